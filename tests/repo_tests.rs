#![cfg(feature = "inmem-store")]

use mbbs::models::{ApprovalStatus, NewCategory, NewPost, NewThread, NewUser};
use mbbs::repo::{inmem::InMemRepo, RepoError, ThreadListFilter};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use mbbs::repo::{CategoryRepo, PermissionRepo, PostRepo, ThreadRepo, UserRepo};

/// Helper that returns a fresh, empty repository for every test run.
fn repo() -> InMemRepo {
    // isolate state: do **not** persist to the default file path
    std::env::set_var("MBBS_DATA_DIR", tempfile::tempdir().unwrap().path());
    InMemRepo::new()
}

async fn seed_user(r: &InMemRepo, username: &str, group_id: i64) -> mbbs::models::User {
    r.create_user(NewUser {
        username: username.into(),
        nickname: username.into(),
        group_id,
    })
    .await
    .unwrap()
}

async fn seed_category(r: &InMemRepo, name: &str) -> mbbs::models::Category {
    r.create_category(NewCategory {
        name: name.into(),
        description: String::new(),
        sort: 0,
    })
    .await
    .unwrap()
}

fn new_thread(user_id: i64, category_id: i64, title: &str) -> NewThread {
    NewThread {
        user_id,
        category_id,
        title: title.into(),
        content: format!("<p>{title}</p>"),
        content_for_indexes: title.into(),
        is_draft: false,
    }
}

#[tokio::test]
async fn category_crud_and_conflict() {
    let r = repo();

    assert!(r.list_categories().await.unwrap().is_empty());

    let c = seed_category(&r, "tech").await;
    assert_eq!(c.name, "tech");
    assert_eq!(c.thread_count, 0);

    // duplicate name → conflict
    let err = r
        .create_category(NewCategory {
            name: "tech".into(),
            description: "dup".into(),
            sort: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Conflict));
}

#[tokio::test]
async fn thread_creation_sets_first_post_and_counters() {
    let r = repo();
    let user = seed_user(&r, "alice", 2).await;
    let category = seed_category(&r, "general").await;

    let thread = r
        .create_thread(new_thread(user.id, category.id, "hello"))
        .await
        .unwrap();

    // first post exists, counts start at 1
    assert!(thread.first_post_id.is_some());
    assert_eq!(thread.post_count, 1);
    assert_eq!(thread.is_approved, ApprovalStatus::Ok);
    let first = r.find_first_post(thread.id).await.unwrap().unwrap();
    assert_eq!(Some(first.id), thread.first_post_id);
    assert!(first.is_first);
    assert_eq!(first.thread_id, thread.id);

    // derived counters refresh on demand
    assert_eq!(r.update_category_thread_count(category.id).await.unwrap(), 1);
    assert_eq!(r.update_user_thread_count(user.id).await.unwrap(), 1);
}

#[tokio::test]
async fn reply_bumps_thread_and_first_post_counters() {
    let r = repo();
    let alice = seed_user(&r, "alice", 2).await;
    let bob = seed_user(&r, "bob", 2).await;
    let category = seed_category(&r, "general").await;
    let thread = r
        .create_thread(new_thread(alice.id, category.id, "topic"))
        .await
        .unwrap();

    let reply = r
        .create_post(NewPost {
            thread_id: thread.id,
            user_id: bob.id,
            content: "<p>hi</p>".into(),
        })
        .await
        .unwrap();
    assert!(!reply.is_first);

    let thread = r.get_thread(thread.id).await.unwrap();
    assert_eq!(thread.post_count, 2);
    assert_eq!(thread.last_posted_user_id, bob.id);
    let first = r.find_first_post(thread.id).await.unwrap().unwrap();
    assert_eq!(first.reply_count, 1);

    // replies listing excludes the first post
    let posts = r.list_posts(thread.id).await.unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].id, reply.id);

    assert!(r.has_user_posted(thread.id, bob.id).await.unwrap());
    assert!(r.has_user_posted(thread.id, alice.id).await.unwrap());
}

#[tokio::test]
async fn first_post_backfill_writes_only_if_null() {
    let r = repo();
    let user = seed_user(&r, "alice", 2).await;
    let category = seed_category(&r, "general").await;
    let mut thread = r
        .create_thread(new_thread(user.id, category.id, "legacy"))
        .await
        .unwrap();
    let first_post_id = thread.first_post_id.unwrap();

    // already set → no write
    assert!(!r
        .set_first_post_id_if_null(thread.id, 999)
        .await
        .unwrap());
    assert_eq!(
        r.get_thread(thread.id).await.unwrap().first_post_id,
        Some(first_post_id)
    );

    // simulate a legacy row
    thread.first_post_id = None;
    r.save_thread(&thread).await.unwrap();
    assert!(r
        .set_first_post_id_if_null(thread.id, first_post_id)
        .await
        .unwrap());
    assert_eq!(
        r.get_thread(thread.id).await.unwrap().first_post_id,
        Some(first_post_id)
    );
}

#[tokio::test]
async fn soft_deleted_and_draft_threads_are_filtered_from_listings() {
    let r = repo();
    let user = seed_user(&r, "alice", 2).await;
    let category = seed_category(&r, "general").await;

    let visible = r
        .create_thread(new_thread(user.id, category.id, "visible"))
        .await
        .unwrap();
    let mut hidden = r
        .create_thread(new_thread(user.id, category.id, "hidden"))
        .await
        .unwrap();
    hidden.deleted_at = Some(chrono::Utc::now());
    r.save_thread(&hidden).await.unwrap();
    let mut draft = new_thread(user.id, category.id, "draft");
    draft.is_draft = true;
    r.create_thread(draft).await.unwrap();
    let mut unapproved = r
        .create_thread(new_thread(user.id, category.id, "checking"))
        .await
        .unwrap();
    unapproved.is_approved = ApprovalStatus::Checking;
    r.save_thread(&unapproved).await.unwrap();

    let normal = r
        .list_threads(category.id, ThreadListFilter::Normal)
        .await
        .unwrap();
    assert_eq!(normal.len(), 1);
    assert_eq!(normal[0].id, visible.id);

    let all = r
        .list_threads(category.id, ThreadListFilter::AllNotDeleted)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    // counters follow the normal filter
    assert_eq!(r.update_category_thread_count(category.id).await.unwrap(), 1);
    // user counter only excludes deleted and drafts
    assert_eq!(r.update_user_thread_count(user.id).await.unwrap(), 2);
}

#[tokio::test]
async fn sticky_threads_sort_first() {
    let r = repo();
    let user = seed_user(&r, "alice", 2).await;
    let category = seed_category(&r, "general").await;

    let older = r
        .create_thread(new_thread(user.id, category.id, "older"))
        .await
        .unwrap();
    let _newer = r
        .create_thread(new_thread(user.id, category.id, "newer"))
        .await
        .unwrap();

    let mut sticky = r.get_thread(older.id).await.unwrap();
    sticky.is_sticky = true;
    r.save_thread(&sticky).await.unwrap();

    let listed = r
        .list_threads(category.id, ThreadListFilter::Normal)
        .await
        .unwrap();
    assert_eq!(listed[0].id, older.id);
}

#[tokio::test]
async fn like_toggle_is_idempotent_and_tracks_count() {
    let r = repo();
    let alice = seed_user(&r, "alice", 2).await;
    let bob = seed_user(&r, "bob", 2).await;
    let category = seed_category(&r, "general").await;
    let thread = r
        .create_thread(new_thread(alice.id, category.id, "topic"))
        .await
        .unwrap();
    let post_id = thread.first_post_id.unwrap();

    assert!(!r.has_user_liked_post(post_id, bob.id).await.unwrap());
    assert!(r.set_post_liked(post_id, bob.id, true).await.unwrap());
    // second like is a no-op
    assert!(!r.set_post_liked(post_id, bob.id, true).await.unwrap());
    assert!(r.has_user_liked_post(post_id, bob.id).await.unwrap());
    assert_eq!(r.get_post(post_id).await.unwrap().like_count, 1);

    assert!(r.set_post_liked(post_id, bob.id, false).await.unwrap());
    assert_eq!(r.get_post(post_id).await.unwrap().like_count, 0);
}

#[tokio::test]
async fn group_permission_lookup_matches_any_name() {
    let r = repo();
    r.grant_group_permission(2, "thread.reply").await.unwrap();
    r.grant_group_permission(2, "category7.thread.edit")
        .await
        .unwrap();

    assert!(r
        .group_has_one_of_permissions(2, &["thread.reply"])
        .await
        .unwrap());
    assert!(r
        .group_has_one_of_permissions(2, &["thread.edit", "category7.thread.edit"])
        .await
        .unwrap());
    assert!(!r
        .group_has_one_of_permissions(2, &["thread.edit", "category9.thread.edit"])
        .await
        .unwrap());
    assert!(!r
        .group_has_one_of_permissions(3, &["thread.reply"])
        .await
        .unwrap());

    r.revoke_group_permission(2, "thread.reply").await.unwrap();
    assert!(!r
        .group_has_one_of_permissions(2, &["thread.reply"])
        .await
        .unwrap());
}

#[tokio::test]
async fn count_queries_use_inclusive_bounds() {
    let r = repo();
    let user = seed_user(&r, "alice", 2).await;
    let category = seed_category(&r, "general").await;
    let other = seed_category(&r, "other").await;

    r.create_thread(new_thread(user.id, category.id, "one"))
        .await
        .unwrap();
    r.create_thread(new_thread(user.id, other.id, "two"))
        .await
        .unwrap();
    let mut draft = new_thread(user.id, category.id, "draft");
    draft.is_draft = true;
    r.create_thread(draft).await.unwrap();

    let now = chrono::Utc::now();
    let hour_ago = now - chrono::Duration::hours(1);

    // range count includes drafts
    assert_eq!(
        r.count_threads_in_range(user.id, None, hour_ago, now)
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        r.count_threads_in_range(user.id, Some(other.id), hour_ago, now)
            .await
            .unwrap(),
        1
    );
    // a window in the past matches nothing
    assert_eq!(
        r.count_threads_in_range(user.id, None, hour_ago, hour_ago)
            .await
            .unwrap(),
        0
    );

    // today count excludes drafts
    assert_eq!(
        r.count_threads_created_today(user.id, None).await.unwrap(),
        2
    );
    assert_eq!(
        r.count_threads_created_today(user.id, Some(category.id))
            .await
            .unwrap(),
        1
    );
}
