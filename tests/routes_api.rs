#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use actix_web::{test, App};
use serial_test::serial;

use mbbs::auth::create_jwt;
use mbbs::cache::{ThreadCache, THREAD_CACHE_CAPACITY};
use mbbs::models::{NewUser, User, GROUP_ID_ADMIN};
use mbbs::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use mbbs::render::ResourceUrlConfig;
use mbbs::repo::inmem::InMemRepo;
use mbbs::repo::{PermissionRepo, UserRepo};
use mbbs::routes::{config, AppState};

const GROUP_MEMBER: i64 = 2;

// Helper to ensure JWT secret present & unique temp data dir per test
fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("MBBS_DATA_DIR", tmp.path().to_str().unwrap());
}

fn app_state(repo: InMemRepo, rate_limited: bool) -> AppState {
    AppState {
        repo: Arc::new(repo),
        thread_cache: Arc::new(ThreadCache::new(THREAD_CACHE_CAPACITY)),
        rate_limiter: RateLimiterFacade::new(
            InMemoryRateLimiter::new(rate_limited),
            RateLimitConfig::from_env(),
        ),
        resource: ResourceUrlConfig::new("http://res.example.com/"),
    }
}

async fn seed_users(repo: &InMemRepo) -> (User, User) {
    let admin = repo
        .create_user(NewUser {
            username: "admin".into(),
            nickname: "Admin".into(),
            group_id: GROUP_ID_ADMIN,
        })
        .await
        .unwrap();
    let member = repo
        .create_user(NewUser {
            username: "alice".into(),
            nickname: "Alice".into(),
            group_id: GROUP_MEMBER,
        })
        .await
        .unwrap();
    for perm in [
        "thread.createThread",
        "thread.reply",
        "thread.like",
        "thread.viewPosts",
        "thread.editOwnThread",
        "thread.hideOwnThread",
    ] {
        repo.grant_group_permission(GROUP_MEMBER, perm).await.unwrap();
    }
    (admin, member)
}

fn bearer(user: &User) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", create_jwt(user.id).unwrap()))
}

#[actix_web::test]
#[serial]
async fn category_thread_post_flow() {
    setup_env();
    let repo = InMemRepo::new();
    let (admin, member) = seed_users(&repo).await;
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(repo, false)))
            .configure(config),
    )
    .await;

    // list categories empty
    let req = test::TestRequest::get().uri("/api/v1/categories").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v.as_array().unwrap().len(), 0);

    // member cannot create a category
    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&member))
        .set_json(&serde_json::json!({"name":"general","description":"","sort":0}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // admin creates a category
    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&admin))
        .set_json(&serde_json::json!({"name":"general","description":"talk","sort":0}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let category: serde_json::Value =
        serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let category_id = category["id"].as_i64().unwrap();

    // member creates a thread; the view carries capability flags
    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(bearer(&member))
        .set_json(&serde_json::json!({
            "category_id": category_id,
            "title": "First",
            "content": "<p>hello</p>"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let thread: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let thread_id = thread["id"].as_i64().unwrap();
    assert_eq!(thread["post_count"], 1);
    assert_eq!(thread["can_edit"], true);
    assert_eq!(thread["can_hide"], true);
    assert_eq!(thread["can_reply"], true);
    assert_eq!(thread["can_sticky"], false);
    assert_eq!(thread["user"]["username"], "alice");

    // anonymous detail view: no capabilities, view_count bumped
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let view: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(view["can_edit"], false);
    assert_eq!(view["view_count"], 1);

    // member replies
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/posts"))
        .insert_header(bearer(&member))
        .set_json(&serde_json::json!({"content":"<p>reply</p>"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let first_post_id = thread["first_post_id"].as_i64().unwrap();
    assert_ne!(post["id"].as_i64().unwrap(), first_post_id);

    // replies listing requires viewPosts; anonymous tourist group has no grant
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}/posts"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}/posts"))
        .insert_header(bearer(&member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let posts: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(posts.as_array().unwrap().len(), 1);

    // like the thread body, then the detail view reflects it
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{first_post_id}/like"))
        .insert_header(bearer(&member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .insert_header(bearer(&member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let view: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(view["is_liked"], true);
    assert_eq!(view["like_count"], 1);
    assert_eq!(view["post_count"], 2);

    // the lookup can be skipped
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}?skip_liked=1"))
        .insert_header(bearer(&member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let view: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(view["is_liked"], false);
}

#[actix_web::test]
#[serial]
async fn edit_and_moderation_flow() {
    setup_env();
    let repo = InMemRepo::new();
    let (admin, member) = seed_users(&repo).await;
    // moderation grants for the admin group
    for perm in ["thread.hide", "thread.sticky", "thread.essence"] {
        repo.grant_group_permission(GROUP_ID_ADMIN, perm).await.unwrap();
    }
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(repo, false)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&admin))
        .set_json(&serde_json::json!({"name":"general","description":"","sort":0}))
        .to_request();
    let category: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await)
            .unwrap();
    let category_id = category["id"].as_i64().unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(bearer(&member))
        .set_json(&serde_json::json!({
            "category_id": category_id,
            "title": "Original",
            "content": "<p>v1</p>"
        }))
        .to_request();
    let thread: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await)
            .unwrap();
    let thread_id = thread["id"].as_i64().unwrap();

    // owner edits title and content
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .insert_header(bearer(&member))
        .set_json(&serde_json::json!({"title":"Edited","content":"<p>v2</p>"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let view: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(view["title"], "Edited");
    assert_eq!(view["content"], "<p>v2</p>");

    // admin cannot edit without the moderator permission
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .insert_header(bearer(&admin))
        .set_json(&serde_json::json!({"title":"Nope"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // admin pins the thread
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/sticky"))
        .insert_header(bearer(&admin))
        .set_json(&serde_json::json!({"value": true}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // owner hides the thread, anonymous readers get 404
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/hide"))
        .insert_header(bearer(&member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    // restore is a moderator action: the owner-form grant is not enough
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/restore"))
        .insert_header(bearer(&member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/restore"))
        .insert_header(bearer(&admin))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // disable replies, member can no longer post
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/disable-post"))
        .insert_header(bearer(&admin))
        .set_json(&serde_json::json!({"value": true}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/posts"))
        .insert_header(bearer(&member))
        .set_json(&serde_json::json!({"content":"<p>late</p>"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // listing puts the sticky (restored) thread first
    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(bearer(&member))
        .set_json(&serde_json::json!({
            "category_id": category_id,
            "title": "Second",
            "content": "<p>other</p>"
        }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/categories/{category_id}/threads"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let listed: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["id"].as_i64().unwrap(), thread_id);
}

#[actix_web::test]
#[serial]
async fn drafts_are_visible_to_their_owner_only() {
    setup_env();
    let repo = InMemRepo::new();
    let (admin, member) = seed_users(&repo).await;
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(repo, false)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&admin))
        .set_json(&serde_json::json!({"name":"general","description":"","sort":0}))
        .to_request();
    let category: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await)
            .unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(bearer(&member))
        .set_json(&serde_json::json!({
            "category_id": category["id"].as_i64().unwrap(),
            "title": "WIP",
            "content": "<p>draft</p>",
            "is_draft": true
        }))
        .to_request();
    let thread: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await)
            .unwrap();
    let thread_id = thread["id"].as_i64().unwrap();
    // drafts are always editable by their owner
    assert_eq!(thread["can_edit"], true);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .insert_header(bearer(&admin))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .insert_header(bearer(&member))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    // drafts never show up in listings
    let req = test::TestRequest::get()
        .uri(&format!(
            "/api/v1/categories/{}/threads",
            category["id"].as_i64().unwrap()
        ))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let listed: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 0);
}

#[actix_web::test]
#[serial]
async fn thread_creation_is_rate_limited() {
    setup_env();
    std::env::set_var("RL_THREAD_LIMIT", "1");
    std::env::set_var("RL_THREAD_WINDOW", "300");
    let repo = InMemRepo::new();
    let (admin, member) = seed_users(&repo).await;
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(repo, true)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&admin))
        .set_json(&serde_json::json!({"name":"general","description":"","sort":0}))
        .to_request();
    let category: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await)
            .unwrap();
    let category_id = category["id"].as_i64().unwrap();

    let make = |title: &str| {
        serde_json::json!({
            "category_id": category_id,
            "title": title,
            "content": "<p>x</p>"
        })
    };
    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(bearer(&member))
        .set_json(&make("one"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(bearer(&member))
        .set_json(&make("two"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 429);
}

#[actix_web::test]
#[serial]
async fn auth_me_returns_the_token_owner() {
    setup_env();
    let repo = InMemRepo::new();
    let (_, member) = seed_users(&repo).await;
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(repo, false)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/auth/me")
        .insert_header(bearer(&member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["username"], "alice");

    // no token → unauthorized
    let req = test::TestRequest::get().uri("/api/v1/auth/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}
