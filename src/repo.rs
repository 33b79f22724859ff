use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("internal: {0}")]
    Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Listing filter for threads. The store never hides soft-deleted rows on its
/// own; callers pick the filter explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadListFilter {
    /// Not deleted, approved, not draft.
    Normal,
    /// Not deleted, not draft (moderation queues want unapproved rows too).
    AllNotDeleted,
}

impl ThreadListFilter {
    fn matches(&self, t: &Thread) -> bool {
        if t.deleted_at.is_some() || t.is_draft {
            return false;
        }
        match self {
            ThreadListFilter::Normal => t.is_approved == ApprovalStatus::Ok,
            ThreadListFilter::AllNotDeleted => true,
        }
    }
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    /// Recounts the user's non-deleted, non-draft threads and stores the result.
    async fn update_user_thread_count(&self, user_id: Id) -> RepoResult<i64>;
}

#[async_trait]
pub trait CategoryRepo: Send + Sync {
    async fn list_categories(&self) -> RepoResult<Vec<Category>>;
    async fn get_category(&self, id: Id) -> RepoResult<Category>;
    async fn create_category(&self, new: NewCategory) -> RepoResult<Category>;
    /// Recounts the category's normal threads and stores the result.
    async fn update_category_thread_count(&self, category_id: Id) -> RepoResult<i64>;
}

#[async_trait]
pub trait ThreadRepo: Send + Sync {
    async fn get_thread(&self, id: Id) -> RepoResult<Thread>;
    async fn list_threads(&self, category_id: Id, filter: ThreadListFilter)
        -> RepoResult<Vec<Thread>>;
    /// Creates the thread row together with its designated first post.
    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread>;
    /// Full-row write; refreshes updated_at and returns the stored row.
    async fn save_thread(&self, thread: &Thread) -> RepoResult<Thread>;
    /// Legacy-data backfill: writes first_post_id only when still null.
    /// Returns whether this call performed the write.
    async fn set_first_post_id_if_null(&self, thread_id: Id, post_id: Id) -> RepoResult<bool>;
    async fn increment_view_count(&self, thread_id: Id) -> RepoResult<i64>;
    /// Threads created by the user inside [start, end], drafts included.
    async fn count_threads_in_range(
        &self,
        user_id: Id,
        category_id: Option<Id>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RepoResult<i64>;
    /// Non-draft threads created by the user since the start of the UTC day.
    async fn count_threads_created_today(
        &self,
        user_id: Id,
        category_id: Option<Id>,
    ) -> RepoResult<i64>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    async fn find_first_post(&self, thread_id: Id) -> RepoResult<Option<Post>>;
    /// Replies (is_first = false), ascending by creation time, deleted excluded.
    async fn list_posts(&self, thread_id: Id) -> RepoResult<Vec<Post>>;
    /// Inserts a reply and bumps thread counters (post_count, posted_at,
    /// last_posted_user_id) plus the first post's reply_count.
    async fn create_post(&self, new: NewPost) -> RepoResult<Post>;
    async fn save_post(&self, post: &Post) -> RepoResult<Post>;
    async fn has_user_posted(&self, thread_id: Id, user_id: Id) -> RepoResult<bool>;
    async fn has_user_liked_post(&self, post_id: Id, user_id: Id) -> RepoResult<bool>;
    /// Returns false when the like state was already as requested.
    async fn set_post_liked(&self, post_id: Id, user_id: Id, liked: bool) -> RepoResult<bool>;
}

#[async_trait]
pub trait PermissionRepo: Send + Sync {
    async fn group_has_one_of_permissions(&self, group_id: Id, perms: &[&str])
        -> RepoResult<bool>;
    async fn grant_group_permission(&self, group_id: Id, perm: &str) -> RepoResult<()>;
    async fn revoke_group_permission(&self, group_id: Id, perm: &str) -> RepoResult<()>;
}

pub trait Repo: UserRepo + CategoryRepo + ThreadRepo + PostRepo + PermissionRepo {}

impl<T> Repo for T where T: UserRepo + CategoryRepo + ThreadRepo + PostRepo + PermissionRepo {}

fn utc_day_start() -> DateTime<Utc> {
    Utc::now().date_naive().and_time(chrono::NaiveTime::MIN).and_utc()
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::{HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        categories: HashMap<Id, Category>,
        threads: HashMap<Id, Thread>,
        posts: HashMap<Id, Post>,
        post_likes: HashSet<(Id, Id)>, // (post_id, user_id)
        group_permissions: HashMap<Id, HashSet<String>>,
        next_id: Id,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("MBBS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("MBBS_DATA_DIR").is_ok() {
                let mut p = Self::data_dir();
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        tracing::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        tracing::warn!(
                            "failed to parse snapshot '{}': {e}. Starting empty.",
                            path.display()
                        );
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    tracing::warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }

        fn recount_user_threads(state: &State, user_id: Id) -> i64 {
            state
                .threads
                .values()
                .filter(|t| t.user_id == user_id && t.deleted_at.is_none() && !t.is_draft)
                .count() as i64
        }

        fn recount_category_threads(state: &State, category_id: Id) -> i64 {
            state
                .threads
                .values()
                .filter(|t| t.category_id == category_id && ThreadListFilter::Normal.matches(t))
                .count() as i64
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn get_user(&self, id: Id) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            if s.users.values().any(|u| u.username == new.username) {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let user = User {
                id,
                username: new.username,
                nickname: new.nickname,
                group_id: new.group_id,
                thread_count: 0,
                created_at: Utc::now(),
                deleted_at: None,
            };
            s.users.insert(id, user.clone());
            drop(s);
            self.persist();
            Ok(user)
        }

        async fn update_user_thread_count(&self, user_id: Id) -> RepoResult<i64> {
            let mut s = self.state.write().unwrap();
            let count = Self::recount_user_threads(&s, user_id);
            let user = s.users.get_mut(&user_id).ok_or(RepoError::NotFound)?;
            user.thread_count = count;
            drop(s);
            self.persist();
            Ok(count)
        }
    }

    #[async_trait]
    impl CategoryRepo for InMemRepo {
        async fn list_categories(&self) -> RepoResult<Vec<Category>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s.categories.values().cloned().collect();
            v.sort_by_key(|c| (c.sort, c.id));
            Ok(v)
        }

        async fn get_category(&self, id: Id) -> RepoResult<Category> {
            let s = self.state.read().unwrap();
            s.categories.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn create_category(&self, new: NewCategory) -> RepoResult<Category> {
            let mut s = self.state.write().unwrap();
            if s.categories.values().any(|c| c.name == new.name) {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let category = Category {
                id,
                name: new.name,
                description: new.description,
                sort: new.sort,
                thread_count: 0,
                created_at: Utc::now(),
            };
            s.categories.insert(id, category.clone());
            drop(s);
            self.persist();
            Ok(category)
        }

        async fn update_category_thread_count(&self, category_id: Id) -> RepoResult<i64> {
            let mut s = self.state.write().unwrap();
            let count = Self::recount_category_threads(&s, category_id);
            let category = s.categories.get_mut(&category_id).ok_or(RepoError::NotFound)?;
            category.thread_count = count;
            drop(s);
            self.persist();
            Ok(count)
        }
    }

    #[async_trait]
    impl ThreadRepo for InMemRepo {
        async fn get_thread(&self, id: Id) -> RepoResult<Thread> {
            let s = self.state.read().unwrap();
            s.threads.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn list_threads(
            &self,
            category_id: Id,
            filter: ThreadListFilter,
        ) -> RepoResult<Vec<Thread>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .threads
                .values()
                .filter(|t| t.category_id == category_id && filter.matches(t))
                .cloned()
                .collect();
            // sticky first, then latest activity
            v.sort_by(|a, b| {
                b.is_sticky
                    .cmp(&a.is_sticky)
                    .then(b.posted_at.cmp(&a.posted_at))
            });
            Ok(v)
        }

        async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
            let mut s = self.state.write().unwrap();
            if !s.categories.contains_key(&new.category_id) {
                return Err(RepoError::NotFound);
            }
            if !s.users.contains_key(&new.user_id) {
                return Err(RepoError::NotFound);
            }
            let now = Utc::now();
            let thread_id = Self::next_id(&mut s);
            let post_id = Self::next_id(&mut s);
            let post = Post {
                id: post_id,
                thread_id,
                user_id: new.user_id,
                content: new.content,
                is_first: true,
                like_count: 0,
                reply_count: 0,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            let thread = Thread {
                id: thread_id,
                user_id: new.user_id,
                last_posted_user_id: new.user_id,
                category_id: new.category_id,
                first_post_id: Some(post_id),
                is_approved: ApprovalStatus::Ok,
                is_sticky: false,
                is_essence: false,
                is_draft: new.is_draft,
                disable_post: false,
                title: new.title,
                content_for_indexes: new.content_for_indexes,
                post_count: 1,
                view_count: 0,
                deleted_user_id: None,
                posted_at: now,
                created_at: now,
                updated_at: now,
                modified_at: Some(now),
                deleted_at: None,
            };
            s.posts.insert(post_id, post);
            s.threads.insert(thread_id, thread.clone());
            drop(s);
            self.persist();
            Ok(thread)
        }

        async fn save_thread(&self, thread: &Thread) -> RepoResult<Thread> {
            let mut s = self.state.write().unwrap();
            if !s.threads.contains_key(&thread.id) {
                return Err(RepoError::NotFound);
            }
            let mut row = thread.clone();
            row.updated_at = Utc::now();
            s.threads.insert(row.id, row.clone());
            drop(s);
            self.persist();
            Ok(row)
        }

        async fn set_first_post_id_if_null(&self, thread_id: Id, post_id: Id) -> RepoResult<bool> {
            let mut s = self.state.write().unwrap();
            let thread = s.threads.get_mut(&thread_id).ok_or(RepoError::NotFound)?;
            if thread.first_post_id.is_some() {
                return Ok(false);
            }
            thread.first_post_id = Some(post_id);
            thread.updated_at = Utc::now();
            drop(s);
            self.persist();
            Ok(true)
        }

        async fn increment_view_count(&self, thread_id: Id) -> RepoResult<i64> {
            let mut s = self.state.write().unwrap();
            let thread = s.threads.get_mut(&thread_id).ok_or(RepoError::NotFound)?;
            thread.view_count += 1;
            let count = thread.view_count;
            drop(s);
            self.persist();
            Ok(count)
        }

        async fn count_threads_in_range(
            &self,
            user_id: Id,
            category_id: Option<Id>,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> RepoResult<i64> {
            let s = self.state.read().unwrap();
            Ok(s.threads
                .values()
                .filter(|t| {
                    t.user_id == user_id
                        && category_id.map_or(true, |c| t.category_id == c)
                        && t.created_at >= start
                        && t.created_at <= end
                })
                .count() as i64)
        }

        async fn count_threads_created_today(
            &self,
            user_id: Id,
            category_id: Option<Id>,
        ) -> RepoResult<i64> {
            let start = utc_day_start();
            let s = self.state.read().unwrap();
            Ok(s.threads
                .values()
                .filter(|t| {
                    t.user_id == user_id
                        && !t.is_draft
                        && category_id.map_or(true, |c| t.category_id == c)
                        && t.created_at >= start
                })
                .count() as i64)
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let s = self.state.read().unwrap();
            s.posts.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn find_first_post(&self, thread_id: Id) -> RepoResult<Option<Post>> {
            let s = self.state.read().unwrap();
            Ok(s.posts
                .values()
                .find(|p| p.thread_id == thread_id && p.is_first)
                .cloned())
        }

        async fn list_posts(&self, thread_id: Id) -> RepoResult<Vec<Post>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .posts
                .values()
                .filter(|p| p.thread_id == thread_id && !p.is_first && p.deleted_at.is_none())
                .cloned()
                .collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(v)
        }

        async fn create_post(&self, new: NewPost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            if !s.threads.contains_key(&new.thread_id) {
                return Err(RepoError::NotFound);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let post = Post {
                id,
                thread_id: new.thread_id,
                user_id: new.user_id,
                content: new.content,
                is_first: false,
                like_count: 0,
                reply_count: 0,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            s.posts.insert(id, post.clone());
            let first_post_id = {
                let thread = s.threads.get_mut(&new.thread_id).ok_or(RepoError::NotFound)?;
                thread.post_count += 1;
                thread.posted_at = now;
                thread.last_posted_user_id = new.user_id;
                thread.first_post_id
            };
            if let Some(fp) = first_post_id {
                if let Some(first) = s.posts.get_mut(&fp) {
                    first.reply_count += 1;
                }
            }
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn save_post(&self, post: &Post) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&post.id) {
                return Err(RepoError::NotFound);
            }
            let mut row = post.clone();
            row.updated_at = Utc::now();
            s.posts.insert(row.id, row.clone());
            drop(s);
            self.persist();
            Ok(row)
        }

        async fn has_user_posted(&self, thread_id: Id, user_id: Id) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.posts
                .values()
                .any(|p| p.thread_id == thread_id && p.user_id == user_id))
        }

        async fn has_user_liked_post(&self, post_id: Id, user_id: Id) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.post_likes.contains(&(post_id, user_id)))
        }

        async fn set_post_liked(&self, post_id: Id, user_id: Id, liked: bool) -> RepoResult<bool> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&post_id) {
                return Err(RepoError::NotFound);
            }
            let changed = if liked {
                s.post_likes.insert((post_id, user_id))
            } else {
                s.post_likes.remove(&(post_id, user_id))
            };
            if changed {
                if let Some(post) = s.posts.get_mut(&post_id) {
                    post.like_count += if liked { 1 } else { -1 };
                }
            }
            drop(s);
            self.persist();
            Ok(changed)
        }
    }

    #[async_trait]
    impl PermissionRepo for InMemRepo {
        async fn group_has_one_of_permissions(
            &self,
            group_id: Id,
            perms: &[&str],
        ) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.group_permissions
                .get(&group_id)
                .map(|set| perms.iter().any(|p| set.contains(*p)))
                .unwrap_or(false))
        }

        async fn grant_group_permission(&self, group_id: Id, perm: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.group_permissions
                .entry(group_id)
                .or_default()
                .insert(perm.to_string());
            drop(s);
            self.persist();
            Ok(())
        }

        async fn revoke_group_permission(&self, group_id: Id, perm: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if let Some(set) = s.group_permissions.get_mut(&group_id) {
                set.remove(perm);
            }
            drop(s);
            self.persist();
            Ok(())
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }
    }

    fn internal(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            other => RepoError::Internal(other.to_string()),
        }
    }

    const THREAD_COLS: &str = "id, user_id, last_posted_user_id, category_id, first_post_id, \
        is_approved, is_sticky, is_essence, is_draft, disable_post, title, content_for_indexes, \
        post_count, view_count, deleted_user_id, posted_at, created_at, updated_at, modified_at, \
        deleted_at";

    const POST_COLS: &str =
        "id, thread_id, user_id, content, is_first, like_count, reply_count, created_at, \
         updated_at, deleted_at";

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn get_user(&self, id: Id) -> RepoResult<User> {
            sqlx::query_as::<_, User>(
                "SELECT id, username, nickname, group_id, thread_count, created_at, deleted_at \
                 FROM users WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            sqlx::query_as::<_, User>(
                "INSERT INTO users (username, nickname, group_id) VALUES ($1, $2, $3) \
                 RETURNING id, username, nickname, group_id, thread_count, created_at, deleted_at",
            )
            .bind(&new.username)
            .bind(&new.nickname)
            .bind(new.group_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| RepoError::Conflict)
        }

        async fn update_user_thread_count(&self, user_id: Id) -> RepoResult<i64> {
            sqlx::query_scalar::<_, i64>(
                "UPDATE users SET thread_count = ( \
                     SELECT COUNT(*) FROM threads \
                     WHERE user_id = $1 AND deleted_at IS NULL AND is_draft = FALSE \
                 ) WHERE id = $1 RETURNING thread_count",
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }
    }

    #[async_trait]
    impl CategoryRepo for PgRepo {
        async fn list_categories(&self) -> RepoResult<Vec<Category>> {
            sqlx::query_as::<_, Category>(
                "SELECT id, name, description, sort, thread_count, created_at \
                 FROM categories ORDER BY sort, id",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(internal)
        }

        async fn get_category(&self, id: Id) -> RepoResult<Category> {
            sqlx::query_as::<_, Category>(
                "SELECT id, name, description, sort, thread_count, created_at \
                 FROM categories WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn create_category(&self, new: NewCategory) -> RepoResult<Category> {
            sqlx::query_as::<_, Category>(
                "INSERT INTO categories (name, description, sort) VALUES ($1, $2, $3) \
                 RETURNING id, name, description, sort, thread_count, created_at",
            )
            .bind(&new.name)
            .bind(&new.description)
            .bind(new.sort)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| RepoError::Conflict)
        }

        async fn update_category_thread_count(&self, category_id: Id) -> RepoResult<i64> {
            sqlx::query_scalar::<_, i64>(
                "UPDATE categories SET thread_count = ( \
                     SELECT COUNT(*) FROM threads \
                     WHERE category_id = $1 AND deleted_at IS NULL AND is_draft = FALSE \
                       AND is_approved = 1 \
                 ) WHERE id = $1 RETURNING thread_count",
            )
            .bind(category_id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }
    }

    #[async_trait]
    impl ThreadRepo for PgRepo {
        async fn get_thread(&self, id: Id) -> RepoResult<Thread> {
            sqlx::query_as::<_, Thread>(&format!(
                "SELECT {THREAD_COLS} FROM threads WHERE id = $1"
            ))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn list_threads(
            &self,
            category_id: Id,
            filter: ThreadListFilter,
        ) -> RepoResult<Vec<Thread>> {
            let approval_clause = match filter {
                ThreadListFilter::Normal => " AND is_approved = 1",
                ThreadListFilter::AllNotDeleted => "",
            };
            sqlx::query_as::<_, Thread>(&format!(
                "SELECT {THREAD_COLS} FROM threads \
                 WHERE category_id = $1 AND deleted_at IS NULL AND is_draft = FALSE{approval_clause} \
                 ORDER BY is_sticky DESC, posted_at DESC"
            ))
            .bind(category_id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)
        }

        async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let thread_id = sqlx::query_scalar::<_, Id>(
                "INSERT INTO threads \
                     (user_id, last_posted_user_id, category_id, is_approved, is_draft, title, \
                      content_for_indexes, post_count, modified_at) \
                 VALUES ($1, $1, $2, 1, $3, $4, $5, 1, now()) RETURNING id",
            )
            .bind(new.user_id)
            .bind(new.category_id)
            .bind(new.is_draft)
            .bind(&new.title)
            .bind(&new.content_for_indexes)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            let post_id = sqlx::query_scalar::<_, Id>(
                "INSERT INTO posts (thread_id, user_id, content, is_first) \
                 VALUES ($1, $2, $3, TRUE) RETURNING id",
            )
            .bind(thread_id)
            .bind(new.user_id)
            .bind(&new.content)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            sqlx::query("UPDATE threads SET first_post_id = $2 WHERE id = $1")
                .bind(thread_id)
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            self.get_thread(thread_id).await
        }

        async fn save_thread(&self, thread: &Thread) -> RepoResult<Thread> {
            sqlx::query_as::<_, Thread>(&format!(
                "UPDATE threads SET \
                     user_id = $2, last_posted_user_id = $3, category_id = $4, \
                     first_post_id = $5, is_approved = $6, is_sticky = $7, is_essence = $8, \
                     is_draft = $9, disable_post = $10, title = $11, content_for_indexes = $12, \
                     post_count = $13, view_count = $14, deleted_user_id = $15, posted_at = $16, \
                     modified_at = $17, deleted_at = $18, updated_at = now() \
                 WHERE id = $1 RETURNING {THREAD_COLS}"
            ))
            .bind(thread.id)
            .bind(thread.user_id)
            .bind(thread.last_posted_user_id)
            .bind(thread.category_id)
            .bind(thread.first_post_id)
            .bind(thread.is_approved)
            .bind(thread.is_sticky)
            .bind(thread.is_essence)
            .bind(thread.is_draft)
            .bind(thread.disable_post)
            .bind(&thread.title)
            .bind(&thread.content_for_indexes)
            .bind(thread.post_count)
            .bind(thread.view_count)
            .bind(thread.deleted_user_id)
            .bind(thread.posted_at)
            .bind(thread.modified_at)
            .bind(thread.deleted_at)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn set_first_post_id_if_null(&self, thread_id: Id, post_id: Id) -> RepoResult<bool> {
            let result = sqlx::query(
                "UPDATE threads SET first_post_id = $2, updated_at = now() \
                 WHERE id = $1 AND first_post_id IS NULL",
            )
            .bind(thread_id)
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            Ok(result.rows_affected() > 0)
        }

        async fn increment_view_count(&self, thread_id: Id) -> RepoResult<i64> {
            sqlx::query_scalar::<_, i64>(
                "UPDATE threads SET view_count = view_count + 1 WHERE id = $1 \
                 RETURNING view_count",
            )
            .bind(thread_id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn count_threads_in_range(
            &self,
            user_id: Id,
            category_id: Option<Id>,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> RepoResult<i64> {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM threads \
                 WHERE user_id = $1 AND ($2::BIGINT IS NULL OR category_id = $2) \
                   AND created_at >= $3 AND created_at <= $4",
            )
            .bind(user_id)
            .bind(category_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn count_threads_created_today(
            &self,
            user_id: Id,
            category_id: Option<Id>,
        ) -> RepoResult<i64> {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM threads \
                 WHERE user_id = $1 AND is_draft = FALSE \
                   AND ($2::BIGINT IS NULL OR category_id = $2) AND created_at >= $3",
            )
            .bind(user_id)
            .bind(category_id)
            .bind(utc_day_start())
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            sqlx::query_as::<_, Post>(&format!("SELECT {POST_COLS} FROM posts WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)
        }

        async fn find_first_post(&self, thread_id: Id) -> RepoResult<Option<Post>> {
            sqlx::query_as::<_, Post>(&format!(
                "SELECT {POST_COLS} FROM posts WHERE thread_id = $1 AND is_first = TRUE"
            ))
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)
        }

        async fn list_posts(&self, thread_id: Id) -> RepoResult<Vec<Post>> {
            sqlx::query_as::<_, Post>(&format!(
                "SELECT {POST_COLS} FROM posts \
                 WHERE thread_id = $1 AND is_first = FALSE AND deleted_at IS NULL \
                 ORDER BY created_at ASC"
            ))
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)
        }

        async fn create_post(&self, new: NewPost) -> RepoResult<Post> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let post = sqlx::query_as::<_, Post>(&format!(
                "INSERT INTO posts (thread_id, user_id, content, is_first) \
                 VALUES ($1, $2, $3, FALSE) RETURNING {POST_COLS}"
            ))
            .bind(new.thread_id)
            .bind(new.user_id)
            .bind(&new.content)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            sqlx::query(
                "UPDATE threads SET post_count = post_count + 1, posted_at = now(), \
                     last_posted_user_id = $2 WHERE id = $1",
            )
            .bind(new.thread_id)
            .bind(new.user_id)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
            sqlx::query(
                "UPDATE posts SET reply_count = reply_count + 1 \
                 WHERE thread_id = $1 AND is_first = TRUE",
            )
            .bind(new.thread_id)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(post)
        }

        async fn save_post(&self, post: &Post) -> RepoResult<Post> {
            sqlx::query_as::<_, Post>(&format!(
                "UPDATE posts SET content = $2, like_count = $3, reply_count = $4, \
                     deleted_at = $5, updated_at = now() \
                 WHERE id = $1 RETURNING {POST_COLS}"
            ))
            .bind(post.id)
            .bind(&post.content)
            .bind(post.like_count)
            .bind(post.reply_count)
            .bind(post.deleted_at)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn has_user_posted(&self, thread_id: Id, user_id: Id) -> RepoResult<bool> {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM posts WHERE thread_id = $1 AND user_id = $2)",
            )
            .bind(thread_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn has_user_liked_post(&self, post_id: Id, user_id: Id) -> RepoResult<bool> {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM post_likes WHERE post_id = $1 AND user_id = $2)",
            )
            .bind(post_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn set_post_liked(&self, post_id: Id, user_id: Id, liked: bool) -> RepoResult<bool> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let changed = if liked {
                sqlx::query(
                    "INSERT INTO post_likes (post_id, user_id) VALUES ($1, $2) \
                     ON CONFLICT DO NOTHING",
                )
                .bind(post_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(internal)?
                .rows_affected()
                    > 0
            } else {
                sqlx::query("DELETE FROM post_likes WHERE post_id = $1 AND user_id = $2")
                    .bind(post_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(internal)?
                    .rows_affected()
                    > 0
            };
            if changed {
                let delta: i64 = if liked { 1 } else { -1 };
                sqlx::query("UPDATE posts SET like_count = like_count + $2 WHERE id = $1")
                    .bind(post_id)
                    .bind(delta)
                    .execute(&mut *tx)
                    .await
                    .map_err(internal)?;
            }
            tx.commit().await.map_err(internal)?;
            Ok(changed)
        }
    }

    #[async_trait]
    impl PermissionRepo for PgRepo {
        async fn group_has_one_of_permissions(
            &self,
            group_id: Id,
            perms: &[&str],
        ) -> RepoResult<bool> {
            let names: Vec<String> = perms.iter().map(|p| p.to_string()).collect();
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM group_permissions \
                 WHERE group_id = $1 AND permission = ANY($2))",
            )
            .bind(group_id)
            .bind(&names)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn grant_group_permission(&self, group_id: Id, perm: &str) -> RepoResult<()> {
            sqlx::query(
                "INSERT INTO group_permissions (group_id, permission) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(group_id)
            .bind(perm)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            Ok(())
        }

        async fn revoke_group_permission(&self, group_id: Id, perm: &str) -> RepoResult<()> {
            sqlx::query("DELETE FROM group_permissions WHERE group_id = $1 AND permission = $2")
                .bind(group_id)
                .bind(perm)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }
    }
}
