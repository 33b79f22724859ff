use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = i64;

/// Built-in permission groups. Group 0 is the fallback for anonymous viewers.
pub const GROUP_ID_TOURIST: Id = 0;
pub const GROUP_ID_ADMIN: Id = 1;

/// Moderation state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Checking = 0,
    Ok = 1,
    CheckFailed = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub nickname: String,
    pub group_id: Id,
    pub thread_count: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>, // soft delete marker
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.group_id == GROUP_ID_ADMIN
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewUser {
    pub username: String,
    pub nickname: String,
    pub group_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Category {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub sort: i32,
    pub thread_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewCategory {
    pub name: String,
    pub description: String,
    pub sort: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Thread {
    pub id: Id,
    pub user_id: Id,
    pub last_posted_user_id: Id,
    pub category_id: Id,
    /// Row id of the post holding the thread body. Legacy rows may lack it;
    /// it is backfilled on first read (only-if-null write).
    pub first_post_id: Option<Id>,
    pub is_approved: ApprovalStatus,
    pub is_sticky: bool,
    pub is_essence: bool,
    pub is_draft: bool,
    pub disable_post: bool,
    pub title: String,
    /// Plain-text rendition of the body kept for search indexing.
    pub content_for_indexes: String,
    /// At least 1 once the first post exists (the body counts as a post).
    pub post_count: i64,
    pub view_count: i64,
    pub deleted_user_id: Option<Id>,
    /// Last reply time.
    pub posted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Content/title edit time. None on legacy rows; views fall back to created_at.
    pub modified_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>, // soft delete marker
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewThread {
    pub user_id: Id,
    pub category_id: Id,
    pub title: String,
    /// Body HTML, already normalized for storage.
    pub content: String,
    /// Plain-text rendition of `content` for the index field.
    pub content_for_indexes: String,
    pub is_draft: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateThread {
    pub title: Option<String>,
    pub content: Option<String>,
    pub is_draft: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Post {
    pub id: Id,
    pub thread_id: Id,
    pub user_id: Id,
    pub content: String,
    /// The designated first post holds the thread body.
    pub is_first: bool,
    pub like_count: i64,
    pub reply_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>, // soft delete marker
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    pub thread_id: Id,
    pub user_id: Id,
    pub content: String,
}

/// Externally visible projection of a thread for one viewing user.
/// Raw thread fields are merged with resolved content, the author row,
/// counters from the first post and per-viewer capability flags.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ThreadView {
    pub id: Id,
    pub user_id: Id,
    pub last_posted_user_id: Id,
    pub category_id: Id,
    pub first_post_id: Option<Id>,
    pub is_approved: ApprovalStatus,
    pub is_sticky: bool,
    pub is_essence: bool,
    pub is_draft: bool,
    pub disable_post: bool,
    pub title: String,
    pub content_for_indexes: String,
    pub post_count: i64,
    pub view_count: i64,
    pub deleted_user_id: Option<Id>,
    pub posted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Falls back to created_at for legacy rows lacking an edit time.
    pub modified_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub content: String,
    pub user: User,
    pub like_count: i64,
    pub reply_count: i64,
    pub is_liked: bool,
    pub can_edit: bool,
    pub can_hide: bool,
    pub can_like: bool,
    pub can_reply: bool,
    pub can_essence: bool,
    pub can_sticky: bool,
    pub can_set_disable_post: bool,
    pub can_view_posts: bool,
}
