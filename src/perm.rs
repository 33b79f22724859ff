//! Permission-name vocabulary and capability queries.
//!
//! A capability is granted by permission-name strings held by a user's group,
//! either in global form (`thread.edit`) or scoped to one category
//! (`category7.thread.edit`). A query passes when the group holds any one of
//! the requested names.

use crate::models::{Id, User, GROUP_ID_TOURIST};
use crate::repo::{Repo, RepoResult};

pub const THREAD_CREATE: &str = "thread.createThread";
pub const THREAD_EDIT: &str = "thread.edit";
pub const THREAD_EDIT_OWN: &str = "thread.editOwnThread";
pub const THREAD_HIDE: &str = "thread.hide";
pub const THREAD_HIDE_OWN: &str = "thread.hideOwnThread";
pub const THREAD_LIKE: &str = "thread.like";
pub const THREAD_REPLY: &str = "thread.reply";
pub const THREAD_STICKY: &str = "thread.sticky";
pub const THREAD_ESSENCE: &str = "thread.essence";
pub const THREAD_VIEW_POSTS: &str = "thread.viewPosts";

/// Category-scoped form of a permission name.
pub fn scoped(category_id: Id, action: &str) -> String {
    format!("category{category_id}.{action}")
}

/// True if the user's group holds the action globally or scoped to the category.
pub async fn user_has_permission(
    repo: &dyn Repo,
    user: &User,
    category_id: Id,
    action: &str,
) -> RepoResult<bool> {
    repo.group_has_one_of_permissions(user.group_id, &[action, &scoped(category_id, action)])
        .await
}

/// Same check against the tourist group, for anonymous viewers.
pub async fn tourist_has_permission(
    repo: &dyn Repo,
    category_id: Id,
    action: &str,
) -> RepoResult<bool> {
    repo.group_has_one_of_permissions(GROUP_ID_TOURIST, &[action, &scoped(category_id, action)])
        .await
}
