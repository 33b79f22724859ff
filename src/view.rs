//! Thread permission checks and the per-viewer view projection.

use crate::cache::ThreadCache;
use crate::markdown::{filter_markdown_hidden_content, markdown_has_reply_hidden_content};
use crate::models::*;
use crate::perm;
use crate::repo::{Repo, RepoError, RepoResult};

/// Per-call switches for `thread_to_view`. `field_is_liked` exists as a cost
/// control: the like-status lookup is an extra existence check that list
/// callers may not need.
#[derive(Debug, Clone)]
pub struct ViewOptions {
    pub field_is_liked: bool,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            field_is_liked: true,
        }
    }
}

/// Outcome of the best-effort counter refresh after a thread save. The save
/// itself either succeeded or the whole call errored; `Degraded` means the
/// thread row is persisted but the derived counters are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterRefresh {
    Applied,
    Degraded,
}

impl Thread {
    /// Whether the user may edit this thread. A draft is always editable by
    /// its owner; otherwise the owner needs `editOwnThread` and anyone else
    /// needs the moderator-form `edit` permission.
    pub async fn can_edit_by_user(&self, repo: &dyn Repo, user: Option<&User>) -> RepoResult<bool> {
        let Some(user) = user else {
            return Ok(false);
        };
        if self.user_id == user.id && self.is_draft {
            return Ok(true);
        }
        let mut has_permission = false;
        if self.user_id == user.id {
            has_permission =
                perm::user_has_permission(repo, user, self.category_id, perm::THREAD_EDIT_OWN)
                    .await?;
        }
        if !has_permission {
            has_permission =
                perm::user_has_permission(repo, user, self.category_id, perm::THREAD_EDIT).await?;
        }
        Ok(has_permission)
    }

    /// Whether the user may soft-delete this thread.
    pub async fn can_hide_by_user(&self, repo: &dyn Repo, user: Option<&User>) -> RepoResult<bool> {
        let Some(user) = user else {
            return Ok(false);
        };
        let mut has_permission = false;
        if self.user_id == user.id {
            has_permission =
                perm::user_has_permission(repo, user, self.category_id, perm::THREAD_HIDE_OWN)
                    .await?;
        }
        if !has_permission {
            has_permission =
                perm::user_has_permission(repo, user, self.category_id, perm::THREAD_HIDE).await?;
        }
        Ok(has_permission)
    }
}

async fn viewer_has(
    repo: &dyn Repo,
    viewer: Option<&User>,
    category_id: Id,
    action: &str,
) -> RepoResult<bool> {
    match viewer {
        Some(user) => perm::user_has_permission(repo, user, category_id, action).await,
        None => Ok(false),
    }
}

/// Single-row thread fetch through the LRU cache.
pub async fn get_thread_cached(
    repo: &dyn Repo,
    cache: &ThreadCache,
    id: Id,
) -> RepoResult<Thread> {
    if let Some(hit) = cache.get(&id) {
        return Ok(hit);
    }
    let thread = repo.get_thread(id).await?;
    cache.put(id, thread.clone());
    Ok(thread)
}

/// Builds the externally visible representation of a thread for one viewing
/// user (or an anonymous viewer).
///
/// Resolves the first post (backfilling `first_post_id` on legacy rows with
/// an only-if-null write), applies the reply-hidden content filter for
/// viewers who can neither edit nor have replied, and derives the capability
/// flags. All flags are independent checks except that `can_edit` is computed
/// once and reused for the hidden-content decision.
pub async fn thread_to_view(
    repo: &dyn Repo,
    cache: &ThreadCache,
    thread: &Thread,
    viewer: Option<&User>,
    options: &ViewOptions,
) -> RepoResult<ThreadView> {
    let mut thread = thread.clone();

    let first_post = match thread.first_post_id {
        Some(id) => repo.get_post(id).await.ok(),
        None => match repo.find_first_post(thread.id).await? {
            Some(post) => {
                // legacy rows lack first_post_id
                if repo.set_first_post_id_if_null(thread.id, post.id).await? {
                    cache.invalidate(&thread.id);
                }
                thread.first_post_id = Some(post.id);
                Some(post)
            }
            None => {
                tracing::warn!("thread {} has no first post", thread.id);
                None
            }
        },
    };

    let mut content = first_post
        .as_ref()
        .map(|p| p.content.clone())
        .unwrap_or_default();
    let can_edit = thread.can_edit_by_user(repo, viewer).await?;

    if markdown_has_reply_hidden_content(&content) {
        let has_reply = match viewer {
            Some(user) => repo.has_user_posted(thread.id, user.id).await?,
            None => false,
        };
        if !can_edit && !has_reply {
            content = filter_markdown_hidden_content(&content);
        }
    }

    let user = repo.get_user(thread.user_id).await?;

    let is_liked = if options.field_is_liked {
        match (viewer, thread.first_post_id) {
            (Some(viewer), Some(first_post_id)) => {
                repo.has_user_liked_post(first_post_id, viewer.id).await?
            }
            _ => false,
        }
    } else {
        false
    };

    let can_hide = thread.can_hide_by_user(repo, viewer).await?;
    let can_like = viewer_has(repo, viewer, thread.category_id, perm::THREAD_LIKE).await?;
    let can_reply = viewer_has(repo, viewer, thread.category_id, perm::THREAD_REPLY).await?;
    let can_essence = viewer_has(repo, viewer, thread.category_id, perm::THREAD_ESSENCE).await?;
    let can_sticky = viewer_has(repo, viewer, thread.category_id, perm::THREAD_STICKY).await?;
    let can_set_disable_post = viewer.map(|u| u.is_admin()).unwrap_or(false);
    let can_view_posts = match viewer {
        Some(user) => {
            perm::user_has_permission(repo, user, thread.category_id, perm::THREAD_VIEW_POSTS)
                .await?
        }
        None => {
            perm::tourist_has_permission(repo, thread.category_id, perm::THREAD_VIEW_POSTS).await?
        }
    };

    Ok(ThreadView {
        id: thread.id,
        user_id: thread.user_id,
        last_posted_user_id: thread.last_posted_user_id,
        category_id: thread.category_id,
        first_post_id: thread.first_post_id,
        is_approved: thread.is_approved,
        is_sticky: thread.is_sticky,
        is_essence: thread.is_essence,
        is_draft: thread.is_draft,
        disable_post: thread.disable_post,
        title: thread.title.clone(),
        content_for_indexes: thread.content_for_indexes.clone(),
        post_count: thread.post_count,
        view_count: thread.view_count,
        deleted_user_id: thread.deleted_user_id,
        posted_at: thread.posted_at,
        created_at: thread.created_at,
        updated_at: thread.updated_at,
        // legacy rows have no modified_at
        modified_at: thread.modified_at.unwrap_or(thread.created_at),
        deleted_at: thread.deleted_at,
        content,
        user,
        like_count: first_post.as_ref().map(|p| p.like_count).unwrap_or(0),
        reply_count: first_post.as_ref().map(|p| p.reply_count).unwrap_or(0),
        is_liked,
        can_edit,
        can_hide,
        can_like,
        can_reply,
        can_essence,
        can_sticky,
        can_set_disable_post,
        can_view_posts,
    })
}

/// Persists the thread, then refreshes the category's and the author's
/// thread counters as best-effort side effects. A failed refresh leaves the
/// counters stale and reports `Degraded`; it never fails the save.
pub async fn save_and_update_thread_count(
    repo: &dyn Repo,
    cache: &ThreadCache,
    thread: &Thread,
) -> RepoResult<(Thread, CounterRefresh)> {
    let saved = repo.save_thread(thread).await?;
    cache.invalidate(&saved.id);
    let refresh: Result<(), RepoError> = async {
        repo.update_category_thread_count(saved.category_id).await?;
        repo.update_user_thread_count(saved.user_id).await?;
        Ok(())
    }
    .await;
    match refresh {
        Ok(()) => Ok((saved, CounterRefresh::Applied)),
        Err(e) => {
            tracing::warn!("counter refresh failed for thread {}: {e}", saved.id);
            Ok((saved, CounterRefresh::Degraded))
        }
    }
}
