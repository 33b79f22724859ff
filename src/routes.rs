use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;

use crate::auth::Auth;
use crate::cache::ThreadCache;
use crate::error::ApiError;
use crate::markdown::markdown_to_pure_text;
use crate::models::*;
use crate::perm;
use crate::rate_limit::RateLimiterFacade;
use crate::render::{transform_render_html_for_upload, ResourceUrlConfig};
use crate::repo::{Repo, ThreadListFilter};
use crate::view::{
    get_thread_cached, save_and_update_thread_count, thread_to_view, ViewOptions,
};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/categories")
                    .route(web::get().to(list_categories))
                    .route(web::post().to(create_category)),
            )
            .service(web::resource("/categories/{id}/threads").route(web::get().to(list_threads)))
            .service(web::resource("/threads").route(web::post().to(create_thread)))
            .service(
                web::resource("/threads/{id}")
                    .route(web::get().to(get_thread))
                    .route(web::patch().to(update_thread)),
            )
            .service(web::resource("/threads/{id}/hide").route(web::post().to(hide_thread)))
            .service(web::resource("/threads/{id}/restore").route(web::post().to(restore_thread)))
            .service(web::resource("/threads/{id}/sticky").route(web::post().to(set_sticky)))
            .service(web::resource("/threads/{id}/essence").route(web::post().to(set_essence)))
            .service(
                web::resource("/threads/{id}/disable-post")
                    .route(web::post().to(set_disable_post)),
            )
            .service(
                web::resource("/threads/{id}/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(
                web::resource("/posts/{id}/like")
                    .route(web::post().to(like_post))
                    .route(web::delete().to(unlike_post)),
            )
            .service(web::resource("/auth/me").route(web::get().to(auth_me)))
            // Admin endpoints
            .service(web::resource("/admin/users").route(web::post().to(admin_create_user)))
            .service(
                web::resource("/admin/groups/{id}/permissions")
                    .route(web::post().to(admin_grant_permission))
                    .route(web::delete().to(admin_revoke_permission)),
            ),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub thread_cache: Arc<ThreadCache>,
    pub rate_limiter: RateLimiterFacade,
    pub resource: ResourceUrlConfig,
}

// ---------------- request payloads -----------------------

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct CreateThreadRequest {
    pub category_id: Id,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub is_draft: bool,
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct CreatePostRequest {
    pub content: String,
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct FlagRequest {
    pub value: bool,
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct GrantPermissionRequest {
    pub permission: String,
}

// ---------------- helpers -----------------------

/// Resolves the authenticated viewer, if any. A token for a user row that no
/// longer exists degrades to anonymous rather than failing the request.
async fn resolve_viewer(repo: &dyn Repo, auth: Option<&Auth>) -> Option<User> {
    let claims = &auth?.0;
    let user_id = claims.user_id()?;
    repo.get_user(user_id).await.ok()
}

async fn require_viewer(repo: &dyn Repo, auth: &Auth) -> Result<User, ApiError> {
    let user_id = auth.0.user_id().ok_or(ApiError::Forbidden)?;
    repo.get_user(user_id).await.map_err(|_| ApiError::Forbidden)
}

macro_rules! ensure_admin {
    ($viewer:expr) => {
        if !$viewer.is_admin() {
            return Err(ApiError::Forbidden);
        }
    };
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

/// Whether the thread is visible to this viewer at all: drafts are
/// owner-only, soft-deleted and unapproved threads are owner/admin-only.
fn thread_visible_to(thread: &Thread, viewer: Option<&User>) -> bool {
    let is_owner = viewer.map(|u| u.id == thread.user_id).unwrap_or(false);
    let is_admin = viewer.map(|u| u.is_admin()).unwrap_or(false);
    if thread.is_draft {
        return is_owner;
    }
    if thread.deleted_at.is_some() {
        return is_admin;
    }
    if thread.is_approved != ApprovalStatus::Ok {
        return is_owner || is_admin;
    }
    true
}

// ---------------- categories -----------------------

#[utoipa::path(
    get,
    path = "/api/v1/categories",
    responses(
        (status = 200, description = "List categories", body = [Category])
    )
)]
pub async fn list_categories(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let categories = data.repo.list_categories().await?;
    Ok(HttpResponse::Ok().json(categories))
}

#[utoipa::path(
    post,
    path = "/api/v1/categories",
    request_body = NewCategory,
    responses(
        (status = 201, description = "Category created", body = Category),
        (status = 403, description = "Forbidden – Admins only"),
        (status = 409, description = "Conflict")
    )
)]
pub async fn create_category(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewCategory>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    ensure_admin!(viewer);
    let category = data.repo.create_category(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(category))
}

// ---------------- threads -----------------------

#[utoipa::path(
    get,
    path = "/api/v1/categories/{id}/threads",
    params(("id" = Id, Path, description = "Category id")),
    responses(
        (status = 200, description = "List threads (sticky first, then latest activity)", body = [ThreadView]),
        (status = 404, description = "Category not found")
    )
)]
pub async fn list_threads(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let category_id = path.into_inner();
    data.repo.get_category(category_id).await?;
    let viewer = resolve_viewer(data.repo.as_ref(), auth.as_ref()).await;
    let threads = data
        .repo
        .list_threads(category_id, ThreadListFilter::Normal)
        .await?;
    // list views skip the per-row like lookup
    let opts = ViewOptions {
        field_is_liked: false,
    };
    let mut views = Vec::with_capacity(threads.len());
    for thread in &threads {
        views.push(
            thread_to_view(
                data.repo.as_ref(),
                &data.thread_cache,
                thread,
                viewer.as_ref(),
                &opts,
            )
            .await?,
        );
    }
    Ok(HttpResponse::Ok().json(views))
}

#[utoipa::path(
    post,
    path = "/api/v1/threads",
    request_body = CreateThreadRequest,
    responses(
        (status = 201, description = "Thread created", body = ThreadView),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Category not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_thread(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<CreateThreadRequest>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    let payload = payload.into_inner();
    data.repo.get_category(payload.category_id).await?;
    if !perm::user_has_permission(
        data.repo.as_ref(),
        &viewer,
        payload.category_id,
        perm::THREAD_CREATE,
    )
    .await?
    {
        return Err(ApiError::Forbidden);
    }
    if !data.rate_limiter.allow_thread(&client_ip(&req)) {
        return Err(ApiError::RateLimited);
    }

    let content = transform_render_html_for_upload(&data.resource, &payload.content);
    let content_for_indexes = markdown_to_pure_text(&content);
    let thread = data
        .repo
        .create_thread(NewThread {
            user_id: viewer.id,
            category_id: payload.category_id,
            title: payload.title,
            content,
            content_for_indexes,
            is_draft: payload.is_draft,
        })
        .await?;
    refresh_counters_best_effort(data.repo.as_ref(), &thread).await;

    let view = thread_to_view(
        data.repo.as_ref(),
        &data.thread_cache,
        &thread,
        Some(&viewer),
        &ViewOptions::default(),
    )
    .await?;
    Ok(HttpResponse::Created().json(view))
}

#[utoipa::path(
    get,
    path = "/api/v1/threads/{id}",
    params(
        ("id" = Id, Path, description = "Thread id"),
        ("skip_liked" = Option<bool>, Query, description = "Skip the is_liked lookup")
    ),
    responses(
        (status = 200, description = "Thread view for the current viewer", body = ThreadView),
        (status = 404, description = "Thread not found")
    )
)]
pub async fn get_thread(
    req: HttpRequest,
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let thread_id = path.into_inner();
    let viewer = resolve_viewer(data.repo.as_ref(), auth.as_ref()).await;
    let mut thread =
        get_thread_cached(data.repo.as_ref(), &data.thread_cache, thread_id).await?;
    if !thread_visible_to(&thread, viewer.as_ref()) {
        return Err(ApiError::NotFound);
    }

    // keep the cached row in step with the bumped counter
    match data.repo.increment_view_count(thread_id).await {
        Ok(count) => {
            thread.view_count = count;
            data.thread_cache.put(thread_id, thread.clone());
        }
        Err(e) => tracing::warn!("view count bump failed for thread {thread_id}: {e}"),
    }

    let opts = ViewOptions {
        field_is_liked: !req.query_string().contains("skip_liked=1"),
    };
    let view = thread_to_view(
        data.repo.as_ref(),
        &data.thread_cache,
        &thread,
        viewer.as_ref(),
        &opts,
    )
    .await?;
    Ok(HttpResponse::Ok().json(view))
}

#[utoipa::path(
    patch,
    path = "/api/v1/threads/{id}",
    request_body = UpdateThread,
    params(("id" = Id, Path, description = "Thread id")),
    responses(
        (status = 200, description = "Thread updated", body = ThreadView),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Thread not found")
    )
)]
pub async fn update_thread(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateThread>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    let mut thread = data.repo.get_thread(path.into_inner()).await?;
    if !thread
        .can_edit_by_user(data.repo.as_ref(), Some(&viewer))
        .await?
    {
        return Err(ApiError::Forbidden);
    }
    let payload = payload.into_inner();

    if let Some(title) = payload.title {
        thread.title = title;
    }
    if let Some(content) = payload.content {
        let content = transform_render_html_for_upload(&data.resource, &content);
        thread.content_for_indexes = markdown_to_pure_text(&content);
        let first_post_id = match thread.first_post_id {
            Some(id) => id,
            None => data
                .repo
                .find_first_post(thread.id)
                .await?
                .ok_or(ApiError::NotFound)?
                .id,
        };
        let mut first_post = data.repo.get_post(first_post_id).await?;
        first_post.content = content;
        data.repo.save_post(&first_post).await?;
    }
    if let Some(is_draft) = payload.is_draft {
        thread.is_draft = is_draft;
    }
    thread.modified_at = Some(Utc::now());

    let (saved, _) =
        save_and_update_thread_count(data.repo.as_ref(), &data.thread_cache, &thread).await?;
    let view = thread_to_view(
        data.repo.as_ref(),
        &data.thread_cache,
        &saved,
        Some(&viewer),
        &ViewOptions::default(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn hide_thread(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    let mut thread = data.repo.get_thread(path.into_inner()).await?;
    if !thread
        .can_hide_by_user(data.repo.as_ref(), Some(&viewer))
        .await?
    {
        return Err(ApiError::Forbidden);
    }
    thread.deleted_at = Some(Utc::now());
    thread.deleted_user_id = Some(viewer.id);
    save_and_update_thread_count(data.repo.as_ref(), &data.thread_cache, &thread).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status":"ok"})))
}

pub async fn restore_thread(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    let mut thread = data.repo.get_thread(path.into_inner()).await?;
    // restoring is a moderator action; the owner-form permission is not enough
    if !perm::user_has_permission(
        data.repo.as_ref(),
        &viewer,
        thread.category_id,
        perm::THREAD_HIDE,
    )
    .await?
    {
        return Err(ApiError::Forbidden);
    }
    thread.deleted_at = None;
    thread.deleted_user_id = None;
    save_and_update_thread_count(data.repo.as_ref(), &data.thread_cache, &thread).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status":"ok"})))
}

async fn set_thread_flag(
    data: &AppState,
    thread_id: Id,
    viewer: &User,
    action: &str,
    apply: impl FnOnce(&mut Thread, bool),
    value: bool,
) -> Result<HttpResponse, ApiError> {
    let mut thread = data.repo.get_thread(thread_id).await?;
    if !perm::user_has_permission(data.repo.as_ref(), viewer, thread.category_id, action).await? {
        return Err(ApiError::Forbidden);
    }
    apply(&mut thread, value);
    data.repo.save_thread(&thread).await?;
    data.thread_cache.invalidate(&thread.id);
    Ok(HttpResponse::Ok().json(serde_json::json!({"status":"ok"})))
}

pub async fn set_sticky(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<FlagRequest>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    set_thread_flag(
        &data,
        path.into_inner(),
        &viewer,
        perm::THREAD_STICKY,
        |t, v| t.is_sticky = v,
        payload.value,
    )
    .await
}

pub async fn set_essence(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<FlagRequest>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    set_thread_flag(
        &data,
        path.into_inner(),
        &viewer,
        perm::THREAD_ESSENCE,
        |t, v| t.is_essence = v,
        payload.value,
    )
    .await
}

pub async fn set_disable_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<FlagRequest>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    ensure_admin!(viewer);
    let mut thread = data.repo.get_thread(path.into_inner()).await?;
    thread.disable_post = payload.value;
    data.repo.save_thread(&thread).await?;
    data.thread_cache.invalidate(&thread.id);
    Ok(HttpResponse::Ok().json(serde_json::json!({"status":"ok"})))
}

// ---------------- posts -----------------------

#[utoipa::path(
    get,
    path = "/api/v1/threads/{id}/posts",
    params(("id" = Id, Path, description = "Thread id")),
    responses(
        (status = 200, description = "List replies", body = [Post]),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Thread not found")
    )
)]
pub async fn list_posts(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let thread_id = path.into_inner();
    let viewer = resolve_viewer(data.repo.as_ref(), auth.as_ref()).await;
    let thread = get_thread_cached(data.repo.as_ref(), &data.thread_cache, thread_id).await?;
    if !thread_visible_to(&thread, viewer.as_ref()) {
        return Err(ApiError::NotFound);
    }
    let can_view = match viewer.as_ref() {
        Some(user) => {
            perm::user_has_permission(
                data.repo.as_ref(),
                user,
                thread.category_id,
                perm::THREAD_VIEW_POSTS,
            )
            .await?
        }
        None => {
            perm::tourist_has_permission(
                data.repo.as_ref(),
                thread.category_id,
                perm::THREAD_VIEW_POSTS,
            )
            .await?
        }
    };
    if !can_view {
        return Err(ApiError::Forbidden);
    }
    let posts = data.repo.list_posts(thread_id).await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    post,
    path = "/api/v1/threads/{id}/posts",
    request_body = CreatePostRequest,
    params(("id" = Id, Path, description = "Thread id")),
    responses(
        (status = 201, description = "Reply created", body = Post),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Thread not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_post(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<CreatePostRequest>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    let thread_id = path.into_inner();
    let thread = data.repo.get_thread(thread_id).await?;
    if thread.deleted_at.is_some() || thread.is_draft {
        return Err(ApiError::NotFound);
    }
    if thread.disable_post {
        return Err(ApiError::Forbidden);
    }
    if !perm::user_has_permission(
        data.repo.as_ref(),
        &viewer,
        thread.category_id,
        perm::THREAD_REPLY,
    )
    .await?
    {
        return Err(ApiError::Forbidden);
    }
    if !data.rate_limiter.allow_post(&client_ip(&req)) {
        return Err(ApiError::RateLimited);
    }
    let content = transform_render_html_for_upload(&data.resource, &payload.content);
    let post = data
        .repo
        .create_post(NewPost {
            thread_id,
            user_id: viewer.id,
            content,
        })
        .await?;
    // post_count / posted_at changed underneath the cached row
    data.thread_cache.invalidate(&thread_id);
    Ok(HttpResponse::Created().json(post))
}

async fn set_like(
    auth: Auth,
    data: web::Data<AppState>,
    post_id: Id,
    liked: bool,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    let post = data.repo.get_post(post_id).await?;
    let thread = data.repo.get_thread(post.thread_id).await?;
    if !perm::user_has_permission(
        data.repo.as_ref(),
        &viewer,
        thread.category_id,
        perm::THREAD_LIKE,
    )
    .await?
    {
        return Err(ApiError::Forbidden);
    }
    let changed = data.repo.set_post_liked(post_id, viewer.id, liked).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status":"ok", "changed": changed})))
}

pub async fn like_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    set_like(auth, data, path.into_inner(), true).await
}

pub async fn unlike_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    set_like(auth, data, path.into_inner(), false).await
}

// ---------------- auth / admin -----------------------

pub async fn auth_me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    Ok(HttpResponse::Ok().json(viewer))
}

pub async fn admin_create_user(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewUser>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    ensure_admin!(viewer);
    let user = data.repo.create_user(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(user))
}

pub async fn admin_grant_permission(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<GrantPermissionRequest>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    ensure_admin!(viewer);
    data.repo
        .grant_group_permission(path.into_inner(), &payload.permission)
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status":"ok"})))
}

pub async fn admin_revoke_permission(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<GrantPermissionRequest>,
) -> Result<HttpResponse, ApiError> {
    let viewer = require_viewer(data.repo.as_ref(), &auth).await?;
    ensure_admin!(viewer);
    data.repo
        .revoke_group_permission(path.into_inner(), &payload.permission)
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status":"ok"})))
}

/// Counter refresh after create shares the best-effort policy of
/// `save_and_update_thread_count`.
async fn refresh_counters_best_effort(repo: &dyn Repo, thread: &Thread) {
    if let Err(e) = repo.update_category_thread_count(thread.category_id).await {
        tracing::warn!("category count refresh failed for thread {}: {e}", thread.id);
    }
    if let Err(e) = repo.update_user_thread_count(thread.user_id).await {
        tracing::warn!("user count refresh failed for thread {}: {e}", thread.id);
    }
}
