use crate::models::{
    ApprovalStatus, Category, NewCategory, NewUser, Post, Thread, ThreadView, UpdateThread, User,
};
use crate::routes::{CreatePostRequest, CreateThreadRequest, FlagRequest, GrantPermissionRequest};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_categories,
        crate::routes::create_category,
        crate::routes::list_threads,
        crate::routes::create_thread,
        crate::routes::get_thread,
        crate::routes::update_thread,
        crate::routes::list_posts,
        crate::routes::create_post,
    ),
    components(schemas(
        ApprovalStatus, Category, NewCategory, User, NewUser, Thread, ThreadView, UpdateThread,
        Post, CreateThreadRequest, CreatePostRequest, FlagRequest, GrantPermissionRequest
    )),
    tags(
        (name = "categories", description = "Category operations"),
        (name = "threads", description = "Thread operations"),
        (name = "posts", description = "Reply operations"),
    )
)]
pub struct ApiDoc;
