pub mod accounts;
pub mod auth;
pub mod cache;
pub mod comments;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod images;
pub mod jobs;
pub mod ledger;
pub mod mailer;
pub mod paging;
pub mod posts;
pub mod tags;
pub mod votes;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, patch, post},
    Router,
};

use crate::{cache::Cache, config::AppConfig, db::DbPool, images::ImageStore, jobs::JobQueue};

/// Multipart bodies carry the image plus form overhead.
const UPLOAD_BODY_LIMIT: usize = images::MAX_IMAGE_BYTES + 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<AppConfig>,
    pub cache: Cache,
    pub images: Arc<dyn ImageStore>,
    pub jobs: JobQueue,
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.config)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(|| async { "ok" }))
        // Accounts
        .route("/api/auth/register", post(accounts::register))
        .route("/api/auth/confirm-email", get(accounts::confirm_email))
        .route("/api/auth/login", post(accounts::login))
        .route("/api/auth/refresh-token", post(accounts::refresh_token))
        .route("/api/auth/me", get(accounts::me))
        .route(
            "/api/auth/users",
            get(accounts::list_users).delete(accounts::delete_user),
        )
        .route("/api/auth/users/roles", get(accounts::users_in_role))
        .route("/api/auth/user-roles", get(accounts::user_roles))
        .route("/api/auth/roles/add", post(accounts::add_roles))
        .route("/api/auth/roles/remove", post(accounts::remove_roles))
        .route("/api/auth/update-user", patch(accounts::update_user))
        .route("/api/auth/change-password", post(accounts::change_password))
        .route("/api/auth/forgot-password", post(accounts::forgot_password))
        .route(
            "/api/auth/reset-password",
            get(accounts::reset_password_form).post(accounts::reset_password),
        )
        .route("/api/auth/change-email", post(accounts::change_email))
        .route("/api/auth/confirm-email-change", get(accounts::confirm_email_change))
        // Posts
        .route("/api/posts", get(posts::list_posts).post(posts::create_post))
        .route("/api/posts/user-posts", get(posts::user_posts))
        .route(
            "/api/posts/{id}",
            get(posts::get_post)
                .patch(posts::update_post)
                .delete(posts::delete_post),
        )
        .route(
            "/api/posts/{id}/cover-image",
            patch(posts::update_cover_image).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        // Comments
        .route(
            "/api/posts/{id}/comments",
            get(comments::list_comments).post(comments::create_comment),
        )
        .route(
            "/api/comments/{id}",
            get(comments::get_comment)
                .put(comments::update_comment)
                .delete(comments::delete_comment),
        )
        // Votes
        .route("/api/comments/{id}/vote", post(votes::cast_vote))
        .route("/api/comments/{id}/votes", get(votes::get_votes))
        // Tags
        .route("/api/tags", get(tags::list_tags).post(tags::create_tag))
        .route(
            "/api/tags/{id}",
            get(tags::get_tag)
                .put(tags::update_tag)
                .delete(tags::delete_tag),
        )
        .route("/api/tags/{id}/posts", get(tags::tag_posts))
        .with_state(state)
}
