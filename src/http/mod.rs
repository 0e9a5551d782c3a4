//! HTTP 接口层
//!
//! 路由表、共享状态、维护模式中间件，以及 `AppError` 到 HTTP 响应的映射。

pub mod auth;
pub mod handlers;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::{CredentialGate, TokenService};
use crate::backup::BackupPipeline;
use crate::database::DatabaseManager;
use crate::maintenance::MaintenanceState;
use crate::models::{AppError, AppErrorType, MessageResponse};
use crate::restore::RestorePipeline;

/// 上传备份文件的大小上限
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// 所有处理器共享的状态，克隆只复制 `Arc`
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseManager>,
    pub tokens: Arc<TokenService>,
    pub gate: Arc<CredentialGate>,
    pub maintenance: Arc<MaintenanceState>,
    pub backup: Arc<BackupPipeline>,
    pub restore: Arc<RestorePipeline>,
}

pub fn build_router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(MAX_UPLOAD_BYTES);

    Router::new()
        .route("/", get(handlers::api_home))
        .route("/login", post(handlers::login))
        .route("/refresh", post(handlers::refresh))
        .route(
            "/blog",
            post(handlers::create_blog_post).get(handlers::read_blog_posts),
        )
        .route("/blog/slug/{slug}", get(handlers::read_blog_post_by_slug))
        .route(
            "/blog/{id}",
            get(handlers::read_blog_post)
                .put(handlers::update_blog_post)
                .delete(handlers::delete_blog_post),
        )
        .route("/latest-blogs", get(handlers::read_latest_blog_posts))
        .route("/all-blogs", get(handlers::read_all_blog_posts))
        .route("/blog-count", get(handlers::get_blog_count))
        .route(
            "/replace-database",
            post(handlers::replace_database).layer(upload_limit.clone()),
        )
        .route(
            "/replace-database/",
            post(handlers::replace_database).layer(upload_limit),
        )
        .route("/force-backup", post(handlers::force_backup))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            maintenance_gate,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 维护模式期间拒绝所有请求
async fn maintenance_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.maintenance.is_active() {
        return maintenance_response();
    }
    next.run(request).await
}

fn maintenance_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(MessageResponse::new(AppError::maintenance().message)),
    )
        .into_response()
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self.error_type {
            AppErrorType::Unauthorized => StatusCode::UNAUTHORIZED,
            AppErrorType::NotFound => StatusCode::NOT_FOUND,
            AppErrorType::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            AppErrorType::Maintenance => StatusCode::SERVICE_UNAVAILABLE,
            AppErrorType::Database
            | AppErrorType::FileSystem
            | AppErrorType::Configuration
            | AppErrorType::Network
            | AppErrorType::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self.error_type {
            AppErrorType::Maintenance => maintenance_response(),
            AppErrorType::Unauthorized => {
                let mut response =
                    (status, Json(json!({ "detail": self.message }))).into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            AppErrorType::Internal
            | AppErrorType::NotFound
            | AppErrorType::Validation => {
                (status, Json(json!({ "detail": self.message }))).into_response()
            }
            // 存储 / 网络细节只进日志
            _ => {
                error!("[Http] 请求失败 ({:?}): {}", self.error_type, self.message);
                (status, Json(json!({ "detail": "Internal server error" }))).into_response()
            }
        }
    }
}
