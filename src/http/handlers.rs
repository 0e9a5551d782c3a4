//! 路由处理器
//!
//! 数据库、argon2 等阻塞操作一律放到 `spawn_blocking` 中执行。

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::auth::{cookie_value, AdminUser, OptionalAdmin, REFRESH_COOKIE};
use super::AppState;
use crate::database::BlogPostRepo;
use crate::models::{
    AccessTokenResponse, AppError, BlogPost, BlogPostCreate, BlogPostUpdate, LatestQuery,
    LoginRequest, MessageResponse, PageQuery, TokenPair,
};

const POST_NOT_FOUND: &str = "Blog post not found";
const UPLOAD_FIELD: &str = "file";

async fn blocking<T, F>(task: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await?
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

fn post_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, AppError> {
    path.map(|Path(id)| id)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

fn query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

pub async fn api_home() -> Json<MessageResponse> {
    Json(MessageResponse::new("API is running"))
}

// ============================================================================
// 认证
// ============================================================================

pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenPair>, AppError> {
    let request = json_body(body)?;
    let gate = Arc::clone(&state.gate);
    let tokens = Arc::clone(&state.tokens);
    let pair = blocking(move || {
        gate.authenticate(&tokens, &request.username, &request.password, &request.totp)
    })
    .await?;
    Ok(Json(pair))
}

/// 用 cookie 中的刷新令牌换取新的访问令牌，同时轮换刷新令牌
pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    let token = cookie_value(&headers, REFRESH_COOKIE)
        .ok_or_else(|| AppError::unauthorized("No refresh token provided"))?;
    let subject = state.tokens.verify_refresh(token)?;
    if subject != state.gate.username() {
        return Err(AppError::unauthorized("Could not validate credentials"));
    }

    let access_token = state.tokens.issue_access(&subject)?;
    let rotated = state.tokens.issue_refresh(&subject)?;
    let cookie = format!(
        "{}={}; HttpOnly; Secure; SameSite=None; Path=/; Max-Age={}",
        REFRESH_COOKIE,
        rotated,
        state.tokens.refresh_ttl().num_seconds()
    );
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|e| AppError::internal(format!("构建 Set-Cookie 失败: {}", e)))?;

    let mut response = Json(AccessTokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    })
    .into_response();
    response.headers_mut().insert(SET_COOKIE, cookie);
    Ok(response)
}

// ============================================================================
// 博客文章
// ============================================================================

pub async fn create_blog_post(
    State(state): State<AppState>,
    _admin: AdminUser,
    body: Result<Json<BlogPostCreate>, JsonRejection>,
) -> Result<Json<BlogPost>, AppError> {
    let input = json_body(body)?;
    input.validate()?;
    let db = Arc::clone(&state.db);
    let post = blocking(move || BlogPostRepo::create_post(&db, &input)).await?;
    Ok(Json(post))
}

pub async fn read_blog_posts(
    State(state): State<AppState>,
    params: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Vec<BlogPost>>, AppError> {
    let page = query(params)?;
    let db = Arc::clone(&state.db);
    let posts = blocking(move || BlogPostRepo::list_page(&db, page.skip, page.limit)).await?;
    Ok(Json(posts))
}

/// 匿名读取计一次浏览，管理员读取不计
pub async fn read_blog_post(
    State(state): State<AppState>,
    viewer: OptionalAdmin,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<BlogPost>, AppError> {
    let id = post_id(path)?;
    let db = Arc::clone(&state.db);
    let count_view = !viewer.is_admin;
    blocking(move || BlogPostRepo::view_post(&db, &id, count_view))
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(POST_NOT_FOUND))
}

pub async fn read_blog_post_by_slug(
    State(state): State<AppState>,
    viewer: OptionalAdmin,
    Path(slug): Path<String>,
) -> Result<Json<BlogPost>, AppError> {
    let db = Arc::clone(&state.db);
    let count_view = !viewer.is_admin;
    blocking(move || {
        let Some(found) = BlogPostRepo::find_by_slug(&db, &slug)? else {
            return Ok(None);
        };
        BlogPostRepo::view_post(&db, &found.id, count_view)
    })
    .await?
    .map(Json)
    .ok_or_else(|| AppError::not_found(POST_NOT_FOUND))
}

pub async fn update_blog_post(
    State(state): State<AppState>,
    _admin: AdminUser,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<BlogPostUpdate>, JsonRejection>,
) -> Result<Json<BlogPost>, AppError> {
    let id = post_id(path)?;
    let changes = json_body(body)?;
    if changes.is_empty() {
        return Err(AppError::validation("没有提供任何需要更新的字段"));
    }
    let db = Arc::clone(&state.db);
    blocking(move || BlogPostRepo::update_post(&db, &id, &changes))
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(POST_NOT_FOUND))
}

pub async fn delete_blog_post(
    State(state): State<AppState>,
    _admin: AdminUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<BlogPost>, AppError> {
    let id = post_id(path)?;
    let db = Arc::clone(&state.db);
    blocking(move || BlogPostRepo::delete_post(&db, &id))
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(POST_NOT_FOUND))
}

pub async fn read_latest_blog_posts(
    State(state): State<AppState>,
    params: Result<Query<LatestQuery>, QueryRejection>,
) -> Result<Json<Vec<BlogPost>>, AppError> {
    let latest = query(params)?;
    let db = Arc::clone(&state.db);
    let posts = blocking(move || BlogPostRepo::list_latest(&db, latest.limit)).await?;
    Ok(Json(posts))
}

pub async fn read_all_blog_posts(
    State(state): State<AppState>,
) -> Result<Json<Vec<BlogPost>>, AppError> {
    let db = Arc::clone(&state.db);
    let posts = blocking(move || BlogPostRepo::list_all(&db)).await?;
    Ok(Json(posts))
}

pub async fn get_blog_count(State(state): State<AppState>) -> Result<Json<i64>, AppError> {
    let db = Arc::clone(&state.db);
    let count = blocking(move || BlogPostRepo::count_posts(&db)).await?;
    Ok(Json(count))
}

// ============================================================================
// 备份 / 恢复
// ============================================================================

/// 上传加密备份并替换在线数据库
pub async fn replace_database(
    State(state): State<AppState>,
    admin: AdminUser,
    mut multipart: Multipart,
) -> Result<Json<MessageResponse>, AppError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("读取上传内容失败: {}", e)))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::validation(format!("读取上传文件失败: {}", e)))?;
            upload = Some(bytes.to_vec());
            break;
        }
    }
    let upload = upload.ok_or_else(|| AppError::validation("缺少上传字段 'file'"))?;

    info!("[Http] {} 发起数据库替换", admin.username);
    state.restore.restore(upload).await?;
    Ok(Json(MessageResponse::new("Database replaced successfully")))
}

/// 在后台立即执行一次备份
pub async fn force_backup(
    State(state): State<AppState>,
    admin: AdminUser,
) -> Json<MessageResponse> {
    info!("[Http] {} 手动触发备份", admin.username);
    let backup = Arc::clone(&state.backup);
    tokio::spawn(async move {
        if backup.run_logged().await.is_none() {
            warn!("[Http] 手动备份未完成");
        }
    });
    Json(MessageResponse::new("Backup started"))
}
