//! 请求认证提取器
//!
//! - `AdminUser`：必须携带有效的管理员访问令牌，否则 401
//! - `OptionalAdmin`：令牌有效则视为已登录，任何失败都静默退回匿名

use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tracing::debug;

use super::AppState;
use crate::models::AppError;

pub const REFRESH_COOKIE: &str = "refresh_token";

/// 已认证的管理员
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub username: String,
}

/// 可选认证：`is_admin` 为真表示请求来自管理员
#[derive(Debug, Clone, Copy)]
pub struct OptionalAdmin {
    pub is_admin: bool,
}

/// 取出 `Authorization: Bearer <token>` 中的令牌
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = value.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") || parts.next().is_some() {
        return None;
    }
    Some(token)
}

/// 在所有 `Cookie` 头中查找指定名称的值
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

fn admin_from_headers(state: &AppState, headers: &HeaderMap) -> Result<AdminUser, AppError> {
    let token = bearer_token(headers).ok_or_else(|| AppError::unauthorized("Not authenticated"))?;
    let subject = state.tokens.verify_access(token)?;
    if subject != state.gate.username() {
        return Err(AppError::unauthorized("Could not validate credentials"));
    }
    Ok(AdminUser { username: subject })
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        admin_from_headers(state, &parts.headers)
    }
}

impl FromRequestParts<AppState> for OptionalAdmin {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if parts.headers.get(AUTHORIZATION).is_none() {
            return Ok(OptionalAdmin { is_admin: false });
        }
        let is_admin = match admin_from_headers(state, &parts.headers) {
            Ok(_) => true,
            Err(e) => {
                debug!("[Auth] 可选认证失败，按匿名处理: {}", e);
                false
            }
        };
        Ok(OptionalAdmin { is_admin })
    }
}
