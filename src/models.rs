use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// 博客文章
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogPost {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub view_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlogPostCreate {
    pub title: String,
    pub content: String,
    pub author: String,
}

impl BlogPostCreate {
    pub fn validate(&self) -> Result<(), AppError> {
        let mut empty = Vec::new();
        if self.title.trim().is_empty() {
            empty.push("title");
        }
        if self.content.trim().is_empty() {
            empty.push("content");
        }
        if self.author.trim().is_empty() {
            empty.push("author");
        }
        if empty.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(format!(
                "字段不能为空: {}",
                empty.join(", ")
            )))
        }
    }
}

/// 部分更新：未提供的字段保持不变
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlogPostUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

impl BlogPostUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.author.is_none()
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_page_limit")]
    pub limit: u32,
}

fn default_page_limit() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LatestQuery {
    #[serde(default = "default_latest_limit")]
    pub limit: u32,
}

fn default_latest_limit() -> u32 {
    5
}

// ============================================================================
// 认证
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub totp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ============================================================================
// 结构化错误处理
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorType {
    Validation,
    Unauthorized,
    Database,
    FileSystem,
    NotFound,
    Configuration,
    Network,
    Maintenance,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Unauthorized, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Database, message)
    }

    pub fn file_system(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::FileSystem, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::NotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Configuration, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Network, message)
    }

    pub fn maintenance() -> Self {
        Self::new(AppErrorType::Maintenance, "Server is in maintenance mode")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Internal, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

// 实现从其他错误类型的转换
impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::file_system(format!("ZIP操作错误: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::file_system(format!("文件系统错误: {}", err))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::database(format!("数据库错误: {}", err))
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::database(format!("从连接池获取连接失败: {}", err))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::internal(format!("后台任务异常退出: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_validation_reports_all_empty_fields() {
        let req = BlogPostCreate {
            title: " ".into(),
            content: "body".into(),
            author: "".into(),
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.error_type, AppErrorType::Validation);
        assert!(err.message.contains("title"));
        assert!(err.message.contains("author"));
        assert!(!err.message.contains("content"));
    }

    #[test]
    fn test_page_query_defaults() {
        let q: PageQuery = serde_json::from_str("{}").unwrap();
        assert_eq!((q.skip, q.limit), (0, 10));
        let q: LatestQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.limit, 5);
    }

    #[test]
    fn test_update_is_empty() {
        assert!(BlogPostUpdate::default().is_empty());
        let update = BlogPostUpdate {
            title: Some("t".into()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
