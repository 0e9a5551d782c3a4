//! 调度器状态存储
//!
//! 独立于博客库的小型 SQLite 键值表，保存上次自动备份时间。
//! 放在 `<data_dir>/logs/backup_scheduler.db`，恢复数据库时不会被覆盖。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::database::parse_datetime_flexible;

pub const STATE_FILE_NAME: &str = "backup_scheduler.db";

/// 上次自动备份时间存储键
const LAST_RUN_KEY: &str = "backup.last_run";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("调度状态库错误: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("调度状态库目录不可用: {0}")]
    Io(#[from] std::io::Error),
    #[error("调度状态读取任务异常: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StateError {
    /// 锁竞争类错误，值得稍后重试
    pub fn is_transient(&self) -> bool {
        match self {
            StateError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            StateError::Io(e) => {
                e.kind() == std::io::ErrorKind::WouldBlock
                    || e.to_string()
                        .to_lowercase()
                        .contains("resource temporarily unavailable")
            }
            StateError::Sqlite(other) => other
                .to_string()
                .to_lowercase()
                .contains("resource temporarily unavailable"),
            StateError::Task(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerStateStore {
    path: PathBuf,
}

impl SchedulerStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<logs_dir>/backup_scheduler.db`
    pub fn in_dir(logs_dir: &Path) -> Self {
        Self::new(logs_dir.join(STATE_FILE_NAME))
    }

    fn open(&self) -> Result<Connection, StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_millis(500))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(conn)
    }

    /// 读取上次运行时间；值无法解析时按"从未运行"处理
    pub fn get_last_run(&self) -> Result<Option<DateTime<Utc>>, StateError> {
        let conn = self.open()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![LAST_RUN_KEY],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value.and_then(|raw| match parse_datetime_flexible(&raw) {
            Ok(dt) => Some(dt),
            Err(e) => {
                warn!("[AutoBackup] 解析上次备份时间失败 '{}': {}", raw, e);
                None
            }
        }))
    }

    pub fn save_last_run(&self, at: DateTime<Utc>) -> Result<(), StateError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![LAST_RUN_KEY, at.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
