//! 数据库恢复流水线
//!
//! 上传文件 → 解密 → 解压 → 完整性检查 → 原子替换在线数据库。
//! 整个过程持有 `MaintenanceGuard`，任何出口（含 panic）都会退出维护模式。

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::backup_common::{extract_single_file, TempArtifacts};
use crate::config::SecretString;
use crate::crypto::backup_crypto::decrypt_file;
use crate::database::DatabaseManager;
use crate::maintenance::MaintenanceState;
use crate::models::AppError;

const UPLOAD_FILE: &str = "restore_upload.enc";
const DECRYPTED_FILE: &str = "restore_upload.zip";
const EXTRACTED_FILE: &str = "restore_extracted.db";

/// 对外只暴露这一条信息，具体原因写日志
const RESTORE_FAILED: &str = "Database restore failed";

/// 故障注入点，用于验证失败路径上的清理与维护模式复位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreFault {
    Decompress,
}

pub struct RestorePipeline {
    db: Arc<DatabaseManager>,
    maintenance: Arc<MaintenanceState>,
    work_dir: PathBuf,
    passphrase: SecretString,
    fault: Option<RestoreFault>,
}

impl RestorePipeline {
    pub fn new(
        db: Arc<DatabaseManager>,
        maintenance: Arc<MaintenanceState>,
        work_dir: PathBuf,
        passphrase: SecretString,
    ) -> Self {
        Self {
            db,
            maintenance,
            work_dir,
            passphrase,
            fault: None,
        }
    }

    #[doc(hidden)]
    pub fn with_fault(mut self, fault: RestoreFault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// 用上传的加密备份替换在线数据库
    ///
    /// 失败时返回统一的内部错误，细节只进日志。
    /// guard 归阻塞任务所有：请求被取消时，维护模式一直持续到替换结束。
    pub async fn restore(&self, upload: Vec<u8>) -> Result<(), AppError> {
        let guard = self.maintenance.begin()?;
        info!("[Restore] 开始恢复，上传大小 {} bytes", upload.len());

        let db = Arc::clone(&self.db);
        let work_dir = self.work_dir.clone();
        let passphrase = self.passphrase.clone();
        let fault = self.fault;
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            match restore_blocking(&db, &work_dir, &passphrase, &upload, fault) {
                Ok(()) => {
                    info!("[Restore] 数据库替换完成");
                    Ok(())
                }
                Err(e) => {
                    error!("[Restore] 恢复失败: {}", e);
                    Err(AppError::internal(RESTORE_FAILED))
                }
            }
        })
        .await
        .map_err(|e| {
            error!("[Restore] 恢复任务异常退出: {}", e);
            AppError::internal(RESTORE_FAILED)
        })?
    }
}

fn restore_blocking(
    db: &DatabaseManager,
    work_dir: &Path,
    passphrase: &SecretString,
    upload: &[u8],
    fault: Option<RestoreFault>,
) -> Result<(), AppError> {
    fs::create_dir_all(work_dir)?;
    let mut artifacts = TempArtifacts::new();

    let uploaded = artifacts.track(work_dir.join(UPLOAD_FILE));
    fs::write(&uploaded, upload)?;

    let decrypted = artifacts.track(work_dir.join(DECRYPTED_FILE));
    decrypt_file(&uploaded, &decrypted, passphrase.expose())?;
    debug!("[Restore] 解密完成");

    if fault == Some(RestoreFault::Decompress) {
        return Err(AppError::file_system("注入故障: 解压失败"));
    }
    let extracted = artifacts.track(work_dir.join(EXTRACTED_FILE));
    // 完整性检查会打开该文件，可能留下 WAL 附属文件
    for suffix in ["-wal", "-shm"] {
        artifacts.track(work_dir.join(format!("{}{}", EXTRACTED_FILE, suffix)));
    }
    let size = extract_single_file(&decrypted, &extracted)?;
    debug!("[Restore] 解压完成 ({} bytes)", size);

    verify_database_file(&extracted)?;

    db.replace_with(&extracted)?;
    Ok(())
}

/// 替换前确认解出的文件是完好的 SQLite 数据库
fn verify_database_file(path: &Path) -> Result<(), AppError> {
    let conn = Connection::open(path)
        .map_err(|e| AppError::validation(format!("无法打开恢复的数据库文件: {}", e)))?;
    let result: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| AppError::validation(format!("恢复的文件不是 SQLite 数据库: {}", e)))?;
    if result != "ok" {
        return Err(AppError::validation(format!(
            "恢复的数据库完整性检查失败: {}",
            result
        )));
    }
    Ok(())
}
