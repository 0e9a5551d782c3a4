//! 数据库备份流水线
//!
//! 导出快照 → ZIP 压缩 → 口令加密 → 邮件投递 → 清理中间文件。
//!
//! 中间文件登记在 `TempArtifacts` 中，无论哪一步失败（包括投递失败）
//! 都会在流水线结束时删除，加密前的明文快照不会残留在磁盘上。
//! 无人值守的调用方使用 `run_logged`：失败只记日志，不向上传播。

use chrono::Local;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::backup_common::{
    calculate_file_hash, compress_single_file, TempArtifacts,
};
use crate::config::SecretString;
use crate::crypto::backup_crypto::{encrypt_file, KdfParams};
use crate::database::{BlogPostRepo, DatabaseManager};
use crate::mailer::{BackupMail, BackupMailer};
use crate::models::AppError;

const SNAPSHOT_PREFIX: &str = "exported_db_";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H_%M_%S";

/// 一次成功备份的摘要
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub timestamp: String,
    pub post_count: i64,
    pub artifact_name: String,
    pub artifact_bytes: u64,
    pub artifact_sha256: String,
}

/// 阻塞阶段的产物：加密文件内容 + 仍需清理的中间文件
struct PreparedArtifact {
    artifacts: TempArtifacts,
    report: BackupReport,
    bytes: Vec<u8>,
}

pub struct BackupPipeline {
    db: Arc<DatabaseManager>,
    mailer: Arc<dyn BackupMailer>,
    work_dir: PathBuf,
    passphrase: SecretString,
    kdf: KdfParams,
    /// 同一时刻只允许一次备份，避免同秒时间戳的文件名冲突
    limiter: Semaphore,
}

impl BackupPipeline {
    pub fn new(
        db: Arc<DatabaseManager>,
        mailer: Arc<dyn BackupMailer>,
        work_dir: PathBuf,
        passphrase: SecretString,
    ) -> Self {
        Self {
            db,
            mailer,
            work_dir,
            passphrase,
            kdf: KdfParams::default(),
            limiter: Semaphore::new(1),
        }
    }

    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }

    /// 执行完整流水线，失败时返回错误（中间文件已清理）
    pub async fn run(&self) -> Result<BackupReport, AppError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| AppError::internal(format!("备份限流器已关闭: {}", e)))?;

        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        info!("[Backup] 开始备份: {}", timestamp);

        let db = Arc::clone(&self.db);
        let work_dir = self.work_dir.clone();
        let passphrase = self.passphrase.clone();
        let kdf = self.kdf;
        let ts = timestamp.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            prepare_artifact(&db, work_dir, &passphrase, kdf, ts)
        })
        .await??;

        let PreparedArtifact {
            artifacts,
            report,
            bytes,
        } = prepared;

        let mail = BackupMail {
            subject: format!("Blog Database Backup ({})", report.timestamp),
            body: format!(
                "Please find the attached encrypted and compressed SQLite database backup. \
                 This email was sent automatically. Do not reply.\n\n\
                 Number of blog posts: {}",
                report.post_count
            ),
            attachment_name: report.artifact_name.clone(),
            attachment: bytes,
        };

        let delivered = self.mailer.send_backup(mail).await;
        // 投递成功与否都清理
        drop(artifacts);
        delivered?;

        info!(
            "[Backup] 备份完成: {} posts={} size={} sha256={}",
            report.artifact_name, report.post_count, report.artifact_bytes, report.artifact_sha256
        );
        Ok(report)
    }

    /// 无人值守入口：失败只记录日志
    pub async fn run_logged(&self) -> Option<BackupReport> {
        match self.run().await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("[Backup] 备份失败（已忽略）: {}", e);
                None
            }
        }
    }
}

fn prepare_artifact(
    db: &DatabaseManager,
    work_dir: PathBuf,
    passphrase: &SecretString,
    kdf: KdfParams,
    timestamp: String,
) -> Result<PreparedArtifact, AppError> {
    fs::create_dir_all(&work_dir)?;
    let mut artifacts = TempArtifacts::new();

    let post_count = BlogPostRepo::count_posts(db)?;

    let snapshot = artifacts.track(work_dir.join(format!("{}{}.db", SNAPSHOT_PREFIX, timestamp)));
    db.snapshot_to(&snapshot)?;

    let archive = artifacts.track(PathBuf::from(format!("{}.zip", snapshot.display())));
    compress_single_file(&snapshot, &archive)?;

    let encrypted = artifacts.track(PathBuf::from(format!("{}.enc", archive.display())));
    encrypt_file(&archive, &encrypted, passphrase.expose(), kdf)?;

    let bytes = fs::read(&encrypted)?;
    let artifact_sha256 = calculate_file_hash(&encrypted)?;
    let artifact_name = encrypted
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(PreparedArtifact {
        artifacts,
        report: BackupReport {
            timestamp,
            post_count,
            artifact_name,
            artifact_bytes: bytes.len() as u64,
            artifact_sha256,
        },
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_common::{compress_single_file, extract_single_file};
    use crate::crypto::backup_crypto::{decrypt_backup, decrypt_file, encrypt_file, tests::FAST_KDF};
    use crate::mailer::RecordingMailer;
    use crate::models::BlogPostCreate;
    use tempfile::TempDir;

    fn setup(mailer: Arc<RecordingMailer>) -> (TempDir, Arc<DatabaseManager>, BackupPipeline) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(DatabaseManager::new(&temp.path().join("blog.db")).unwrap());
        for title in ["one", "two"] {
            BlogPostRepo::create_post(
                &db,
                &BlogPostCreate {
                    title: title.into(),
                    content: "c".into(),
                    author: "a".into(),
                },
            )
            .unwrap();
        }
        let pipeline = BackupPipeline::new(
            Arc::clone(&db),
            mailer,
            temp.path().join("work"),
            SecretString::new("backup-pass"),
        )
        .with_kdf_params(FAST_KDF);
        (temp, db, pipeline)
    }

    fn work_dir_is_empty(pipeline: &BackupPipeline) -> bool {
        fs::read_dir(pipeline.work_dir())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_backup_delivers_decryptable_snapshot() {
        let mailer = Arc::new(RecordingMailer::new());
        let (temp, _db, pipeline) = setup(Arc::clone(&mailer));

        let report = pipeline.run().await.expect("备份应成功");
        assert_eq!(report.post_count, 2);
        assert!(report.artifact_name.starts_with(SNAPSHOT_PREFIX));
        assert!(report.artifact_name.ends_with(".db.zip.enc"));

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.starts_with("Blog Database Backup ("));
        assert!(sent[0].body.contains("Number of blog posts: 2"));

        // 解密 + 解压后应是可打开的数据库
        let zip_bytes = decrypt_backup(&sent[0].attachment, "backup-pass").unwrap();
        let zip_path = temp.path().join("received.zip");
        fs::write(&zip_path, zip_bytes).unwrap();
        let restored = temp.path().join("received.db");
        extract_single_file(&zip_path, &restored).unwrap();
        let copy = DatabaseManager::new(&restored).unwrap();
        assert_eq!(BlogPostRepo::count_posts(&copy).unwrap(), 2);

        assert!(work_dir_is_empty(&pipeline), "中间文件应全部清理");
    }

    #[tokio::test]
    async fn test_cleanup_runs_when_delivery_fails() {
        let mailer = Arc::new(RecordingMailer::failing());
        let (_temp, _db, pipeline) = setup(Arc::clone(&mailer));

        assert!(pipeline.run().await.is_err());
        assert!(work_dir_is_empty(&pipeline), "投递失败也要清理中间文件");

        // 无人值守入口吞掉错误
        assert!(pipeline.run_logged().await.is_none());
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_chain_reproduces_export_bytes() {
        let (temp, db, _pipeline) = setup(Arc::new(RecordingMailer::new()));
        let dir = temp.path();

        let snapshot = dir.join("exported.db");
        db.snapshot_to(&snapshot).unwrap();
        let zip = dir.join("exported.db.zip");
        compress_single_file(&snapshot, &zip).unwrap();
        let enc = dir.join("exported.db.zip.enc");
        encrypt_file(&zip, &enc, "backup-pass", FAST_KDF).unwrap();

        let decrypted = dir.join("decrypted.zip");
        decrypt_file(&enc, &decrypted, "backup-pass").unwrap();
        let extracted = dir.join("extracted.db");
        extract_single_file(&decrypted, &extracted).unwrap();

        assert_eq!(fs::read(&extracted).unwrap(), fs::read(&snapshot).unwrap());
    }
}
