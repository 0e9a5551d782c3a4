//! 备份 / 恢复共享组件
//!
//! - 单文件 ZIP 压缩与解压（含 ZIP 炸弹检测）
//! - SHA256 计算：用于日志中的产物指纹
//! - `TempArtifacts`：中间文件 RAII 清理

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::models::AppError;

// ============================================================================
// 安全常量 - 防止 ZIP 炸弹和资源耗尽攻击
// ============================================================================

/// 最大允许解压总大小: 4GB
pub const MAX_UNCOMPRESSED_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// 最大允许文件数量（恢复只需要一个数据库文件）
pub const MAX_FILE_COUNT: usize = 16;

/// 压缩比告警阈值，SQLite 空页较多时压缩比会偏高
pub const MAX_COMPRESSION_RATIO: u64 = 100;

/// 极端压缩比阈值 — 超过此值视为 ZIP 炸弹并拒绝解压
pub const EXTREME_COMPRESSION_RATIO: u64 = 1000;

/// 重试次数常量
pub const RESILIENT_RETRY_COUNT: usize = 5;

/// 重试延迟(毫秒)
pub const RESILIENT_RETRY_DELAY_MS: u64 = 3000;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("ZIP 中没有任何文件")]
    Empty,
    #[error("ZIP 文件包含 {count} 个条目，超过最大限制 {limit}")]
    TooManyEntries { count: usize, limit: usize },
    #[error("ZIP 解压后大小 {0} bytes 超过最大限制")]
    TooLarge(u64),
    #[error("ZIP 炸弹检测：条目 '{name}' 压缩比 {ratio:.1} 超过极限阈值 {limit}")]
    SuspiciousRatio { name: String, ratio: f64, limit: u64 },
    #[error("解压后的大小与 ZIP 头声明不符: 声明 {declared}, 实际 {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("ZIP操作错误: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("文件系统错误: {0}")]
    Io(#[from] io::Error),
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(e) => AppError::from(e),
            ArchiveError::Zip(e) => AppError::from(e),
            other => AppError::validation(other.to_string()),
        }
    }
}

/// 计算文件的SHA256哈希值
///
/// 使用8KB缓冲区分块读取，适合处理大文件而不会占用过多内存
pub fn calculate_file_hash(path: &Path) -> Result<String, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::file_system(format!("打开文件计算哈希失败 {:?}: {}", path, e)))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| AppError::file_system(format!("读取文件失败 {:?}: {}", path, e)))?;

        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// 单文件 ZIP
// ============================================================================

/// 将 `src` 压缩为 `dst`，条目名为源文件名
pub fn compress_single_file(src: &Path, dst: &Path) -> Result<(), ArchiveError> {
    let entry_name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database.db".to_string());

    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(fs::metadata(src)?.len() >= u32::MAX as u64);

    let mut writer = ZipWriter::new(File::create(dst)?);
    writer.start_file(entry_name.as_str(), options)?;
    let mut input = BufReader::new(File::open(src)?);
    io::copy(&mut input, &mut writer)?;
    writer.finish()?;

    debug!("[BackupCommon] 已压缩 {:?} -> {:?}", src, dst);
    Ok(())
}

fn check_entry_ratio(name: &str, size: u64, compressed: u64) -> Result<(), ArchiveError> {
    if compressed == 0 {
        return Ok(());
    }
    let ratio = size as f64 / compressed as f64;
    if ratio > EXTREME_COMPRESSION_RATIO as f64 {
        return Err(ArchiveError::SuspiciousRatio {
            name: name.to_string(),
            ratio,
            limit: EXTREME_COMPRESSION_RATIO,
        });
    }
    if ratio > MAX_COMPRESSION_RATIO as f64 {
        warn!(
            "[BackupCommon] ZIP 压缩比较高 ({:.1} > {})，继续解压",
            ratio, MAX_COMPRESSION_RATIO
        );
    }
    Ok(())
}

/// 解压前的安全检查，返回首个文件条目的下标
fn validate_archive(archive: &mut ZipArchive<File>) -> Result<usize, ArchiveError> {
    if archive.len() > MAX_FILE_COUNT {
        return Err(ArchiveError::TooManyEntries {
            count: archive.len(),
            limit: MAX_FILE_COUNT,
        });
    }

    let mut total_uncompressed: u64 = 0;
    let mut first_file = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let size = entry.size();
        let compressed = entry.compressed_size();
        total_uncompressed = total_uncompressed.saturating_add(size);
        if total_uncompressed > MAX_UNCOMPRESSED_SIZE {
            return Err(ArchiveError::TooLarge(total_uncompressed));
        }

        check_entry_ratio(entry.name(), size, compressed)?;

        if first_file.is_none() {
            first_file = Some(i);
        }
    }

    first_file.ok_or(ArchiveError::Empty)
}

/// 从 `zip_path` 中取出唯一（首个）文件写到 `dst`
///
/// 只信任条目内容，不使用条目路径，避免路径穿越。
pub fn extract_single_file(zip_path: &Path, dst: &Path) -> Result<u64, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(zip_path)?)?;
    let index = validate_archive(&mut archive)?;

    let entry = archive.by_index(index)?;
    let declared = entry.size();
    let mut output = File::create(dst)?;
    // 多读 1 字节即可发现头部谎报大小
    let actual = io::copy(&mut entry.take(declared + 1), &mut output)?;
    if actual != declared {
        drop(output);
        let _ = fs::remove_file(dst);
        return Err(ArchiveError::SizeMismatch { declared, actual });
    }
    output.sync_all()?;

    debug!("[BackupCommon] 已解压 {:?} -> {:?} ({} bytes)", zip_path, dst, actual);
    Ok(actual)
}

// ============================================================================
// 中间文件清理
// ============================================================================

/// 中间文件登记表，drop 时逐个删除（每个路径只删一次）
#[derive(Debug, Default)]
pub struct TempArtifacts {
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记并返回路径，方便链式使用
    pub fn track(&mut self, path: PathBuf) -> PathBuf {
        if !self.paths.contains(&path) {
            self.paths.push(path.clone());
        }
        path
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("[BackupCommon] 已清理中间文件: {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("[BackupCommon] 清理中间文件失败 {:?}: {}", path, e),
            }
        }
    }
}
