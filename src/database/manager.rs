//! DatabaseManager - 连接池管理器
//!
//! 负责：
//! - r2d2 连接池管理
//! - Schema 初始化与迁移
//! - 在线快照（备份导出）
//! - 整库替换（恢复流程）：checkpoint → 释放连接池 → rename → reopen

use crate::models::AppError;
use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::DatabaseName;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{initialize_schema, SqlitePool, SqlitePooledConnection};

pub struct DatabaseManager {
    pool: RwLock<SqlitePool>,
    db_path: RwLock<PathBuf>,
}

impl DatabaseManager {
    /// 打开（必要时创建）数据库文件并执行迁移
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
        }

        let pool = Self::build_pool(db_path)?;
        {
            let conn = pool.get().with_context(|| "从连接池获取连接失败")?;
            initialize_schema(&conn).with_context(|| "初始化数据库 schema 失败")?;
        }

        Ok(DatabaseManager {
            pool: RwLock::new(pool),
            db_path: RwLock::new(db_path.to_path_buf()),
        })
    }

    /// 获取数据库连接
    pub fn get_conn(&self) -> Result<SqlitePooledConnection, AppError> {
        let pool = self.pool.read().unwrap_or_else(|poisoned| {
            error!("[DatabaseManager] Pool RwLock poisoned! Attempting recovery");
            poisoned.into_inner()
        });
        Ok(pool.get()?)
    }

    /// 当前使用的数据库路径
    pub fn current_db_path(&self) -> PathBuf {
        match self.db_path.read() {
            Ok(path) => path.clone(),
            Err(poisoned) => {
                error!("[DatabaseManager] db_path RwLock poisoned! Attempting recovery");
                poisoned.into_inner().clone()
            }
        }
    }

    fn build_pool(db_path: &Path) -> Result<SqlitePool> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.pragma_update(None, "foreign_keys", &"ON")?;
            c.pragma_update(None, "journal_mode", &"WAL")?;
            c.pragma_update(None, "synchronous", &"NORMAL")?;
            // 写锁等待上限 3 秒，超时交给上层重试
            c.pragma_update(None, "busy_timeout", &3000i64)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(15)
            .min_idle(Some(2))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .with_context(|| format!("创建数据库连接池失败: {:?}", db_path))?;

        Ok(pool)
    }

    fn swap_pool(&self, new_pool: SqlitePool) {
        let mut guard = match self.pool.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("[DatabaseManager] Pool RwLock poisoned during swap! Forcing recovery");
                poisoned.into_inner()
            }
        };
        *guard = new_pool;
    }

    /// 将 WAL 内容合并回主库文件
    pub fn checkpoint(&self) -> Result<(), AppError> {
        let conn = self.get_conn()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// 重新打开指定路径的数据库，执行迁移后替换连接池
    pub fn reopen(&self, path: &Path) -> Result<(), AppError> {
        let new_pool = Self::build_pool(path)?;
        {
            let conn = new_pool.get()?;
            initialize_schema(&conn)?;
        }
        self.swap_pool(new_pool);

        let mut path_guard = match self.db_path.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("[DatabaseManager] db_path RwLock poisoned during reopen! Forcing recovery");
                poisoned.into_inner()
            }
        };
        *path_guard = path.to_path_buf();

        info!("[DatabaseManager] 已重新打开数据库: {:?}", path);
        Ok(())
    }

    /// 生成一致性快照到 `dest`
    ///
    /// 先 checkpoint，再通过 SQLite 在线备份 API 逐页复制，
    /// 快照期间的并发写入不会产生半写文件。
    pub fn snapshot_to(&self, dest: &Path) -> Result<(), AppError> {
        if let Err(e) = self.checkpoint() {
            warn!("[DatabaseManager] 快照前 checkpoint 失败，继续备份: {}", e);
        }
        let conn = self.get_conn()?;
        conn.backup(DatabaseName::Main, dest, None)?;
        Ok(())
    }

    /// 用 `source` 文件整体替换当前数据库
    ///
    /// 调用方需已进入维护模式。仍持有旧连接的在途请求会继续指向旧文件，
    /// 直到其连接归还。
    pub fn replace_with(&self, source: &Path) -> Result<(), AppError> {
        let live_path = self.current_db_path();

        if let Err(e) = self.checkpoint() {
            warn!("[DatabaseManager] 替换前 checkpoint 失败: {}", e);
        }

        // 切到内存库，释放连接池对磁盘文件的占用
        let mem_pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        self.swap_pool(mem_pool);

        if let Err(e) = fs::rename(source, &live_path) {
            // 跨文件系统时 rename 不可用，退化为复制
            warn!(
                "[DatabaseManager] rename 失败 ({}), 改用复制: {:?} -> {:?}",
                e, source, live_path
            );
            let copied = fs::copy(source, &live_path);
            if let Err(copy_err) = copied {
                // 无论如何都要恢复到磁盘连接池
                self.reopen(&live_path)?;
                return Err(AppError::file_system(format!(
                    "替换数据库文件失败: {}",
                    copy_err
                )));
            }
            let _ = fs::remove_file(source);
        }

        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{}", live_path.display(), suffix));
            if side.exists() {
                if let Err(e) = fs::remove_file(&side) {
                    warn!("[DatabaseManager] 删除旧的 {} 文件失败: {}", suffix, e);
                }
            }
        }

        self.reopen(&live_path)?;
        info!("[DatabaseManager] 数据库已替换: {:?}", live_path);
        Ok(())
    }
}
