//! 应用配置
//!
//! 启动时构建一次 `AppConfig`：
//! 1. `dotenvy` 读取 `.env`（可选）
//! 2. `config` crate 合并 `config/blog_vault.toml`（可选）与进程环境变量
//! 3. 校验：所有缺失 / 非法字段汇总为一个错误后再返回
//!
//! 密钥类字段以 `SecretString` 保存，`Debug` 输出只显示 `***`。
//!
//! `.env` 中未加引号或双引号的值会被 dotenvy 做 `$VAR` 替换，
//! argon2 PHC 串（`$argon2id$v=19$...`）必须用单引号包住：
//! `ADMIN_PASS_HASH='$argon2id$v=19$m=19456,t=2,p=1$...'`

use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_DATA_DIR: &str = "database";
const DEFAULT_TOKEN_EXPIRE_MINUTES: i64 = 1440;
const DEFAULT_REFRESH_EXPIRE_MINUTES: i64 = 7 * 24 * 60;
const DEFAULT_BACKUP_INTERVAL_HOURS: u64 = 6;
/// 令牌有效期与备份间隔的上限：十年
const MAX_TOKEN_EXPIRE_MINUTES: i64 = 10 * 365 * 24 * 60;
const MAX_BACKUP_INTERVAL_HOURS: i64 = 10 * 365 * 24;
const CONFIG_FILE: &str = "config/blog_vault";

pub const DB_FILE_NAME: &str = "blog.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置缺失或非法 (missing: [{}], invalid: [{}])", .missing.join(", "), .invalid.join("; "))]
    Invalid {
        missing: Vec<&'static str>,
        invalid: Vec<String>,
    },
    #[error("数据目录不存在且当前不是开发环境，拒绝启动: {0:?}")]
    VolumeMissing(PathBuf),
    #[error("加载配置源失败: {0}")]
    Source(#[from] config::ConfigError),
    #[error("创建数据目录失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 不在日志 / Debug 中泄露的字符串，drop 时清零
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone)]
pub struct AdminCredentials {
    pub username: String,
    /// argon2 PHC 字符串
    pub password_hash: SecretString,
    /// Base32 编码的 TOTP 共享密钥
    pub totp_secret: SecretString,
}

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub access_secret: SecretString,
    pub refresh_secret: SecretString,
    pub expire_minutes: i64,
    pub refresh_expire_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub from_email: String,
    pub to_email: String,
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub encryption_key: SecretString,
    pub interval_hours: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub admin: AdminCredentials,
    pub tokens: TokenSettings,
    pub smtp: SmtpSettings,
    pub backup: BackupSettings,
}

/// 配置源反序列化的原始形态，全部可选，校验阶段再汇总缺失项
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    environment: Option<String>,
    bind_addr: Option<String>,
    data_dir: Option<String>,
    admin_user: Option<String>,
    admin_pass_hash: Option<String>,
    totp_secret: Option<String>,
    access_token_secret: Option<String>,
    refresh_token_secret: Option<String>,
    token_expire_minutes: Option<String>,
    refresh_token_expire_minutes: Option<String>,
    encryption_key: Option<String>,
    backup_interval_hours: Option<String>,
    smtp_server: Option<String>,
    smtp_port: Option<String>,
    smtp_user: Option<String>,
    smtp_password: Option<String>,
    from_email: Option<String>,
    to_email: Option<String>,
}

impl AppConfig {
    /// 从 `.env`、可选的 toml 文件和进程环境变量加载
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder();
        if Path::new(&format!("{}.toml", CONFIG_FILE)).exists() {
            builder = builder.add_source(config::File::with_name(CONFIG_FILE));
        }
        let loaded = builder
            .add_source(config::Environment::default())
            .build()?;
        Self::from_raw(loaded.try_deserialize()?)
    }

    /// 从显式键值对加载（键名与环境变量一致）
    pub fn from_map<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let loaded = config::Config::builder()
            .add_source(config::Environment::default().source(Some(map)))
            .build()?;
        Self::from_raw(loaded.try_deserialize()?)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        let mut required = |value: Option<String>, name: &'static str| -> String {
            match value.filter(|v| !v.trim().is_empty()) {
                Some(v) => v,
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let admin_user = required(raw.admin_user, "ADMIN_USER");
        let admin_pass_hash = required(raw.admin_pass_hash, "ADMIN_PASS_HASH");
        let totp_secret = required(raw.totp_secret, "TOTP_SECRET");
        let access_secret = required(raw.access_token_secret, "ACCESS_TOKEN_SECRET");
        let refresh_secret = required(raw.refresh_token_secret, "REFRESH_TOKEN_SECRET");
        let encryption_key = required(raw.encryption_key, "ENCRYPTION_KEY");
        let smtp_server = required(raw.smtp_server, "SMTP_SERVER");
        let smtp_port_raw = required(raw.smtp_port, "SMTP_PORT");
        let smtp_user = required(raw.smtp_user, "SMTP_USER");
        let smtp_password = required(raw.smtp_password, "SMTP_PASSWORD");
        let from_email = required(raw.from_email, "FROM_EMAIL");
        let to_email = required(raw.to_email, "TO_EMAIL");

        let smtp_port = if smtp_port_raw.is_empty() {
            0
        } else {
            smtp_port_raw.trim().parse::<u16>().unwrap_or_else(|_| {
                invalid.push(format!("SMTP_PORT={} 不是合法端口", smtp_port_raw));
                0
            })
        };

        let bind_raw = raw
            .bind_addr
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.trim().parse::<SocketAddr>().unwrap_or_else(|_| {
            invalid.push(format!("BIND_ADDR={} 不是合法地址", bind_raw));
            SocketAddr::from(([0, 0, 0, 0], 5000))
        });

        let expire_minutes = parse_positive(
            raw.token_expire_minutes,
            "TOKEN_EXPIRE_MINUTES",
            DEFAULT_TOKEN_EXPIRE_MINUTES,
            MAX_TOKEN_EXPIRE_MINUTES,
            &mut invalid,
        );
        let refresh_expire_minutes = parse_positive(
            raw.refresh_token_expire_minutes,
            "REFRESH_TOKEN_EXPIRE_MINUTES",
            DEFAULT_REFRESH_EXPIRE_MINUTES,
            MAX_TOKEN_EXPIRE_MINUTES,
            &mut invalid,
        );
        if refresh_expire_minutes < expire_minutes {
            invalid.push(format!(
                "REFRESH_TOKEN_EXPIRE_MINUTES={} 不能短于 TOKEN_EXPIRE_MINUTES={}",
                refresh_expire_minutes, expire_minutes
            ));
        }
        let interval_hours = parse_positive(
            raw.backup_interval_hours,
            "BACKUP_INTERVAL_HOURS",
            DEFAULT_BACKUP_INTERVAL_HOURS as i64,
            MAX_BACKUP_INTERVAL_HOURS,
            &mut invalid,
        ) as u64;

        if !missing.is_empty() || !invalid.is_empty() {
            return Err(ConfigError::Invalid { missing, invalid });
        }

        Ok(Self {
            environment: raw
                .environment
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            bind_addr,
            data_dir: PathBuf::from(
                raw.data_dir
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            ),
            admin: AdminCredentials {
                username: admin_user,
                password_hash: SecretString::new(admin_pass_hash),
                totp_secret: SecretString::new(totp_secret),
            },
            tokens: TokenSettings {
                access_secret: SecretString::new(access_secret),
                refresh_secret: SecretString::new(refresh_secret),
                expire_minutes,
                refresh_expire_minutes,
            },
            smtp: SmtpSettings {
                server: smtp_server,
                port: smtp_port,
                user: smtp_user,
                password: SecretString::new(smtp_password),
                from_email,
                to_email,
            },
            backup: BackupSettings {
                encryption_key: SecretString::new(encryption_key),
                interval_hours,
            },
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case(DEFAULT_ENVIRONMENT)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// 备份 / 恢复的中间文件目录
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    /// 确保数据目录可用
    ///
    /// 开发环境下自动创建；生产环境下目录缺失视为存储卷未挂载，拒绝启动。
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        if !self.data_dir.exists() {
            if !self.is_development() {
                return Err(ConfigError::VolumeMissing(self.data_dir.clone()));
            }
            info!("[Config] 开发环境，创建数据目录: {:?}", self.data_dir);
            std::fs::create_dir_all(&self.data_dir)?;
        }
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.work_dir())?;
        Ok(())
    }
}

fn parse_positive(
    value: Option<String>,
    name: &str,
    default: i64,
    max: i64,
    invalid: &mut Vec<String>,
) -> i64 {
    match value.filter(|v| !v.trim().is_empty()) {
        None => default,
        Some(v) => match v.trim().parse::<i64>() {
            Ok(n) if n > max => {
                invalid.push(format!("{}={} 超过上限 {}", name, v, max));
                default
            }
            Ok(n) if n > 0 => n,
            _ => {
                invalid.push(format!("{}={} 必须是正整数", name, v));
                default
            }
        },
    }
}
