//! 管理员登录校验：用户名 + argon2 密码哈希 + TOTP
//!
//! 三项检查总是全部执行，任何一项失败都返回同一个 `Unauthorized`，
//! 调用方无法据此判断是哪一项出错。

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use super::token::TokenService;
use crate::config::{AdminCredentials, SecretString};
use crate::models::{AppError, TokenPair};

/// RFC 6238 默认参数
const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;

const INVALID_CREDENTIALS: &str = "Incorrect username, password or TOTP";

pub struct CredentialGate {
    username: String,
    password_hash: SecretString,
    totp_key: Vec<u8>,
}

impl CredentialGate {
    /// 启动时解析 PHC 哈希与 Base32 密钥，格式错误直接拒绝启动
    pub fn new(admin: &AdminCredentials) -> Result<Self, AppError> {
        PasswordHash::new(admin.password_hash.expose()).map_err(|e| {
            AppError::configuration(format!("ADMIN_PASS_HASH 不是合法的 PHC 字符串: {}", e))
        })?;
        let totp_key = decode_totp_secret(admin.totp_secret.expose())?;

        Ok(Self {
            username: admin.username.clone(),
            password_hash: admin.password_hash.clone(),
            totp_key,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// 校验三元组并签发令牌对
    pub fn authenticate(
        &self,
        tokens: &TokenService,
        username: &str,
        password: &str,
        totp_code: &str,
    ) -> Result<TokenPair, AppError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.authenticate_at(tokens, username, password, totp_code, now)
    }

    pub fn authenticate_at(
        &self,
        tokens: &TokenService,
        username: &str,
        password: &str,
        totp_code: &str,
        unix_secs: u64,
    ) -> Result<TokenPair, AppError> {
        let user_ok = constant_time_eq(username.as_bytes(), self.username.as_bytes());
        let password_ok = self.verify_password(password);
        let totp_ok = self.verify_totp(totp_code, unix_secs);

        if !(user_ok & password_ok & totp_ok) {
            warn!("[CredentialGate] 登录失败");
            return Err(AppError::unauthorized(INVALID_CREDENTIALS));
        }

        let pair = TokenPair {
            access_token: tokens.issue_access(&self.username)?,
            refresh_token: tokens.issue_refresh(&self.username)?,
            token_type: "bearer".to_string(),
        };
        info!("[CredentialGate] 管理员登录成功");
        Ok(pair)
    }

    fn verify_password(&self, password: &str) -> bool {
        match PasswordHash::new(self.password_hash.expose()) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// 仅接受当前 30 秒窗口的验证码
    fn verify_totp(&self, code: &str, unix_secs: u64) -> bool {
        let expected = current_totp(&self.totp_key, unix_secs);
        constant_time_eq(code.trim().as_bytes(), expected.as_bytes())
    }
}

pub(crate) fn current_totp(key: &[u8], unix_secs: u64) -> String {
    totp_lite::totp_custom::<totp_lite::Sha1>(TOTP_STEP_SECS, TOTP_DIGITS, key, unix_secs)
}

fn decode_totp_secret(secret: &str) -> Result<Vec<u8>, AppError> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    data_encoding::BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|e| AppError::configuration(format!("TOTP_SECRET 不是合法的 Base32: {}", e)))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
