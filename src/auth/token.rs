//! 访问令牌 / 刷新令牌的签发与校验
//!
//! 两种令牌都是 HS256 JWT，claims 为 `{ sub, exp, iat }`，
//! 使用各自独立的密钥签名，互相不能冒用。不落库，无吊销列表。

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TokenSettings;
use crate::models::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Could not validate credentials")]
    Unauthorized,
    #[error("Token has expired")]
    Expired,
    #[error("Token subject is missing")]
    Malformed,
    #[error("Failed to sign token: {0}")]
    Signing(String),
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Signing(msg) => AppError::internal(format!("令牌签发失败: {}", msg)),
            other => AppError::unauthorized(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKeys {
    fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

pub struct TokenService {
    access: SigningKeys,
    refresh: SigningKeys,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(
        access_secret: &[u8],
        refresh_secret: &[u8],
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            access: SigningKeys::from_secret(access_secret),
            refresh: SigningKeys::from_secret(refresh_secret),
            validation,
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_settings(settings: &TokenSettings) -> Self {
        Self::new(
            settings.access_secret.expose().as_bytes(),
            settings.refresh_secret.expose().as_bytes(),
            Duration::minutes(settings.expire_minutes),
            Duration::minutes(settings.refresh_expire_minutes),
        )
    }

    /// 刷新令牌有效期，refresh cookie 的 Max-Age 取此值
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn keys(&self, kind: TokenKind) -> &SigningKeys {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    pub fn issue(&self, kind: TokenKind, subject: &str, ttl: Duration) -> Result<String, TokenError> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| TokenError::Signing(format!("有效期溢出: {} 分钟", ttl.num_minutes())))?;
        let claims = Claims {
            sub: Some(subject.to_string()),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.keys(kind).encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    pub fn issue_access(&self, subject: &str) -> Result<String, TokenError> {
        self.issue(TokenKind::Access, subject, self.access_ttl)
    }

    pub fn issue_refresh(&self, subject: &str) -> Result<String, TokenError> {
        self.issue(TokenKind::Refresh, subject, self.refresh_ttl)
    }

    /// 校验签名与过期时间，返回 subject
    pub fn verify(&self, kind: TokenKind, token: &str) -> Result<String, TokenError> {
        let data = decode::<Claims>(token, &self.keys(kind).decoding, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Unauthorized,
            },
        )?;

        match data.claims.sub {
            Some(sub) if !sub.is_empty() => Ok(sub),
            _ => Err(TokenError::Malformed),
        }
    }

    pub fn verify_access(&self, token: &str) -> Result<String, TokenError> {
        self.verify(TokenKind::Access, token)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<String, TokenError> {
        self.verify(TokenKind::Refresh, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn service() -> TokenService {
        TokenService::new(
            b"access-secret",
            b"refresh-secret",
            Duration::minutes(30),
            Duration::days(7),
        )
    }

    #[test]
    fn test_issue_and_verify_access() {
        let svc = service();
        let token = svc.issue_access("admin").unwrap();
        assert_eq!(svc.verify_access(&token).unwrap(), "admin");
    }

    #[test]
    fn test_kinds_do_not_cross_verify() {
        let svc = service();
        let access = svc.issue_access("admin").unwrap();
        let refresh = svc.issue_refresh("admin").unwrap();
        assert_eq!(svc.verify_refresh(&refresh).unwrap(), "admin");
        assert_matches!(svc.verify_refresh(&access), Err(TokenError::Unauthorized));
        assert_matches!(svc.verify_access(&refresh), Err(TokenError::Unauthorized));
    }

    #[test]
    fn test_expired_token_rejected() {
        let svc = service();
        let token = svc
            .issue(TokenKind::Access, "admin", Duration::seconds(-10))
            .unwrap();
        assert_matches!(svc.verify_access(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let svc = service();
        let token = svc.issue_access("admin").unwrap();
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        // 篡改签名段
        let mut sig: Vec<char> = parts[2].chars().collect();
        sig[4] = if sig[4] == 'x' { 'y' } else { 'x' };
        parts[2] = sig.into_iter().collect();
        let tampered = parts.join(".");
        assert_matches!(svc.verify_access(&tampered), Err(TokenError::Unauthorized));
        assert_matches!(svc.verify_access("garbage"), Err(TokenError::Unauthorized));
    }

    #[test]
    fn test_missing_subject_is_malformed() {
        let svc = service();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: None,
            iat: now,
            exp: now + 600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"access-secret"),
        )
        .unwrap();
        assert_matches!(svc.verify_access(&token), Err(TokenError::Malformed));

        let empty = svc.issue(TokenKind::Access, "", Duration::minutes(5)).unwrap();
        assert_matches!(svc.verify_access(&empty), Err(TokenError::Malformed));
    }

    #[test]
    fn test_overflowing_ttl_is_signing_error() {
        let svc = TokenService::new(
            b"access-secret",
            b"refresh-secret",
            Duration::days(365_000_000),
            Duration::days(365_000_000),
        );
        assert_matches!(svc.issue_access("admin"), Err(TokenError::Signing(_)));
        let err: AppError = svc.issue_refresh("admin").unwrap_err().into();
        assert_eq!(err.error_type, crate::models::AppErrorType::Internal);
    }

    #[test]
    fn test_longest_configured_ttl_still_signs() {
        let mut vars = crate::config::tests::full_vars();
        vars.push(("TOKEN_EXPIRE_MINUTES", "5256000".into()));
        vars.push(("REFRESH_TOKEN_EXPIRE_MINUTES", "5256000".into()));
        let cfg = crate::config::AppConfig::from_map(vars).unwrap();
        let svc = TokenService::from_settings(&cfg.tokens);
        let token = svc.issue_access("admin").unwrap();
        assert_eq!(svc.verify_access(&token).unwrap(), "admin");
    }
}
