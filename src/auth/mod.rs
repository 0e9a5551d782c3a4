//! 管理员认证
//!
//! - `token`：访问令牌 / 刷新令牌（JWT HS256）
//! - `credential_gate`：用户名 + 密码 + TOTP 登录

pub mod credential_gate;
pub mod token;

pub use credential_gate::CredentialGate;
pub use token::{TokenError, TokenKind, TokenService};
