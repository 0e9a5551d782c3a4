//! 集成测试公共设施：临时数据目录 + 内存投递 + 真实路由

#![allow(dead_code)]

use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tower::ServiceExt;

use blog_vault_lib::backup::BackupPipeline;
use blog_vault_lib::build_router;
use blog_vault_lib::config::AppConfig;
use blog_vault_lib::crypto::backup_crypto::KdfParams;
use blog_vault_lib::http::AppState;
use blog_vault_lib::mailer::RecordingMailer;
use blog_vault_lib::restore::{RestoreFault, RestorePipeline};

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "correct horse battery staple";
pub const TOTP_SECRET: &str = "JBSWY3DPEHPK3PXP";
pub const BACKUP_PASSPHRASE: &str = "integration-backup-pass";

/// 测试用低代价 Argon2 参数
pub const FAST_KDF: KdfParams = KdfParams {
    m_cost: 256,
    t_cost: 1,
    p_cost: 1,
};

pub struct TestApp {
    pub temp: TempDir,
    pub cfg: AppConfig,
    pub state: AppState,
    pub mailer: Arc<RecordingMailer>,
}

fn password_hash() -> String {
    let salt = SaltString::encode_b64(b"integration-salt").unwrap();
    Argon2::default()
        .hash_password(ADMIN_PASSWORD.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

pub fn totp_now() -> String {
    let key = data_encoding::BASE32_NOPAD
        .decode(TOTP_SECRET.as_bytes())
        .unwrap();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    totp_lite::totp_custom::<totp_lite::Sha1>(30, 6, &key, now)
}

fn login_request() -> Request<Body> {
    json_request(
        "POST",
        "/login",
        None,
        serde_json::json!({
            "username": ADMIN_USER,
            "password": ADMIN_PASSWORD,
            "totp": totp_now(),
        }),
    )
}

impl TestApp {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("database");
        let cfg = AppConfig::from_map(vec![
            ("ADMIN_USER", ADMIN_USER.to_string()),
            ("ADMIN_PASS_HASH", password_hash()),
            ("TOTP_SECRET", TOTP_SECRET.to_string()),
            ("ACCESS_TOKEN_SECRET", "integration-access".to_string()),
            ("REFRESH_TOKEN_SECRET", "integration-refresh".to_string()),
            ("ENCRYPTION_KEY", BACKUP_PASSPHRASE.to_string()),
            ("SMTP_SERVER", "smtp.example.com".to_string()),
            ("SMTP_PORT", "587".to_string()),
            ("SMTP_USER", "mailer".to_string()),
            ("SMTP_PASSWORD", "smtp-password".to_string()),
            ("FROM_EMAIL", "blog@example.com".to_string()),
            ("TO_EMAIL", "owner@example.com".to_string()),
            ("DATA_DIR", data_dir.to_string_lossy().into_owned()),
        ])
        .unwrap();
        cfg.ensure_data_dir().unwrap();

        let mailer = Arc::new(RecordingMailer::new());
        let mut state = blog_vault_lib::build_state(&cfg, mailer.clone()).unwrap();
        state.backup = Arc::new(
            BackupPipeline::new(
                Arc::clone(&state.db),
                mailer.clone(),
                cfg.work_dir(),
                cfg.backup.encryption_key.clone(),
            )
            .with_kdf_params(FAST_KDF),
        );

        Self {
            temp,
            cfg,
            state,
            mailer,
        }
    }

    /// 换成在解压阶段注入故障的恢复流水线
    pub fn with_restore_fault(mut self, fault: RestoreFault) -> Self {
        self.state.restore = Arc::new(
            RestorePipeline::new(
                Arc::clone(&self.state.db),
                Arc::clone(&self.state.maintenance),
                self.cfg.work_dir(),
                self.cfg.backup.encryption_key.clone(),
            )
            .with_fault(fault),
        );
        self
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.unwrap()
    }

    /// 登录；验证码恰好跨过 30 秒步长时用新验证码重试一次
    pub async fn login(&self) -> Value {
        let mut response = self.send(login_request()).await;
        if response.status() == StatusCode::UNAUTHORIZED {
            response = self.send(login_request()).await;
        }
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    pub async fn access_token(&self) -> String {
        self.login().await["access_token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    pub async fn create_post(&self, token: &str, title: &str) -> Value {
        let response = self
            .send(json_request(
                "POST",
                "/blog",
                Some(token),
                serde_json::json!({
                    "title": title,
                    "content": format!("content of {}", title),
                    "author": "Kaden",
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn multipart_upload(uri: &str, token: Option<&str>, file: &[u8]) -> Request<Body> {
    const BOUNDARY: &str = "blog-vault-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"backup.enc\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(file);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    let mut builder = Request::builder().method("POST").uri(uri).header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={}", BOUNDARY),
    );
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body)).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
