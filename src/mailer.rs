//! 备份邮件投递
//!
//! `BackupMailer` 是备份流水线与投递方式之间的接缝：
//! 生产环境用 `SmtpMailer`（STARTTLS + 登录认证），测试用 `RecordingMailer`。

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::info;

use crate::config::SmtpSettings;
use crate::models::AppError;

/// 一封备份邮件
#[derive(Debug, Clone)]
pub struct BackupMail {
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub attachment: Vec<u8>,
}

#[async_trait]
pub trait BackupMailer: Send + Sync {
    async fn send_backup(&self, mail: BackupMail) -> Result<(), AppError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpMailer {
    pub fn from_settings(settings: &SmtpSettings) -> Result<Self, AppError> {
        let from: Mailbox = settings.from_email.parse().map_err(|e| {
            AppError::configuration(format!("FROM_EMAIL 不是合法地址: {}", e))
        })?;
        let to: Mailbox = settings
            .to_email
            .parse()
            .map_err(|e| AppError::configuration(format!("TO_EMAIL 不是合法地址: {}", e)))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)
            .map_err(|e| AppError::configuration(format!("SMTP 服务器配置无效: {}", e)))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.user.clone(),
                settings.password.expose().to_string(),
            ))
            .build();

        Ok(Self {
            transport,
            from,
            to,
        })
    }
}

#[async_trait]
impl BackupMailer for SmtpMailer {
    async fn send_backup(&self, mail: BackupMail) -> Result<(), AppError> {
        let content_type = ContentType::parse("application/octet-stream")
            .map_err(|e| AppError::internal(format!("附件类型无效: {}", e)))?;
        let size = mail.attachment.len();

        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(mail.subject)
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(mail.body))
                    .singlepart(
                        Attachment::new(mail.attachment_name.clone())
                            .body(mail.attachment, content_type),
                    ),
            )
            .map_err(|e| AppError::internal(format!("构建备份邮件失败: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::network(format!("SMTP 投递失败: {}", e)))?;

        info!(
            "[Mailer] 备份邮件已发送: {} ({} bytes)",
            mail.attachment_name, size
        );
        Ok(())
    }
}

/// 内存投递：记录每封邮件，可切换为失败模式
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<BackupMail>>,
    fail: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let mailer = Self::default();
        mailer.set_failing(true);
        mailer
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<BackupMail> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl BackupMailer for RecordingMailer {
    async fn send_backup(&self, mail: BackupMail) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::network("SMTP 投递失败: connection refused"));
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(mail);
        Ok(())
    }
}
