// Blog Vault library entry
// 提供 run() 供 bin 目标调用；集成测试通过 build_state / build_router 组装服务。

pub mod auth;
pub mod backup;
pub mod backup_common;
pub mod backup_scheduler;
pub mod backup_state;
pub mod config;
pub mod crypto;
pub mod database;
pub mod http;
pub mod mailer;
pub mod maintenance;
pub mod models;
pub mod restore;
pub mod slug;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::auth::{CredentialGate, TokenService};
use crate::backup::BackupPipeline;
use crate::backup_scheduler::BackupScheduler;
use crate::backup_state::SchedulerStateStore;
use crate::config::AppConfig;
use crate::database::DatabaseManager;
use crate::http::AppState;
use crate::mailer::{BackupMailer, SmtpMailer};
use crate::maintenance::MaintenanceState;
use crate::restore::RestorePipeline;

pub use crate::http::build_router;

/// 按配置组装共享状态；投递方式由调用方注入
pub fn build_state(cfg: &AppConfig, mailer: Arc<dyn BackupMailer>) -> anyhow::Result<AppState> {
    let db = Arc::new(DatabaseManager::new(&cfg.db_path())?);
    let tokens = Arc::new(TokenService::from_settings(&cfg.tokens));
    let gate = Arc::new(CredentialGate::new(&cfg.admin)?);
    let maintenance = MaintenanceState::new();

    let backup = Arc::new(BackupPipeline::new(
        Arc::clone(&db),
        mailer,
        cfg.work_dir(),
        cfg.backup.encryption_key.clone(),
    ));
    let restore = Arc::new(RestorePipeline::new(
        Arc::clone(&db),
        Arc::clone(&maintenance),
        cfg.work_dir(),
        cfg.backup.encryption_key.clone(),
    ));

    Ok(AppState {
        db,
        tokens,
        gate,
        maintenance,
        backup,
        restore,
    })
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let cfg = AppConfig::from_env().context("加载配置失败")?;
    cfg.ensure_data_dir()?;
    info!(
        "[Startup] environment={} data_dir={:?}",
        cfg.environment, cfg.data_dir
    );

    let mailer: Arc<dyn BackupMailer> = Arc::new(SmtpMailer::from_settings(&cfg.smtp)?);
    let state = build_state(&cfg, mailer)?;

    let scheduler = Arc::new(BackupScheduler::new(
        Arc::clone(&state.backup),
        SchedulerStateStore::in_dir(&cfg.logs_dir()),
        cfg.backup.interval_hours,
    ));
    let scheduler_task = scheduler.spawn();

    let app = build_router(state);
    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", cfg.bind_addr))?;
    info!("[Startup] 服务已启动: {}", cfg.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler_task.abort();
    info!("[Startup] 服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("[Startup] 注册 Ctrl+C 处理失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("[Startup] 注册 SIGTERM 处理失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[Startup] 收到 Ctrl+C，准备退出"),
        _ = terminate => info!("[Startup] 收到 SIGTERM，准备退出"),
    }
}
