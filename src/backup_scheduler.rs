//! 自动备份调度器
//!
//! 启动时读取上次运行时间（锁竞争时按固定间隔重试），若距今已超过
//! 一个周期则立即备份一次；之后每个周期执行一次。每次运行后都记录时间，
//! 与邮件是否送达无关。

use backon::{ConstantBuilder, Retryable};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::backup::BackupPipeline;
use crate::backup_common::{RESILIENT_RETRY_COUNT, RESILIENT_RETRY_DELAY_MS};
use crate::backup_state::{SchedulerStateStore, StateError};

/// 是否需要在启动时补一次备份
pub fn should_run_initial(
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
) -> bool {
    match last_run {
        None => true,
        // 上次时间在未来（时钟回拨）时视为未到期
        Some(last) => match (now - last).to_std() {
            Ok(elapsed) => elapsed >= interval,
            Err(_) => false,
        },
    }
}

pub struct BackupScheduler {
    pipeline: Arc<BackupPipeline>,
    store: SchedulerStateStore,
    interval: Duration,
    retry_attempts: usize,
    retry_delay: Duration,
}

impl BackupScheduler {
    pub fn new(pipeline: Arc<BackupPipeline>, store: SchedulerStateStore, interval_hours: u64) -> Self {
        Self {
            pipeline,
            store,
            interval: Duration::from_secs(interval_hours.max(1).saturating_mul(3600)),
            retry_attempts: RESILIENT_RETRY_COUNT,
            retry_delay: Duration::from_millis(RESILIENT_RETRY_DELAY_MS),
        }
    }

    pub fn with_retry(mut self, attempts: usize, delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// 读取上次运行时间，只对锁竞争类错误重试
    pub async fn read_last_run(&self) -> Result<Option<DateTime<Utc>>, StateError> {
        let backoff = ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times(self.retry_attempts.saturating_sub(1));

        let read = || {
            let store = self.store.clone();
            async move { tokio::task::spawn_blocking(move || store.get_last_run()).await? }
        };

        read.retry(&backoff)
            .when(|e: &StateError| e.is_transient())
            .notify(|e: &StateError, delay: Duration| {
                warn!("[AutoBackup] 读取上次备份时间失败，{:?} 后重试: {}", delay, e);
            })
            .await
    }

    /// 执行一次备份并记录时间
    pub async fn run_once(&self) {
        if self.pipeline.run_logged().await.is_none() {
            warn!("[AutoBackup] 本次备份未完成，仍记录运行时间");
        }
        let store = self.store.clone();
        let now = Utc::now();
        match tokio::task::spawn_blocking(move || store.save_last_run(now)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("[AutoBackup] 保存运行时间失败: {}", e),
            Err(e) => error!("[AutoBackup] 保存运行时间任务异常: {}", e),
        }
    }

    /// 启动检查，返回是否执行了备份
    pub async fn run_initial_check(&self) -> bool {
        let last_run = match self.read_last_run().await {
            Ok(last) => last,
            Err(e) => {
                error!("[AutoBackup] 无法读取上次备份时间，跳过启动检查: {}", e);
                return false;
            }
        };

        if should_run_initial(last_run, Utc::now(), self.interval) {
            info!("[AutoBackup] 距上次备份已超过周期（上次: {:?}），立即备份", last_run);
            self.run_once().await;
            true
        } else {
            info!("[AutoBackup] 上次备份时间 {:?}，等待下一个周期", last_run);
            false
        }
    }

    /// 在后台运行：启动检查 + 周期定时器
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "[AutoBackup] 自动备份调度器已启动，周期 {} 小时",
                self.interval.as_secs() / 3600
            );
            self.run_initial_check().await;

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("[AutoBackup] 定时备份开始");
                self.run_once().await;
            }
        })
    }
}
