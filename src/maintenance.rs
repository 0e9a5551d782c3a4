//! 维护模式
//!
//! 进程级布尔标志，只能通过 `MaintenanceState::begin()` 拿到的
//! `MaintenanceGuard` 置位，guard drop 时无条件复位。

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::models::AppError;

/// 超过此时长仍未退出维护模式时打告警日志
const MAINTENANCE_MODE_WARN_SECS: u64 = 300;

#[derive(Debug, Default)]
pub struct MaintenanceState {
    active: Mutex<bool>,
}

impl MaintenanceState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock().unwrap_or_else(|poisoned| {
            error!("[Maintenance] flag Mutex poisoned! Attempting recovery");
            poisoned.into_inner()
        })
    }

    /// 进入维护模式；已处于维护模式时返回错误，避免两个 guard 互相复位
    pub fn begin(self: &Arc<Self>) -> Result<MaintenanceGuard, AppError> {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| {
            error!("[Maintenance] flag Mutex poisoned! Attempting recovery");
            poisoned.into_inner()
        });
        if *active {
            return Err(AppError::maintenance());
        }
        *active = true;
        info!("[MaintenanceGuard] 已进入维护模式");

        Ok(MaintenanceGuard {
            state: Arc::clone(self),
            entered_at: Instant::now(),
        })
    }

    fn end(&self) {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| {
            error!("[Maintenance] flag Mutex poisoned during end! Forcing recovery");
            poisoned.into_inner()
        });
        *active = false;
    }
}

/// 维护模式 RAII guard
///
/// ```ignore
/// let guard = state.begin()?;
/// // 执行恢复操作...
/// // guard 超出作用域时自动退出维护模式（包括 ? 提前返回与 panic 展开）
/// ```
pub struct MaintenanceGuard {
    state: Arc<MaintenanceState>,
    entered_at: Instant,
}

impl MaintenanceGuard {
    pub fn elapsed_secs(&self) -> u64 {
        self.entered_at.elapsed().as_secs()
    }
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        let elapsed = self.elapsed_secs();
        if elapsed > MAINTENANCE_MODE_WARN_SECS {
            warn!(
                "[MaintenanceGuard] 维护模式持续过久（{} 秒，阈值 {} 秒）",
                elapsed, MAINTENANCE_MODE_WARN_SECS
            );
        }
        self.state.end();
        info!("[MaintenanceGuard] 已退出维护模式（持续 {} 秒）", elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_sets_and_clears_flag() {
        let state = MaintenanceState::new();
        assert!(!state.is_active());
        {
            let _guard = state.begin().unwrap();
            assert!(state.is_active());
        }
        assert!(!state.is_active());
    }

    #[test]
    fn test_nested_begin_rejected() {
        let state = MaintenanceState::new();
        let guard = state.begin().unwrap();
        assert!(state.begin().is_err());
        // 失败的 begin 不应影响已有 guard
        assert!(state.is_active());
        drop(guard);
        assert!(!state.is_active());
    }

    #[test]
    fn test_flag_cleared_on_error_path() {
        fn failing(state: &Arc<MaintenanceState>) -> Result<(), AppError> {
            let _guard = state.begin()?;
            Err(AppError::internal("boom"))
        }
        let state = MaintenanceState::new();
        assert!(failing(&state).is_err());
        assert!(!state.is_active());
    }

    #[test]
    fn test_flag_cleared_on_panic() {
        let state = MaintenanceState::new();
        let cloned = Arc::clone(&state);
        let result = std::thread::spawn(move || {
            let _guard = cloned.begin().unwrap();
            panic!("restore step panicked");
        })
        .join();
        assert!(result.is_err());
        assert!(!state.is_active());
    }
}
