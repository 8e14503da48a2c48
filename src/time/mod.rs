//! 定时服务
//!
//! 包含：
//! - Event: 单次/周期定时器回调
//! - Period: 全局时钟分辨率请求
//! - Tick: 系统毫秒计数
//!
//! Windows 上直接使用 winmm 多媒体定时器，其他平台使用线程定时器。

pub mod event;
pub mod period;
pub mod tick;

#[cfg(not(windows))]
mod scheduler;
#[cfg(windows)]
mod winmm;

#[cfg(not(windows))]
use scheduler as native;
#[cfg(windows)]
use winmm as native;

pub use event::{TimerEvent, TimerHandle, TimerMode};
pub use period::{ClockResolution, PeriodRange, ResolutionGuard};
pub use tick::{elapsed_ms, now_ms};

/// 定时服务错误
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("failed to create {interval_ms} ms timer: {reason}")]
    TimerCreate { interval_ms: u32, reason: String },

    #[error("clock resolution already active at {active} ms")]
    AlreadyActive { active: u32 },

    #[error("failed to set clock resolution to {period_ms} ms: {reason}")]
    Resolution { period_ms: u32, reason: String },
}
