//! 全局时钟分辨率
//!
//! 进程范围内同一时刻最多请求一个最小定时器周期。`begin` 请求，`end` 撤销；
//! 已有活动请求时再次 `begin` 报错而不是叠加，`end` 在无活动请求时什么都不做。

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::native;
use super::TimeError;

/// 当前活动的周期（毫秒）
static ACTIVE: Mutex<Option<u32>> = Mutex::new(None);

fn active_slot() -> MutexGuard<'static, Option<u32>> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 平台支持的周期范围（毫秒，闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodRange {
    pub min: u32,
    pub max: u32,
}

impl PeriodRange {
    pub fn contains(&self, period_ms: u32) -> bool {
        (self.min..=self.max).contains(&period_ms)
    }
}

/// 时钟分辨率请求
pub struct ClockResolution;

impl ClockResolution {
    /// 请求最小定时器周期
    pub fn begin(period_ms: u32) -> Result<(), TimeError> {
        let mut active = active_slot();
        if let Some(current) = *active {
            return Err(TimeError::AlreadyActive { active: current });
        }

        let range = Self::capabilities()?;
        if !range.contains(period_ms) {
            return Err(TimeError::Resolution {
                period_ms,
                reason: format!("outside supported range {}..={} ms", range.min, range.max),
            });
        }

        native::begin_period(period_ms)
            .map_err(|reason| TimeError::Resolution { period_ms, reason })?;
        *active = Some(period_ms);

        log::info!("Clock resolution set to {} ms", period_ms);
        Ok(())
    }

    /// 撤销当前请求（无活动请求时为空操作）
    pub fn end() {
        let mut active = active_slot();
        if let Some(period_ms) = active.take() {
            native::end_period(period_ms);
            log::info!("Clock resolution {} ms released", period_ms);
        }
    }

    /// 当前活动的周期
    pub fn active() -> Option<u32> {
        *active_slot()
    }

    /// 请求周期，在返回的 guard 析构时撤销
    pub fn scoped(period_ms: u32) -> Result<ResolutionGuard, TimeError> {
        Self::begin(period_ms)?;
        Ok(ResolutionGuard { period_ms })
    }

    /// 查询平台支持的周期范围
    pub fn capabilities() -> Result<PeriodRange, TimeError> {
        native::period_range().map_err(|reason| TimeError::Resolution {
            period_ms: 0,
            reason,
        })
    }
}

/// `ClockResolution::scoped` 返回的作用域守卫
#[derive(Debug)]
#[must_use = "the resolution is released when the guard is dropped"]
pub struct ResolutionGuard {
    period_ms: u32,
}

impl ResolutionGuard {
    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        ClockResolution::end();
    }
}
