//! WinMM 定时器后端
//!
//! - timeSetEvent / timeKillEvent：回调运行在 winmm 的定时器线程上
//! - timeBeginPeriod / timeEndPeriod / timeGetDevCaps：全局时钟分辨率

use crate::midi::MmError;

use super::event::{self, TimerMode};
use super::period::PeriodRange;

type MmResult = u32;

type TimerProc = extern "system" fn(timer_id: u32, msg: u32, user: usize, dw1: usize, dw2: usize);

const TIME_ONESHOT: u32 = 0x0000;
const TIME_PERIODIC: u32 = 0x0001;
const TIME_CALLBACK_FUNCTION: u32 = 0x0000;
const TIME_KILL_SYNCHRONOUS: u32 = 0x0100;

/// Win32 TIMECAPS
#[repr(C)]
#[derive(Default)]
struct TimeCaps {
    period_min: u32,
    period_max: u32,
}

#[link(name = "winmm")]
extern "system" {
    fn timeSetEvent(delay: u32, resolution: u32, callback: TimerProc, user: usize, event_type: u32) -> u32;

    fn timeKillEvent(timer_id: u32) -> MmResult;

    fn timeBeginPeriod(period: u32) -> MmResult;

    fn timeEndPeriod(period: u32) -> MmResult;

    fn timeGetDevCaps(caps: *mut TimeCaps, caps_size: u32) -> MmResult;
}

extern "system" fn timer_proc(_timer_id: u32, _msg: u32, user: usize, _dw1: usize, _dw2: usize) {
    event::dispatch(user);
}

/// timeSetEvent 返回的定时器
pub(crate) struct NativeTimer {
    timer_id: u32,
}

impl NativeTimer {
    pub(crate) fn start(interval_ms: u32, mode: TimerMode, key: usize) -> Result<Self, String> {
        let kind = match mode {
            TimerMode::OneShot => TIME_ONESHOT,
            TimerMode::Periodic => TIME_PERIODIC,
        };

        let timer_id = unsafe {
            timeSetEvent(
                interval_ms,
                interval_ms,
                timer_proc,
                key,
                kind | TIME_CALLBACK_FUNCTION | TIME_KILL_SYNCHRONOUS,
            )
        };

        if timer_id == 0 {
            return Err(format!("timeSetEvent refused a {} ms timer", interval_ms));
        }
        Ok(Self { timer_id })
    }

    pub(crate) fn kill(self) {
        // 只对仍属于本事件的定时器调用（已触发的单次定时器由注册表过滤）
        if let Err(e) = MmError::check(unsafe { timeKillEvent(self.timer_id) }) {
            log::debug!("timeKillEvent({}) returned {}", self.timer_id, e);
        }
    }
}

pub(crate) fn begin_period(period_ms: u32) -> Result<(), String> {
    MmError::check(unsafe { timeBeginPeriod(period_ms) }).map_err(|e| e.to_string())
}

pub(crate) fn end_period(period_ms: u32) {
    if let Err(e) = MmError::check(unsafe { timeEndPeriod(period_ms) }) {
        log::warn!("timeEndPeriod({}) failed: {}", period_ms, e);
    }
}

pub(crate) fn period_range() -> Result<PeriodRange, String> {
    let mut caps = TimeCaps::default();
    let status = unsafe { timeGetDevCaps(&mut caps, std::mem::size_of::<TimeCaps>() as u32) };
    MmError::check(status).map_err(|e| e.to_string())?;

    Ok(PeriodRange {
        min: caps.period_min,
        max: caps.period_max,
    })
}
