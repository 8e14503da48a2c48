//! 线程定时器后端（非 Windows）
//!
//! 每个事件一个命名线程，用 `recv_timeout` 等待下一个截止时间；
//! 丢弃发送端即注销，线程在下一次唤醒时退出，不需要 join。
//! 截止时间按固定节拍推进，从不提前触发；错过的周期直接跳过。

use std::sync::mpsc::{self, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use super::event::{self, TimerMode};
use super::period::PeriodRange;

/// 本后端没有全局分辨率概念，接受任意合理周期
const PERIOD_RANGE: PeriodRange = PeriodRange {
    min: 1,
    max: 1_000_000,
};

pub(crate) struct NativeTimer {
    cancel: Sender<()>,
}

impl NativeTimer {
    pub(crate) fn start(interval_ms: u32, mode: TimerMode, key: usize) -> Result<Self, String> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let interval = Duration::from_millis(u64::from(interval_ms));

        thread::Builder::new()
            .name(format!("timer-{}", key))
            .spawn(move || {
                let mut deadline = Instant::now() + interval;
                loop {
                    // 等到截止时间；提前唤醒就继续等
                    loop {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        match cancelled.recv_timeout(deadline - now) {
                            Err(RecvTimeoutError::Timeout) => continue,
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }

                    if !matches!(cancelled.try_recv(), Err(TryRecvError::Empty)) {
                        return;
                    }

                    event::dispatch(key);

                    if mode == TimerMode::OneShot {
                        return;
                    }

                    deadline += interval;
                    let now = Instant::now();
                    if deadline <= now {
                        let behind = (now - deadline).as_nanos() / interval.as_nanos() + 1;
                        log::trace!("Timer {} skipped {} late ticks", key, behind);
                        deadline += interval * behind as u32;
                    }
                }
            })
            .map_err(|e| format!("failed to spawn timer thread: {}", e))?;

        Ok(Self { cancel })
    }

    pub(crate) fn kill(self) {
        drop(self.cancel);
    }
}

pub(crate) fn begin_period(_period_ms: u32) -> Result<(), String> {
    Ok(())
}

pub(crate) fn end_period(_period_ms: u32) {}

pub(crate) fn period_range() -> Result<PeriodRange, String> {
    Ok(PERIOD_RANGE)
}
