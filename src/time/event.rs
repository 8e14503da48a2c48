//! 多媒体定时器事件
//!
//! 单次或周期地调用用户回调。回调运行在定时设施自己的线程上
//! （Windows 为 winmm 定时器线程，其他平台为每个事件一个专用线程），
//! 与创建事件的线程以及其他事件的回调并发执行。
//!
//! 回调不直接以指针交给原生层：原生层只拿到一个整数 key，触发时在全局注册表中
//! 查找回调并克隆其 `Arc` 后调用。注销后迟到的触发查不到回调，成为空操作；
//! 已经在执行的回调持有自己的 `Arc`，可以与注销并发地安全完成。
//! 注销不等待执行中的回调结束。
//!
//! 单次定时器在触发时就从注册表移除；注销时发现条目已不存在，说明原生定时器
//! 已经触发完毕，不再对它的 ID 调用 kill（该 ID 可能已被系统分配给别的定时器）。

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use super::native::NativeTimer;
use super::TimeError;

/// 触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// 经过 interval 后触发一次
    OneShot,
    /// 每隔 interval 触发一次，直到注销
    Periodic,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    callback: Callback,
    mode: TimerMode,
}

/// 回调注册表
struct Registry {
    next_key: usize,
    entries: HashMap<usize, Entry>,
}

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| {
            Mutex::new(Registry {
                next_key: 1,
                entries: HashMap::new(),
            })
        })
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn register(callback: Callback, mode: TimerMode) -> usize {
    let mut registry = registry();
    let key = registry.next_key;
    registry.next_key = registry.next_key.wrapping_add(1).max(1);
    registry.entries.insert(key, Entry { callback, mode });
    key
}

/// 移除条目；返回 false 表示已经移除过（或单次定时器已触发）
fn unregister(key: usize) -> bool {
    registry().entries.remove(&key).is_some()
}

/// 原生定时器触发时调用
///
/// 回调在注册表锁之外执行；回调中的 panic 被拦截，不会跨越原生边界。
pub(crate) fn dispatch(key: usize) {
    let callback = {
        let mut registry = registry();
        match registry.entries.get(&key).map(|entry| entry.mode) {
            Some(TimerMode::OneShot) => registry.entries.remove(&key).map(|entry| entry.callback),
            Some(TimerMode::Periodic) => registry.entries.get(&key).map(|entry| Arc::clone(&entry.callback)),
            None => None,
        }
    };
    if let Some(callback) = callback {
        if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
            log::error!("Timer callback {} panicked", key);
        }
    }
}

/// 已注册的原生定时器
///
/// 从构造成功到注销期间有效，只由一个 `TimerEvent` 持有。
pub struct TimerHandle {
    key: usize,
    native: NativeTimer,
}

impl TimerHandle {
    /// 注册表中的 key
    pub fn id(&self) -> usize {
        self.key
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").field("key", &self.key).finish()
    }
}

/// 定时器事件
pub struct TimerEvent {
    mode: TimerMode,
    interval_ms: u32,
    handle: Option<TimerHandle>,
}

impl TimerEvent {
    /// 创建并启动定时器
    ///
    /// - `callback`: 每次触发时以 `&user` 调用
    /// - `interval_ms`: 首次触发延迟，也是周期模式下的周期（至少 1ms）
    /// - `user`: 用户数据，原样传给回调
    pub fn new<U, F>(callback: F, interval_ms: u32, mode: TimerMode, user: U) -> Result<Self, TimeError>
    where
        U: Send + Sync + 'static,
        F: Fn(&U) + Send + Sync + 'static,
    {
        if interval_ms == 0 {
            return Err(TimeError::TimerCreate {
                interval_ms,
                reason: "interval must be at least 1 ms".to_string(),
            });
        }

        let key = register(Arc::new(move || callback(&user)), mode);

        let native = match NativeTimer::start(interval_ms, mode, key) {
            Ok(native) => native,
            Err(reason) => {
                unregister(key);
                return Err(TimeError::TimerCreate { interval_ms, reason });
            }
        };

        log::debug!("Timer {} started: {:?} every {} ms", key, mode, interval_ms);

        Ok(Self {
            mode,
            interval_ms,
            handle: Some(TimerHandle { key, native }),
        })
    }

    /// 单次定时器（无用户数据）
    pub fn one_shot<F>(interval_ms: u32, callback: F) -> Result<Self, TimeError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(move |_: &()| callback(), interval_ms, TimerMode::OneShot, ())
    }

    /// 周期定时器（无用户数据）
    pub fn periodic<F>(interval_ms: u32, callback: F) -> Result<Self, TimeError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(move |_: &()| callback(), interval_ms, TimerMode::Periodic, ())
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    /// 是否尚未注销
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&TimerHandle> {
        self.handle.as_ref()
    }

    /// 注销定时器
    ///
    /// 返回后不会再开始新的回调；正在执行的回调可能仍在并发完成。重复调用无副作用。
    pub fn cancel(&mut self) {
        let Some(TimerHandle { key, native }) = self.handle.take() else {
            return;
        };

        if unregister(key) {
            native.kill();
            log::debug!("Timer {} cancelled", key);
        } else {
            // 单次定时器已经触发，原生 ID 不再属于本事件
            drop(native);
            log::debug!("Timer {} already fired", key);
        }
    }
}

impl fmt::Debug for TimerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEvent")
            .field("mode", &self.mode)
            .field("interval_ms", &self.interval_ms)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for TimerEvent {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    /// 等待条件成立，超时返回 false
    fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < limit {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_one_shot_fires_once_after_interval() {
        let fired_at = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let recorder = Arc::clone(&fired_at);
        let mut event = TimerEvent::one_shot(20, move || {
            recorder.lock().unwrap().push(Instant::now());
        })
        .unwrap();
        assert_eq!(event.mode(), TimerMode::OneShot);
        assert!(event.is_active());

        assert!(wait_until(Duration::from_secs(2), || !fired_at.lock().unwrap().is_empty()));
        thread::sleep(Duration::from_millis(100));

        {
            let fired_at = fired_at.lock().unwrap();
            assert_eq!(fired_at.len(), 1);
            assert!(fired_at[0] - started >= Duration::from_millis(20));
        }

        event.cancel();
        assert!(!event.is_active());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired_at.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cancelled_one_shot_never_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let event = TimerEvent::one_shot(50, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        drop(event);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_periodic_fires_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut event = TimerEvent::periodic(5, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) >= 3));
        event.cancel();

        // 等待可能仍在执行的回调结束后再取样
        thread::sleep(Duration::from_millis(20));
        let after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_user_data_is_passed_through() {
        struct Payload {
            tag: &'static str,
            seen: Mutex<Vec<&'static str>>,
        }

        let payload = Arc::new(Payload {
            tag: "clock",
            seen: Mutex::new(Vec::new()),
        });

        let event = TimerEvent::new(
            |user: &Arc<Payload>| user.seen.lock().unwrap().push(user.tag),
            5,
            TimerMode::OneShot,
            Arc::clone(&payload),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || !payload.seen.lock().unwrap().is_empty()));
        assert_eq!(*payload.seen.lock().unwrap(), vec!["clock"]);
        drop(event);
    }

    #[test]
    fn test_cancel_from_inside_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancelled_at = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<TimerEvent>>> = Arc::new(Mutex::new(None));

        let counter = Arc::clone(&count);
        let marker = Arc::clone(&cancelled_at);
        let own_slot = Arc::clone(&slot);
        let event = TimerEvent::periodic(5, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= 3 {
                // 在回调线程中注销自身
                if let Some(event) = own_slot.lock().unwrap().take() {
                    marker.store(n, Ordering::SeqCst);
                    drop(event);
                }
            }
        })
        .unwrap();
        *slot.lock().unwrap() = Some(event);

        assert!(wait_until(Duration::from_secs(2), || cancelled_at.load(Ordering::SeqCst) > 0));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), cancelled_at.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let err = TimerEvent::one_shot(0, || {}).unwrap_err();
        assert!(matches!(err, TimeError::TimerCreate { interval_ms: 0, .. }));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut event = TimerEvent::periodic(5, move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick fails");
            }
        })
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) >= 2));
        event.cancel();
    }

    #[test]
    fn test_dispatch_after_unregister_is_noop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let key = register(
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            TimerMode::Periodic,
        );

        dispatch(key);
        dispatch(key);
        assert!(unregister(key));
        dispatch(key);
        assert!(!unregister(key));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_one_shot_entry_is_consumed_by_dispatch() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let key = register(
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            TimerMode::OneShot,
        );

        dispatch(key);
        dispatch(key);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // 已触发：注销时不再需要 kill 原生定时器
        assert!(!unregister(key));
    }

    #[test]
    fn test_cancel_after_one_shot_fired() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut event = TimerEvent::one_shot(5, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let key = event.handle().unwrap().id();

        assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
        assert!(!registry().entries.contains_key(&key));

        event.cancel();
        event.cancel();
        assert!(!event.is_active());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
