//! 系统毫秒计数
//!
//! 32 位毫秒计数，约 49.7 天回绕一次；计算间隔请用 `elapsed_ms`。

#[cfg(windows)]
mod mm {
    #[link(name = "winmm")]
    extern "system" {
        pub fn timeGetTime() -> u32;
    }
}

/// 当前毫秒计数（winmm timeGetTime）
#[cfg(windows)]
#[inline]
pub fn now_ms() -> u32 {
    unsafe { mm::timeGetTime() }
}

/// 当前毫秒计数（CLOCK_MONOTONIC，截断到 32 位）
#[cfg(not(windows))]
#[inline]
pub fn now_ms() -> u32 {
    // CLOCK_MONOTONIC 总是可用，失败时 ts 保持为零
    let ts = unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        ts
    };
    let ms = (ts.tv_sec as u64)
        .wrapping_mul(1000)
        .wrapping_add(ts.tv_nsec as u64 / 1_000_000);
    ms as u32
}

/// 自 `since` 起经过的毫秒数，正确处理回绕
#[inline]
pub fn elapsed_ms(since: u32) -> u32 {
    now_ms().wrapping_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now() {
        let t1 = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let diff = elapsed_ms(t1);

        // 计数粒度可能粗到 ~16ms
        assert!(diff >= 4, "expected time to advance, got {}ms", diff);
        assert!(diff < 5_000, "unexpected jump: {}ms", diff);
    }

    #[test]
    fn test_elapsed_across_wrap() {
        let before_wrap = u32::MAX - 5;
        let after_wrap: u32 = 10;
        assert_eq!(after_wrap.wrapping_sub(before_wrap), 16);
    }
}
