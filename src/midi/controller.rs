//! MIDI 输出控制器
//!
//! 独占一个输出端口和一个传输缓冲区，提供：
//! - 短消息：打包成一个字，同步发送，不等待完成
//! - 长消息：按缓冲区容量分块，每块 prepare → submit → 等待 DONE → unprepare，严格按顺序
//!
//! 状态：Unopened → Open → Closed。打开过程中任何一步失败都会先释放已获取的资源。
//! 所有发送方法都取 `&mut self`，同一控制器上同时最多只有一个发送在进行；
//! 跨线程共享时由调用方加锁（例如 `Arc<Mutex<OutputController>>`）。

use std::collections::TryReserveError;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use super::buffer::{MidiHeader, TransferBuffer};
use super::device;
use super::driver::{MidiOutDriver, MidiOutPort, MmError};
use super::message::{pack_short, ShortMessage};
use super::{system_driver, SystemPort};

/// 一次传输的最大字节数（默认缓冲区容量）
pub const MAX_BYTES_PER_SENDING: usize = 1024;

/// winmm 单个 MIDIHDR 的上限
const MAX_TRANSFER_BYTES: usize = 64 * 1024;

/// 默认的单块完成等待上限
const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

/// 控制器配置
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// 传输缓冲区容量（字节），超过的长消息会被分块
    pub buffer_capacity: usize,
    /// 单块等待完成的上限，None 表示无限等待
    pub completion_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: MAX_BYTES_PER_SENDING,
            completion_timeout: Some(DEFAULT_COMPLETION_TIMEOUT),
        }
    }
}

impl ControllerConfig {
    /// 把容量限制在 1..=64KiB
    fn normalized(mut self) -> Self {
        let clamped = self.buffer_capacity.clamp(1, MAX_TRANSFER_BYTES);
        if clamped != self.buffer_capacity {
            log::warn!(
                "Transfer buffer capacity {} out of range, using {}",
                self.buffer_capacity,
                clamped
            );
            self.buffer_capacity = clamped;
        }
        self
    }
}

/// 长消息分块所处的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Prepare,
    Submit,
    Unprepare,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepare => f.write_str("prepare"),
            Self::Submit => f.write_str("submit"),
            Self::Unprepare => f.write_str("unprepare"),
        }
    }
}

/// MIDI 输出错误
#[derive(Debug, thiserror::Error)]
pub enum MidiError {
    #[error("failed to open MIDI output {device_id}: {reason}")]
    DeviceOpen { device_id: u32, reason: MmError },

    #[error("no MIDI output device named {name:?}")]
    DeviceNotFound { name: String },

    #[error("failed to query MIDI output {device_id}: {reason}")]
    DeviceCaps { device_id: u32, reason: MmError },

    #[error("failed to allocate a {capacity} byte transfer buffer")]
    BufferAlloc { capacity: usize },

    #[error("short message 0x{word:06X} rejected: {reason}")]
    ShortMessage { word: u32, reason: MmError },

    #[error("long message chunk {chunk_index}: {stage} failed: {reason}")]
    Transmit {
        chunk_index: usize,
        stage: TransferStage,
        reason: MmError,
    },

    #[error("long message chunk {chunk_index} not completed after {waited:?}")]
    TransmitTimeout { chunk_index: usize, waited: Duration },

    #[error("MIDI output is closed")]
    Closed,
}

/// 打开状态下持有的资源
struct Open<P> {
    port: P,
    transfer: TransferBuffer,
}

/// MIDI 输出设备控制器
pub struct OutputController<P: MidiOutPort = SystemPort> {
    device_id: u32,
    config: ControllerConfig,
    inner: Option<Open<P>>,
}

impl OutputController {
    /// 使用系统驱动和默认配置打开设备
    pub fn open(device_id: u32) -> Result<Self, MidiError> {
        Self::open_with(&system_driver(), device_id, ControllerConfig::default())
    }

    /// 使用系统驱动和默认配置，按名称打开设备
    pub fn open_by_name(name: &str) -> Result<Self, MidiError> {
        Self::open_by_name_with(&system_driver(), name, ControllerConfig::default())
    }
}

impl<P: MidiOutPort> OutputController<P> {
    /// 打开设备
    ///
    /// 先获取端口，再分配传输缓冲区；缓冲区分配失败时关闭端口后返回错误。
    pub fn open_with<D>(driver: &D, device_id: u32, config: ControllerConfig) -> Result<Self, MidiError>
    where
        D: MidiOutDriver<Port = P>,
    {
        Self::open_parts(driver, device_id, config, TransferBuffer::with_capacity)
    }

    /// 打开端口后用 `allocate` 分配传输缓冲区
    fn open_parts<D, A>(driver: &D, device_id: u32, config: ControllerConfig, allocate: A) -> Result<Self, MidiError>
    where
        D: MidiOutDriver<Port = P>,
        A: FnOnce(usize) -> Result<TransferBuffer, TryReserveError>,
    {
        let config = config.normalized();

        let port = driver
            .open(device_id)
            .map_err(|reason| MidiError::DeviceOpen { device_id, reason })?;

        let transfer = match allocate(config.buffer_capacity) {
            Ok(transfer) => transfer,
            Err(e) => {
                log::warn!("Transfer buffer allocation failed: {}", e);
                if let Err(e) = port.close() {
                    log::warn!("Failed to close MIDI output {} after allocation failure: {}", device_id, e);
                }
                return Err(MidiError::BufferAlloc {
                    capacity: config.buffer_capacity,
                });
            }
        };

        log::info!(
            "MIDI output {} opened ({} byte transfer buffer)",
            device_id,
            transfer.capacity()
        );

        Ok(Self {
            device_id,
            config,
            inner: Some(Open { port, transfer }),
        })
    }

    /// 按名称打开设备（第一个完全匹配的设备）
    pub fn open_by_name_with<D>(driver: &D, name: &str, config: ControllerConfig) -> Result<Self, MidiError>
    where
        D: MidiOutDriver<Port = P>,
    {
        match device::find_by_name(driver, name) {
            Some(device_id) => {
                log::info!("Found MIDI output: {} (ID: {})", name, device_id);
                Self::open_with(driver, device_id, config)
            }
            None => Err(MidiError::DeviceNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// 获取设备 ID
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// 获取传输缓冲区容量
    pub fn buffer_capacity(&self) -> usize {
        self.config.buffer_capacity
    }

    /// 是否处于打开状态
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// 发送 1~3 字节的短消息
    pub fn send_short(&mut self, status: u8, data1: u8, data2: u8) -> Result<(), MidiError> {
        let open = self.inner.as_mut().ok_or(MidiError::Closed)?;
        let word = pack_short(status, data1, data2);
        open.port
            .short_msg(word)
            .map_err(|reason| MidiError::ShortMessage { word, reason })
    }

    /// 发送短消息
    pub fn send(&mut self, message: ShortMessage) -> Result<(), MidiError> {
        self.send_short(message.status, message.data1, message.data2)
    }

    /// 发送任意长度的消息（通常是 SysEx）
    ///
    /// 按缓冲区容量分块依次传输，每块都等到设备完成后才开始下一块。
    /// 出错时之前的分块已经送出且不会回滚，调用方不能假设跨分块的原子性。
    /// 如果出错后驱动仍持有 header（例如超时后 reset 失败），控制器随即关闭，
    /// 之后的发送返回 `MidiError::Closed`。
    pub fn send_long(&mut self, bytes: &[u8]) -> Result<(), MidiError> {
        let timeout = self.config.completion_timeout;
        let Open { port, transfer } = self.inner.as_mut().ok_or(MidiError::Closed)?;

        let capacity = transfer.capacity();
        let mut result = Ok(());
        for (chunk_index, chunk) in bytes.chunks(capacity).enumerate() {
            log::trace!("Sending chunk {} ({} bytes)", chunk_index, chunk.len());
            result = transmit_chunk(port, transfer.load(chunk), chunk_index, timeout);
            if result.is_err() {
                break;
            }
        }

        if result.is_err() && transfer.header().is_busy() {
            log::error!(
                "MIDI output {} still holds the transfer header, closing it",
                self.device_id
            );
            self.close();
        }

        result
    }

    /// 关闭控制器
    ///
    /// 依次释放 header/缓冲区，reset 后关闭端口。重复调用无副作用。
    /// 驱动仍持有 header 时，缓冲区保留到端口关闭之后再释放。
    pub fn close(&mut self) {
        let Some(Open { mut port, transfer }) = self.inner.take() else {
            return;
        };

        let held = if transfer.header().is_busy() {
            Some(transfer)
        } else {
            drop(transfer);
            None
        };

        if let Err(e) = port.reset() {
            log::warn!("Failed to reset MIDI output {}: {}", self.device_id, e);
        }
        if let Err(e) = port.close() {
            log::warn!("Failed to close MIDI output {}: {}", self.device_id, e);
        }
        drop(held);

        log::info!("MIDI output {} closed", self.device_id);
    }
}

impl<P: MidiOutPort> Drop for OutputController<P> {
    fn drop(&mut self) {
        self.close();
    }
}

/// 传输一个已装载的分块
fn transmit_chunk<P: MidiOutPort>(
    port: &mut P,
    header: &mut MidiHeader,
    chunk_index: usize,
    timeout: Option<Duration>,
) -> Result<(), MidiError> {
    port.prepare(header).map_err(|reason| MidiError::Transmit {
        chunk_index,
        stage: TransferStage::Prepare,
        reason,
    })?;

    if let Err(reason) = port.submit(header) {
        // 提交失败不会有完成通知，跳过等待，只尝试注销
        if let Err(e) = port.unprepare(header) {
            log::debug!("Unprepare after failed submit of chunk {}: {}", chunk_index, e);
        }
        return Err(MidiError::Transmit {
            chunk_index,
            stage: TransferStage::Submit,
            reason,
        });
    }

    if let Err(waited) = wait_for_completion(header, timeout) {
        log::warn!(
            "Chunk {} not completed after {:?}, resetting output",
            chunk_index,
            waited
        );
        // reset 让驱动归还 header，之后才能注销
        if let Err(e) = port.reset() {
            log::debug!("Reset after timeout of chunk {}: {}", chunk_index, e);
        }
        if let Err(e) = port.unprepare(header) {
            log::debug!("Unprepare after timeout of chunk {}: {}", chunk_index, e);
        }
        return Err(MidiError::TransmitTimeout { chunk_index, waited });
    }

    port.unprepare(header).map_err(|reason| MidiError::Transmit {
        chunk_index,
        stage: TransferStage::Unprepare,
        reason,
    })
}

/// 等待设备置 `MHDR_DONE`
///
/// 先自旋，随后退化为 yield。超时返回已等待的时长。
fn wait_for_completion(header: &MidiHeader, timeout: Option<Duration>) -> Result<(), Duration> {
    let backoff = Backoff::new();
    let started = Instant::now();

    while !header.is_done() {
        if let Some(limit) = timeout {
            let waited = started.elapsed();
            if waited >= limit {
                return Err(waited);
            }
        }

        if backoff.is_completed() {
            thread::yield_now();
        } else {
            backoff.snooze();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::loopback::{Loopback, LoopbackPort, Sent};
    use std::sync::{Arc, Barrier};

    fn config(capacity: usize) -> ControllerConfig {
        ControllerConfig {
            buffer_capacity: capacity,
            completion_timeout: Some(Duration::from_millis(200)),
        }
    }

    fn open(loopback: &Loopback, capacity: usize) -> OutputController<LoopbackPort> {
        OutputController::open_with(loopback, 0, config(capacity)).unwrap()
    }

    #[test]
    fn test_send_short_packs_little_endian() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = open(&loopback, 16);

        out.send_short(0x90, 60, 100).unwrap();
        out.send(ShortMessage::note_off(0, 60, 0)).unwrap();
        out.send_short(0xF8, 0, 0).unwrap();

        assert_eq!(loopback.short_messages(0), vec![0x0064_3C90, 0x0000_3C80, 0x0000_00F8]);
    }

    #[test]
    fn test_send_long_fits_in_one_chunk() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = open(&loopback, 8);

        let message = [0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7];
        out.send_long(&message).unwrap();
        assert_eq!(loopback.long_chunks(0), vec![message.to_vec()]);

        // 恰好等于容量也是一块
        loopback.clear(0);
        let full: Vec<u8> = (0..8).collect();
        out.send_long(&full).unwrap();
        assert_eq!(loopback.long_chunks(0), vec![full]);
    }

    #[test]
    fn test_send_long_splits_in_order() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = open(&loopback, 4);

        for len in [5usize, 8, 9, 23] {
            loopback.clear(0);
            let message: Vec<u8> = (0..len).map(|i| i as u8).collect();
            out.send_long(&message).unwrap();

            let chunks = loopback.long_chunks(0);
            assert_eq!(chunks.len(), len.div_ceil(4), "len {}", len);
            assert!(chunks[..chunks.len() - 1].iter().all(|c| c.len() == 4));
            assert!(!chunks.last().unwrap().is_empty());
            assert_eq!(chunks.concat(), message);
        }
    }

    #[test]
    fn test_send_long_default_capacity() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = OutputController::open_with(&loopback, 0, ControllerConfig::default()).unwrap();
        assert_eq!(out.buffer_capacity(), MAX_BYTES_PER_SENDING);

        let message = vec![0x42u8; 2500];
        out.send_long(&message).unwrap();

        let lens: Vec<usize> = loopback.long_chunks(0).iter().map(Vec::len).collect();
        assert_eq!(lens, vec![1024, 1024, 452]);
    }

    #[test]
    fn test_send_long_empty_sends_nothing() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = open(&loopback, 4);

        out.send_long(&[]).unwrap();
        assert!(loopback.sent(0).is_empty());
    }

    #[test]
    fn test_submit_failure_reports_chunk_index() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = open(&loopback, 2);
        loopback.fail_submit(0, 2, MmError::MIDI_NOT_READY);

        let err = out.send_long(&[1, 2, 3, 4, 5, 6, 7]).unwrap_err();
        match err {
            MidiError::Transmit {
                chunk_index,
                stage,
                reason,
            } => {
                assert_eq!(chunk_index, 2);
                assert_eq!(stage, TransferStage::Submit);
                assert_eq!(reason, MmError::MIDI_NOT_READY);
            }
            other => panic!("unexpected error: {other}"),
        }

        // 之前的分块已经送出，不回滚
        assert_eq!(loopback.long_chunks(0), vec![vec![1, 2], vec![3, 4]]);

        // header 已注销，控制器仍可继续使用
        out.send_long(&[9]).unwrap();
        assert_eq!(loopback.long_chunks(0).last(), Some(&vec![9]));
    }

    #[test]
    fn test_stalled_completion_times_out() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = OutputController::open_with(
            &loopback,
            0,
            ControllerConfig {
                buffer_capacity: 4,
                completion_timeout: Some(Duration::from_millis(30)),
            },
        )
        .unwrap();
        loopback.stall_completion(0, true);

        let started = Instant::now();
        let err = out.send_long(&[1, 2, 3, 4, 5]).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(30));
        match err {
            MidiError::TransmitTimeout { chunk_index, waited } => {
                assert_eq!(chunk_index, 0);
                assert!(waited >= Duration::from_millis(30));
            }
            other => panic!("unexpected error: {other}"),
        }

        // 第二块没有开始；reset 之后 header 已归还
        assert_eq!(
            loopback.sent(0),
            vec![Sent::Long(vec![1, 2, 3, 4]), Sent::Reset]
        );

        loopback.stall_completion(0, false);
        out.send_long(&[7, 8]).unwrap();
        assert_eq!(loopback.long_chunks(0).last(), Some(&vec![7, 8]));
    }

    #[test]
    fn test_timeout_with_failed_reset_closes_controller() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = OutputController::open_with(
            &loopback,
            0,
            ControllerConfig {
                buffer_capacity: 4,
                completion_timeout: Some(Duration::from_millis(20)),
            },
        )
        .unwrap();
        loopback.stall_completion(0, true);
        loopback.fail_reset(0, Some(MmError::INVALID_HANDLE));

        let err = out.send_long(&[1, 2, 3, 4, 5, 6]).unwrap_err();
        assert!(matches!(err, MidiError::TransmitTimeout { chunk_index: 0, .. }));

        // 驱动没有归还 header：控制器关闭，不再装载第二块
        assert!(!out.is_open());
        assert!(!loopback.is_claimed(0));
        assert_eq!(loopback.close_count(0), 1);
        assert_eq!(loopback.long_chunks(0), vec![vec![1, 2, 3, 4]]);

        assert!(matches!(out.send_long(&[7]), Err(MidiError::Closed)));
        assert_eq!(loopback.long_chunks(0).len(), 1);

        drop(out);
        assert_eq!(loopback.close_count(0), 1);
    }

    #[test]
    fn test_send_after_close_fails() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = open(&loopback, 4);
        out.close();

        assert!(!out.is_open());
        assert!(matches!(out.send_short(0x90, 60, 100), Err(MidiError::Closed)));
        assert!(matches!(out.send_long(&[0xF0, 0xF7]), Err(MidiError::Closed)));
        assert!(matches!(out.send_long(&[]), Err(MidiError::Closed)));
    }

    #[test]
    fn test_close_resets_then_closes_once() {
        let loopback = Loopback::with_devices(["A"]);
        let mut out = open(&loopback, 4);
        out.send_short(0x90, 60, 100).unwrap();

        out.close();
        out.close();
        drop(out);

        assert_eq!(loopback.sent(0).last(), Some(&Sent::Reset));
        assert_eq!(loopback.close_count(0), 1);
        assert!(!loopback.is_claimed(0));
    }

    #[test]
    fn test_drop_closes() {
        let loopback = Loopback::with_devices(["A"]);
        {
            let _out = open(&loopback, 4);
            assert!(loopback.is_claimed(0));
        }
        assert!(!loopback.is_claimed(0));
        assert_eq!(loopback.close_count(0), 1);
    }

    #[test]
    fn test_open_failures() {
        let loopback = Loopback::with_devices(["A"]);

        let err = OutputController::open_with(&loopback, 3, config(4)).err().unwrap();
        assert!(matches!(
            err,
            MidiError::DeviceOpen { device_id: 3, reason } if reason == MmError::BAD_DEVICE_ID
        ));

        let _first = open(&loopback, 4);
        let err = OutputController::open_with(&loopback, 0, config(4)).err().unwrap();
        assert!(matches!(
            err,
            MidiError::DeviceOpen { reason, .. } if reason == MmError::ALLOCATED
        ));
    }

    #[test]
    fn test_allocation_failure_closes_port() {
        let loopback = Loopback::with_devices(["A"]);

        let err = OutputController::<LoopbackPort>::open_parts(&loopback, 0, config(16), |_| {
            Err(Vec::<u8>::new().try_reserve_exact(usize::MAX).unwrap_err())
        })
        .err()
        .unwrap();

        assert!(matches!(err, MidiError::BufferAlloc { capacity: 16 }));
        assert_eq!(loopback.close_count(0), 1);
        assert!(!loopback.is_claimed(0));

        // 设备已归还，可以再次打开
        let out = open(&loopback, 16);
        assert!(out.is_open());
    }

    #[test]
    fn test_open_by_name() {
        let loopback = Loopback::with_devices(["Synth A", "Synth B"]);

        let out = OutputController::open_by_name_with(&loopback, "Synth B", config(4)).unwrap();
        assert_eq!(out.device_id(), 1);
        assert!(loopback.is_claimed(1));
        assert!(!loopback.is_claimed(0));

        let err = OutputController::open_by_name_with(&loopback, "Synth C", config(4)).err().unwrap();
        assert!(matches!(err, MidiError::DeviceNotFound { ref name } if name == "Synth C"));
    }

    #[test]
    fn test_capacity_is_clamped() {
        let loopback = Loopback::with_devices(["A", "B"]);

        let out = OutputController::open_with(&loopback, 0, config(0)).unwrap();
        assert_eq!(out.buffer_capacity(), 1);

        let out = OutputController::open_with(&loopback, 1, config(1 << 20)).unwrap();
        assert_eq!(out.buffer_capacity(), 64 * 1024);
    }

    #[test]
    fn test_independent_controllers_on_two_threads() {
        let loopback = Loopback::with_devices(["A", "B"]);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [(0u32, 0x11u8), (1, 0x22)]
            .into_iter()
            .map(|(device_id, fill)| {
                let loopback = loopback.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut out = OutputController::open_with(&loopback, device_id, config(16)).unwrap();
                    let message = vec![fill; 1000];
                    barrier.wait();
                    for _ in 0..20 {
                        out.send_long(&message).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for (device_id, fill) in [(0u32, 0x11u8), (1, 0x22)] {
            let chunks = loopback.long_chunks(device_id);
            assert_eq!(chunks.len(), 20 * 1000usize.div_ceil(16));
            assert!(chunks.iter().flatten().all(|&b| b == fill));
            assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 20 * 1000);
        }
    }
}
