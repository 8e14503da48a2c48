//! 进程内虚拟 MIDI 输出
//!
//! 一组具名的虚拟输出设备，记录发送到每个设备的短消息和长消息分块。
//! 与 winmm 行为保持一致：
//! - 设备独占打开（已被占用返回 `MMSYSERR_ALLOCATED`）
//! - 无效 ID 返回 `MMSYSERR_BADDEVICEID`
//! - 未 prepare 就 submit 返回 `MIDIERR_UNPREPARED`
//! - 仍在传输中 unprepare 返回 `MIDIERR_STILLPLAYING`
//!
//! 另外支持故障注入（打开失败、第 N 次提交失败、reset 失败、传输永不完成），
//! 用于测试控制器的错误路径。非 Windows 平台的系统驱动也是它，
//! 该共享实例不记录收到的内容。

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use super::buffer::{MidiHeader, MHDR_DONE, MHDR_INQUEUE, MHDR_PREPARED};
use super::device::DeviceCaps;
use super::driver::{MidiOutDriver, MidiOutPort, MmError};

/// 设备收到的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// 打包后的短消息
    Short(u32),
    /// 一个长消息分块
    Long(Vec<u8>),
    /// midiOutReset
    Reset,
}

#[derive(Debug)]
struct VirtualDevice {
    caps: DeviceCaps,
    claimed: bool,
    recording: bool,
    sent: Vec<Sent>,
    submits: usize,
    closes: usize,
    fail_open: Option<MmError>,
    fail_submit: Option<(usize, MmError)>,
    fail_reset: Option<MmError>,
    stall: bool,
    /// 已提交但未完成（仅在 stall 时出现）
    pending: bool,
}

impl VirtualDevice {
    fn record(&mut self, sent: Sent) {
        if self.recording {
            self.sent.push(sent);
        }
    }

    fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            claimed: false,
            recording: true,
            sent: Vec::new(),
            submits: 0,
            closes: 0,
            fail_open: None,
            fail_submit: None,
            fail_reset: None,
            stall: false,
            pending: false,
        }
    }
}

/// 虚拟输出设备集合
///
/// 克隆得到的是同一组设备的句柄。
#[derive(Debug, Clone, Default)]
pub struct Loopback {
    devices: Arc<Mutex<Vec<VirtualDevice>>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建包含指定名称设备的集合，ID 按顺序从 0 开始
    pub fn with_devices<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let loopback = Self::new();
        for name in names {
            loopback.add_device(name);
        }
        loopback
    }

    /// 进程内共享的默认设备集合（非 Windows 平台的系统驱动），不记录收到的内容
    pub fn shared() -> Self {
        static SHARED: OnceLock<Loopback> = OnceLock::new();
        SHARED
            .get_or_init(|| {
                let loopback = Loopback::new();
                let device_id = loopback.add_device("Loopback MIDI Out");
                loopback.set_recording(device_id, false);
                loopback
            })
            .clone()
    }

    /// 添加设备，返回其 ID
    pub fn add_device(&self, name: impl Into<String>) -> u32 {
        let mut devices = self.lock();
        let id = devices.len() as u32;
        devices.push(VirtualDevice::new(DeviceCaps::port(id, name)));
        id
    }

    /// 设备收到的全部内容（按时间顺序）
    pub fn sent(&self, device_id: u32) -> Vec<Sent> {
        self.with_device(device_id, |d| d.sent.clone()).unwrap_or_default()
    }

    /// 设备收到的短消息
    pub fn short_messages(&self, device_id: u32) -> Vec<u32> {
        self.sent(device_id)
            .into_iter()
            .filter_map(|s| match s {
                Sent::Short(word) => Some(word),
                _ => None,
            })
            .collect()
    }

    /// 设备收到的长消息分块
    pub fn long_chunks(&self, device_id: u32) -> Vec<Vec<u8>> {
        self.sent(device_id)
            .into_iter()
            .filter_map(|s| match s {
                Sent::Long(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    /// 是否记录收到的内容（新设备默认记录）
    pub fn set_recording(&self, device_id: u32, recording: bool) {
        self.with_device(device_id, |d| {
            d.recording = recording;
            if !recording {
                d.sent = Vec::new();
            }
        });
    }

    pub fn is_recording(&self, device_id: u32) -> bool {
        self.with_device(device_id, |d| d.recording).unwrap_or(false)
    }

    /// 清空记录
    pub fn clear(&self, device_id: u32) {
        self.with_device(device_id, |d| d.sent.clear());
    }

    /// 设备当前是否被占用
    pub fn is_claimed(&self, device_id: u32) -> bool {
        self.with_device(device_id, |d| d.claimed).unwrap_or(false)
    }

    /// 原生 close 被调用的次数
    pub fn close_count(&self, device_id: u32) -> usize {
        self.with_device(device_id, |d| d.closes).unwrap_or(0)
    }

    /// 之后的打开请求以 `reason` 失败（None 取消）
    pub fn fail_open(&self, device_id: u32, reason: Option<MmError>) {
        self.with_device(device_id, |d| d.fail_open = reason);
    }

    /// 第 `nth` 次提交（从 0 计数，从现在起算）以 `reason` 失败
    pub fn fail_submit(&self, device_id: u32, nth: usize, reason: MmError) {
        self.with_device(device_id, |d| d.fail_submit = Some((d.submits + nth, reason)));
    }

    /// 之后的 reset 以 `reason` 失败（None 取消），失败的 reset 不会归还 header
    pub fn fail_reset(&self, device_id: u32, reason: Option<MmError>) {
        self.with_device(device_id, |d| d.fail_reset = reason);
    }

    /// 提交后永不完成，直到 reset
    pub fn stall_completion(&self, device_id: u32, stall: bool) {
        self.with_device(device_id, |d| d.stall = stall);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<VirtualDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device<R>(&self, device_id: u32, f: impl FnOnce(&mut VirtualDevice) -> R) -> Option<R> {
        self.lock().get_mut(device_id as usize).map(f)
    }
}

impl MidiOutDriver for Loopback {
    type Port = LoopbackPort;

    fn device_count(&self) -> u32 {
        self.lock().len() as u32
    }

    fn device_caps(&self, device_id: u32) -> Result<DeviceCaps, MmError> {
        self.with_device(device_id, |d| d.caps.clone())
            .ok_or(MmError::BAD_DEVICE_ID)
    }

    fn open(&self, device_id: u32) -> Result<LoopbackPort, MmError> {
        self.with_device(device_id, |d| {
            if let Some(reason) = d.fail_open {
                return Err(reason);
            }
            if d.claimed {
                return Err(MmError::ALLOCATED);
            }
            d.claimed = true;
            d.pending = false;
            log::debug!("Loopback output {} ({}) opened", device_id, d.caps.name);
            Ok(())
        })
        .unwrap_or(Err(MmError::BAD_DEVICE_ID))?;

        Ok(LoopbackPort {
            loopback: self.clone(),
            device_id,
            open: true,
        })
    }
}

/// 已打开的虚拟输出
#[derive(Debug)]
pub struct LoopbackPort {
    loopback: Loopback,
    device_id: u32,
    open: bool,
}

impl LoopbackPort {
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    fn device<R>(&self, f: impl FnOnce(&mut VirtualDevice) -> R) -> Result<R, MmError> {
        if !self.open {
            return Err(MmError::INVALID_HANDLE);
        }
        self.loopback
            .with_device(self.device_id, f)
            .ok_or(MmError::INVALID_HANDLE)
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.loopback.with_device(self.device_id, |d| {
            d.claimed = false;
            d.pending = false;
            d.closes += 1;
        });
        log::debug!("Loopback output {} closed", self.device_id);
    }
}

impl MidiOutPort for LoopbackPort {
    fn short_msg(&mut self, word: u32) -> Result<(), MmError> {
        self.device(|d| {
            log::trace!("Loopback output {}: short 0x{:06X}", d.caps.id, word);
            d.record(Sent::Short(word));
        })
    }

    fn prepare(&mut self, header: &mut MidiHeader) -> Result<(), MmError> {
        self.device(|_| ())?;
        if header.data_ptr().is_null() {
            return Err(MmError::INVALID_PARAM);
        }
        header.insert_flags(MHDR_PREPARED);
        Ok(())
    }

    fn submit(&mut self, header: &mut MidiHeader) -> Result<(), MmError> {
        if !header.is_prepared() {
            return Err(MmError::MIDI_UNPREPARED);
        }
        let payload = header.payload().to_vec();
        let completed = self.device(|d| {
            let index = d.submits;
            d.submits += 1;
            if let Some((nth, reason)) = d.fail_submit {
                if nth == index {
                    d.fail_submit = None;
                    return Err(reason);
                }
            }
            log::trace!("Loopback output {}: long chunk of {} bytes", d.caps.id, payload.len());
            d.record(Sent::Long(payload));
            d.pending = d.stall;
            Ok(!d.stall)
        })??;

        if completed {
            header.insert_flags(MHDR_DONE);
        } else {
            header.insert_flags(MHDR_INQUEUE);
        }
        Ok(())
    }

    fn unprepare(&mut self, header: &mut MidiHeader) -> Result<(), MmError> {
        if self.device(|d| d.pending)? {
            return Err(MmError::MIDI_STILL_PLAYING);
        }
        header.remove_flags(MHDR_PREPARED | MHDR_INQUEUE);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), MmError> {
        self.device(|d| {
            if let Some(reason) = d.fail_reset {
                return Err(reason);
            }
            d.pending = false;
            d.record(Sent::Reset);
            Ok(())
        })?
    }

    fn close(mut self) -> Result<(), MmError> {
        if !self.open {
            return Err(MmError::INVALID_HANDLE);
        }
        self.release();
        Ok(())
    }
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        self.release();
    }
}
