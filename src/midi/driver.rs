//! 原生 MIDI 输出 API 抽象
//!
//! 以 WinMM `midiOut*` 的调用形状为准：
//! - `MidiOutDriver`: 设备枚举 + 打开端口
//! - `MidiOutPort`: 已打开的输出连接（短消息、prepare/submit/unprepare、reset、close）
//!
//! Windows 上由 `winmm::WinMm` 实现，其他平台以及测试使用 `loopback::Loopback`。

use std::fmt;

use super::buffer::MidiHeader;
use super::device::DeviceCaps;

/// 原生 API 返回码（MMRESULT）
///
/// 0 表示成功，因此这里只保存非零的错误码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MmError(pub u32);

impl MmError {
    pub const ERROR: Self = Self(1);
    pub const BAD_DEVICE_ID: Self = Self(2);
    pub const NOT_ENABLED: Self = Self(3);
    pub const ALLOCATED: Self = Self(4);
    pub const INVALID_HANDLE: Self = Self(5);
    pub const NO_DRIVER: Self = Self(6);
    pub const NO_MEM: Self = Self(7);
    pub const NOT_SUPPORTED: Self = Self(8);
    pub const INVALID_FLAG: Self = Self(10);
    pub const INVALID_PARAM: Self = Self(11);
    pub const HANDLE_BUSY: Self = Self(12);

    pub const MIDI_UNPREPARED: Self = Self(64);
    pub const MIDI_STILL_PLAYING: Self = Self(65);
    pub const MIDI_NO_MAP: Self = Self(66);
    pub const MIDI_NOT_READY: Self = Self(67);
    pub const MIDI_NO_DEVICE: Self = Self(68);
    pub const MIDI_INVALID_SETUP: Self = Self(69);
    pub const MIDI_BAD_OPEN_MODE: Self = Self(70);
    pub const MIDI_DONT_CONTINUE: Self = Self(71);

    pub const TIME_NO_CAN_DO: Self = Self(97);
    pub const TIME_STRUCT: Self = Self(129);

    /// 把原生返回码转换为 Result
    #[inline]
    pub fn check(code: u32) -> Result<(), MmError> {
        if code == 0 {
            Ok(())
        } else {
            Err(Self(code))
        }
    }

    pub fn code(self) -> u32 {
        self.0
    }

    /// 返回码的符号名（与 mmsystem.h 一致）
    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "MMSYSERR_ERROR",
            2 => "MMSYSERR_BADDEVICEID",
            3 => "MMSYSERR_NOTENABLED",
            4 => "MMSYSERR_ALLOCATED",
            5 => "MMSYSERR_INVALHANDLE",
            6 => "MMSYSERR_NODRIVER",
            7 => "MMSYSERR_NOMEM",
            8 => "MMSYSERR_NOTSUPPORTED",
            9 => "MMSYSERR_BADERRNUM",
            10 => "MMSYSERR_INVALFLAG",
            11 => "MMSYSERR_INVALPARAM",
            12 => "MMSYSERR_HANDLEBUSY",
            13 => "MMSYSERR_INVALIDALIAS",
            14 => "MMSYSERR_BADDB",
            15 => "MMSYSERR_KEYNOTFOUND",
            16 => "MMSYSERR_READERROR",
            17 => "MMSYSERR_WRITEERROR",
            18 => "MMSYSERR_DELETEERROR",
            19 => "MMSYSERR_VALNOTFOUND",
            20 => "MMSYSERR_NODRIVERCB",
            21 => "MMSYSERR_MOREDATA",
            64 => "MIDIERR_UNPREPARED",
            65 => "MIDIERR_STILLPLAYING",
            66 => "MIDIERR_NOMAP",
            67 => "MIDIERR_NOTREADY",
            68 => "MIDIERR_NODEVICE",
            69 => "MIDIERR_INVALIDSETUP",
            70 => "MIDIERR_BADOPENMODE",
            71 => "MIDIERR_DONT_CONTINUE",
            97 => "TIMERR_NOCANDO",
            129 => "TIMERR_STRUCT",
            _ => "MMSYSERR_UNKNOWN",
        }
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl std::error::Error for MmError {}

/// MIDI 输出驱动：设备枚举 + 打开
pub trait MidiOutDriver {
    type Port: MidiOutPort;

    /// 当前可枚举的输出设备数
    fn device_count(&self) -> u32;

    /// 查询设备信息
    fn device_caps(&self, device_id: u32) -> Result<DeviceCaps, MmError>;

    /// 独占打开设备
    fn open(&self, device_id: u32) -> Result<Self::Port, MmError>;
}

/// 已打开的输出连接
///
/// 端口只由一个 `OutputController` 独占持有，所有方法都取 `&mut self`。
/// 长消息协议：调用方先通过 `TransferBuffer::load` 填好 header，
/// 然后依次 `prepare` → `submit` → 等待 `MHDR_DONE` → `unprepare`。
pub trait MidiOutPort: Send {
    /// 发送打包好的短消息（status | data1 << 8 | data2 << 16）
    fn short_msg(&mut self, word: u32) -> Result<(), MmError>;

    /// 向设备登记 header（置 `MHDR_PREPARED`）
    fn prepare(&mut self, header: &mut MidiHeader) -> Result<(), MmError>;

    /// 提交传输；完成时设备在 header 上置 `MHDR_DONE`
    fn submit(&mut self, header: &mut MidiHeader) -> Result<(), MmError>;

    /// 注销 header（清 `MHDR_PREPARED`）
    fn unprepare(&mut self, header: &mut MidiHeader) -> Result<(), MmError>;

    /// 关闭所有发声并归还所有未完成的 header
    fn reset(&mut self) -> Result<(), MmError>;

    /// 关闭连接，消耗端口，因此原生 close 只会执行一次
    fn close(self) -> Result<(), MmError>
    where
        Self: Sized;
}
