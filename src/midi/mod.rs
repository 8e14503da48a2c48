//! MIDI 输出模块
//!
//! 包含：
//! - Driver: 原生输出 API 抽象（设备枚举 + 端口）
//! - Buffer: 长消息传输缓冲区与 MIDIHDR
//! - Controller: 短消息/长消息发送、分块与完成同步
//! - Device: 设备信息
//! - Message: 通道消息编码
//! - Loopback: 进程内虚拟输出设备
//! - WinMM: Windows 原生后端

pub mod buffer;
pub mod controller;
pub mod device;
pub mod driver;
pub mod loopback;
pub mod message;
#[cfg(windows)]
pub mod winmm;

pub use buffer::{MidiHeader, TransferBuffer};
pub use controller::{
    ControllerConfig, MidiError, OutputController, TransferStage, MAX_BYTES_PER_SENDING,
};
pub use device::{DeviceCaps, Technology};
pub use driver::{MidiOutDriver, MidiOutPort, MmError};
pub use loopback::{Loopback, LoopbackPort, Sent};
pub use message::ShortMessage;

/// 当前平台的系统驱动
#[cfg(windows)]
pub type SystemDriver = winmm::WinMm;
#[cfg(not(windows))]
pub type SystemDriver = loopback::Loopback;

/// 系统驱动打开的端口类型
pub type SystemPort = <SystemDriver as MidiOutDriver>::Port;

/// 获取系统驱动
#[cfg(windows)]
pub fn system_driver() -> SystemDriver {
    winmm::WinMm
}

/// 获取系统驱动（非 Windows 平台为共享的虚拟设备）
#[cfg(not(windows))]
pub fn system_driver() -> SystemDriver {
    loopback::Loopback::shared()
}
