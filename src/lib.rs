//! midi-pulse
//!
//! MIDI 输出设备访问与多媒体定时服务：
//! - `midi`: 设备枚举、短消息、分块长消息传输
//! - `time`: 单次/周期定时器、全局时钟分辨率、毫秒计数

pub mod midi;
pub mod time;
