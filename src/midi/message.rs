//! 通道消息编码
//!
//! 纯函数：把音乐事件参数映射为 (status, data1, data2)。
//! 不做语义校验，通道号只取低 4 位。

/// Note Off
pub const NOTE_OFF: u8 = 0x80;
/// Note On
pub const NOTE_ON: u8 = 0x90;
/// Polyphonic Key Pressure
pub const POLY_PRESSURE: u8 = 0xA0;
/// Control Change
pub const CONTROL_CHANGE: u8 = 0xB0;
/// Program Change
pub const PROGRAM_CHANGE: u8 = 0xC0;
/// Channel Pressure
pub const CHANNEL_PRESSURE: u8 = 0xD0;
/// Pitch Bend
pub const PITCH_BEND: u8 = 0xE0;

/// 打包短消息：status 在最低字节，其后 data1、data2
#[inline]
pub fn pack_short(status: u8, data1: u8, data2: u8) -> u32 {
    u32::from(status) | (u32::from(data1) << 8) | (u32::from(data2) << 16)
}

/// 1~3 字节的短消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortMessage {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl ShortMessage {
    pub const fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self { status, data1, data2 }
    }

    #[inline]
    fn channel_voice(kind: u8, channel: u8, data1: u8, data2: u8) -> Self {
        Self::new(kind | (channel & 0x0F), data1, data2)
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_voice(NOTE_OFF, channel, note, velocity)
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_voice(NOTE_ON, channel, note, velocity)
    }

    pub fn poly_pressure(channel: u8, note: u8, pressure: u8) -> Self {
        Self::channel_voice(POLY_PRESSURE, channel, note, pressure)
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::channel_voice(CONTROL_CHANGE, channel, controller, value)
    }

    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::channel_voice(PROGRAM_CHANGE, channel, program, 0)
    }

    pub fn channel_pressure(channel: u8, pressure: u8) -> Self {
        Self::channel_voice(CHANNEL_PRESSURE, channel, pressure, 0)
    }

    /// Pitch Bend，`pitch` 范围 -8192..=8191，超出部分按 14 位回绕
    pub fn pitch_bend(channel: u8, pitch: i16) -> Self {
        let value = ((i32::from(pitch) + 8192) & 0x3FFF) as u16;
        Self::channel_voice(PITCH_BEND, channel, (value & 0x7F) as u8, (value >> 7) as u8)
    }

    /// 打包为 midiOutShortMsg 使用的字
    #[inline]
    pub fn pack(&self) -> u32 {
        pack_short(self.status, self.data1, self.data2)
    }

    /// 低 4 位通道号（仅对通道消息有意义）
    #[inline]
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [self.status, self.data1, self.data2]
    }
}

impl From<ShortMessage> for u32 {
    fn from(message: ShortMessage) -> Self {
        message.pack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_byte_order() {
        assert_eq!(pack_short(0x90, 60, 100), 0x0064_3C90);
        assert_eq!(pack_short(0xF8, 0, 0), 0x0000_00F8);
        assert_eq!(pack_short(0xFF, 0xFF, 0xFF), 0x00FF_FFFF);
    }

    #[test]
    fn test_channel_messages() {
        assert_eq!(ShortMessage::note_on(0, 60, 100).pack(), 0x0064_3C90);
        assert_eq!(ShortMessage::note_off(9, 37, 0).to_bytes(), [0x89, 37, 0]);
        assert_eq!(ShortMessage::poly_pressure(1, 64, 20).status, 0xA1);
        assert_eq!(ShortMessage::control_change(15, 7, 127).to_bytes(), [0xBF, 7, 127]);
        assert_eq!(ShortMessage::program_change(2, 5).to_bytes(), [0xC2, 5, 0]);
        assert_eq!(ShortMessage::channel_pressure(3, 90).to_bytes(), [0xD3, 90, 0]);
    }

    #[test]
    fn test_channel_is_masked() {
        let message = ShortMessage::note_on(0x1F, 60, 1);
        assert_eq!(message.status, 0x9F);
        assert_eq!(message.channel(), 15);
    }

    #[test]
    fn test_pitch_bend() {
        // 中心
        assert_eq!(ShortMessage::pitch_bend(0, 0).to_bytes(), [0xE0, 0x00, 0x40]);
        // 最小 / 最大
        assert_eq!(ShortMessage::pitch_bend(0, -8192).to_bytes(), [0xE0, 0x00, 0x00]);
        assert_eq!(ShortMessage::pitch_bend(0, 8191).to_bytes(), [0xE0, 0x7F, 0x7F]);
        // 超出范围按 14 位回绕
        assert_eq!(ShortMessage::pitch_bend(0, 8192).to_bytes(), [0xE0, 0x00, 0x00]);
        assert_eq!(ShortMessage::pitch_bend(0, i16::MIN).to_bytes(), [0xE0, 0x00, 0x40]);
    }
}
