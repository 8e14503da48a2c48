//! MIDI 输出设备信息
//!
//! 设备枚举本身由驱动提供，这里只负责整理成 `DeviceCaps` 以及按名称查找。

use super::controller::MidiError;
use super::driver::MidiOutDriver;

/// 设备技术类型（MIDIOUTCAPS.wTechnology）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technology {
    /// MOD_MIDIPORT: 硬件 MIDI 端口
    Port,
    /// MOD_SYNTH
    Synth,
    /// MOD_SQSYNTH
    SquareWaveSynth,
    /// MOD_FMSYNTH
    FmSynth,
    /// MOD_MAPPER: MIDI Mapper
    Mapper,
    /// MOD_WAVETABLE
    Wavetable,
    /// MOD_SWSYNTH
    SoftwareSynth,
    Unknown(u16),
}

impl Technology {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Port,
            2 => Self::Synth,
            3 => Self::SquareWaveSynth,
            4 => Self::FmSynth,
            5 => Self::Mapper,
            6 => Self::Wavetable,
            7 => Self::SoftwareSynth,
            other => Self::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Port => "port",
            Self::Synth => "synth",
            Self::SquareWaveSynth => "square-wave synth",
            Self::FmSynth => "FM synth",
            Self::Mapper => "mapper",
            Self::Wavetable => "wavetable",
            Self::SoftwareSynth => "software synth",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// MIDI 输出设备信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub id: u32,
    pub name: String,
    pub manufacturer_id: u16,
    pub product_id: u16,
    pub driver_version: u32,
    pub technology: Technology,
    /// 内部合成器的复音数（端口为 0）
    pub voices: u16,
    /// 最大同时发音数（端口为 0）
    pub notes: u16,
    /// 响应的通道位图（端口为 0xFFFF）
    pub channel_mask: u16,
    pub support: u32,
}

impl DeviceCaps {
    /// 以 MIDI 端口身份描述一个设备
    pub fn port(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            manufacturer_id: 0,
            product_id: 0,
            driver_version: 0,
            technology: Technology::Port,
            voices: 0,
            notes: 0,
            channel_mask: 0xFFFF,
            support: 0,
        }
    }

    /// 驱动版本（主版本, 次版本）
    pub fn driver_version_parts(&self) -> (u8, u8) {
        ((self.driver_version >> 8) as u8, self.driver_version as u8)
    }
}

/// 获取所有输出设备
pub fn list<D: MidiOutDriver>(driver: &D) -> Result<Vec<DeviceCaps>, MidiError> {
    (0..driver.device_count())
        .map(|device_id| {
            driver
                .device_caps(device_id)
                .map_err(|reason| MidiError::DeviceCaps { device_id, reason })
        })
        .collect()
}

/// 按名称查找设备（线性扫描，第一个完全匹配者胜出）
///
/// 查询失败的设备会被跳过。
pub fn find_by_name<D: MidiOutDriver>(driver: &D, name: &str) -> Option<u32> {
    let count = driver.device_count();
    for device_id in 0..count {
        match driver.device_caps(device_id) {
            Ok(caps) if caps.name == name => return Some(device_id),
            Ok(_) => {}
            Err(e) => {
                log::warn!("Skipping MIDI output {} while searching by name: {}", device_id, e);
            }
        }
    }
    None
}
