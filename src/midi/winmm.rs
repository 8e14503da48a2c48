//! WinMM MIDI 输出后端
//!
//! 直接调用 winmm.dll 的 `midiOut*` 系列函数：
//! - 设备枚举：midiOutGetNumDevs / midiOutGetDevCapsW
//! - 连接：midiOutOpen (CALLBACK_NULL) / midiOutReset / midiOutClose
//! - 短消息：midiOutShortMsg
//! - 长消息：midiOutPrepareHeader / midiOutLongMsg / midiOutUnprepareHeader

use std::ffi::c_void;
use std::ptr;

use super::buffer::MidiHeader;
use super::device::{DeviceCaps, Technology};
use super::driver::{MidiOutDriver, MidiOutPort, MmError};

type HMidiOut = *mut c_void;
type MmResult = u32;

const CALLBACK_NULL: u32 = 0x0000_0000;
const MAXPNAMELEN: usize = 32;

/// Win32 MIDIOUTCAPSW
#[repr(C)]
#[derive(Clone, Copy)]
struct MidiOutCapsW {
    mid: u16,
    pid: u16,
    driver_version: u32,
    pname: [u16; MAXPNAMELEN],
    technology: u16,
    voices: u16,
    notes: u16,
    channel_mask: u16,
    support: u32,
}

impl MidiOutCapsW {
    fn name(&self) -> String {
        let len = self.pname.iter().position(|&c| c == 0).unwrap_or(MAXPNAMELEN);
        String::from_utf16_lossy(&self.pname[..len])
    }
}

#[link(name = "winmm")]
extern "system" {
    fn midiOutGetNumDevs() -> u32;

    fn midiOutGetDevCapsW(device_id: usize, caps: *mut MidiOutCapsW, caps_size: u32) -> MmResult;

    fn midiOutOpen(
        handle: *mut HMidiOut,
        device_id: u32,
        callback: usize,
        instance: usize,
        flags: u32,
    ) -> MmResult;

    fn midiOutClose(handle: HMidiOut) -> MmResult;

    fn midiOutReset(handle: HMidiOut) -> MmResult;

    fn midiOutShortMsg(handle: HMidiOut, message: u32) -> MmResult;

    fn midiOutPrepareHeader(handle: HMidiOut, header: *mut MidiHeader, header_size: u32) -> MmResult;

    fn midiOutUnprepareHeader(handle: HMidiOut, header: *mut MidiHeader, header_size: u32) -> MmResult;

    fn midiOutLongMsg(handle: HMidiOut, header: *mut MidiHeader, header_size: u32) -> MmResult;
}

/// WinMM 驱动
#[derive(Debug, Clone, Copy, Default)]
pub struct WinMm;

impl MidiOutDriver for WinMm {
    type Port = WinMmPort;

    fn device_count(&self) -> u32 {
        unsafe { midiOutGetNumDevs() }
    }

    fn device_caps(&self, device_id: u32) -> Result<DeviceCaps, MmError> {
        let mut caps = std::mem::MaybeUninit::<MidiOutCapsW>::zeroed();
        let status = unsafe {
            midiOutGetDevCapsW(
                device_id as usize,
                caps.as_mut_ptr(),
                std::mem::size_of::<MidiOutCapsW>() as u32,
            )
        };
        MmError::check(status)?;

        // midiOutGetDevCapsW 成功时已写满结构体，且全零本身也是合法值
        let caps = unsafe { caps.assume_init() };
        Ok(DeviceCaps {
            id: device_id,
            name: caps.name(),
            manufacturer_id: caps.mid,
            product_id: caps.pid,
            driver_version: caps.driver_version,
            technology: Technology::from_raw(caps.technology),
            voices: caps.voices,
            notes: caps.notes,
            channel_mask: caps.channel_mask,
            support: caps.support,
        })
    }

    fn open(&self, device_id: u32) -> Result<WinMmPort, MmError> {
        let mut handle: HMidiOut = ptr::null_mut();
        let status = unsafe { midiOutOpen(&mut handle, device_id, 0, 0, CALLBACK_NULL) };
        MmError::check(status)?;

        if handle.is_null() {
            return Err(MmError::INVALID_HANDLE);
        }

        Ok(WinMmPort { handle, device_id })
    }
}

/// 已打开的 HMIDIOUT
#[derive(Debug)]
pub struct WinMmPort {
    handle: HMidiOut,
    device_id: u32,
}

// HMIDIOUT 可以在任意线程使用，端口由单一所有者持有
unsafe impl Send for WinMmPort {}

impl WinMmPort {
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    fn close_handle(&mut self) -> Result<(), MmError> {
        let handle = std::mem::replace(&mut self.handle, ptr::null_mut());
        if handle.is_null() {
            return Ok(());
        }
        MmError::check(unsafe { midiOutClose(handle) })
    }
}

impl MidiOutPort for WinMmPort {
    fn short_msg(&mut self, word: u32) -> Result<(), MmError> {
        MmError::check(unsafe { midiOutShortMsg(self.handle, word) })
    }

    fn prepare(&mut self, header: &mut MidiHeader) -> Result<(), MmError> {
        MmError::check(unsafe { midiOutPrepareHeader(self.handle, header, MidiHeader::SIZE) })
    }

    fn submit(&mut self, header: &mut MidiHeader) -> Result<(), MmError> {
        MmError::check(unsafe { midiOutLongMsg(self.handle, header, MidiHeader::SIZE) })
    }

    fn unprepare(&mut self, header: &mut MidiHeader) -> Result<(), MmError> {
        MmError::check(unsafe { midiOutUnprepareHeader(self.handle, header, MidiHeader::SIZE) })
    }

    fn reset(&mut self) -> Result<(), MmError> {
        MmError::check(unsafe { midiOutReset(self.handle) })
    }

    fn close(mut self) -> Result<(), MmError> {
        self.close_handle()
    }
}

impl Drop for WinMmPort {
    fn drop(&mut self) {
        if let Err(e) = self.close_handle() {
            log::warn!("Failed to close MIDI output {}: {}", self.device_id, e);
        }
    }
}
