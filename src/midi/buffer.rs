//! 长消息传输缓冲区
//!
//! 设计目标：
//! - 单一所有者：缓冲区和 header 都由一个 `OutputController` 独占
//! - 零重分配：容量在打开时确定，之后每次长消息发送都复用同一块内存
//! - 无悬垂指针：header 的数据指针只在装载分块时重新绑定到当前缓冲区地址
//!
//! `MidiHeader` 与 Win32 `MIDIHDR` 内存布局一致（Pack = 4），可以直接交给 winmm。

use std::cell::UnsafeCell;
use std::collections::TryReserveError;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

/// 传输已完成（由设备置位）
pub const MHDR_DONE: u32 = 0x0000_0001;
/// header 已登记
pub const MHDR_PREPARED: u32 = 0x0000_0002;
/// 已提交，设备正在处理
pub const MHDR_INQUEUE: u32 = 0x0000_0004;
/// 流式缓冲区（本模块不使用）
pub const MHDR_ISSTRM: u32 = 0x0000_0008;

/// Win32 MIDIHDR
///
/// `flags` 由设备驱动线程异步写入，只通过 `AtomicU32` 视图访问。
/// packed 结构体不能直接包含 `AtomicU32`（带 align 属性），所以存为 `UnsafeCell<u32>`。
/// 其余字段只在没有传输进行时由本线程修改。
#[repr(C, packed(4))]
pub struct MidiHeader {
    data: *mut u8,
    buffer_length: u32,
    bytes_recorded: u32,
    user: usize,
    flags: UnsafeCell<u32>,
    next: *mut MidiHeader,
    reserved: usize,
    offset: u32,
    driver_reserved: [usize; 8],
}

// header 只通过 TransferBuffer 创建，数据指针总是指向同一所有者的缓冲区
unsafe impl Send for MidiHeader {}

impl MidiHeader {
    /// 结构体大小（cbMidiOutHdr 参数）
    pub const SIZE: u32 = std::mem::size_of::<MidiHeader>() as u32;

    fn unbound() -> Self {
        Self {
            data: ptr::null_mut(),
            buffer_length: 0,
            bytes_recorded: 0,
            user: 0,
            flags: UnsafeCell::new(0),
            next: ptr::null_mut(),
            reserved: 0,
            offset: 0,
            driver_reserved: [0; 8],
        }
    }

    #[inline]
    fn atomic_flags(&self) -> &AtomicU32 {
        // flags 位于 4 字节对齐的偏移处（packed(4)），满足 AtomicU32 的对齐要求；
        // 与驱动线程的并发访问全部经过这个原子视图
        unsafe { AtomicU32::from_ptr(self.flags.get()) }
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.atomic_flags().load(Ordering::Acquire)
    }

    /// 置位（设备侧使用）
    #[inline]
    pub fn insert_flags(&self, flags: u32) {
        self.atomic_flags().fetch_or(flags, Ordering::AcqRel);
    }

    /// 清位（设备侧使用）
    #[inline]
    pub fn remove_flags(&self, flags: u32) {
        self.atomic_flags().fetch_and(!flags, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.flags() & MHDR_DONE != 0
    }

    #[inline]
    pub fn is_prepared(&self) -> bool {
        self.flags() & MHDR_PREPARED != 0
    }

    #[inline]
    pub fn is_in_queue(&self) -> bool {
        self.flags() & MHDR_INQUEUE != 0
    }

    /// 仍登记在驱动中（已 prepare 或仍在队列里），此时不能改写或释放缓冲区
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.flags() & (MHDR_PREPARED | MHDR_INQUEUE) != 0
    }

    /// 本次传输的字节数
    #[inline]
    pub fn buffer_length(&self) -> u32 {
        self.buffer_length
    }

    /// 原生数据指针（交给 winmm 的 lpData）
    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        self.data
    }

    /// 当前装载的分块内容
    pub fn payload(&self) -> &[u8] {
        let data = self.data;
        if data.is_null() {
            return &[];
        }
        // data 由 TransferBuffer::load 绑定，指向至少 buffer_length 字节的有效内存，
        // 且该内存与 header 同属一个所有者，在 &self 期间不会被修改或释放
        unsafe { std::slice::from_raw_parts(data, self.buffer_length as usize) }
    }
}

/// 固定容量的传输缓冲区 + header
pub struct TransferBuffer {
    header: Box<MidiHeader>,
    data: Box<[u8]>,
}

impl TransferBuffer {
    /// 分配指定容量的缓冲区
    ///
    /// 分配失败返回错误而不是中止进程，调用方据此释放已获取的设备。
    pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;
        data.resize(capacity, 0u8);

        Ok(Self {
            header: Box::new(MidiHeader::unbound()),
            data: data.into_boxed_slice(),
        })
    }

    /// 获取容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// 装载一个分块并返回已绑定的 header
    ///
    /// 复制数据、重新绑定数据指针、写入长度并清空 DONE/PREPARED 标志。
    /// 只能在没有传输进行时调用（由 `&mut self` 保证）。
    pub fn load(&mut self, chunk: &[u8]) -> &mut MidiHeader {
        assert!(
            chunk.len() <= self.data.len(),
            "chunk of {} bytes exceeds transfer buffer capacity {}",
            chunk.len(),
            self.data.len()
        );

        self.data[..chunk.len()].copy_from_slice(chunk);

        let header = &mut *self.header;
        header.data = self.data.as_mut_ptr();
        header.buffer_length = chunk.len() as u32;
        header.bytes_recorded = 0;
        header.atomic_flags().store(0, Ordering::Release);
        header
    }

    #[inline]
    pub fn header(&self) -> &MidiHeader {
        &self.header
    }

    #[inline]
    pub fn header_mut(&mut self) -> &mut MidiHeader {
        &mut self.header
    }
}

impl Drop for TransferBuffer {
    fn drop(&mut self) {
        if self.header.is_prepared() {
            log::warn!("Transfer buffer released while its header is still prepared");
        }
    }
}
