// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Narrow interfaces to the collaborators the driver does not own.
//!
//! - [`AddressTranslator`]: virtual to physical mapping of DMA memory.
//! - [`DmaMemory`]: aligned, DMA-capable allocations.
//! - [`JobRingRegisters`]: raw access to one job ring's register page.
//! - [`InterruptControl`]: the kernel-side interrupt enable/disable request.
//! - [`Clock`]: time source for the bounded reset wait.

use crate::error::SecResult;
use bitflags::bitflags;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Physical (bus) address as seen by the accelerator.
pub type PhysAddr = u64;

/// Virtual to physical translation for DMA-visible memory.
pub trait AddressTranslator: Send + Sync {
    /// Physical address of `addr`, or `None` if it is not DMA-visible.
    fn virt_to_phys(&self, addr: *const u8) -> Option<PhysAddr>;

    /// Virtual address of `phys`, or `None` if it is outside known memory.
    fn phys_to_virt(&self, phys: PhysAddr) -> Option<*mut u8>;
}

/// Translator for platforms where the accelerator uses virtual addresses
/// directly (IOMMU with shared virtual addressing, or software models).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTranslator;

impl AddressTranslator for IdentityTranslator {
    #[inline]
    fn virt_to_phys(&self, addr: *const u8) -> Option<PhysAddr> {
        if addr.is_null() {
            None
        } else {
            Some(addr as PhysAddr)
        }
    }

    #[inline]
    fn phys_to_virt(&self, phys: PhysAddr) -> Option<*mut u8> {
        if phys == 0 {
            None
        } else {
            Some(phys as *mut u8)
        }
    }
}

/// Allocator of DMA-visible memory.
///
/// Ring memory, descriptors, scratch areas, scatter-gather tables and
/// protocol data blobs are all taken from here at driver initialization.
pub trait DmaMemory: AddressTranslator {
    /// Allocate `layout`, or `None` when the memory is exhausted.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return memory obtained from [`DmaMemory::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on the same allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// DMA memory backed by the global allocator with identity translation.
///
/// Suitable for accelerators behind an IOMMU with shared virtual
/// addressing, and for the software accelerator model.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapMemory;

impl AddressTranslator for HeapMemory {
    fn virt_to_phys(&self, addr: *const u8) -> Option<PhysAddr> {
        IdentityTranslator.virt_to_phys(addr)
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> Option<*mut u8> {
        IdentityTranslator.phys_to_virt(phys)
    }
}

impl DmaMemory for HeapMemory {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: layout has a non-zero size.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Physically contiguous DMA region with a linear mapping.
///
/// Allocation is a bump pointer; freed memory is not reused. The driver
/// allocates everything once at initialization, so a region sized for one
/// driver instance is consumed exactly once.
#[derive(Debug)]
pub struct DmaRegion {
    virt_base: usize,
    phys_base: PhysAddr,
    len: usize,
    next: AtomicUsize,
}

impl DmaRegion {
    /// Describe a region of `len` bytes mapped at `virt_base`, starting at
    /// bus address `phys_base`.
    ///
    /// # Safety
    ///
    /// `virt_base .. virt_base + len` must be mapped, writable, owned by the
    /// region for its whole lifetime, and visible to the accelerator at
    /// `phys_base` onwards.
    pub const unsafe fn new(virt_base: usize, phys_base: PhysAddr, len: usize) -> Self {
        Self {
            virt_base,
            phys_base,
            len,
            next: AtomicUsize::new(0),
        }
    }

    /// Region length in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }
}

impl AddressTranslator for DmaRegion {
    fn virt_to_phys(&self, addr: *const u8) -> Option<PhysAddr> {
        let offset = (addr as usize).checked_sub(self.virt_base)?;
        (offset < self.len).then(|| self.phys_base + offset as PhysAddr)
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> Option<*mut u8> {
        let offset = phys.checked_sub(self.phys_base)? as usize;
        (offset < self.len).then(|| (self.virt_base + offset) as *mut u8)
    }
}

impl DmaMemory for DmaRegion {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let start = (self.virt_base + current).checked_next_multiple_of(layout.align())?;
            let end = start.checked_add(layout.size())? - self.virt_base;
            if end > self.len {
                return None;
            }
            match self.next.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let ptr = start as *mut u8;
                    // SAFETY: [start, start + size) lies inside the region
                    // and was handed out to nobody else.
                    unsafe { std::ptr::write_bytes(ptr, 0, layout.size()) };
                    return NonNull::new(ptr);
                }
                Err(seen) => current = seen,
            }
        }
    }

    unsafe fn free(&self, _ptr: NonNull<u8>, _layout: Layout) {}
}

/// Job ring registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Input ring base address, upper 32 bits.
    InputRingBaseHi,
    /// Input ring base address, lower 32 bits.
    InputRingBaseLo,
    /// Input ring size in entries.
    InputRingSize,
    /// Free input ring slots as seen by the hardware.
    InputSlotsAvailable,
    /// Write: number of descriptors added to the input ring.
    InputJobsAdded,
    /// Output ring base address, upper 32 bits.
    OutputRingBaseHi,
    /// Output ring base address, lower 32 bits.
    OutputRingBaseLo,
    /// Output ring size in entries.
    OutputRingSize,
    /// Write: number of output entries consumed by software.
    OutputJobsRemoved,
    /// Completed entries waiting in the output ring.
    OutputSlotsFull,
    /// Ring status.
    Status,
    /// Interrupt status, see [`RingInterrupt`].
    InterruptStatus,
    /// Interrupt coalescing configuration.
    InterruptConfig,
    /// Ring command, see [`RING_CMD_RESET`].
    Command,
}

impl Register {
    /// Byte offset of the register in the job ring register page.
    pub const fn offset(self) -> usize {
        match self {
            Self::InputRingBaseHi => 0x00,
            Self::InputRingBaseLo => 0x04,
            Self::InputRingSize => 0x0C,
            Self::InputSlotsAvailable => 0x14,
            Self::InputJobsAdded => 0x1C,
            Self::OutputRingBaseHi => 0x20,
            Self::OutputRingBaseLo => 0x24,
            Self::OutputRingSize => 0x2C,
            Self::OutputJobsRemoved => 0x34,
            Self::OutputSlotsFull => 0x3C,
            Self::Status => 0x44,
            Self::InterruptStatus => 0x4C,
            Self::InterruptConfig => 0x54,
            Self::Command => 0x6C,
        }
    }
}

/// Size of the job ring register page.
pub const REGISTER_PAGE_SIZE: usize = 0x1000;

/// Command register: reset request.
pub const RING_CMD_RESET: u32 = 1 << 0;

bitflags! {
    /// Interrupt status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RingInterrupt: u32 {
        /// Completions are pending.
        const PENDING = 1 << 0;
        /// A ring-level error was detected, see [`ring_error_type`].
        const ERROR = 1 << 1;
        /// Ring halt in progress.
        const HALT_IN_PROGRESS = 1 << 2;
        /// Ring halted; the second reset phase may start.
        const HALT_COMPLETE = 1 << 3;
    }
}

/// Ring error type: controller-level failure.
pub const RING_ERR_FATAL: u8 = 0xF;

/// Error type field (bits [11:8]) of the interrupt status register.
#[inline]
pub const fn ring_error_type(status: u32) -> u8 {
    ((status >> 8) & 0xF) as u8
}

/// Encode an interrupt status value carrying a ring error.
#[inline]
pub const fn ring_error_status(error_type: u8) -> u32 {
    RingInterrupt::ERROR.bits() | (((error_type & 0xF) as u32) << 8)
}

/// Interrupt configuration: coalescing enable bit.
pub const IRQ_COALESCING_ENABLE: u32 = 1 << 0;

/// Raw access to a job ring's register page.
///
/// Implementations perform volatile 32-bit accesses.
pub trait JobRingRegisters: Send {
    /// Read a register.
    fn read(&self, reg: Register) -> u32;

    /// Write a register.
    fn write(&self, reg: Register, value: u32);

    /// Program a 64-bit base address into a hi/lo register pair.
    fn write_base(&self, hi: Register, lo: Register, addr: PhysAddr) {
        self.write(hi, (addr >> 32) as u32);
        self.write(lo, addr as u32);
    }
}

/// Interrupt enable/disable requests toward the kernel-side counterpart.
pub trait InterruptControl: Send {
    /// Re-arm the ring interrupt.
    fn enable(&self) -> SecResult<()>;

    /// Mask the ring interrupt.
    fn disable(&self) -> SecResult<()>;

    /// File descriptor that becomes readable on interrupt, if any.
    fn event_fd(&self) -> Option<i32> {
        None
    }
}

/// Interrupt control for rings driven purely by polling.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterrupts;

impl InterruptControl for NoInterrupts {
    fn enable(&self) -> SecResult<()> {
        Ok(())
    }

    fn disable(&self) -> SecResult<()> {
        Ok(())
    }
}

/// Time source for bounded hardware waits.
pub trait Clock: Send + Sync {
    /// Monotonic time in microseconds.
    fn now_micros(&self) -> u64;

    /// Called between two polls of a hardware register.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock starting now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}
