// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Hardware job descriptor, ring entry and scatter-gather structures.
//!
//! Everything in this module is read or written by the accelerator through
//! DMA, so layouts are `repr(C)` and sizes are checked at compile time.

use bitflags::bitflags;

bitflags! {
    /// Job descriptor header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u32 {
        /// Input pointer refers to a scatter-gather table.
        const IN_SG = 1 << 0;
        /// Output pointer refers to a scatter-gather table.
        const OUT_SG = 1 << 1;
        /// Wait for the previous descriptor of this ring to finish.
        const FENCE = 1 << 2;
        /// Descriptor runs the cipher algorithm.
        const CIPHER = 1 << 3;
        /// Descriptor runs the integrity algorithm.
        const INTEGRITY = 1 << 4;
        /// MAC IV is the first entry of the input table.
        const MAC_IV_PREPENDED = 1 << 5;
        /// COUNT uses the per-packet HFN override.
        const HFN_OVERRIDE = 1 << 6;
        /// Write the computed MAC-I after the output data.
        const APPEND_MAC = 1 << 7;
        /// Compare the computed MAC-I with the trailing input bytes.
        const VERIFY_MAC = 1 << 8;
        /// Descriptor is the first half of a two-pass packet.
        const FIRST_PASS = 1 << 9;
    }
}

/// Length of the MAC-I appended by integrity protection.
pub const MAC_I_LEN: u32 = 4;

/// 128-byte job descriptor.
///
/// The accelerator fetches it through the physical address placed in the
/// input ring. It must be 64-byte aligned.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct JobDescriptor {
    /// [`DescriptorFlags`] bits.
    pub header: u32,

    /// Protocol operation word, see [`crate::opcode::op_word`].
    pub op: u32,

    /// Physical address of the context's protocol data blob.
    pub pdb_addr: u64,

    /// Input data or input SG table address.
    pub in_addr: u64,

    /// Input length in bytes.
    pub in_len: u32,

    /// Output length in bytes.
    pub out_len: u32,

    /// Output data or output SG table address. Zero for verify-only passes.
    pub out_addr: u64,

    /// Cipher IV address (per-job scratch).
    pub iv_addr: u64,

    /// MAC IV address (per-job scratch).
    pub mac_iv_addr: u64,

    /// Cipher key address.
    pub key_addr: u64,

    /// Integrity key address.
    pub auth_key_addr: u64,

    /// Bits [7:0] cipher IV length, [15:8] MAC IV length,
    /// [23:16] leading bytes copied verbatim, [31:24] key length.
    pub lengths: u32,

    /// Integrity key length.
    pub auth_key_len: u32,

    reserved: [u64; 5],
}

impl JobDescriptor {
    /// Create a new zeroed descriptor.
    #[inline]
    pub const fn new() -> Self {
        Self {
            header: 0,
            op: 0,
            pdb_addr: 0,
            in_addr: 0,
            in_len: 0,
            out_len: 0,
            out_addr: 0,
            iv_addr: 0,
            mac_iv_addr: 0,
            key_addr: 0,
            auth_key_addr: 0,
            lengths: 0,
            auth_key_len: 0,
            reserved: [0; 5],
        }
    }

    /// Reset the descriptor for reuse.
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Header flags.
    #[inline]
    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.header)
    }

    /// Add header flags (OR with existing).
    #[inline]
    pub fn add_flags(&mut self, flags: DescriptorFlags) {
        self.header |= flags.bits();
    }

    /// Pack the length byte fields.
    #[inline]
    pub fn set_lengths(&mut self, iv_len: u8, mac_iv_len: u8, copy_len: u8, key_len: u8) {
        self.lengths = (iv_len as u32)
            | ((mac_iv_len as u32) << 8)
            | ((copy_len as u32) << 16)
            | ((key_len as u32) << 24);
    }

    /// Cipher IV length.
    #[inline]
    pub fn iv_len(&self) -> u8 {
        self.lengths as u8
    }

    /// MAC IV length.
    #[inline]
    pub fn mac_iv_len(&self) -> u8 {
        (self.lengths >> 8) as u8
    }

    /// Leading bytes copied to the output without processing.
    #[inline]
    pub fn copy_len(&self) -> u8 {
        (self.lengths >> 16) as u8
    }

    /// Cipher key length.
    #[inline]
    pub fn key_len(&self) -> u8 {
        (self.lengths >> 24) as u8
    }
}

impl Default for JobDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Output ring entry written by the accelerator on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct OutputRingEntry {
    /// Physical address of the completed descriptor.
    pub desc_addr: u64,
    /// Completion status word, see [`CompletionStatus`].
    pub status: u32,
    reserved: u32,
}

impl OutputRingEntry {
    /// Build an entry.
    pub const fn new(desc_addr: u64, status: u32) -> Self {
        Self {
            desc_addr,
            status,
            reserved: 0,
        }
    }
}

/// Scatter-gather entry: last entry of a table.
pub const SG_FINAL: u32 = 1 << 30;
/// Scatter-gather entry: length field mask.
pub const SG_LEN_MASK: u32 = 0x3FFF_FFFF;
/// Scatter-gather entry: largest encodable offset.
pub const SG_OFFSET_MAX: u32 = 0x1FFF;

/// 16-byte hardware scatter-gather table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct SgEntry {
    /// Physical address of the fragment buffer.
    pub addr: u64,
    /// Bits [29:0] length, bit 30 final marker.
    pub len_flags: u32,
    /// Bits [12:0] offset of the data within the buffer.
    pub offset: u32,
}

impl SgEntry {
    /// Encode an entry.
    #[inline]
    pub const fn new(addr: u64, len: u32, offset: u32, last: bool) -> Self {
        Self {
            addr,
            len_flags: (len & SG_LEN_MASK) | if last { SG_FINAL } else { 0 },
            offset: offset & SG_OFFSET_MAX,
        }
    }

    /// Fragment length.
    #[inline]
    pub const fn len(&self) -> u32 {
        self.len_flags & SG_LEN_MASK
    }

    /// Whether the entry has a zero length.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is the last entry of its table.
    #[inline]
    pub const fn is_final(&self) -> bool {
        self.len_flags & SG_FINAL != 0
    }
}

/// Per-job scratch area holding IVs and MAC-I.
///
/// Cipher and MAC IVs have fixed, distinct offsets so a two-pass packet can
/// keep both alive at once.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct JobScratch {
    /// Stream cipher IV.
    pub cipher_iv: [u8; 16],
    /// MAC IV (SNOW F9 register image or AES-CMAC message prefix).
    pub mac_iv: [u8; 16],
    /// MAC-I produced or expected by the integrity pass.
    pub mac: [u8; 8],
    reserved: [u8; 24],
}

/// Offset of the cipher IV within [`JobScratch`].
pub const CIPHER_IV_OFFSET: usize = std::mem::offset_of!(JobScratch, cipher_iv);
/// Offset of the MAC IV within [`JobScratch`].
pub const MAC_IV_OFFSET: usize = std::mem::offset_of!(JobScratch, mac_iv);
/// Offset of the MAC-I within [`JobScratch`].
pub const MAC_OFFSET: usize = std::mem::offset_of!(JobScratch, mac);

impl JobScratch {
    /// Create a zeroed scratch area.
    pub const fn new() -> Self {
        Self {
            cipher_iv: [0; 16],
            mac_iv: [0; 16],
            mac: [0; 8],
            reserved: [0; 24],
        }
    }

    /// COUNT value stored in the first word of the cipher IV.
    pub fn cipher_count(&self) -> u32 {
        u32::from_be_bytes([
            self.cipher_iv[0],
            self.cipher_iv[1],
            self.cipher_iv[2],
            self.cipher_iv[3],
        ])
    }
}

impl Default for JobScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Status source: crypto engine.
pub const STATUS_SRC_CCB: u32 = 0x2;
/// Status source: job ring.
pub const STATUS_SRC_JOB_RING: u32 = 0x4;
/// Crypto engine error id for an integrity check mismatch.
pub const CCB_ERR_ICV_CHECK: u32 = 0x0A;

/// Build a raw status word.
#[inline]
pub const fn status_word(source: u32, id: u32) -> u32 {
    (source << 28) | (id & 0xFF)
}

/// Decoded completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Job completed successfully.
    Success,
    /// Integrity check failed on decapsulation.
    IcvMismatch,
    /// Crypto engine reported an error.
    EngineError(u32),
    /// Job ring reported an error for this descriptor.
    JobRingError(u32),
    /// Unknown status word.
    Unknown(u32),
}

impl From<u32> for CompletionStatus {
    fn from(status: u32) -> Self {
        if status == 0 {
            return Self::Success;
        }
        match status >> 28 {
            STATUS_SRC_CCB if status & 0xFF == CCB_ERR_ICV_CHECK => Self::IcvMismatch,
            STATUS_SRC_CCB => Self::EngineError(status),
            STATUS_SRC_JOB_RING => Self::JobRingError(status),
            _ => Self::Unknown(status),
        }
    }
}

impl CompletionStatus {
    /// Returns true if this status indicates success.
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if this status indicates an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }
}

// Compile-time size and alignment checks
const _: () = assert!(std::mem::size_of::<JobDescriptor>() == 128);
const _: () = assert!(std::mem::align_of::<JobDescriptor>() == 64);
const _: () = assert!(std::mem::size_of::<OutputRingEntry>() == 16);
const _: () = assert!(std::mem::size_of::<SgEntry>() == 16);
const _: () = assert!(std::mem::size_of::<JobScratch>() == 64);
