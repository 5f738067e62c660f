// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Logical packets and scatter-gather table assembly.
//!
//! A [`LogicalPacket`] is either one contiguous buffer or an ordered list of
//! fragments whose lengths add up to the declared total length. Multi-fragment
//! packets are described to the accelerator through an [`SgTable`]; a
//! contiguous packet is handed over directly and needs no table.

use crate::descriptor::{SgEntry, SG_LEN_MASK, SG_OFFSET_MAX};
use crate::dma::DmaSlice;
use crate::error::{SecError, SecResult};
use crate::hw::{AddressTranslator, DmaMemory, PhysAddr};
use std::sync::Arc;

/// Maximum number of entries in one scatter-gather table.
pub const MAX_SG_ENTRIES: usize = 16;

/// One buffer region of a logical packet.
///
/// Protocol data starts at `addr + offset` and spans `length` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    addr: *mut u8,
    offset: u32,
    length: u32,
}

// SAFETY: a Fragment only carries the address of caller-owned DMA memory.
// The caller guarantees (see `Fragment::new`) that the memory stays valid
// until the packet is notified, regardless of the submitting thread.
unsafe impl Send for Fragment {}

impl Fragment {
    /// Describe a buffer region.
    ///
    /// # Safety
    ///
    /// - `addr + offset .. addr + offset + length` must be valid for reads
    ///   and writes and reachable by the accelerator.
    /// - The memory must stay valid, and must not be accessed by the caller,
    ///   until the packet using this fragment has been notified through a
    ///   poll callback or the driver has been released.
    pub unsafe fn new(addr: *mut u8, offset: u32, length: u32) -> Self {
        Self {
            addr,
            offset,
            length,
        }
    }

    /// Describe a whole buffer that lives for the rest of the program.
    ///
    /// Fails for buffers longer than `u32::MAX` bytes.
    pub fn from_static(buf: &'static mut [u8]) -> SecResult<Self> {
        let length = u32::try_from(buf.len()).map_err(|_| {
            SecError::InvalidInput(format!("buffer of {} bytes too long", buf.len()))
        })?;
        Ok(Self {
            addr: buf.as_mut_ptr(),
            offset: 0,
            length,
        })
    }

    /// Buffer start address.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Offset of the protocol data within the buffer.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Length of the protocol data.
    #[inline]
    pub fn len(&self) -> u32 {
        self.length
    }

    /// Whether the fragment carries no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Address of the first protocol data byte.
    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        self.addr.wrapping_add(self.offset as usize)
    }
}

/// Caller-supplied packet: one contiguous buffer or a fragment list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPacket {
    fragments: Vec<Fragment>,
    total_length: u32,
}

impl LogicalPacket {
    /// Packet held in a single buffer.
    pub fn contiguous(fragment: Fragment) -> Self {
        Self {
            total_length: fragment.len(),
            fragments: vec![fragment],
        }
    }

    /// Packet spread over `fragments`, in order, totalling `total_length`.
    pub fn scattered(fragments: Vec<Fragment>, total_length: u32) -> Self {
        Self {
            fragments,
            total_length,
        }
    }

    /// Fragments in submission order.
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Number of fragments.
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Declared total length.
    pub fn total_length(&self) -> u32 {
        self.total_length
    }

    /// Whether the packet needs a scatter-gather table.
    pub fn is_scattered(&self) -> bool {
        self.fragments.len() > 1
    }

    /// First fragment, if any.
    pub fn first(&self) -> Option<&Fragment> {
        self.fragments.first()
    }

    /// Checks shared by every submission: at least one fragment, no null
    /// buffers, non-zero length, and fragments adding up to the total.
    pub(crate) fn validate(&self, what: &str) -> SecResult<()> {
        let first = self
            .first()
            .ok_or_else(|| SecError::InvalidInput(format!("{what} packet has no buffer")))?;
        if self.fragments.iter().any(|f| f.addr().is_null()) {
            return Err(SecError::InvalidInput(format!("{what} buffer is null")));
        }
        if self.total_length == 0 || first.is_empty() {
            return Err(SecError::InvalidInput(format!("{what} packet is empty")));
        }
        let sum: u64 = self.fragments.iter().map(|f| f.len() as u64).sum();
        if sum != self.total_length as u64 {
            return Err(SecError::InvalidInput(format!(
                "{what} fragments total {sum} bytes, {} declared",
                self.total_length
            )));
        }
        Ok(())
    }

    /// Leading `n` bytes of protocol data, taken from the first fragment.
    pub(crate) fn head(&self, n: usize) -> Option<&[u8]> {
        let first = self.first()?;
        if first.addr().is_null() || (first.len() as usize) < n {
            return None;
        }
        // SAFETY: the range lies within the fragment, which the caller
        // guaranteed valid when constructing it.
        Some(unsafe { std::slice::from_raw_parts(first.data_ptr(), n) })
    }
}

/// Which side of a job a table describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgDirection {
    /// Data read by the accelerator.
    Input,
    /// Data written by the accelerator.
    Output,
}

impl std::fmt::Display for SgDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Hardware scatter-gather table in DMA memory.
pub struct SgTable {
    entries: DmaSlice<SgEntry>,
    used: usize,
    total_length: u32,
}

impl SgTable {
    /// Allocate an empty table.
    pub fn new(mem: &Arc<dyn DmaMemory>) -> SecResult<Self> {
        Ok(Self {
            entries: DmaSlice::new(mem, MAX_SG_ENTRIES, SgEntry::default())?,
            used: 0,
            total_length: 0,
        })
    }

    /// Forget previous contents.
    pub fn clear(&mut self) {
        self.used = 0;
        self.total_length = 0;
    }

    /// Whether the table describes a packet.
    pub fn is_active(&self) -> bool {
        self.used > 0
    }

    /// Entries in use.
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries[..self.used]
    }

    /// Sum of entry lengths.
    pub fn total_length(&self) -> u32 {
        self.total_length
    }

    /// Physical address of the first entry.
    pub fn phys(&self) -> PhysAddr {
        self.entries.phys()
    }

    fn push(&mut self, entry: SgEntry) -> SecResult<()> {
        if self.used == MAX_SG_ENTRIES {
            return Err(SecError::InvalidInput(format!(
                "more than {MAX_SG_ENTRIES} fragments"
            )));
        }
        self.total_length = self
            .total_length
            .checked_add(entry.len())
            .ok_or_else(|| SecError::InvalidInput("scatter-gather length overflows".into()))?;
        self.entries.write_volatile(self.used, entry);
        self.used += 1;
        Ok(())
    }

    fn mark_last_final(&mut self) {
        if let Some(last) = self.used.checked_sub(1) {
            let e = self.entries[last];
            self.entries
                .write_volatile(last, SgEntry::new(e.addr, e.len(), e.offset, true));
        }
    }
}

impl std::fmt::Debug for SgTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SgTable")
            .field("phys", &format_args!("{:#x}", self.phys()))
            .field("used", &self.used)
            .field("total_length", &self.total_length)
            .finish()
    }
}

/// Input and output tables of one job.
#[derive(Debug)]
pub struct SgContext {
    /// Table describing the input packet.
    pub input: SgTable,
    /// Table describing the output packet.
    pub output: SgTable,
}

impl SgContext {
    /// Allocate both tables.
    pub fn new(mem: &Arc<dyn DmaMemory>) -> SecResult<Self> {
        Ok(Self {
            input: SgTable::new(mem)?,
            output: SgTable::new(mem)?,
        })
    }

    /// Table for `direction`.
    pub fn table_mut(&mut self, direction: SgDirection) -> &mut SgTable {
        match direction {
            SgDirection::Input => &mut self.input,
            SgDirection::Output => &mut self.output,
        }
    }

    /// Clear both tables.
    pub fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}

fn encode_fragments<T: AddressTranslator + ?Sized>(
    table: &mut SgTable,
    packet: &LogicalPacket,
    direction: SgDirection,
    translator: &T,
) -> SecResult<()> {
    let total = packet.total_length() as u64;
    let count = packet.fragment_count();
    let mut sum: u64 = 0;

    for (i, frag) in packet.fragments().iter().enumerate() {
        if frag.addr().is_null() {
            return Err(SecError::InvalidInput(format!(
                "{direction} fragment {i} is null"
            )));
        }
        if frag.offset() >= frag.len() {
            return Err(SecError::InvalidInput(format!(
                "{direction} fragment {i}: offset {} not below length {}",
                frag.offset(),
                frag.len()
            )));
        }
        if frag.offset() > SG_OFFSET_MAX || frag.len() > SG_LEN_MASK {
            return Err(SecError::InvalidInput(format!(
                "{direction} fragment {i} not encodable"
            )));
        }
        sum += frag.len() as u64;
        if sum > total {
            return Err(SecError::InvalidInput(format!(
                "{direction} fragments exceed total length {total}"
            )));
        }
        let last = i + 1 == count;
        if last && sum != total {
            return Err(SecError::InvalidInput(format!(
                "{direction} fragments sum to {sum}, total length is {total}"
            )));
        }
        let phys = translator.virt_to_phys(frag.addr()).ok_or_else(|| {
            SecError::InvalidInput(format!("{direction} fragment {i} not DMA-visible"))
        })?;
        table.push(SgEntry::new(phys, frag.len(), frag.offset(), false))?;
    }
    table.mark_last_final();
    Ok(())
}

/// Builds the hardware table for one direction of a job.
///
/// A contiguous packet leaves the table inactive. For a fragmented packet
/// every fragment is validated in order and the last entry is marked final;
/// fragment lengths must add up to the declared total exactly.
pub fn assemble<T: AddressTranslator + ?Sized>(
    table: &mut SgTable,
    packet: &LogicalPacket,
    direction: SgDirection,
    translator: &T,
) -> SecResult<()> {
    table.clear();
    if !packet.is_scattered() {
        return Ok(());
    }
    let result = encode_fragments(table, packet, direction, translator);
    if result.is_err() {
        table.clear();
    }
    result
}

/// Builds an input table whose first entry is `prefix` followed by the
/// packet data. Used when a MAC IV is authenticated ahead of the packet.
pub fn assemble_prefixed<T: AddressTranslator + ?Sized>(
    table: &mut SgTable,
    prefix: PhysAddr,
    prefix_len: u32,
    packet: &LogicalPacket,
    translator: &T,
) -> SecResult<()> {
    table.clear();
    let result = (|| {
        table.push(SgEntry::new(prefix, prefix_len, 0, false))?;
        if packet.is_scattered() {
            return encode_fragments(table, packet, SgDirection::Input, translator);
        }
        let frag = packet
            .first()
            .ok_or_else(|| SecError::InvalidInput("input packet has no buffer".into()))?;
        if frag.offset() > SG_OFFSET_MAX || frag.len() > SG_LEN_MASK {
            return Err(SecError::InvalidInput("input buffer not encodable".into()));
        }
        let phys = translator
            .virt_to_phys(frag.addr())
            .ok_or_else(|| SecError::InvalidInput("input buffer not DMA-visible".into()))?;
        table.push(SgEntry::new(phys, frag.len(), frag.offset(), true))
    })();
    if result.is_err() {
        table.clear();
    }
    result
}
