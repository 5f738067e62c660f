// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of a job ring.
//!
//! [`SimulatedRing`] implements [`JobRingRegisters`] on top of ordinary
//! memory: it fetches descriptors from the input ring, runs them, and posts
//! completions to the output ring, following the same register protocol as
//! the hardware. The "crypto" is a keyed XOR stream and a keyed hash, which
//! is enough to check that IVs, keys, header copy lengths, scatter-gather
//! tables and MAC handling are wired correctly end to end.
//!
//! Clones share one model, so a test can keep a handle for control
//! ([`SimulatedRing::pause`], [`SimulatedRing::inject_error`], ...) while the
//! driver owns another as its register backend.

use crate::descriptor::{
    status_word, DescriptorFlags, JobDescriptor, OutputRingEntry, SgEntry, CCB_ERR_ICV_CHECK,
    MAC_I_LEN, STATUS_SRC_CCB, STATUS_SRC_JOB_RING,
};
use crate::hw::{
    ring_error_status, Clock, DmaMemory, JobRingRegisters, PhysAddr, Register, RingInterrupt,
    RING_CMD_RESET,
};
use log::{debug, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Job ring error id: a descriptor or data address could not be accessed.
pub const JR_ERR_ADDRESS: u32 = 0x02;

const MAX_SG_WALK: usize = 64;

#[derive(Debug, Default)]
struct SimState {
    input_base: PhysAddr,
    input_size: u32,
    output_base: PhysAddr,
    output_size: u32,
    fetch_idx: u32,
    post_idx: u32,
    queued: u32,
    slots_full: u32,
    irq_status: u32,
    irq_config: u32,
    command: u32,
    halted: bool,
    paused: bool,
    stall_reset: bool,
    fail_next: Option<u8>,
    processed: u64,
    last: Option<JobDescriptor>,
}

/// Software job ring; see the module documentation.
#[derive(Clone)]
pub struct SimulatedRing {
    state: Arc<Mutex<SimState>>,
    mem: Arc<dyn DmaMemory>,
}

impl SimulatedRing {
    /// Create a model that resolves bus addresses through `mem`.
    pub fn new(mem: Arc<dyn DmaMemory>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            mem,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop processing descriptors as they are added.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Process everything queued and resume immediate processing.
    pub fn resume(&self) {
        let mut s = self.lock();
        s.paused = false;
        self.process(&mut s, u32::MAX);
    }

    /// Process up to `n` queued descriptors; returns how many completed.
    pub fn complete(&self, n: u32) -> u32 {
        let mut s = self.lock();
        self.process(&mut s, n)
    }

    /// Raise a ring error of `error_type` when the next descriptor is
    /// fetched; the ring halts until reset.
    pub fn inject_error(&self, error_type: u8) {
        self.lock().fail_next = Some(error_type);
    }

    /// Make resets hang in the halt phase.
    pub fn stall_reset(&self, stall: bool) {
        self.lock().stall_reset = stall;
    }

    /// Descriptors completed since creation.
    pub fn processed(&self) -> u64 {
        self.lock().processed
    }

    /// Descriptors waiting to be fetched.
    pub fn queued(&self) -> u32 {
        self.lock().queued
    }

    /// Copy of the most recently executed descriptor.
    pub fn last_descriptor(&self) -> Option<JobDescriptor> {
        self.lock().last
    }

    fn process(&self, s: &mut SimState, max: u32) -> u32 {
        let mut done = 0;
        while done < max && s.queued > 0 && !s.halted && s.slots_full < s.output_size {
            if let Some(error_type) = s.fail_next.take() {
                debug!("sim: raising ring error type {:#x}", error_type);
                s.irq_status |= ring_error_status(error_type);
                s.halted = true;
                break;
            }
            let entry_addr = s.input_base + s.fetch_idx as PhysAddr * 8;
            let status = match self.read_mem::<PhysAddr>(entry_addr) {
                Some(desc_addr) => {
                    let status = match self.read_mem::<JobDescriptor>(desc_addr) {
                        Some(desc) => {
                            s.last = Some(desc);
                            self.execute(&desc)
                        }
                        None => status_word(STATUS_SRC_JOB_RING, JR_ERR_ADDRESS),
                    };
                    let out = s.output_base + s.post_idx as PhysAddr * 16;
                    self.write_mem(out, OutputRingEntry::new(desc_addr, status));
                    status
                }
                None => status_word(STATUS_SRC_JOB_RING, JR_ERR_ADDRESS),
            };
            trace!("sim: slot {} done, status {:#x}", s.fetch_idx, status);
            s.fetch_idx = (s.fetch_idx + 1) % s.input_size.max(1);
            s.post_idx = (s.post_idx + 1) % s.output_size.max(1);
            s.queued -= 1;
            s.slots_full += 1;
            s.irq_status |= RingInterrupt::PENDING.bits();
            s.processed += 1;
            done += 1;
        }
        done
    }

    fn read_mem<T: Copy>(&self, phys: PhysAddr) -> Option<T> {
        let ptr = self.mem.phys_to_virt(phys)?;
        // SAFETY: the driver only hands out addresses of live DMA memory.
        Some(unsafe { std::ptr::read_unaligned(ptr as *const T) })
    }

    fn write_mem<T: Copy>(&self, phys: PhysAddr, value: T) -> Option<()> {
        let ptr = self.mem.phys_to_virt(phys)?;
        // SAFETY: as in `read_mem`.
        unsafe { std::ptr::write_unaligned(ptr as *mut T, value) };
        Some(())
    }

    fn bytes(&self, phys: PhysAddr, len: usize) -> Option<Vec<u8>> {
        if len == 0 {
            return Some(Vec::new());
        }
        let ptr = self.mem.phys_to_virt(phys)?;
        // SAFETY: as in `read_mem`.
        Some(unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec())
    }

    fn sg_entries(&self, table: PhysAddr) -> Option<Vec<SgEntry>> {
        let mut entries = Vec::new();
        for i in 0..MAX_SG_WALK {
            let entry: SgEntry = self.read_mem(table + (i * 16) as PhysAddr)?;
            entries.push(entry);
            if entry.is_final() {
                return Some(entries);
            }
        }
        None
    }

    fn gather(&self, addr: PhysAddr, len: u32, sg: bool) -> Option<Vec<u8>> {
        if !sg {
            return self.bytes(addr, len as usize);
        }
        let mut data = Vec::with_capacity(len as usize);
        for e in self.sg_entries(addr)? {
            data.extend(self.bytes(e.addr + e.offset as PhysAddr, e.len() as usize)?);
        }
        data.truncate(len as usize);
        Some(data)
    }

    fn scatter(&self, addr: PhysAddr, data: &[u8], sg: bool) -> Option<()> {
        if data.is_empty() {
            return Some(());
        }
        if !sg {
            let ptr = self.mem.phys_to_virt(addr)?;
            // SAFETY: as in `read_mem`.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
            return Some(());
        }
        let mut rest = data;
        for e in self.sg_entries(addr)? {
            let n = rest.len().min(e.len() as usize);
            let ptr = self.mem.phys_to_virt(e.addr + e.offset as PhysAddr)?;
            // SAFETY: as in `read_mem`.
            unsafe { std::ptr::copy_nonoverlapping(rest.as_ptr(), ptr, n) };
            rest = &rest[n..];
            if rest.is_empty() {
                return Some(());
            }
        }
        rest.is_empty().then_some(())
    }

    fn word(&self, addr: PhysAddr) -> Option<u32> {
        if addr == 0 {
            return Some(0);
        }
        self.bytes(addr, 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn key(&self, addr: PhysAddr, len: usize) -> Option<Vec<u8>> {
        if addr == 0 {
            return Some(vec![0; 16]);
        }
        self.bytes(addr, len.clamp(1, 32))
    }

    fn execute(&self, desc: &JobDescriptor) -> u32 {
        self.run(desc)
            .unwrap_or_else(|| status_word(STATUS_SRC_JOB_RING, JR_ERR_ADDRESS))
    }

    fn run(&self, desc: &JobDescriptor) -> Option<u32> {
        let flags = desc.flags();
        let mut data = self.gather(
            desc.in_addr,
            desc.in_len,
            flags.contains(DescriptorFlags::IN_SG),
        )?;
        let prefix: Vec<u8> = if flags.contains(DescriptorFlags::MAC_IV_PREPENDED) {
            let n = (desc.mac_iv_len() as usize).min(data.len());
            data.drain(..n).collect()
        } else {
            Vec::new()
        };
        let copy = (desc.copy_len() as usize).min(data.len());

        let cipher = if flags.contains(DescriptorFlags::CIPHER) {
            Some((
                self.word(desc.iv_addr)?,
                self.key(desc.key_addr, desc.key_len() as usize)?,
            ))
        } else {
            None
        };
        let integrity = if flags.contains(DescriptorFlags::INTEGRITY) {
            Some((
                self.word(desc.mac_iv_addr)?,
                self.key(desc.auth_key_addr, desc.auth_key_len as usize)?,
            ))
        } else {
            None
        };
        let mac_of = |body: &[u8]| match &integrity {
            Some((count, key)) => toy_mac(*count, key, &prefix, body),
            None => 0,
        };
        let apply_cipher = |buf: &mut [u8]| {
            if let Some((count, key)) = &cipher {
                let start = copy.min(buf.len());
                keystream(*count, key, &mut buf[start..]);
            }
        };

        let mut status = 0;
        if flags.contains(DescriptorFlags::APPEND_MAC) {
            let mac = mac_of(&data);
            data.extend_from_slice(&mac.to_be_bytes());
            apply_cipher(&mut data);
        } else if flags.contains(DescriptorFlags::VERIFY_MAC) {
            apply_cipher(&mut data);
            let body_len = data.len().checked_sub(MAC_I_LEN as usize)?;
            let (body, tail) = data.split_at(body_len);
            if tail != mac_of(body).to_be_bytes() {
                status = status_word(STATUS_SRC_CCB, CCB_ERR_ICV_CHECK);
            }
            data.truncate(body_len);
        } else {
            apply_cipher(&mut data);
        }

        if desc.out_addr != 0 {
            let n = data.len().min(desc.out_len as usize);
            self.scatter(
                desc.out_addr,
                &data[..n],
                flags.contains(DescriptorFlags::OUT_SG),
            )?;
        }
        Some(status)
    }

    fn reset(&self, s: &mut SimState) {
        if s.irq_status & RingInterrupt::HALT_COMPLETE.bits() != 0 {
            s.fetch_idx = 0;
            s.post_idx = 0;
            s.queued = 0;
            s.slots_full = 0;
            s.irq_status = 0;
            s.command = 0;
            s.halted = false;
            s.fail_next = None;
            debug!("sim: ring reset");
        } else {
            s.command = RING_CMD_RESET;
            s.halted = true;
            if !s.stall_reset {
                s.irq_status |= RingInterrupt::HALT_COMPLETE.bits();
            }
        }
    }
}

impl JobRingRegisters for SimulatedRing {
    fn read(&self, reg: Register) -> u32 {
        let s = self.lock();
        match reg {
            Register::InputRingBaseHi => (s.input_base >> 32) as u32,
            Register::InputRingBaseLo => s.input_base as u32,
            Register::InputRingSize => s.input_size,
            Register::InputSlotsAvailable => s.input_size.saturating_sub(s.queued),
            Register::OutputRingBaseHi => (s.output_base >> 32) as u32,
            Register::OutputRingBaseLo => s.output_base as u32,
            Register::OutputRingSize => s.output_size,
            Register::OutputSlotsFull => s.slots_full,
            Register::Status => s.halted as u32,
            Register::InterruptStatus => s.irq_status,
            Register::InterruptConfig => s.irq_config,
            Register::Command => s.command,
            Register::InputJobsAdded | Register::OutputJobsRemoved => 0,
        }
    }

    fn write(&self, reg: Register, value: u32) {
        let mut s = self.lock();
        let lo = |base: PhysAddr| (base & !0xFFFF_FFFF) | value as PhysAddr;
        let hi = |base: PhysAddr| (base & 0xFFFF_FFFF) | (value as PhysAddr) << 32;
        match reg {
            Register::InputRingBaseHi => s.input_base = hi(s.input_base),
            Register::InputRingBaseLo => s.input_base = lo(s.input_base),
            Register::InputRingSize => s.input_size = value,
            Register::OutputRingBaseHi => s.output_base = hi(s.output_base),
            Register::OutputRingBaseLo => s.output_base = lo(s.output_base),
            Register::OutputRingSize => s.output_size = value,
            Register::InputJobsAdded => {
                s.queued += value;
                if !s.paused {
                    self.process(&mut s, u32::MAX);
                }
            }
            Register::OutputJobsRemoved => {
                s.slots_full = s.slots_full.saturating_sub(value);
                if s.slots_full == 0 {
                    s.irq_status &= !RingInterrupt::PENDING.bits();
                }
            }
            Register::InterruptStatus => s.irq_status &= !value,
            Register::InterruptConfig => s.irq_config = value,
            Register::Command if value & RING_CMD_RESET != 0 => self.reset(&mut s),
            Register::Command => s.command = value,
            Register::InputSlotsAvailable | Register::OutputSlotsFull | Register::Status => {}
        }
    }
}

impl std::fmt::Debug for SimulatedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.lock();
        f.debug_struct("SimulatedRing")
            .field("queued", &s.queued)
            .field("slots_full", &s.slots_full)
            .field("halted", &s.halted)
            .field("processed", &s.processed)
            .finish()
    }
}

fn keystream(count: u32, key: &[u8], data: &mut [u8]) {
    let count = count.to_be_bytes();
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= count[i % 4] ^ key[i % key.len()] ^ (i as u8).wrapping_mul(31) ^ 0x5A;
    }
}

fn toy_mac(count: u32, key: &[u8], prefix: &[u8], body: &[u8]) -> u32 {
    let seed = key
        .iter()
        .fold(count, |h, b| h.rotate_left(7) ^ *b as u32);
    prefix
        .iter()
        .chain(body)
        .fold(seed ^ 0x811C_9DC5, |h, b| {
            (h ^ *b as u32).wrapping_mul(0x0100_0193)
        })
}

/// Clock that advances a fixed step on every [`Clock::relax`].
#[derive(Debug)]
pub struct FakeClock {
    now: AtomicU64,
    step: u64,
}

impl FakeClock {
    /// Start at zero, advancing `step` microseconds per wait iteration.
    pub fn new(step: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step,
        }
    }
}

impl Clock for FakeClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn relax(&self) {
        self.now.fetch_add(self.step, Ordering::Relaxed);
    }
}
