// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Job ring: the circular descriptor queue shared with the accelerator.
//!
//! Software owns `capacity` job slots. Each slot has a 128-byte descriptor
//! and an IV scratch area in DMA memory, scatter-gather tables, and the
//! shadow state of the packet in flight. Submitting a slot writes the
//! descriptor's physical address to the input ring and tells the hardware
//! how many entries were added; the accelerator answers through the output
//! ring with `{descriptor address, status}` entries in submission order.
//!
//! Indices are masked with `capacity - 1`. The hardware FIFO holds fewer
//! entries than the ring has slots, so at most
//! `capacity - 1 - headroom` slots are ever in flight.

use crate::config::StartupMode;
use crate::context::{ContextHandle, ContextPool};
use crate::descriptor::{DescriptorFlags, JobDescriptor, JobScratch, OutputRingEntry};
use crate::dma::DmaSlice;
use crate::error::{SecError, SecResult};
use crate::hw::{
    AddressTranslator, Clock, DmaMemory, InterruptControl, JobRingRegisters, PhysAddr, Register, RingInterrupt,
    RING_CMD_RESET,
};
use crate::pdcp::{update_packet_descriptor, write_iv, JobView};
use crate::sg::{LogicalPacket, SgContext};
use log::{debug, error, info, trace, warn};
use scopeguard::ScopeGuard;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

/// Largest supported ring capacity.
pub const MAX_RING_SIZE: u32 = 1024;

#[repr(C, align(64))]
struct CacheAligned<T>(T);

/// Ring lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    /// Accepting jobs.
    Started,
    /// Hardware reset in progress after an error.
    Resetting,
    /// Terminal: released or failed to reset.
    ShutDown,
}

/// Position of a slot within a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRole {
    /// The packet's only descriptor.
    Single,
    /// First descriptor of a two-pass packet; not notified.
    FirstOfTwo,
    /// Second descriptor of a two-pass packet; carries the packet.
    SecondOfTwo,
}

/// Index of a slot in its ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(pub u32);

/// Software side of one job slot.
#[derive(Debug)]
struct Job {
    sg: SgContext,
    context: Option<ContextHandle>,
    input: Option<LogicalPacket>,
    output: Option<LogicalPacket>,
    user_tag: u64,
    role: JobRole,
    out_len: u32,
    hfn_threshold: bool,
    carried_status: u32,
}

impl Job {
    fn new(mem: &Arc<dyn DmaMemory>) -> SecResult<Self> {
        Ok(Self {
            sg: SgContext::new(mem)?,
            context: None,
            input: None,
            output: None,
            user_tag: 0,
            role: JobRole::Single,
            out_len: 0,
            hfn_threshold: false,
            carried_status: 0,
        })
    }

    /// Attach the packet this slot notifies on completion.
    fn attach(
        &mut self,
        context: ContextHandle,
        input: LogicalPacket,
        output: LogicalPacket,
        user_tag: u64,
        out_len: u32,
        hfn_threshold: bool,
    ) {
        self.context = Some(context);
        self.input = Some(input);
        self.output = Some(output);
        self.user_tag = user_tag;
        self.out_len = out_len;
        self.hfn_threshold = hfn_threshold;
    }

    fn set_role(&mut self, role: JobRole) {
        self.role = role;
    }

    fn detach(&mut self) {
        self.context = None;
        self.input = None;
        self.output = None;
        self.user_tag = 0;
        self.role = JobRole::Single;
        self.out_len = 0;
        self.hfn_threshold = false;
        self.carried_status = 0;
        self.sg.clear();
    }

    fn take(&mut self, slot: u32, status: u32) -> Completion {
        // A failed first pass outranks whatever the second pass reported.
        let status = if self.carried_status != 0 {
            self.carried_status
        } else {
            status
        };
        let completion = Completion {
            slot,
            status,
            role: self.role,
            context: self.context.take(),
            input: self.input.take(),
            output: self.output.take(),
            user_tag: self.user_tag,
            out_len: self.out_len,
            hfn_threshold: self.hfn_threshold,
        };
        self.detach();
        completion
    }
}

/// A drained slot and the packet it carried.
#[derive(Debug)]
pub struct Completion {
    /// Slot index.
    pub slot: u32,
    /// Raw hardware status word.
    pub status: u32,
    /// Position within the packet.
    pub role: JobRole,
    /// Owning context, absent for raw descriptors.
    pub context: Option<ContextHandle>,
    /// Input packet.
    pub input: Option<LogicalPacket>,
    /// Output packet.
    pub output: Option<LogicalPacket>,
    /// Caller tag.
    pub user_tag: u64,
    /// Bytes of protocol data in the output.
    pub out_len: u32,
    /// HFN threshold was reached when the packet was submitted.
    pub hfn_threshold: bool,
}

/// Snapshot of a ring's indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    /// Next slot to be filled.
    pub producer_idx: u32,
    /// Next slot to be drained.
    pub consumer_idx: u32,
    /// Slots that can be submitted now.
    pub free_slots: u32,
    /// Slots in flight.
    pub pending: u32,
}

/// Static parameters of a ring.
#[derive(Debug, Clone, Copy)]
pub struct RingParams {
    /// Ring index.
    pub id: u8,
    /// Slot count, a power of two.
    pub capacity: u32,
    /// Slots withheld from the hardware FIFO.
    pub headroom: u32,
    /// Value for the interrupt configuration register.
    pub irq_config: u32,
    /// Interrupt mode at start.
    pub mode: StartupMode,
}

/// One job ring.
pub struct JobRing {
    producer: CacheAligned<AtomicU32>,
    consumer: CacheAligned<AtomicU32>,
    params: RingParams,
    state: RingState,
    mask: u32,
    descriptors: DmaSlice<JobDescriptor>,
    scratch: DmaSlice<JobScratch>,
    input_ring: DmaSlice<PhysAddr>,
    output_ring: DmaSlice<OutputRingEntry>,
    jobs: Vec<Job>,
    registers: Box<dyn JobRingRegisters>,
    interrupts: Box<dyn InterruptControl>,
    pool: ContextPool,
}

impl JobRing {
    /// Allocate ring memory and program the hardware.
    pub fn new(
        params: RingParams,
        mem: &Arc<dyn DmaMemory>,
        registers: Box<dyn JobRingRegisters>,
        interrupts: Box<dyn InterruptControl>,
        pool: ContextPool,
    ) -> SecResult<Self> {
        let capacity = params.capacity;
        if !capacity.is_power_of_two() || capacity > MAX_RING_SIZE {
            return Err(SecError::InvalidConfig(format!(
                "ring size {capacity} must be a power of two up to {MAX_RING_SIZE}"
            )));
        }
        if params.headroom + 1 >= capacity {
            return Err(SecError::InvalidConfig(format!(
                "headroom {} leaves no usable slot in a ring of {capacity}",
                params.headroom
            )));
        }
        let slots = capacity as usize;
        let jobs = (0..slots)
            .map(|_| Job::new(mem))
            .collect::<SecResult<Vec<_>>>()?;
        let mut ring = Self {
            producer: CacheAligned(AtomicU32::new(0)),
            consumer: CacheAligned(AtomicU32::new(0)),
            params,
            state: RingState::Started,
            mask: capacity - 1,
            descriptors: DmaSlice::new(mem, slots, JobDescriptor::new())?,
            scratch: DmaSlice::new(mem, slots, JobScratch::new())?,
            input_ring: DmaSlice::new(mem, slots, 0)?,
            output_ring: DmaSlice::new(mem, slots, OutputRingEntry::default())?,
            jobs,
            registers,
            interrupts,
            pool,
        };
        ring.program();
        ring.apply_mode(params.mode)?;
        Ok(ring)
    }

    fn program(&self) {
        let r = &self.registers;
        r.write_base(
            Register::InputRingBaseHi,
            Register::InputRingBaseLo,
            self.input_ring.phys(),
        );
        r.write(Register::InputRingSize, self.params.capacity);
        r.write_base(
            Register::OutputRingBaseHi,
            Register::OutputRingBaseLo,
            self.output_ring.phys(),
        );
        r.write(Register::OutputRingSize, self.params.capacity);
        r.write(Register::InterruptConfig, self.params.irq_config);
    }

    /// Ring index.
    #[inline]
    pub fn id(&self) -> u8 {
        self.params.id
    }

    /// Lifecycle state.
    #[inline]
    pub fn state(&self) -> RingState {
        self.state
    }

    /// Interrupt mode.
    #[inline]
    pub fn mode(&self) -> StartupMode {
        self.params.mode
    }

    /// Allocated slots.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.params.capacity
    }

    /// Slots that may be in flight at once.
    #[inline]
    pub fn usable_depth(&self) -> u32 {
        self.params.capacity - 1 - self.params.headroom
    }

    /// Slots in flight.
    #[inline]
    pub fn count(&self) -> u32 {
        let p = self.producer.0.load(Ordering::Acquire);
        let c = self.consumer.0.load(Ordering::Acquire);
        p.wrapping_sub(c) & self.mask
    }

    /// Whether nothing is in flight.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Whether no slot can be submitted.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() >= self.usable_depth()
    }

    /// Index snapshot.
    pub fn stats(&self) -> RingStats {
        let pending = self.count();
        RingStats {
            producer_idx: self.producer.0.load(Ordering::Acquire),
            consumer_idx: self.consumer.0.load(Ordering::Acquire),
            free_slots: self.usable_depth() - pending,
            pending,
        }
    }

    /// Context pool of this ring.
    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    /// Mutable context pool of this ring.
    pub fn pool_mut(&mut self) -> &mut ContextPool {
        &mut self.pool
    }

    /// Interrupt event descriptor, if the backend has one.
    pub fn event_fd(&self) -> Option<i32> {
        self.interrupts.event_fd()
    }

    fn check_started(&self) -> SecResult<()> {
        match self.state {
            RingState::Started => Ok(()),
            RingState::Resetting => Err(SecError::RingResetting),
            RingState::ShutDown => Err(SecError::NotInitialized),
        }
    }

    /// Checks that `n` consecutive slots are free and returns the first.
    ///
    /// Nothing is visible to the hardware until [`Self::commit`].
    fn reserve(&self, n: u32) -> SecResult<u32> {
        self.check_started()?;
        if self.count() + n > self.usable_depth() {
            return Err(SecError::RingFull);
        }
        Ok(self.producer.0.load(Ordering::Relaxed))
    }

    /// Slot `offset` places after `start`, masked.
    #[inline]
    fn slot_after(&self, start: u32, offset: u32) -> u32 {
        start.wrapping_add(offset) & self.mask
    }

    /// Builds and submits the descriptors of one packet.
    ///
    /// Every check runs before anything is written: on error the context,
    /// the ring indices and the hardware are untouched. A two-pass packet
    /// takes two consecutive slots sharing the first slot's IV scratch.
    pub(crate) fn submit_packet<T: AddressTranslator + ?Sized>(
        &mut self,
        handle: ContextHandle,
        input: LogicalPacket,
        output: LogicalPacket,
        user_tag: u64,
        hfn_override: Option<u32>,
        translator: &T,
    ) -> SecResult<()> {
        self.check_started()?;
        input.validate("input")?;
        output.validate("output")?;
        let n = self
            .pool
            .get_for_submit(handle)?
            .descriptor()
            .plan()
            .descriptor_count() as u32;
        let start = self.reserve(n)?;
        let mask = self.mask;

        let ctx = self.pool.get_for_submit(handle)?;
        let template = ctx.descriptor();
        let out_len = template.check_lengths(&input, &output)?;
        if let Some(hfn) = hfn_override {
            if !template.allows_hfn_override() {
                return Err(SecError::InvalidInput(
                    "context does not accept HFN overrides".into(),
                ));
            }
            if hfn > template.sn_size().max_hfn() {
                return Err(SecError::InvalidInput(format!(
                    "HFN override {hfn:#x} exceeds {} bits",
                    32 - template.sn_size().bits()
                )));
            }
        }
        let sn = template.extract_sn(&input)?;
        let step = template.next_count(ctx.hfn(), ctx.last_sn(), sn, hfn_override);

        let first = start as usize;
        write_iv(template, &mut self.scratch[first], step.count);
        let scratch_phys = self.scratch.phys_of(first);
        let mut in_len = input.total_length();
        let mut last = first;
        for (k, pass) in template.plan().passes().iter().enumerate() {
            let slot = (start.wrapping_add(k as u32) & mask) as usize;
            let view = JobView {
                desc: &mut self.descriptors[slot],
                scratch_phys,
                sg: &mut self.jobs[slot].sg,
            };
            in_len =
                update_packet_descriptor(template, pass, view, &input, &output, in_len, translator)?;
            if step.overridden {
                self.descriptors[slot].add_flags(DescriptorFlags::HFN_OVERRIDE);
            }
            last = slot;
        }

        if ctx.commit(&step) {
            warn!(
                "ring {}: context {} reached HFN threshold ({:#x})",
                self.params.id,
                handle.index(),
                step.hfn
            );
        }
        if step.rolled_over {
            debug!(
                "ring {}: context {} HFN now {:#x}",
                self.params.id,
                handle.index(),
                step.hfn
            );
        }
        if n == 2 {
            self.jobs[first].set_role(JobRole::FirstOfTwo);
            self.jobs[last].set_role(JobRole::SecondOfTwo);
        }
        self.jobs[last].attach(
            handle,
            input,
            output,
            user_tag,
            out_len,
            step.threshold_reached,
        );
        self.commit(n);
        Ok(())
    }

    /// Hands `n` reserved slots to the hardware.
    fn commit(&mut self, n: u32) {
        let start = self.producer.0.load(Ordering::Relaxed);
        for k in 0..n {
            let idx = self.slot_after(start, k) as usize;
            let phys = self.descriptors.phys_of(idx);
            self.input_ring.write_volatile(idx, phys);
        }
        // Descriptors and ring entries must be visible before the doorbell.
        fence(Ordering::Release);
        let next = self.slot_after(start, n);
        self.producer.0.store(next, Ordering::Release);
        self.registers.write(Register::InputJobsAdded, n);
        trace!("ring {}: enqueued {} job(s) at slot {}", self.id(), n, start);
    }

    /// Submits a raw descriptor in the next slot.
    pub fn enqueue(&mut self, desc: &JobDescriptor) -> SecResult<SlotHandle> {
        let slot = self.reserve(1)?;
        self.descriptors[slot as usize] = *desc;
        self.jobs[slot as usize].detach();
        self.commit(1);
        Ok(SlotHandle(slot))
    }

    /// Drains the oldest completed packet, if any.
    ///
    /// The first descriptor of a two-pass packet is consumed silently; its
    /// status is carried to the second.
    pub fn dequeue_completed(&mut self) -> SecResult<Option<Completion>> {
        self.check_started()?;
        while !self.is_empty() && self.registers.read(Register::OutputSlotsFull) > 0 {
            let idx = self.consumer.0.load(Ordering::Relaxed);
            let entry = self.output_ring.read_volatile(idx as usize);
            fence(Ordering::Acquire);
            if entry.desc_addr != self.descriptors.phys_of(idx as usize) {
                error!(
                    "ring {}: completion for {:#x}, expected slot {} at {:#x}",
                    self.id(),
                    entry.desc_addr,
                    idx,
                    self.descriptors.phys_of(idx as usize)
                );
                return Err(SecError::ProcessingError { code: entry.status });
            }
            self.registers.write(Register::OutputJobsRemoved, 1);
            let next = self.slot_after(idx, 1);
            self.consumer.0.store(next, Ordering::Release);
            trace!(
                "ring {}: dequeued slot {} status {:#x}",
                self.id(),
                idx,
                entry.status
            );

            let job = &mut self.jobs[idx as usize];
            if job.role != JobRole::FirstOfTwo {
                return Ok(Some(job.take(idx, entry.status)));
            }
            job.detach();
            if entry.status != 0 {
                self.jobs[next as usize].carried_status = entry.status;
            }
        }
        Ok(None)
    }

    /// Ring-level error reported by the hardware, as the raw interrupt
    /// status word.
    pub fn pending_error(&self) -> Option<u32> {
        let status = self.registers.read(Register::InterruptStatus);
        RingInterrupt::from_bits_truncate(status)
            .contains(RingInterrupt::ERROR)
            .then_some(status)
    }

    /// Takes every packet still in flight, oldest first, with `status`.
    pub fn flush(&mut self, status: u32, mut f: impl FnMut(Completion)) {
        let mut idx = self.consumer.0.load(Ordering::Relaxed);
        let end = self.producer.0.load(Ordering::Relaxed);
        while idx != end {
            let job = &mut self.jobs[idx as usize];
            if job.role == JobRole::FirstOfTwo {
                job.detach();
            } else {
                job.carried_status = 0;
                f(job.take(idx, status));
            }
            idx = self.slot_after(idx, 1);
        }
        self.consumer.0.store(end, Ordering::Release);
    }

    fn wait_for(
        &self,
        clock: &dyn Clock,
        deadline: u64,
        done: impl Fn(&dyn JobRingRegisters) -> bool,
    ) -> SecResult<()> {
        loop {
            if done(self.registers.as_ref()) {
                return Ok(());
            }
            if clock.now_micros() >= deadline {
                return Err(SecError::ResetTimeout { ring: self.id() });
            }
            clock.relax();
        }
    }

    /// Resets the hardware ring and clears both indices.
    ///
    /// Slots still in flight must have been flushed. On timeout the ring is
    /// left [`RingState::ShutDown`].
    pub fn reset(&mut self, clock: &dyn Clock, timeout_micros: u64) -> SecResult<()> {
        self.state = RingState::Resetting;
        let ring = scopeguard::guard(self, |r| {
            r.state = RingState::ShutDown;
            error!("ring {}: reset failed, ring shut down", r.id());
        });
        let deadline = clock.now_micros().saturating_add(timeout_micros);

        ring.registers.write(Register::Command, RING_CMD_RESET);
        ring.wait_for(clock, deadline, |r| {
            RingInterrupt::from_bits_truncate(r.read(Register::InterruptStatus))
                .contains(RingInterrupt::HALT_COMPLETE)
        })?;
        ring.registers.write(Register::Command, RING_CMD_RESET);
        ring.wait_for(clock, deadline, |r| {
            r.read(Register::Command) & RING_CMD_RESET == 0
        })?;

        let ring = ScopeGuard::into_inner(ring);
        ring.program();
        ring.producer.0.store(0, Ordering::Release);
        ring.consumer.0.store(0, Ordering::Release);
        for job in &mut ring.jobs {
            job.detach();
        }
        ring.state = RingState::Started;
        info!("ring {}: reset complete", ring.id());
        Ok(())
    }

    fn apply_mode(&mut self, mode: StartupMode) -> SecResult<()> {
        match mode {
            StartupMode::Polling => self.interrupts.disable()?,
            StartupMode::Interrupt | StartupMode::Napi => self.interrupts.enable()?,
        }
        self.params.mode = mode;
        Ok(())
    }

    /// Switch the interrupt mode.
    pub fn set_mode(&mut self, mode: StartupMode) -> SecResult<()> {
        self.check_started()?;
        self.apply_mode(mode)
    }

    /// Re-arm the ring interrupt after the ring was drained.
    pub(crate) fn rearm(&self) -> SecResult<()> {
        match self.params.mode {
            StartupMode::Polling => Ok(()),
            StartupMode::Interrupt | StartupMode::Napi => self.interrupts.enable(),
        }
    }

    /// Discard everything in flight and stop the ring.
    pub fn shutdown(&mut self) {
        let mut dropped = 0usize;
        self.flush(0, |_| dropped += 1);
        if dropped > 0 {
            warn!("ring {}: discarded {} job(s) in flight", self.id(), dropped);
        }
        if let Err(e) = self.interrupts.disable() {
            warn!("ring {}: interrupt disable failed: {}", self.id(), e);
        }
        self.pool.clear();
        self.state = RingState::ShutDown;
    }
}

impl std::fmt::Debug for JobRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRing")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("capacity", &self.params.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
