// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Driver facade and per-ring handles.

use crate::config::{SecConfig, StartupMode};
use crate::context::{ContextHandle, ContextPool, ContextState, DeletionOutcome, PdcpContext};
use crate::error::{track, SecError, SecResult};
use crate::hw::{InterruptControl, JobRingRegisters};
use crate::pdcp::{build_context_descriptor, PdcpConfig};
use crate::poll::{self, Callback, Limit, Notification, PollAction, ResetPolicy};
use crate::ring::{JobRing, RingParams, RingStats};
use crate::sg::LogicalPacket;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};

/// Job rings provided by the accelerator.
pub const MAX_JOB_RINGS: usize = 4;

/// Identifies one job ring of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RingId(pub u8);

/// Register page and interrupt control of one job ring.
pub struct RingBackend {
    registers: Box<dyn JobRingRegisters>,
    interrupts: Box<dyn InterruptControl>,
}

impl RingBackend {
    /// Combine a register backend with its interrupt control.
    pub fn new<R, I>(registers: R, interrupts: I) -> Self
    where
        R: JobRingRegisters + 'static,
        I: InterruptControl + 'static,
    {
        Self {
            registers: Box::new(registers),
            interrupts: Box::new(interrupts),
        }
    }
}

impl std::fmt::Debug for RingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBackend")
            .field("event_fd", &self.interrupts.event_fd())
            .finish_non_exhaustive()
    }
}

/// A ring handed out by [`SecDriver::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingDescriptor {
    /// Ring to pass to ring-level operations.
    pub id: RingId,
    /// Descriptor to wait on in interrupt modes, if any.
    pub event_fd: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Running,
    Releasing,
    Released,
}

const FATAL_KIND_SHIFT: u32 = 32;
const FATAL_CONTROLLER: u64 = 1 << FATAL_KIND_SHIFT;
const FATAL_RESET_TIMEOUT: u64 = 2 << FATAL_KIND_SHIFT;

/// Driver-wide fatal error, latched by whichever ring hits it first.
///
/// Zero while healthy; otherwise the kind in the upper word and the status
/// code or ring index in the lower word.
#[derive(Debug, Default)]
struct FatalLatch(AtomicU64);

impl FatalLatch {
    fn check(&self) -> SecResult<()> {
        let word = self.0.load(Ordering::Acquire);
        match word & !0xFFFF_FFFF {
            0 => Ok(()),
            FATAL_CONTROLLER => Err(SecError::ProcessingError { code: word as u32 }),
            _ => Err(SecError::ResetTimeout { ring: word as u8 }),
        }
    }

    fn note(&self, err: &SecError) {
        let word = match *err {
            SecError::ProcessingError { code } => FATAL_CONTROLLER | code as u64,
            SecError::ResetTimeout { ring } => FATAL_RESET_TIMEOUT | ring as u64,
            _ => return,
        };
        if self
            .0
            .compare_exchange(0, word, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            error!("sec: fatal error ({}), only release is possible", err);
        }
    }
}

/// Exclusive access to one job ring.
///
/// Obtained from [`SecDriver::split`]. The holder is the ring's only
/// producer and only consumer. Handles are `Send`, so each ring can be
/// driven from its own thread; they borrow the driver, which cannot be
/// released while any handle is alive.
pub struct RingHandle<'d> {
    ring: &'d mut JobRing,
    config: &'d SecConfig,
    fatal: &'d FatalLatch,
}

impl RingHandle<'_> {
    /// Ring this handle drives.
    pub fn id(&self) -> RingId {
        RingId(self.ring.id())
    }

    /// Descriptor to wait on in interrupt modes, if any.
    pub fn event_fd(&self) -> Option<i32> {
        self.ring.event_fd()
    }

    /// Create a context on this ring.
    pub fn create_context(&mut self, cfg: &PdcpConfig) -> SecResult<ContextHandle> {
        track(self.create(cfg))
    }

    fn create(&mut self, cfg: &PdcpConfig) -> SecResult<ContextHandle> {
        self.fatal.check()?;
        let pool = self.ring.pool();
        if pool.in_use() == pool.capacity() {
            return Err(SecError::NoFreeContexts);
        }
        let descriptor = build_context_descriptor(cfg, &self.config.memory)?;
        let handle = self
            .ring
            .pool_mut()
            .insert(PdcpContext::new(descriptor, cfg.hfn))?;
        debug!(
            "ring {}: context {} created ({:?}, {:?}, {} / {})",
            self.ring.id(),
            handle.index(),
            cfg.protocol,
            cfg.operation,
            cfg.cipher,
            cfg.integrity
        );
        Ok(handle)
    }

    /// Request deletion of a context of this ring.
    ///
    /// With packets in flight the context stops accepting new packets and
    /// is freed after its [`PacketStatus::LastOverdue`](crate::PacketStatus::LastOverdue)
    /// notification.
    pub fn delete_context(&mut self, handle: ContextHandle) -> SecResult<DeletionOutcome> {
        track(self.delete(handle))
    }

    fn delete(&mut self, handle: ContextHandle) -> SecResult<DeletionOutcome> {
        self.fatal.check()?;
        let outcome = self.ring.pool_mut().delete(handle)?;
        debug!(
            "ring {}: context {} deletion: {:?}",
            self.ring.id(),
            handle.index(),
            outcome
        );
        Ok(outcome)
    }

    /// Lifecycle state of a context of this ring.
    pub fn context_state(&self, handle: ContextHandle) -> SecResult<ContextState> {
        track(self.ring.pool().state(handle))
    }

    /// Stored HFN of a context of this ring.
    pub fn context_hfn(&self, handle: ContextHandle) -> SecResult<u32> {
        track(self.ring.pool().get(handle).map(PdcpContext::hfn))
    }

    /// Submit one packet.
    ///
    /// The buffers described by `input` and `output` must stay valid until
    /// the packet is notified or the driver is released.
    pub fn process_packet(
        &mut self,
        handle: ContextHandle,
        input: LogicalPacket,
        output: LogicalPacket,
        user_tag: u64,
    ) -> SecResult<()> {
        track(self.submit(handle, input, output, user_tag, None))
    }

    /// Submit one packet with COUNT built from `hfn` instead of the
    /// context's stored HFN. The stored HFN and SN are left unchanged.
    pub fn process_packet_with_hfn(
        &mut self,
        handle: ContextHandle,
        input: LogicalPacket,
        output: LogicalPacket,
        user_tag: u64,
        hfn: u32,
    ) -> SecResult<()> {
        track(self.submit(handle, input, output, user_tag, Some(hfn)))
    }

    fn submit(
        &mut self,
        handle: ContextHandle,
        input: LogicalPacket,
        output: LogicalPacket,
        user_tag: u64,
        hfn: Option<u32>,
    ) -> SecResult<()> {
        self.fatal.check()?;
        let memory = &self.config.memory;
        self.ring
            .submit_packet(handle, input, output, user_tag, hfn, &**memory)
    }

    /// Drain this ring. `limit` as for [`SecDriver::poll`].
    pub fn poll<F>(&mut self, limit: i32, mut on_packet: F) -> SecResult<usize>
    where
        F: FnMut(&Notification<'_>) -> PollAction,
    {
        track(self.poll_with(limit, &mut on_packet))
    }

    fn poll_with(&mut self, limit: i32, on_packet: &mut Callback<'_>) -> SecResult<usize> {
        self.fatal.check()?;
        let limit = Limit::from_raw(limit)?;
        poll::poll_ring(self.ring, limit, reset_policy(self.config), on_packet)
            .map(|outcome| outcome.delivered)
            .inspect_err(|e| self.fatal.note(e))
    }

    /// Index snapshot of this ring.
    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }

    /// Switch this ring between polling and interrupt-driven operation.
    pub fn set_mode(&mut self, mode: StartupMode) -> SecResult<()> {
        track(self.apply_mode(mode))
    }

    fn apply_mode(&mut self, mode: StartupMode) -> SecResult<()> {
        self.fatal.check()?;
        self.ring.set_mode(mode)?;
        debug!("ring {}: mode {:?}", self.ring.id(), mode);
        Ok(())
    }
}

impl std::fmt::Debug for RingHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingHandle")
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}

fn reset_policy(config: &SecConfig) -> ResetPolicy<'_> {
    ResetPolicy {
        clock: &*config.clock,
        timeout_micros: config.reset_timeout.as_micros() as u64,
    }
}

/// User-space driver for the accelerator's job rings.
///
/// Owns the rings, their context pools and all DMA memory taken at
/// initialization. Operations on the driver take `&mut self`; to drive
/// rings from several threads, [`split`](Self::split) it into one
/// [`RingHandle`] per ring.
///
/// ```rust
/// use sec_pdcp::sim::SimulatedRing;
/// use sec_pdcp::{
///     Direction, HeapMemory, NoInterrupts, OperationType, PdcpConfig, RingBackend,
///     SecConfig, SecDriver, SnSize,
/// };
/// use std::sync::Arc;
///
/// let memory = Arc::new(HeapMemory);
/// let sim = SimulatedRing::new(memory.clone());
/// let (mut driver, rings) = SecDriver::init(
///     SecConfig::new(memory).with_ring_size(64),
///     vec![RingBackend::new(sim, NoInterrupts)],
/// )?;
/// let cfg = PdcpConfig::data_plane(SnSize::Bits12, OperationType::Encapsulate, Direction::Uplink);
/// let ctx = driver.create_context(Some(rings[0].id), &cfg)?;
/// assert_eq!(driver.context_hfn(ctx)?, 0);
/// driver.release()?;
/// # Ok::<(), sec_pdcp::SecError>(())
/// ```
pub struct SecDriver {
    config: SecConfig,
    rings: Vec<JobRing>,
    state: DriverState,
    fatal: FatalLatch,
    next_ring: usize,
    next_poll: usize,
}

impl SecDriver {
    /// Program one job ring per backend and split the context budget
    /// evenly across them.
    pub fn init(
        config: SecConfig,
        backends: Vec<RingBackend>,
    ) -> SecResult<(Self, Vec<RingDescriptor>)> {
        track(Self::init_rings(config, backends))
    }

    fn init_rings(
        config: SecConfig,
        backends: Vec<RingBackend>,
    ) -> SecResult<(Self, Vec<RingDescriptor>)> {
        let count = backends.len();
        if count == 0 {
            return Err(SecError::InvalidInput("at least one job ring required".into()));
        }
        if count > MAX_JOB_RINGS {
            return Err(SecError::TooManyRings {
                requested: count,
                max: MAX_JOB_RINGS,
            });
        }
        config.validate(count)?;
        let contexts = config.contexts_per_ring(count);

        let rings = backends
            .into_iter()
            .enumerate()
            .map(|(i, backend)| {
                let params = RingParams {
                    id: i as u8,
                    capacity: config.ring_size,
                    headroom: config.ring_headroom,
                    irq_config: config.irq_config(),
                    mode: config.mode,
                };
                JobRing::new(
                    params,
                    &config.memory,
                    backend.registers,
                    backend.interrupts,
                    ContextPool::new(i as u8, contexts),
                )
            })
            .collect::<SecResult<Vec<_>>>()?;
        let descriptors = rings
            .iter()
            .map(|r| RingDescriptor {
                id: RingId(r.id()),
                event_fd: r.event_fd(),
            })
            .collect();

        info!(
            "sec: {} job ring(s), {} slots each ({} usable), {} contexts per ring, {:?} mode",
            count,
            config.ring_size,
            config.ring_size - 1 - config.ring_headroom,
            contexts,
            config.mode
        );
        let driver = Self {
            config,
            rings,
            state: DriverState::Running,
            fatal: FatalLatch::default(),
            next_ring: 0,
            next_poll: 0,
        };
        Ok((driver, descriptors))
    }

    fn check_initialized(&self) -> SecResult<()> {
        match self.state {
            DriverState::Running => Ok(()),
            DriverState::Releasing => Err(SecError::Releasing),
            DriverState::Released => Err(SecError::NotInitialized),
        }
    }

    fn check_usable(&self) -> SecResult<()> {
        self.check_initialized()?;
        self.fatal.check()
    }

    fn ring_index(&self, ring: RingId) -> SecResult<usize> {
        let index = ring.0 as usize;
        if index < self.rings.len() {
            Ok(index)
        } else {
            Err(SecError::InvalidHandle)
        }
    }

    fn context_ring(&self, handle: ContextHandle) -> SecResult<usize> {
        self.ring_index(RingId(handle.ring()))
    }

    fn handle(&mut self, index: usize) -> RingHandle<'_> {
        RingHandle {
            ring: &mut self.rings[index],
            config: &self.config,
            fatal: &self.fatal,
        }
    }

    /// Number of job rings.
    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    /// One exclusive handle per ring, in ring order.
    ///
    /// A fatal error seen through any handle is seen by all of them and by
    /// the driver.
    pub fn split(&mut self) -> SecResult<Vec<RingHandle<'_>>> {
        track(self.check_initialized())?;
        let (config, fatal) = (&self.config, &self.fatal);
        Ok(self
            .rings
            .iter_mut()
            .map(|ring| RingHandle {
                ring,
                config,
                fatal,
            })
            .collect())
    }

    /// Discard every packet in flight without notification and stop all
    /// rings. Only [`Drop`] is meaningful afterwards.
    pub fn release(&mut self) -> SecResult<()> {
        track(self.release_rings())
    }

    fn release_rings(&mut self) -> SecResult<()> {
        self.check_initialized()?;
        self.state = DriverState::Releasing;
        for ring in &mut self.rings {
            ring.shutdown();
        }
        self.state = DriverState::Released;
        info!("sec: released {} job ring(s)", self.rings.len());
        Ok(())
    }

    /// Create a context on `ring`, or on the next ring in turn.
    pub fn create_context(
        &mut self,
        ring: Option<RingId>,
        cfg: &PdcpConfig,
    ) -> SecResult<ContextHandle> {
        track(self.create(ring, cfg))
    }

    fn create(&mut self, ring: Option<RingId>, cfg: &PdcpConfig) -> SecResult<ContextHandle> {
        self.check_usable()?;
        let index = match ring {
            Some(id) => self.ring_index(id)?,
            None => {
                let index = self.next_ring % self.rings.len();
                self.next_ring = (index + 1) % self.rings.len();
                index
            }
        };
        self.handle(index).create(cfg)
    }

    /// Request deletion of a context.
    ///
    /// See [`RingHandle::delete_context`].
    pub fn delete_context(&mut self, handle: ContextHandle) -> SecResult<DeletionOutcome> {
        track(self.delete(handle))
    }

    fn delete(&mut self, handle: ContextHandle) -> SecResult<DeletionOutcome> {
        self.check_usable()?;
        let index = self.context_ring(handle)?;
        self.handle(index).delete(handle)
    }

    /// Lifecycle state of a context.
    pub fn context_state(&self, handle: ContextHandle) -> SecResult<ContextState> {
        track(
            self.check_initialized()
                .and_then(|()| self.context_ring(handle))
                .and_then(|index| self.rings[index].pool().state(handle)),
        )
    }

    /// Stored HFN of a context.
    pub fn context_hfn(&self, handle: ContextHandle) -> SecResult<u32> {
        track(
            self.check_initialized()
                .and_then(|()| self.context_ring(handle))
                .and_then(|index| self.rings[index].pool().get(handle))
                .map(PdcpContext::hfn),
        )
    }

    /// Submit one packet.
    ///
    /// The buffers described by `input` and `output` must stay valid until
    /// the packet is notified or the driver is released.
    pub fn process_packet(
        &mut self,
        handle: ContextHandle,
        input: LogicalPacket,
        output: LogicalPacket,
        user_tag: u64,
    ) -> SecResult<()> {
        track(self.submit(handle, input, output, user_tag, None))
    }

    /// Submit one packet with COUNT built from `hfn` instead of the
    /// context's stored HFN. The stored HFN and SN are left unchanged.
    pub fn process_packet_with_hfn(
        &mut self,
        handle: ContextHandle,
        input: LogicalPacket,
        output: LogicalPacket,
        user_tag: u64,
        hfn: u32,
    ) -> SecResult<()> {
        track(self.submit(handle, input, output, user_tag, Some(hfn)))
    }

    fn submit(
        &mut self,
        handle: ContextHandle,
        input: LogicalPacket,
        output: LogicalPacket,
        user_tag: u64,
        hfn: Option<u32>,
    ) -> SecResult<()> {
        self.check_usable()?;
        let index = self.context_ring(handle)?;
        self.handle(index)
            .submit(handle, input, output, user_tag, hfn)
    }

    /// Poll every ring with weighted round-robin.
    ///
    /// `limit` bounds the packets delivered (negative: until no ring has
    /// completions; zero is invalid). Each ring delivers at most `weight`
    /// packets per turn; `weight` must be positive and below a positive
    /// `limit`. Returns the number of packets delivered.
    pub fn poll<F>(&mut self, limit: i32, weight: u32, mut on_packet: F) -> SecResult<usize>
    where
        F: FnMut(&Notification<'_>) -> PollAction,
    {
        track(self.poll_all(limit, weight, &mut on_packet))
    }

    fn poll_all(&mut self, limit: i32, weight: u32, on_packet: &mut Callback<'_>) -> SecResult<usize> {
        self.check_usable()?;
        let limit = Limit::from_raw(limit)?;
        let weight = weight as usize;
        let weight_ok = match limit {
            Limit::Unbounded => weight > 0,
            Limit::Packets(n) => weight > 0 && weight < n,
        };
        if !weight_ok {
            return Err(SecError::InvalidInput(format!(
                "weight {weight} not valid for limit {limit:?}"
            )));
        }
        let result = poll::poll_rings(
            &mut self.rings,
            self.next_poll,
            limit,
            weight,
            reset_policy(&self.config),
            on_packet,
        );
        match result {
            Ok((outcome, next)) => {
                self.next_poll = next;
                Ok(outcome.delivered)
            }
            Err(e) => {
                self.fatal.note(&e);
                Err(e)
            }
        }
    }

    /// Poll one ring. `limit` as for [`Self::poll`].
    pub fn poll_ring<F>(&mut self, ring: RingId, limit: i32, mut on_packet: F) -> SecResult<usize>
    where
        F: FnMut(&Notification<'_>) -> PollAction,
    {
        track(self.poll_one(ring, limit, &mut on_packet))
    }

    fn poll_one(
        &mut self,
        ring: RingId,
        limit: i32,
        on_packet: &mut Callback<'_>,
    ) -> SecResult<usize> {
        self.check_usable()?;
        let index = self.ring_index(ring)?;
        self.handle(index).poll_with(limit, on_packet)
    }

    /// Index snapshot of a ring.
    pub fn stats(&self, ring: RingId) -> SecResult<RingStats> {
        track(
            self.check_initialized()
                .and_then(|()| self.ring_index(ring))
                .map(|index| self.rings[index].stats()),
        )
    }

    /// Switch a ring between polling and interrupt-driven operation.
    pub fn set_ring_mode(&mut self, ring: RingId, mode: StartupMode) -> SecResult<()> {
        track(self.set_mode(ring, mode))
    }

    fn set_mode(&mut self, ring: RingId, mode: StartupMode) -> SecResult<()> {
        self.check_usable()?;
        let index = self.ring_index(ring)?;
        self.handle(index).apply_mode(mode)
    }
}

impl Drop for SecDriver {
    fn drop(&mut self) {
        if self.state == DriverState::Running {
            if let Err(e) = self.release_rings() {
                warn!("sec: release on drop failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for SecDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecDriver")
            .field("state", &self.state)
            .field("fatal", &self.fatal)
            .field("rings", &self.rings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::last_error;
    use crate::hw::{ring_error_status, DmaMemory, HeapMemory, NoInterrupts, RING_ERR_FATAL};
    use crate::opcode::{CipherAlgorithm, IntegrityAlgorithm, OperationType};
    use crate::pdcp::{Direction, KeyMaterial, SnSize};
    use crate::poll::PacketStatus;
    use crate::sg::Fragment;
    use crate::sim::{FakeClock, SimulatedRing};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    static CIPHER_KEY: [u8; 16] = [
        0xD3, 0xC5, 0xD5, 0x92, 0x32, 0x7F, 0xB1, 0x1C, 0x40, 0x35, 0xC6, 0x68, 0x0A, 0xF8,
        0xC6, 0xD1,
    ];
    static AUTH_KEY: [u8; 16] = [
        0x2B, 0xD6, 0x45, 0x9F, 0x82, 0xC5, 0xB3, 0x00, 0x95, 0x2C, 0x49, 0x10, 0x48, 0x81,
        0xFF, 0x48,
    ];

    struct Setup {
        driver: SecDriver,
        rings: Vec<RingId>,
        sims: Vec<SimulatedRing>,
    }

    fn setup_with(ring_count: usize, config: impl FnOnce(SecConfig) -> SecConfig) -> Setup {
        let memory: Arc<dyn DmaMemory> = Arc::new(HeapMemory);
        let sims: Vec<_> = (0..ring_count)
            .map(|_| SimulatedRing::new(Arc::clone(&memory)))
            .collect();
        let backends = sims
            .iter()
            .map(|s| RingBackend::new(s.clone(), NoInterrupts))
            .collect();
        let cfg = config(
            SecConfig::new(memory)
                .with_ring_size(32)
                .with_max_contexts(16 * ring_count as u32)
                .with_clock(Arc::new(FakeClock::new(10))),
        );
        let (driver, descriptors) = SecDriver::init(cfg, backends).unwrap();
        Setup {
            driver,
            rings: descriptors.iter().map(|d| d.id).collect(),
            sims,
        }
    }

    fn setup(ring_count: usize) -> Setup {
        setup_with(ring_count, |c| c)
    }

    fn packet(buf: &mut [u8]) -> LogicalPacket {
        LogicalPacket::contiguous(unsafe { Fragment::new(buf.as_mut_ptr(), 0, buf.len() as u32) })
    }

    fn fragments(bufs: &mut [Vec<u8>]) -> Vec<Fragment> {
        bufs.iter_mut()
            .map(|b| unsafe { Fragment::new(b.as_mut_ptr(), 0, b.len() as u32) })
            .collect()
    }

    /// 12-bit SN data PDU: D/C bit, SN, payload.
    fn pdu12(sn: u32, payload_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; 2 + payload_len];
        buf[0] = 0x80 | ((sn >> 8) & 0x0F) as u8;
        buf[1] = sn as u8;
        for (i, b) in buf[2..].iter_mut().enumerate() {
            *b = i as u8;
        }
        buf
    }

    fn snow_data_plane(op: OperationType) -> PdcpConfig {
        PdcpConfig::data_plane(SnSize::Bits12, op, Direction::Downlink)
            .with_bearer(3)
            .with_cipher(
                CipherAlgorithm::Snow,
                Some(KeyMaterial::from_static(&CIPHER_KEY)),
            )
    }

    fn control_plane(
        op: OperationType,
        cipher: CipherAlgorithm,
        integrity: IntegrityAlgorithm,
    ) -> PdcpConfig {
        PdcpConfig::control_plane(op, Direction::Uplink)
            .with_bearer(1)
            .with_cipher(cipher, Some(KeyMaterial::from_static(&CIPHER_KEY)))
            .with_integrity(integrity, Some(KeyMaterial::from_static(&AUTH_KEY)))
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        ring: u8,
        tag: u64,
        status: PacketStatus,
        error_info: u32,
        output_len: u32,
    }

    fn collect(seen: &mut Vec<Seen>) -> impl FnMut(&Notification<'_>) -> PollAction + '_ {
        move |n| {
            seen.push(Seen {
                ring: n.context.ring(),
                tag: n.user_tag,
                status: n.status,
                error_info: n.error_info,
                output_len: n.output_len,
            });
            PollAction::Continue
        }
    }

    fn last_cipher_count(sim: &SimulatedRing) -> u32 {
        let desc = sim.last_descriptor().unwrap();
        let iv = unsafe { std::slice::from_raw_parts(desc.iv_addr as *const u8, 4) };
        u32::from_be_bytes([iv[0], iv[1], iv[2], iv[3]])
    }

    #[test]
    fn test_init_validation() {
        let memory: Arc<dyn DmaMemory> = Arc::new(HeapMemory);
        let backends = |n: usize| {
            (0..n)
                .map(|_| RingBackend::new(SimulatedRing::new(Arc::clone(&memory)), NoInterrupts))
                .collect::<Vec<_>>()
        };
        let cfg = || SecConfig::new(Arc::clone(&memory)).with_ring_size(16);

        assert!(matches!(
            SecDriver::init(cfg(), backends(0)),
            Err(SecError::InvalidInput(_))
        ));
        assert!(matches!(
            SecDriver::init(cfg(), backends(5)),
            Err(SecError::TooManyRings {
                requested: 5,
                max: 4
            })
        ));
        assert_eq!(last_error(), -10);
        assert!(matches!(
            SecDriver::init(cfg().with_ring_size(12), backends(1)),
            Err(SecError::InvalidConfig(_))
        ));
        let (driver, rings) = SecDriver::init(cfg(), backends(4)).unwrap();
        assert_eq!(driver.ring_count(), 4);
        assert_eq!(rings[3].id, RingId(3));
        assert_eq!(rings[0].event_fd, None);
    }

    #[test]
    fn test_full_exactly_at_usable_depth() {
        let mut s = setup_with(1, |c| c.with_ring_size(8));
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        s.sims[0].pause();

        let mut bufs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..7).map(|i| (pdu12(i, 16), vec![0u8; 18])).collect();
        for (i, (input, output)) in bufs.iter_mut().enumerate().take(6) {
            s.driver
                .process_packet(ctx, packet(input), packet(output), i as u64)
                .unwrap();
        }
        let (input, output) = &mut bufs[6];
        let err = s
            .driver
            .process_packet(ctx, packet(input), packet(output), 6)
            .unwrap_err();
        assert!(matches!(err, SecError::RingFull));
        assert_eq!(last_error(), SecError::RingFull.code());
        assert_eq!(s.driver.stats(s.rings[0]).unwrap().free_slots, 0);

        s.sims[0].resume();
        let mut seen = Vec::new();
        let n = s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap();
        assert_eq!(n, 6);
        let tags: Vec<u64> = seen.iter().map(|x| x.tag).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4, 5]);
        assert!(seen.iter().all(|x| x.status == PacketStatus::Success));
    }

    #[test]
    fn test_notifications_follow_submission_order() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let mut bufs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..20).map(|i| (pdu12(i, 8), vec![0u8; 10])).collect();

        s.sims[0].pause();
        for (i, (input, output)) in bufs.iter_mut().enumerate().take(10) {
            s.driver
                .process_packet(ctx, packet(input), packet(output), i as u64)
                .unwrap();
        }
        s.sims[0].complete(4);
        let mut seen = Vec::new();
        assert_eq!(s.driver.poll_ring(s.rings[0], 3, collect(&mut seen)).unwrap(), 3);
        s.sims[0].resume();
        for (i, (input, output)) in bufs.iter_mut().enumerate().skip(10) {
            s.driver
                .process_packet(ctx, packet(input), packet(output), i as u64)
                .unwrap();
        }
        s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap();
        let tags: Vec<u64> = seen.iter().map(|x| x.tag).collect();
        assert_eq!(tags, (0..20).collect::<Vec<u64>>());
        assert_eq!(s.driver.stats(s.rings[0]).unwrap().pending, 0);
    }

    #[test]
    fn test_callback_stop_halts_draining() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let mut bufs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..4).map(|i| (pdu12(i, 8), vec![0u8; 10])).collect();
        for (i, (input, output)) in bufs.iter_mut().enumerate() {
            s.driver
                .process_packet(ctx, packet(input), packet(output), i as u64)
                .unwrap();
        }
        let mut calls = 0;
        let n = s
            .driver
            .poll_ring(s.rings[0], -1, |_| {
                calls += 1;
                if calls == 2 {
                    PollAction::Stop
                } else {
                    PollAction::Continue
                }
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(s.driver.stats(s.rings[0]).unwrap().pending, 2);
    }

    #[test]
    fn test_delete_with_one_in_flight_yields_last_overdue() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let (mut input, mut output) = (pdu12(1, 8), vec![0u8; 10]);
        s.sims[0].pause();
        s.driver
            .process_packet(ctx, packet(&mut input), packet(&mut output), 7)
            .unwrap();

        assert_eq!(
            s.driver.delete_context(ctx).unwrap(),
            DeletionOutcome::LastPacketInFlight
        );
        assert_eq!(
            s.driver.context_state(ctx).unwrap(),
            ContextState::MarkedForDeletion
        );
        let (mut input2, mut output2) = (pdu12(2, 8), vec![0u8; 10]);
        assert!(matches!(
            s.driver
                .process_packet(ctx, packet(&mut input2), packet(&mut output2), 8),
            Err(SecError::ContextMarkedForDeletion)
        ));
        assert!(matches!(
            s.driver.delete_context(ctx),
            Err(SecError::ContextMarkedForDeletion)
        ));

        s.sims[0].resume();
        let mut seen = Vec::new();
        s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].tag, 7);
        assert_eq!(seen[0].status, PacketStatus::LastOverdue);
        assert!(matches!(
            s.driver.context_state(ctx),
            Err(SecError::InvalidHandle)
        ));
        assert_eq!(s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap(), 0);
    }

    #[test]
    fn test_delete_with_several_in_flight() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let mut bufs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..3).map(|i| (pdu12(i, 8), vec![0u8; 10])).collect();
        s.sims[0].pause();
        for (i, (input, output)) in bufs.iter_mut().enumerate() {
            s.driver
                .process_packet(ctx, packet(input), packet(output), i as u64)
                .unwrap();
        }
        assert_eq!(
            s.driver.delete_context(ctx).unwrap(),
            DeletionOutcome::PacketsInFlight
        );
        s.sims[0].resume();
        let mut seen = Vec::new();
        s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap();
        let statuses: Vec<PacketStatus> = seen.iter().map(|x| x.status).collect();
        assert_eq!(
            statuses,
            vec![
                PacketStatus::Overdue,
                PacketStatus::Overdue,
                PacketStatus::LastOverdue
            ]
        );
    }

    #[test]
    fn test_context_pool_exhaustion_and_reuse() {
        let mut s = setup_with(1, |c| c.with_max_contexts(4));
        let cfg = snow_data_plane(OperationType::Encapsulate);
        let handles: Vec<_> = (0..4)
            .map(|_| s.driver.create_context(None, &cfg).unwrap())
            .collect();
        assert!(matches!(
            s.driver.create_context(None, &cfg),
            Err(SecError::NoFreeContexts)
        ));
        assert_eq!(last_error(), SecError::NoFreeContexts.code());

        assert_eq!(
            s.driver.delete_context(handles[2]).unwrap(),
            DeletionOutcome::Done
        );
        assert!(matches!(
            s.driver.context_hfn(handles[2]),
            Err(SecError::InvalidHandle)
        ));
        let reused = s.driver.create_context(None, &cfg).unwrap();
        assert_eq!(reused.index(), handles[2].index());
        assert_ne!(reused, handles[2]);
        assert_eq!(s.driver.context_state(reused).unwrap(), ContextState::Used);
    }

    #[test]
    fn test_round_robin_context_placement() {
        let mut s = setup(3);
        let cfg = snow_data_plane(OperationType::Encapsulate);
        let rings: Vec<u8> = (0..4)
            .map(|_| s.driver.create_context(None, &cfg).unwrap().ring())
            .collect();
        assert_eq!(rings, vec![0, 1, 2, 0]);
        let pinned = s.driver.create_context(Some(s.rings[2]), &cfg).unwrap();
        assert_eq!(pinned.ring(), 2);
        assert!(matches!(
            s.driver.create_context(Some(RingId(3)), &cfg),
            Err(SecError::InvalidHandle)
        ));
    }

    #[test]
    fn test_snow_downlink_iv_carries_hfn() {
        let mut s = setup(1);
        let cfg = snow_data_plane(OperationType::Encapsulate).with_hfn(0xFA556, 0xFFFFF);
        let ctx = s.driver.create_context(None, &cfg).unwrap();
        let mut input = pdu12(0, 32);
        let mut output = vec![0u8; 34];
        s.driver
            .process_packet(ctx, packet(&mut input), packet(&mut output), 0xC0FFEE)
            .unwrap();

        let mut seen = Vec::new();
        let n = s.driver.poll(-1, 1, collect(&mut seen)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, PacketStatus::Success);
        assert_eq!(seen[0].tag, 0xC0FFEE);
        assert_eq!(seen[0].output_len, 34);
        assert_eq!(last_cipher_count(&s.sims[0]), 0xFA556 << 12);
        assert_eq!(output[..2], input[..2]);
        assert_ne!(output[2..], input[2..]);
    }

    #[test]
    fn test_hfn_rollover_and_threshold() {
        let mut s = setup(1);
        let cfg = PdcpConfig::data_plane(SnSize::Bits7, OperationType::Encapsulate, Direction::Uplink)
            .with_cipher(
                CipherAlgorithm::Snow,
                Some(KeyMaterial::from_static(&CIPHER_KEY)),
            )
            .with_hfn(5, 6);
        let ctx = s.driver.create_context(None, &cfg).unwrap();

        let mut hfns = Vec::new();
        let mut counts = Vec::new();
        let mut seen = Vec::new();
        for (tag, sn) in [125u8, 127, 0, 1, 127, 0].into_iter().enumerate() {
            let mut input = vec![0x80 | sn, 1, 2, 3];
            let mut output = vec![0u8; 4];
            s.driver
                .process_packet(ctx, packet(&mut input), packet(&mut output), tag as u64)
                .unwrap();
            counts.push(last_cipher_count(&s.sims[0]));
            hfns.push(s.driver.context_hfn(ctx).unwrap());
            s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap();
        }
        assert_eq!(hfns, vec![5, 5, 6, 6, 6, 7]);
        assert_eq!(
            counts,
            vec![5 << 7 | 125, 5 << 7 | 127, 6 << 7, 6 << 7 | 1, 6 << 7 | 127, 7 << 7]
        );
        let statuses: Vec<PacketStatus> = seen.iter().map(|x| x.status).collect();
        assert_eq!(
            statuses,
            vec![
                PacketStatus::Success,
                PacketStatus::Success,
                PacketStatus::HfnThresholdReached,
                PacketStatus::HfnThresholdReached,
                PacketStatus::HfnThresholdReached,
                PacketStatus::HfnThresholdReached,
            ]
        );
    }

    #[test]
    fn test_hfn_override_leaves_tracking_alone() {
        let mut s = setup(1);
        let strict = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let flexible = s
            .driver
            .create_context(
                None,
                &snow_data_plane(OperationType::Encapsulate)
                    .with_hfn(2, 0xFFFFF)
                    .with_hfn_override(true),
            )
            .unwrap();
        let mut input = pdu12(9, 8);
        let mut output = vec![0u8; 10];

        assert!(matches!(
            s.driver.process_packet_with_hfn(
                strict,
                packet(&mut input),
                packet(&mut output),
                0,
                0x10
            ),
            Err(SecError::InvalidInput(_))
        ));
        assert!(matches!(
            s.driver.process_packet_with_hfn(
                flexible,
                packet(&mut input),
                packet(&mut output),
                0,
                0x10_0000
            ),
            Err(SecError::InvalidInput(_))
        ));
        s.driver
            .process_packet_with_hfn(flexible, packet(&mut input), packet(&mut output), 1, 0x10)
            .unwrap();
        assert_eq!(last_cipher_count(&s.sims[0]), 0x10 << 12 | 9);
        let desc = s.sims[0].last_descriptor().unwrap();
        assert!(desc
            .flags()
            .contains(crate::descriptor::DescriptorFlags::HFN_OVERRIDE));
        assert_eq!(s.driver.context_hfn(flexible).unwrap(), 2);
    }

    #[test]
    fn test_control_plane_round_trip_and_mac_failure() {
        let mut s = setup(1);
        let enc = s
            .driver
            .create_context(
                None,
                &control_plane(
                    OperationType::Encapsulate,
                    CipherAlgorithm::Snow,
                    IntegrityAlgorithm::Snow,
                ),
            )
            .unwrap();
        let dec = s
            .driver
            .create_context(
                None,
                &control_plane(
                    OperationType::Decapsulate,
                    CipherAlgorithm::Snow,
                    IntegrityAlgorithm::Snow,
                ),
            )
            .unwrap();

        let mut plain: Vec<u8> = vec![0x03, 0xA0, 0xA1, 0xA2, 0xA3, 0xA4];
        let original = plain.clone();
        let mut protected = vec![0u8; plain.len() + 4];
        s.driver
            .process_packet(enc, packet(&mut plain), packet(&mut protected), 1)
            .unwrap();

        let mut recovered = vec![0u8; plain.len()];
        s.driver
            .process_packet(dec, packet(&mut protected), packet(&mut recovered), 2)
            .unwrap();

        let mut tampered = protected.clone();
        tampered[3] ^= 0x01;
        let mut scratch = vec![0u8; plain.len()];
        s.driver
            .process_packet(dec, packet(&mut tampered), packet(&mut scratch), 3)
            .unwrap();

        let mut seen = Vec::new();
        s.driver.poll(-1, 2, collect(&mut seen)).unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].status, PacketStatus::Success);
        assert_eq!(seen[0].output_len, 10);
        assert_eq!(seen[1].status, PacketStatus::Success);
        assert_eq!(seen[1].output_len, 6);
        assert_eq!(recovered, original);
        assert_eq!(seen[2].status, PacketStatus::MacCheckFailed);
        assert_ne!(seen[2].error_info, 0);
    }

    #[test]
    fn test_two_pass_contexts_notify_once() {
        let mut s = setup(1);
        let enc = s
            .driver
            .create_context(
                None,
                &control_plane(
                    OperationType::Encapsulate,
                    CipherAlgorithm::Snow,
                    IntegrityAlgorithm::Aes,
                ),
            )
            .unwrap();
        let dec = s
            .driver
            .create_context(
                None,
                &control_plane(
                    OperationType::Decapsulate,
                    CipherAlgorithm::Snow,
                    IntegrityAlgorithm::Aes,
                ),
            )
            .unwrap();

        let mut plain: Vec<u8> = (0..24).collect();
        plain[0] = 0x11;
        let original = plain.clone();
        let mut protected = vec![0u8; 28];
        s.driver
            .process_packet(enc, packet(&mut plain), packet(&mut protected), 1)
            .unwrap();
        assert_eq!(s.driver.stats(s.rings[0]).unwrap().pending, 2);
        assert_eq!(s.sims[0].processed(), 2);

        let mut seen = Vec::new();
        assert_eq!(s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap(), 1);
        assert_eq!(seen[0].output_len, 28);
        assert_eq!(protected[0], original[0]);

        let mut recovered = vec![0u8; 28];
        s.driver
            .process_packet(dec, packet(&mut protected), packet(&mut recovered), 2)
            .unwrap();
        assert_eq!(s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap(), 1);
        assert_eq!(seen[1].status, PacketStatus::Success);
        assert_eq!(seen[1].output_len, 24);
        assert_eq!(recovered[..24], original[..]);
        assert_eq!(s.sims[0].processed(), 4);
    }

    #[test]
    fn test_scattered_packet_matches_contiguous() {
        let mut s = setup(1);
        let cfg = snow_data_plane(OperationType::Encapsulate);
        let a = s.driver.create_context(None, &cfg).unwrap();
        let b = s.driver.create_context(None, &cfg).unwrap();

        let mut whole = pdu12(5, 30);
        let mut parts: Vec<Vec<u8>> = vec![
            whole[..10].to_vec(),
            whole[10..20].to_vec(),
            whole[20..].to_vec(),
        ];
        let mut out_whole = vec![0u8; 32];
        let mut out_parts = [vec![0u8; 16], vec![0u8; 16]];

        s.driver
            .process_packet(a, packet(&mut whole), packet(&mut out_whole), 0)
            .unwrap();

        let bad = LogicalPacket::scattered(fragments(&mut parts), 31);
        let out = LogicalPacket::scattered(fragments(&mut out_parts), 32);
        assert!(matches!(
            s.driver.process_packet(b, bad, out.clone(), 1),
            Err(SecError::InvalidInput(_))
        ));
        assert_eq!(s.driver.stats(s.rings[0]).unwrap().pending, 1);

        let input = LogicalPacket::scattered(fragments(&mut parts), 32);
        s.driver.process_packet(b, input, out, 1).unwrap();

        let mut seen = Vec::new();
        s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|x| x.status == PacketStatus::Success));
        let joined: Vec<u8> = out_parts.concat();
        assert_eq!(joined, out_whole);
    }

    #[test]
    fn test_weighted_round_robin() {
        let mut s = setup(2);
        let cfg = snow_data_plane(OperationType::Encapsulate);
        let ctxs = [
            s.driver.create_context(Some(s.rings[0]), &cfg).unwrap(),
            s.driver.create_context(Some(s.rings[1]), &cfg).unwrap(),
        ];
        let mut bufs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..30).map(|i| (pdu12(i % 15, 4), vec![0u8; 6])).collect();
        for (i, (input, output)) in bufs.iter_mut().enumerate() {
            let ctx = ctxs[i / 15];
            s.driver
                .process_packet(ctx, packet(input), packet(output), i as u64)
                .unwrap();
        }

        for (limit, weight) in [(0, 5), (5, 5), (10, 0)] {
            assert!(matches!(
                s.driver.poll(limit, weight, |_| PollAction::Continue),
                Err(SecError::InvalidInput(_))
            ));
        }

        let mut seen = Vec::new();
        assert_eq!(s.driver.poll(20, 5, collect(&mut seen)).unwrap(), 20);
        let order: Vec<u8> = seen.iter().map(|x| x.ring).collect();
        let expected: Vec<u8> = [0u8, 1, 0, 1]
            .iter()
            .flat_map(|r| std::iter::repeat(*r).take(5))
            .collect();
        assert_eq!(order, expected);

        assert_eq!(s.driver.poll(-1, 5, collect(&mut seen)).unwrap(), 10);
        assert_eq!(s.driver.poll(-1, 5, collect(&mut seen)).unwrap(), 0);
    }

    #[test]
    fn test_descriptor_error_flushes_and_resets() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let mut bufs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..4).map(|i| (pdu12(i, 8), vec![0u8; 10])).collect();
        s.sims[0].pause();
        s.sims[0].inject_error(0x3);
        for (i, (input, output)) in bufs.iter_mut().enumerate().take(3) {
            s.driver
                .process_packet(ctx, packet(input), packet(output), i as u64)
                .unwrap();
        }
        s.sims[0].resume();

        let mut seen = Vec::new();
        let err = s
            .driver
            .poll_ring(s.rings[0], -1, collect(&mut seen))
            .unwrap_err();
        let code = ring_error_status(0x3);
        assert!(matches!(err, SecError::PacketProcessingError { code: c } if c == code));
        assert_eq!(last_error(), code as i32);
        assert_eq!(seen.len(), 3);
        assert!(seen
            .iter()
            .all(|x| x.status == PacketStatus::Error && x.error_info == code));
        assert_eq!(s.driver.stats(s.rings[0]).unwrap().producer_idx, 0);

        let (input, output) = &mut bufs[3];
        s.driver
            .process_packet(ctx, packet(input), packet(output), 3)
            .unwrap();
        seen.clear();
        assert_eq!(s.driver.poll_ring(s.rings[0], -1, collect(&mut seen)).unwrap(), 1);
        assert_eq!(seen[0].status, PacketStatus::Success);
    }

    #[test]
    fn test_fatal_error_leaves_only_release() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let (mut input, mut output) = (pdu12(0, 8), vec![0u8; 10]);
        s.sims[0].inject_error(RING_ERR_FATAL);
        s.driver
            .process_packet(ctx, packet(&mut input), packet(&mut output), 0)
            .unwrap();

        let code = ring_error_status(RING_ERR_FATAL);
        let err = s.driver.poll(-1, 4, |_| PollAction::Continue).unwrap_err();
        assert!(matches!(err, SecError::ProcessingError { code: c } if c == code));
        assert!(matches!(
            s.driver
                .process_packet(ctx, packet(&mut input), packet(&mut output), 1),
            Err(SecError::ProcessingError { .. })
        ));
        assert!(matches!(
            s.driver.poll_ring(s.rings[0], -1, |_| PollAction::Continue),
            Err(SecError::ProcessingError { .. })
        ));
        s.driver.release().unwrap();
        assert!(matches!(s.driver.release(), Err(SecError::NotInitialized)));
    }

    #[test]
    fn test_reset_timeout_is_fatal() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let (mut input, mut output) = (pdu12(0, 8), vec![0u8; 10]);
        s.sims[0].stall_reset(true);
        s.sims[0].inject_error(0x2);
        s.driver
            .process_packet(ctx, packet(&mut input), packet(&mut output), 0)
            .unwrap();

        let mut seen = Vec::new();
        let err = s
            .driver
            .poll_ring(s.rings[0], -1, collect(&mut seen))
            .unwrap_err();
        assert!(matches!(err, SecError::ResetTimeout { ring: 0 }));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, PacketStatus::Error);
        assert!(matches!(
            s.driver.create_context(None, &snow_data_plane(OperationType::Encapsulate)),
            Err(SecError::ResetTimeout { ring: 0 })
        ));
    }

    #[test]
    fn test_release_discards_in_flight() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let (mut input, mut output) = (pdu12(0, 8), vec![0u8; 10]);
        s.sims[0].pause();
        s.driver
            .process_packet(ctx, packet(&mut input), packet(&mut output), 0)
            .unwrap();
        s.driver.release().unwrap();
        assert!(matches!(
            s.driver.poll(-1, 1, |_| PollAction::Continue),
            Err(SecError::NotInitialized)
        ));
        assert!(matches!(
            s.driver.stats(s.rings[0]),
            Err(SecError::NotInitialized)
        ));
        assert!(matches!(
            s.driver.context_hfn(ctx),
            Err(SecError::NotInitialized)
        ));
    }

    #[test]
    fn test_invalid_input_changes_nothing() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let mut input = pdu12(3, 8);
        let mut short = vec![0u8; 4];
        assert!(matches!(
            s.driver
                .process_packet(ctx, packet(&mut input), packet(&mut short), 0),
            Err(SecError::InvalidInput(_))
        ));
        let empty = LogicalPacket::scattered(Vec::new(), 0);
        assert!(matches!(
            s.driver
                .process_packet(ctx, empty, packet(&mut short), 0),
            Err(SecError::InvalidInput(_))
        ));
        let stats = s.driver.stats(s.rings[0]).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.producer_idx, 0);
        assert_eq!(s.driver.context_state(ctx).unwrap(), ContextState::Used);
    }

    #[derive(Clone, Default)]
    struct CountingIrq {
        enabled: Arc<AtomicUsize>,
        disabled: Arc<AtomicUsize>,
    }

    impl InterruptControl for CountingIrq {
        fn enable(&self) -> SecResult<()> {
            self.enabled.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn disable(&self) -> SecResult<()> {
            self.disabled.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_interrupt_mode_rearms_after_drain() {
        let memory: Arc<dyn DmaMemory> = Arc::new(HeapMemory);
        let sim = SimulatedRing::new(Arc::clone(&memory));
        let irq = CountingIrq::default();
        let (mut driver, rings) = SecDriver::init(
            SecConfig::new(memory)
                .with_ring_size(16)
                .with_mode(StartupMode::Interrupt),
            vec![RingBackend::new(sim, irq.clone())],
        )
        .unwrap();
        assert_eq!(irq.enabled.load(Ordering::Relaxed), 1);

        let ctx = driver
            .create_context(None, &snow_data_plane(OperationType::Encapsulate))
            .unwrap();
        let mut bufs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..3).map(|i| (pdu12(i, 8), vec![0u8; 10])).collect();
        for (i, (input, output)) in bufs.iter_mut().enumerate() {
            driver
                .process_packet(ctx, packet(input), packet(output), i as u64)
                .unwrap();
        }
        assert_eq!(driver.poll_ring(rings[0].id, 2, |_| PollAction::Continue).unwrap(), 2);
        assert_eq!(irq.enabled.load(Ordering::Relaxed), 1);
        assert_eq!(driver.poll_ring(rings[0].id, 2, |_| PollAction::Continue).unwrap(), 1);
        assert_eq!(irq.enabled.load(Ordering::Relaxed), 2);

        driver.set_ring_mode(rings[0].id, StartupMode::Polling).unwrap();
        assert_eq!(irq.disabled.load(Ordering::Relaxed), 1);
        driver.poll_ring(rings[0].id, -1, |_| PollAction::Continue).unwrap();
        assert_eq!(irq.enabled.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_declared_length_beyond_fragments_rejected() {
        let mut s = setup(1);
        let ctx = s
            .driver
            .create_context(
                None,
                &control_plane(
                    OperationType::Encapsulate,
                    CipherAlgorithm::Snow,
                    IntegrityAlgorithm::Snow,
                ),
            )
            .unwrap();
        let mut parts = vec![vec![0u8; 8], vec![0u8; 8]];
        let mut out = vec![0u8; 16];
        let input = LogicalPacket::scattered(fragments(&mut parts), u32::MAX - 1);
        assert!(matches!(
            s.driver.process_packet(ctx, input, packet(&mut out), 0),
            Err(SecError::InvalidInput(_))
        ));
        let stats = s.driver.stats(s.rings[0]).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.producer_idx, 0);
        assert_eq!(s.driver.context_state(ctx).unwrap(), ContextState::Used);
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn test_rings_driven_from_separate_threads() {
        assert_send::<RingHandle<'static>>();
        let mut s = setup(2);
        let handles = s.driver.split().unwrap();
        assert_eq!(handles.len(), 2);

        let mut results: Vec<(RingId, Vec<u64>)> = std::thread::scope(|scope| {
            let workers: Vec<_> = handles
                .into_iter()
                .map(|mut ring| {
                    scope.spawn(move || {
                        let ctx = ring
                            .create_context(&snow_data_plane(OperationType::Encapsulate))
                            .unwrap();
                        let mut bufs: Vec<(Vec<u8>, Vec<u8>)> =
                            (0..40).map(|i| (pdu12(i, 8), vec![0u8; 10])).collect();
                        let mut tags = Vec::new();
                        for (i, (input, output)) in bufs.iter_mut().enumerate() {
                            loop {
                                let (inp, out) = (packet(&mut input[..]), packet(&mut output[..]));
                                match ring.process_packet(ctx, inp, out, i as u64) {
                                    Ok(()) => break,
                                    Err(SecError::RingFull) => {
                                        ring.poll(-1, |n| {
                                            tags.push(n.user_tag);
                                            PollAction::Continue
                                        })
                                        .unwrap();
                                    }
                                    Err(e) => panic!("submit failed: {e}"),
                                }
                            }
                        }
                        ring.poll(-1, |n| {
                            tags.push(n.user_tag);
                            PollAction::Continue
                        })
                        .unwrap();
                        (ring.id(), tags)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        results.sort_by_key(|(id, _)| *id);
        assert_eq!(results[0].0, RingId(0));
        assert_eq!(results[1].0, RingId(1));
        for (id, tags) in &results {
            assert_eq!(tags, &(0..40).collect::<Vec<u64>>());
            let stats = s.driver.stats(*id).unwrap();
            assert_eq!(stats.pending, 0);
            assert_eq!(stats.producer_idx, 40 % 32);
        }
    }

    #[test]
    fn test_fatal_error_through_one_handle_stops_all() {
        let mut s = setup(2);
        let cfg = snow_data_plane(OperationType::Encapsulate);
        let mut handles = s.driver.split().unwrap();
        let ctx0 = handles[0].create_context(&cfg).unwrap();
        let ctx1 = handles[1].create_context(&cfg).unwrap();
        assert_eq!(ctx1.ring(), 1);
        assert!(matches!(
            handles[0].context_state(ctx1),
            Err(SecError::InvalidHandle)
        ));

        let (mut input, mut output) = (pdu12(0, 8), vec![0u8; 10]);
        s.sims[0].inject_error(RING_ERR_FATAL);
        handles[0]
            .process_packet(ctx0, packet(&mut input), packet(&mut output), 0)
            .unwrap();
        let code = ring_error_status(RING_ERR_FATAL);
        assert!(matches!(
            handles[0].poll(-1, |_| PollAction::Continue),
            Err(SecError::ProcessingError { code: c }) if c == code
        ));
        assert!(matches!(
            handles[1].process_packet(ctx1, packet(&mut input), packet(&mut output), 1),
            Err(SecError::ProcessingError { .. })
        ));
        assert!(matches!(
            handles[1].poll(-1, |_| PollAction::Continue),
            Err(SecError::ProcessingError { .. })
        ));
        drop(handles);

        assert!(matches!(
            s.driver.create_context(None, &cfg),
            Err(SecError::ProcessingError { .. })
        ));
        s.driver.release().unwrap();
        assert!(matches!(s.driver.split(), Err(SecError::NotInitialized)));
    }
}
