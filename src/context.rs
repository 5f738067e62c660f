// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Context pool and deletion lifecycle.
//!
//! Each job ring owns a fixed-size pool of contexts. A slot moves through
//!
//! ```text
//! Free -> Used -> MarkedForDeletion -> CanBeDeleted -> Free
//!           \__________________________________________/
//!                  (deleted with no packet in flight)
//! ```
//!
//! Handles carry the slot generation, which changes every time a slot is
//! freed, so a handle to a recycled slot is rejected instead of aliasing the
//! new occupant.

use crate::error::{SecError, SecResult};
use crate::pdcp::{ContextDescriptor, CountStep};

/// Handle to a context, valid until the context is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    ring: u8,
    index: u16,
    generation: u32,
}

impl ContextHandle {
    /// Ring the context is affined to.
    #[inline]
    pub fn ring(&self) -> u8 {
        self.ring
    }

    /// Slot index within the ring's pool.
    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }
}

/// Lifecycle state of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Available for `create_context`.
    Free,
    /// Accepting packets.
    Used,
    /// Deletion requested with packets in flight.
    MarkedForDeletion,
    /// Last in-flight packet completed; freed once it has been notified.
    CanBeDeleted,
}

/// Result of a deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// No packet was in flight; the slot is free again.
    Done,
    /// Several packets are in flight; they complete as overdue.
    PacketsInFlight,
    /// One packet is in flight; it completes as last overdue.
    LastPacketInFlight,
}

/// How a completion relates to a pending deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lateness {
    /// Context is live.
    OnTime,
    /// Context is marked for deletion; more packets follow.
    Overdue,
    /// Final packet of a context marked for deletion.
    LastOverdue,
}

/// One radio bearer direction.
#[derive(Debug)]
pub struct PdcpContext {
    descriptor: ContextDescriptor,
    hfn: u32,
    last_sn: Option<u32>,
    threshold_logged: bool,
    in_flight: u32,
}

impl PdcpContext {
    /// Wrap a built descriptor with its initial HFN.
    pub fn new(descriptor: ContextDescriptor, hfn: u32) -> Self {
        Self {
            descriptor,
            hfn,
            last_sn: None,
            threshold_logged: false,
            in_flight: 0,
        }
    }

    /// Job template.
    pub fn descriptor(&self) -> &ContextDescriptor {
        &self.descriptor
    }

    /// Stored HFN.
    pub fn hfn(&self) -> u32 {
        self.hfn
    }

    /// SN of the last packet submitted without an HFN override.
    pub fn last_sn(&self) -> Option<u32> {
        self.last_sn
    }

    /// Packets submitted and not yet notified.
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Commit the tracking state of a submitted packet.
    ///
    /// Returns true the first time the HFN threshold is seen.
    pub(crate) fn commit(&mut self, step: &CountStep) -> bool {
        if !step.overridden {
            self.hfn = step.hfn;
            self.last_sn = Some(step.sn);
        }
        self.in_flight += 1;
        let first = step.threshold_reached && !self.threshold_logged;
        self.threshold_logged |= step.threshold_reached;
        first
    }
}

#[derive(Debug)]
struct Slot {
    state: ContextState,
    generation: u32,
    context: Option<PdcpContext>,
}

/// Fixed-capacity arena of contexts owned by one ring.
#[derive(Debug)]
pub struct ContextPool {
    ring: u8,
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl ContextPool {
    /// Create a pool of `capacity` free slots for ring `ring`.
    pub fn new(ring: u8, capacity: u16) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                state: ContextState::Free,
                generation: 0,
                context: None,
            })
            .collect();
        Self {
            ring,
            slots,
            // Lowest index first.
            free: (0..capacity).rev().collect(),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots not free.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Take a free slot for `context`.
    pub fn insert(&mut self, context: PdcpContext) -> SecResult<ContextHandle> {
        let index = self.free.pop().ok_or(SecError::NoFreeContexts)?;
        let slot = &mut self.slots[index as usize];
        slot.state = ContextState::Used;
        slot.context = Some(context);
        Ok(ContextHandle {
            ring: self.ring,
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: ContextHandle) -> SecResult<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| {
                handle.ring == self.ring
                    && s.generation == handle.generation
                    && s.state != ContextState::Free
            })
            .ok_or(SecError::InvalidHandle)
    }

    fn slot_mut(&mut self, handle: ContextHandle) -> SecResult<&mut Slot> {
        let ring = self.ring;
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| {
                handle.ring == ring
                    && s.generation == handle.generation
                    && s.state != ContextState::Free
            })
            .ok_or(SecError::InvalidHandle)
    }

    /// State of the context behind `handle`.
    pub fn state(&self, handle: ContextHandle) -> SecResult<ContextState> {
        self.slot(handle).map(|s| s.state)
    }

    /// Context behind `handle`, whatever its lifecycle state.
    pub fn get(&self, handle: ContextHandle) -> SecResult<&PdcpContext> {
        self.slot(handle)?
            .context
            .as_ref()
            .ok_or(SecError::InvalidHandle)
    }

    /// Context behind `handle` if it accepts new packets.
    pub fn get_for_submit(&mut self, handle: ContextHandle) -> SecResult<&mut PdcpContext> {
        let slot = self.slot_mut(handle)?;
        if slot.state != ContextState::Used {
            return Err(SecError::ContextMarkedForDeletion);
        }
        slot.context.as_mut().ok_or(SecError::InvalidHandle)
    }

    fn free_slot(&mut self, index: u16) {
        let slot = &mut self.slots[index as usize];
        slot.state = ContextState::Free;
        slot.context = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }

    /// Request deletion of a context.
    pub fn delete(&mut self, handle: ContextHandle) -> SecResult<DeletionOutcome> {
        let slot = self.slot_mut(handle)?;
        if slot.state != ContextState::Used {
            return Err(SecError::ContextMarkedForDeletion);
        }
        let in_flight = slot.context.as_ref().map_or(0, PdcpContext::in_flight);
        let outcome = match in_flight {
            0 => DeletionOutcome::Done,
            1 => DeletionOutcome::LastPacketInFlight,
            _ => DeletionOutcome::PacketsInFlight,
        };
        if outcome == DeletionOutcome::Done {
            self.free_slot(handle.index);
        } else {
            slot.state = ContextState::MarkedForDeletion;
        }
        Ok(outcome)
    }

    /// Account for one completed packet of `handle`.
    ///
    /// When the last packet of a context marked for deletion completes, the
    /// slot becomes [`ContextState::CanBeDeleted`]; call [`Self::reclaim`]
    /// after notifying it.
    pub fn complete(&mut self, handle: ContextHandle) -> SecResult<Lateness> {
        let slot = self.slot_mut(handle)?;
        let ctx = slot.context.as_mut().ok_or(SecError::InvalidHandle)?;
        ctx.in_flight = ctx.in_flight.saturating_sub(1);
        Ok(match slot.state {
            ContextState::MarkedForDeletion if ctx.in_flight == 0 => {
                slot.state = ContextState::CanBeDeleted;
                Lateness::LastOverdue
            }
            ContextState::MarkedForDeletion => Lateness::Overdue,
            _ => Lateness::OnTime,
        })
    }

    /// Free a context whose last overdue packet was notified.
    pub fn reclaim(&mut self, handle: ContextHandle) -> SecResult<()> {
        let slot = self.slot(handle)?;
        if slot.state != ContextState::CanBeDeleted {
            return Err(SecError::InvalidHandle);
        }
        self.free_slot(handle.index);
        Ok(())
    }

    /// Drop every context; used on driver release.
    pub fn clear(&mut self) {
        for index in 0..self.slots.len() as u16 {
            if self.slots[index as usize].state != ContextState::Free {
                self.free_slot(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{DmaMemory, HeapMemory};
    use crate::opcode::OperationType;
    use crate::pdcp::{build_context_descriptor, Direction, PdcpConfig, SnSize};
    use std::sync::Arc;

    fn context() -> PdcpContext {
        let mem: Arc<dyn DmaMemory> = Arc::new(HeapMemory);
        let cfg =
            PdcpConfig::data_plane(SnSize::Bits12, OperationType::Encapsulate, Direction::Uplink);
        PdcpContext::new(build_context_descriptor(&cfg, &mem).unwrap(), 0)
    }

    fn submit(pool: &mut ContextPool, h: ContextHandle, sn: u32) {
        let ctx = pool.get_for_submit(h).unwrap();
        let step = ctx.descriptor().next_count(ctx.hfn(), ctx.last_sn(), sn, None);
        ctx.commit(&step);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let mut pool = ContextPool::new(0, 2);
        let a = pool.insert(context()).unwrap();
        let _b = pool.insert(context()).unwrap();
        assert!(matches!(pool.insert(context()), Err(SecError::NoFreeContexts)));

        assert_eq!(pool.delete(a).unwrap(), DeletionOutcome::Done);
        let c = pool.insert(context()).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert!(matches!(pool.get(a), Err(SecError::InvalidHandle)));
    }

    #[test]
    fn test_delete_with_one_in_flight() {
        let mut pool = ContextPool::new(1, 4);
        let h = pool.insert(context()).unwrap();
        submit(&mut pool, h, 1);

        assert_eq!(pool.delete(h).unwrap(), DeletionOutcome::LastPacketInFlight);
        assert_eq!(pool.state(h).unwrap(), ContextState::MarkedForDeletion);
        assert!(matches!(
            pool.get_for_submit(h),
            Err(SecError::ContextMarkedForDeletion)
        ));

        assert_eq!(pool.complete(h).unwrap(), Lateness::LastOverdue);
        assert_eq!(pool.state(h).unwrap(), ContextState::CanBeDeleted);
        assert_eq!(pool.in_use(), 1);
        pool.reclaim(h).unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_delete_with_several_in_flight() {
        let mut pool = ContextPool::new(0, 4);
        let h = pool.insert(context()).unwrap();
        for sn in 0..3 {
            submit(&mut pool, h, sn);
        }
        assert_eq!(pool.delete(h).unwrap(), DeletionOutcome::PacketsInFlight);
        assert!(matches!(pool.delete(h), Err(SecError::ContextMarkedForDeletion)));
        assert_eq!(pool.complete(h).unwrap(), Lateness::Overdue);
        assert_eq!(pool.complete(h).unwrap(), Lateness::Overdue);
        assert_eq!(pool.complete(h).unwrap(), Lateness::LastOverdue);
        assert!(pool.reclaim(h).is_ok());
    }

    #[test]
    fn test_commit_tracks_sn_and_threshold_once() {
        let mut ctx = context();
        let step = ctx.descriptor().next_count(0, None, 7, None);
        assert!(!ctx.commit(&step));
        assert_eq!(ctx.last_sn(), Some(7));
        assert_eq!(ctx.in_flight(), 1);

        let mut reached = step;
        reached.threshold_reached = true;
        assert!(ctx.commit(&reached));
        assert!(!ctx.commit(&reached));
    }

    #[test]
    fn test_foreign_ring_handle_rejected() {
        let mut pool0 = ContextPool::new(0, 2);
        let pool1 = ContextPool::new(1, 2);
        let h = pool0.insert(context()).unwrap();
        assert!(matches!(pool1.state(h), Err(SecError::InvalidHandle)));
    }

    #[test]
    fn test_clear_frees_everything() {
        let mut pool = ContextPool::new(0, 3);
        let a = pool.insert(context()).unwrap();
        let _ = pool.insert(context()).unwrap();
        pool.clear();
        assert_eq!(pool.in_use(), 0);
        assert!(pool.get(a).is_err());
    }
}
