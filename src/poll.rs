// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Completion polling and notification.
//!
//! Completions are drained in submission order, resolved to their context,
//! classified, and handed to the caller's callback one packet at a time.
//! Across rings a weighted round-robin decides how many packets each ring
//! may deliver before the next ring gets its turn.

use crate::context::{ContextHandle, Lateness};
use crate::descriptor::CompletionStatus;
use crate::error::{SecError, SecResult};
use crate::hw::{ring_error_type, Clock, RING_ERR_FATAL};
use crate::ring::{Completion, JobRing};
use crate::sg::LogicalPacket;
use log::{error, trace, warn};

/// Per-packet result handed to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Processed successfully.
    Success,
    /// The accelerator or the ring reported an error; see `error_info`.
    Error,
    /// Completed after its context was marked for deletion.
    Overdue,
    /// Final completion of a context marked for deletion.
    LastOverdue,
    /// Processed successfully with the context's HFN at or above its
    /// threshold; keys should be renegotiated.
    HfnThresholdReached,
    /// Integrity verification failed on decapsulation.
    MacCheckFailed,
}

/// Callback verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Keep draining.
    Continue,
    /// Stop draining now.
    Stop,
}

/// One completed packet.
#[derive(Debug)]
pub struct Notification<'a> {
    /// Context the packet was submitted on.
    pub context: ContextHandle,
    /// Input packet as submitted.
    pub input: &'a LogicalPacket,
    /// Output packet as submitted.
    pub output: &'a LogicalPacket,
    /// Caller tag given at submission.
    pub user_tag: u64,
    /// Packet status.
    pub status: PacketStatus,
    /// Raw hardware status word, zero on success.
    pub error_info: u32,
    /// Bytes of protocol data written to the output.
    pub output_len: u32,
}

/// Result of one poll call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Packets handed to the callback.
    pub delivered: usize,
    /// The callback asked to stop.
    pub stopped: bool,
}

/// Bound on the packets delivered by one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Until nothing is ready.
    Unbounded,
    /// At most this many packets.
    Packets(usize),
}

impl Limit {
    /// Decode a caller limit: negative is unbounded, zero is rejected.
    pub fn from_raw(limit: i32) -> SecResult<Self> {
        match limit {
            0 => Err(SecError::InvalidInput("poll limit must not be zero".into())),
            n if n < 0 => Ok(Self::Unbounded),
            n => Ok(Self::Packets(n as usize)),
        }
    }

    fn remaining(self, delivered: usize) -> usize {
        match self {
            Self::Unbounded => usize::MAX,
            Self::Packets(n) => n.saturating_sub(delivered),
        }
    }
}

/// Poll callback.
pub type Callback<'c> = dyn FnMut(&Notification<'_>) -> PollAction + 'c;

/// Reset bound used when a ring reports a descriptor error.
#[derive(Clone, Copy)]
pub(crate) struct ResetPolicy<'a> {
    pub clock: &'a dyn Clock,
    pub timeout_micros: u64,
}

fn classify(status: u32, lateness: Lateness, hfn_threshold: bool) -> PacketStatus {
    match lateness {
        Lateness::Overdue => PacketStatus::Overdue,
        Lateness::LastOverdue => PacketStatus::LastOverdue,
        Lateness::OnTime => match CompletionStatus::from(status) {
            CompletionStatus::Success if hfn_threshold => PacketStatus::HfnThresholdReached,
            CompletionStatus::Success => PacketStatus::Success,
            CompletionStatus::IcvMismatch => PacketStatus::MacCheckFailed,
            _ => PacketStatus::Error,
        },
    }
}

/// Notify one completion. Returns `None` for slots that carry no packet.
fn deliver(
    ring: &mut JobRing,
    completion: Completion,
    on_packet: &mut Callback<'_>,
) -> SecResult<Option<PollAction>> {
    let (Some(context), Some(input), Some(output)) = (
        completion.context,
        completion.input.as_ref(),
        completion.output.as_ref(),
    ) else {
        trace!("ring {}: slot {} carried no packet", ring.id(), completion.slot);
        return Ok(None);
    };
    let lateness = ring.pool_mut().complete(context)?;
    let status = classify(completion.status, lateness, completion.hfn_threshold);
    let action = on_packet(&Notification {
        context,
        input,
        output,
        user_tag: completion.user_tag,
        status,
        error_info: completion.status,
        output_len: completion.out_len,
    });
    if lateness == Lateness::LastOverdue {
        ring.pool_mut().reclaim(context)?;
    }
    Ok(Some(action))
}

/// Recover from a ring-level error.
///
/// A controller-fatal error is returned as is. Otherwise every packet in
/// flight is notified as failed, ignoring stop requests, the ring is reset,
/// and [`SecError::PacketProcessingError`] is returned.
fn recover(
    ring: &mut JobRing,
    status: u32,
    reset: ResetPolicy<'_>,
    on_packet: &mut Callback<'_>,
) -> SecResult<PollOutcome> {
    if ring_error_type(status) == RING_ERR_FATAL {
        error!("ring {}: controller error, status {:#010x}", ring.id(), status);
        return Err(SecError::ProcessingError { code: status });
    }
    let mut flushed = Vec::with_capacity(ring.count() as usize);
    ring.flush(status, |c| flushed.push(c));
    warn!(
        "ring {}: descriptor error {:#x}, resetting with {} packet(s) in flight",
        ring.id(),
        ring_error_type(status),
        flushed.len()
    );
    let reset_result = ring.reset(reset.clock, reset.timeout_micros);
    for completion in flushed {
        deliver(ring, completion, on_packet)?;
    }
    reset_result?;
    Err(SecError::PacketProcessingError { code: status })
}

/// Drain up to `limit` packets from `ring`.
///
/// Re-arms the ring interrupt when the ring ran dry before the limit.
pub(crate) fn poll_ring(
    ring: &mut JobRing,
    limit: Limit,
    reset: ResetPolicy<'_>,
    on_packet: &mut Callback<'_>,
) -> SecResult<PollOutcome> {
    if let Some(status) = ring.pending_error() {
        return recover(ring, status, reset, on_packet);
    }
    let mut outcome = PollOutcome::default();
    loop {
        if limit.remaining(outcome.delivered) == 0 {
            return Ok(outcome);
        }
        let Some(completion) = ring.dequeue_completed()? else {
            break;
        };
        match deliver(ring, completion, on_packet)? {
            Some(PollAction::Stop) => {
                outcome.delivered += 1;
                outcome.stopped = true;
                return Ok(outcome);
            }
            Some(PollAction::Continue) => outcome.delivered += 1,
            None => {}
        }
    }
    ring.rearm()?;
    Ok(outcome)
}

/// Weighted round-robin over `rings`, starting at ring `start`.
///
/// Every turn a ring may deliver up to `weight` packets. Stops when the
/// limit is reached, the callback asks to, or a full round delivered
/// nothing. Returns the outcome and the ring whose turn is next.
pub(crate) fn poll_rings(
    rings: &mut [JobRing],
    start: usize,
    limit: Limit,
    weight: usize,
    reset: ResetPolicy<'_>,
    on_packet: &mut Callback<'_>,
) -> SecResult<(PollOutcome, usize)> {
    let mut total = PollOutcome::default();
    if rings.is_empty() {
        return Ok((total, 0));
    }
    let n = rings.len();
    let mut turn = start % n;
    let mut idle_turns = 0;
    while idle_turns < n {
        let budget = weight.min(limit.remaining(total.delivered));
        if budget == 0 {
            break;
        }
        let ring = &mut rings[turn];
        turn = (turn + 1) % n;
        let got = poll_ring(ring, Limit::Packets(budget), reset, on_packet)?;
        total.delivered += got.delivered;
        if got.stopped {
            total.stopped = true;
            break;
        }
        if got.delivered == 0 {
            idle_turns += 1;
        } else {
            idle_turns = 0;
        }
    }
    Ok((total, turn))
}
