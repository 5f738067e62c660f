// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for driver operations.
//!
//! Besides the typed [`SecError`] returned by every operation, the driver
//! keeps a per-thread "last error" code. Hardware errors surface there with
//! their raw status word so a caller that received
//! [`SecError::PacketProcessingError`] can fetch the detailed code later.

use std::cell::Cell;
use thiserror::Error;

/// Errors that can occur during driver operations.
#[derive(Debug, Error)]
pub enum SecError {
    /// Handle does not refer to a live context or ring.
    #[error("invalid handle")]
    InvalidHandle,

    /// Invalid argument provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Context configuration rejected at creation time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Context pool of the selected ring is exhausted.
    #[error("no free contexts")]
    NoFreeContexts,

    /// Job ring has no free slot below its usable depth.
    #[error("job ring full")]
    RingFull,

    /// Context was marked for deletion; no further submissions accepted.
    #[error("context marked for deletion")]
    ContextMarkedForDeletion,

    /// Driver has not been initialized or was already released.
    #[error("driver not initialized")]
    NotInitialized,

    /// Driver release is in progress.
    #[error("driver release in progress")]
    Releasing,

    /// More job rings requested than the hardware provides.
    #[error("requested {requested} job rings, hardware maximum is {max}")]
    TooManyRings { requested: usize, max: usize },

    /// Ring is being reset after a hardware error.
    #[error("job ring reset in progress")]
    RingResetting,

    /// A descriptor failed; the ring was reset and accepts work again.
    #[error("packet processing error: hw status={code:#010x}")]
    PacketProcessingError { code: u32 },

    /// Controller-level failure; only driver release is valid afterwards.
    #[error("fatal processing error: hw status={code:#010x}")]
    ProcessingError { code: u32 },

    /// Ring reset did not complete within the configured timeout.
    #[error("reset of job ring {ring} timed out")]
    ResetTimeout { ring: u8 },

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// DMA memory could not satisfy an allocation.
    #[error("DMA memory exhausted allocating {0} bytes")]
    DmaExhausted(usize),

    /// Platform not supported.
    #[error("platform not supported: job ring access requires Linux with UIO")]
    PlatformNotSupported,
}

impl SecError {
    /// Stable numeric code for this error, as reported by [`last_error`].
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidHandle => -2,
            Self::InvalidInput(_) => -3,
            Self::InvalidConfig(_) => -4,
            Self::NoFreeContexts => -5,
            Self::RingFull => -6,
            Self::ContextMarkedForDeletion => -7,
            Self::NotInitialized => -8,
            Self::Releasing => -9,
            Self::TooManyRings { .. } => -10,
            Self::RingResetting => -11,
            Self::PacketProcessingError { .. } => -12,
            Self::ProcessingError { .. } => -13,
            Self::ResetTimeout { .. } => -14,
            Self::Io(_) => -15,
            Self::MmapFailed(_) => -16,
            Self::PlatformNotSupported => -17,
            Self::DmaExhausted(_) => -18,
        }
    }

    /// Value stored in the thread-local last-error slot.
    ///
    /// Hardware errors store the raw status word; everything else its code.
    fn last_error_value(&self) -> i32 {
        match self {
            Self::PacketProcessingError { code } | Self::ProcessingError { code } => *code as i32,
            other => other.code(),
        }
    }
}

/// Result type alias for driver operations.
pub type SecResult<T> = Result<T, SecError>;

thread_local! {
    static LAST_ERROR: Cell<i32> = const { Cell::new(-1) };
}

/// Last error recorded on the calling thread, `-1` if none was ever set.
pub fn last_error() -> i32 {
    LAST_ERROR.with(Cell::get)
}

pub(crate) fn record(err: &SecError) {
    LAST_ERROR.with(|slot| slot.set(err.last_error_value()));
}

/// Records the error of a failed result in the last-error slot.
pub(crate) fn track<T>(result: SecResult<T>) -> SecResult<T> {
    if let Err(ref e) = result {
        record(e);
    }
    result
}
