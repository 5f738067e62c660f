// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Driver configuration.

use crate::error::{SecError, SecResult};
use crate::hw::{Clock, DmaMemory, SystemClock, IRQ_COALESCING_ENABLE};
use crate::ring::MAX_RING_SIZE;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default job ring size.
pub const DEFAULT_RING_SIZE: u32 = 512;
/// Default number of ring slots withheld from the hardware FIFO.
pub const DEFAULT_RING_HEADROOM: u32 = 1;
/// Default number of contexts, shared across all rings.
pub const DEFAULT_MAX_CONTEXTS: u32 = 1024;
/// Default bound on a ring reset.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_millis(100);

/// How completions are signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupMode {
    /// Interrupts masked; the caller polls.
    #[default]
    Polling,
    /// Interrupt on completion; re-armed after each drain.
    Interrupt,
    /// Interrupt to start a poll burst, polling until drained.
    Napi,
}

impl FromStr for StartupMode {
    type Err = SecError;

    fn from_str(s: &str) -> SecResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "polling" | "poll" => Ok(Self::Polling),
            "interrupt" | "irq" => Ok(Self::Interrupt),
            "napi" => Ok(Self::Napi),
            other => Err(SecError::InvalidConfig(format!("unknown mode {other:?}"))),
        }
    }
}

/// Interrupt coalescing thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqCoalescing {
    /// Cycles to wait after the first completion.
    pub timer_threshold: u16,
    /// Completions that raise the interrupt early.
    pub count_threshold: u8,
}

impl IrqCoalescing {
    /// Interrupt configuration register value.
    pub const fn register_value(self) -> u32 {
        IRQ_COALESCING_ENABLE
            | (self.count_threshold as u32) << 8
            | (self.timer_threshold as u32) << 16
    }
}

/// Driver configuration.
///
/// ```rust
/// use sec_pdcp::{HeapMemory, SecConfig, StartupMode};
/// use std::sync::Arc;
///
/// let config = SecConfig::new(Arc::new(HeapMemory))
///     .with_ring_size(256)
///     .with_mode(StartupMode::Polling);
/// assert_eq!(config.ring_size, 256);
/// ```
#[derive(Clone)]
pub struct SecConfig {
    /// DMA memory for rings, descriptors and per-context data.
    pub memory: Arc<dyn DmaMemory>,
    /// Interrupt mode every ring starts in.
    pub mode: StartupMode,
    /// Interrupt coalescing, off when `None`.
    pub coalescing: Option<IrqCoalescing>,
    /// Slots per ring, a power of two.
    pub ring_size: u32,
    /// Slots withheld from the hardware FIFO.
    pub ring_headroom: u32,
    /// Contexts across all rings.
    pub max_contexts: u32,
    /// Bound on a ring reset.
    pub reset_timeout: Duration,
    /// Time source for bounded waits.
    pub clock: Arc<dyn Clock>,
}

impl SecConfig {
    /// Defaults on top of `memory`.
    pub fn new(memory: Arc<dyn DmaMemory>) -> Self {
        Self {
            memory,
            mode: StartupMode::default(),
            coalescing: None,
            ring_size: DEFAULT_RING_SIZE,
            ring_headroom: DEFAULT_RING_HEADROOM,
            max_contexts: DEFAULT_MAX_CONTEXTS,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Set the startup mode.
    pub fn with_mode(mut self, mode: StartupMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable interrupt coalescing.
    pub fn with_coalescing(mut self, coalescing: IrqCoalescing) -> Self {
        self.coalescing = Some(coalescing);
        self
    }

    /// Set the ring size.
    pub fn with_ring_size(mut self, ring_size: u32) -> Self {
        self.ring_size = ring_size;
        self
    }

    /// Set the ring headroom.
    pub fn with_ring_headroom(mut self, headroom: u32) -> Self {
        self.ring_headroom = headroom;
        self
    }

    /// Set the total number of contexts.
    pub fn with_max_contexts(mut self, max_contexts: u32) -> Self {
        self.max_contexts = max_contexts;
        self
    }

    /// Set the reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override fields from `SEC_RING_SIZE`, `SEC_RING_HEADROOM`,
    /// `SEC_MAX_CONTEXTS`, `SEC_RESET_TIMEOUT_MS` and `SEC_MODE`.
    pub fn apply_env(self) -> SecResult<Self> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> SecResult<Self> {
        fn parse<T: FromStr>(name: &str, value: &str) -> SecResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| SecError::InvalidConfig(format!("{name}={value:?}")))
        }
        if let Some(v) = var("SEC_RING_SIZE") {
            self.ring_size = parse("SEC_RING_SIZE", &v)?;
        }
        if let Some(v) = var("SEC_RING_HEADROOM") {
            self.ring_headroom = parse("SEC_RING_HEADROOM", &v)?;
        }
        if let Some(v) = var("SEC_MAX_CONTEXTS") {
            self.max_contexts = parse("SEC_MAX_CONTEXTS", &v)?;
        }
        if let Some(v) = var("SEC_RESET_TIMEOUT_MS") {
            self.reset_timeout = Duration::from_millis(parse("SEC_RESET_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = var("SEC_MODE") {
            self.mode = v.parse()?;
        }
        Ok(self)
    }

    /// Check the configuration for `ring_count` rings.
    pub fn validate(&self, ring_count: usize) -> SecResult<()> {
        if !self.ring_size.is_power_of_two() || self.ring_size > MAX_RING_SIZE {
            return Err(SecError::InvalidConfig(format!(
                "ring size {} must be a power of two up to {MAX_RING_SIZE}",
                self.ring_size
            )));
        }
        if self.ring_headroom + 1 >= self.ring_size {
            return Err(SecError::InvalidConfig(format!(
                "headroom {} leaves no usable slot",
                self.ring_headroom
            )));
        }
        if self.max_contexts == 0 || (self.max_contexts as usize) < ring_count {
            return Err(SecError::InvalidConfig(format!(
                "{} contexts cannot be shared by {ring_count} rings",
                self.max_contexts
            )));
        }
        Ok(())
    }

    /// Contexts owned by each of `ring_count` rings.
    pub(crate) fn contexts_per_ring(&self, ring_count: usize) -> u16 {
        let per_ring = self.max_contexts as usize / ring_count.max(1);
        per_ring.min(u16::MAX as usize) as u16
    }

    /// Interrupt configuration register value.
    pub(crate) fn irq_config(&self) -> u32 {
        self.coalescing.map_or(0, IrqCoalescing::register_value)
    }
}

impl std::fmt::Debug for SecConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecConfig")
            .field("mode", &self.mode)
            .field("coalescing", &self.coalescing)
            .field("ring_size", &self.ring_size)
            .field("ring_headroom", &self.ring_headroom)
            .field("max_contexts", &self.max_contexts)
            .field("reset_timeout", &self.reset_timeout)
            .finish_non_exhaustive()
    }
}
