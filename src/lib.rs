// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # SEC PDCP Job Ring Driver
//!
//! User-space driver that offloads PDCP and RLC ciphering and integrity
//! protection to a SEC-family crypto accelerator through its job rings.
//!
//! ## Features
//!
//! - PDCP control plane (5-bit SN, MAC-I) and data plane (7/12/15/18-bit SN)
//! - RLC UM/AM ciphering
//! - SNOW 3G, AES and KASUMI ciphers, SNOW 3G and AES integrity, including
//!   mixed combinations run as two chained descriptors
//! - HFN tracking with rollover, threshold notification and per-packet
//!   override
//! - Scatter-gather input and output packets
//! - Context deletion while packets are in flight
//! - Weighted round-robin polling over up to four rings
//! - One exclusive handle per ring, so rings can be driven from separate
//!   threads without locking
//! - Automatic ring reset after descriptor errors
//!
//! ## Platform Support
//!
//! | Backend                  | Platform | Use                         |
//! |--------------------------|----------|-----------------------------|
//! | [`uio::UioRing`]         | Linux    | Hardware through UIO        |
//! | [`sim::SimulatedRing`]   | Any      | Tests, benchmarks, bring-up |
//!
//! ## Example
//!
//! ```rust,no_run
//! use sec_pdcp::uio::{discover_job_rings, UioRing};
//! use sec_pdcp::{
//!     CipherAlgorithm, Direction, DmaRegion, KeyMaterial, OperationType, PdcpConfig,
//!     PollAction, RingBackend, SecConfig, SecDriver, SecError, SnSize,
//! };
//! use std::sync::Arc;
//!
//! static KEY: [u8; 16] = [0x2B; 16];
//!
//! fn main() -> Result<(), SecError> {
//!     let backends = discover_job_rings()?
//!         .iter()
//!         .map(|dev| {
//!             let ring = UioRing::open_device(dev)?;
//!             let irq = ring.interrupts()?;
//!             Ok(RingBackend::new(ring, irq))
//!         })
//!         .collect::<Result<Vec<_>, SecError>>()?;
//!
//!     // Physically contiguous memory shared with the accelerator, mapped
//!     // by the platform's DMA allocator.
//!     let (virt, phys, len) = (0x7f00_0000_0000usize, 0x8000_0000u64, 16 << 20);
//!     let memory = Arc::new(unsafe { DmaRegion::new(virt, phys, len) });
//!     let (mut driver, _rings) = SecDriver::init(SecConfig::new(memory).apply_env()?, backends)?;
//!
//!     let cfg = PdcpConfig::data_plane(SnSize::Bits12, OperationType::Encapsulate, Direction::Uplink)
//!         .with_cipher(CipherAlgorithm::Snow, Some(KeyMaterial::from_static(&KEY)));
//!     let _ctx = driver.create_context(None, &cfg)?;
//!
//!     driver.poll(-1, 16, |n| {
//!         println!("packet {} -> {:?}", n.user_tag, n.status);
//!         PollAction::Continue
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod descriptor;
pub mod dma;
pub mod driver;
pub mod error;
pub mod hw;
pub mod opcode;
pub mod pdcp;
pub mod poll;
pub mod ring;
pub mod sg;
pub mod sim;
pub mod uio;

pub use config::{IrqCoalescing, SecConfig, StartupMode};
pub use context::{ContextHandle, ContextPool, ContextState, DeletionOutcome};
pub use descriptor::{CompletionStatus, JobDescriptor};
pub use driver::{RingBackend, RingDescriptor, RingHandle, RingId, SecDriver, MAX_JOB_RINGS};
pub use error::{last_error, SecError, SecResult};
pub use hw::{
    AddressTranslator, Clock, DmaMemory, DmaRegion, HeapMemory, InterruptControl,
    JobRingRegisters, NoInterrupts, PhysAddr, SystemClock,
};
pub use opcode::{CipherAlgorithm, IntegrityAlgorithm, OperationType};
pub use pdcp::{Direction, KeyMaterial, PdcpConfig, Plane, Protocol, RlcMode, SnSize};
pub use poll::{Notification, PacketStatus, PollAction};
pub use ring::RingStats;
pub use sg::{Fragment, LogicalPacket};
