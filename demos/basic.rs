// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example: protect and recover a PDCP control plane PDU.
//!
//! Uses the job rings found through UIO when present, and the simulated
//! ring otherwise.
//!
//! Run with: `cargo run --example basic`

use sec_pdcp::sim::SimulatedRing;
use sec_pdcp::uio::{discover_job_rings, UioRing};
use sec_pdcp::{
    CipherAlgorithm, Direction, Fragment, HeapMemory, IntegrityAlgorithm, KeyMaterial,
    LogicalPacket, NoInterrupts, OperationType, PdcpConfig, PollAction, RingBackend, SecConfig,
    SecDriver, SecError,
};
use std::sync::Arc;

static CIPHER_KEY: [u8; 16] = [
    0x60, 0x4C, 0x8A, 0x22, 0x89, 0x56, 0x13, 0x51, 0x7D, 0x61, 0xE5, 0xE0, 0x7B, 0x2B, 0xD0, 0x9E,
];
static AUTH_KEY: [u8; 16] = [
    0x1A, 0xDD, 0x42, 0x6F, 0x30, 0x4A, 0x86, 0xC5, 0x4E, 0x03, 0x0A, 0x5B, 0x35, 0x2D, 0x17, 0x77,
];

fn hardware_backends() -> Vec<RingBackend> {
    let Ok(devices) = discover_job_rings() else {
        return Vec::new();
    };
    devices
        .iter()
        .filter_map(|dev| {
            let ring = UioRing::open_device(dev).ok()?;
            let irq = ring.interrupts().ok()?;
            println!("  {} ({})", dev.name, dev.dev_path.display());
            Some(RingBackend::new(ring, irq))
        })
        .take(sec_pdcp::MAX_JOB_RINGS)
        .collect()
}

fn packet(buf: &mut [u8]) -> LogicalPacket {
    // SAFETY: the buffers outlive every poll below.
    LogicalPacket::contiguous(unsafe { Fragment::new(buf.as_mut_ptr(), 0, buf.len() as u32) })
}

fn config(op: OperationType) -> PdcpConfig {
    PdcpConfig::control_plane(op, Direction::Uplink)
        .with_bearer(1)
        .with_cipher(
            CipherAlgorithm::Snow,
            Some(KeyMaterial::from_static(&CIPHER_KEY)),
        )
        .with_integrity(
            IntegrityAlgorithm::Snow,
            Some(KeyMaterial::from_static(&AUTH_KEY)),
        )
}

fn main() -> Result<(), SecError> {
    println!("SEC PDCP Basic Example");
    println!("======================\n");

    println!("Discovering job rings...");
    let mut backends = hardware_backends();
    let memory = Arc::new(HeapMemory);
    if backends.is_empty() {
        // Heap memory is only DMA-visible to the simulator.
        println!("  None found, using the simulated ring.");
        backends.push(RingBackend::new(
            SimulatedRing::new(memory.clone()),
            NoInterrupts,
        ));
    }
    println!();

    let sec_config = SecConfig::new(memory).with_ring_size(64).apply_env()?;
    let (mut driver, rings) = SecDriver::init(sec_config, backends)?;
    println!("Driver up with {} ring(s)", rings.len());

    let enc = driver.create_context(Some(rings[0].id), &config(OperationType::Encapsulate))?;
    let dec = driver.create_context(Some(rings[0].id), &config(OperationType::Decapsulate))?;

    let mut plain = b"\x05RRC connection reconfiguration".to_vec();
    let mut protected = vec![0u8; plain.len() + 4];
    let mut recovered = vec![0u8; plain.len()];

    driver.process_packet(enc, packet(&mut plain), packet(&mut protected), 1)?;
    driver.poll(-1, 8, |n| {
        println!("  encapsulated: {:?}, {} bytes", n.status, n.output_len);
        PollAction::Continue
    })?;
    println!("  protected: {:02x?}", &protected);

    driver.process_packet(dec, packet(&mut protected), packet(&mut recovered), 2)?;
    driver.poll(-1, 8, |n| {
        println!("  decapsulated: {:?}, {} bytes", n.status, n.output_len);
        PollAction::Continue
    })?;
    println!("  recovered: {:?}", String::from_utf8_lossy(&recovered[1..]));
    println!("  round trip ok: {}", recovered == plain);

    driver.delete_context(enc)?;
    driver.delete_context(dec)?;
    driver.release()?;
    println!("\nDone.");
    Ok(())
}
