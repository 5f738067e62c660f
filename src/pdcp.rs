// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! PDCP and RLC context configuration and the job descriptor builder.
//!
//! A [`PdcpConfig`] is turned once, at context creation, into a
//! [`ContextDescriptor`]: a protocol data blob in DMA memory, the translated
//! key addresses, and a [`PassPlan`] describing how many descriptors each
//! packet needs and how data flows between them. Per packet,
//! [`ContextDescriptor::next_count`] derives the COUNT value from the
//! sequence number in the packet header, [`write_iv`] places the IVs in the
//! job's scratch area and [`update_packet_descriptor`] fills one descriptor
//! per pass.
//!
//! # Sequence numbers and HFN
//!
//! COUNT is `HFN << sn_bits | SN`. The HFN advances by one exactly when the
//! SN of the packet being submitted is 0 and the previous packet carried the
//! largest SN representable in the configured width.

use crate::descriptor::{
    DescriptorFlags, JobDescriptor, JobScratch, CIPHER_IV_OFFSET, MAC_IV_OFFSET, MAC_I_LEN,
};
use crate::dma::DmaBox;
use crate::error::{SecError, SecResult};
use crate::hw::{AddressTranslator, DmaMemory, PhysAddr};
use crate::opcode::{op_word, CipherAlgorithm, IntegrityAlgorithm, OperationType, ProtocolId};
use crate::sg::{assemble, assemble_prefixed, LogicalPacket, SgContext, SgDirection};
use std::sync::Arc;

/// Required length of cipher and integrity keys.
pub const KEY_LEN: u32 = 16;

/// Length of the stream cipher IV.
pub const CIPHER_IV_LEN: u8 = 8;

/// PDCP plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    /// Signalling radio bearer; PDUs carry a MAC-I.
    Control,
    /// Data radio bearer; ciphering only.
    Data,
}

/// RLC mode of an RLC ciphering context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RlcMode {
    /// Unacknowledged mode, 5-bit SN.
    Um5,
    /// Unacknowledged mode, 10-bit SN.
    Um10,
    /// Acknowledged mode, 10-bit SN.
    Am,
}

/// Protocol processed by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// PDCP PDU on the given plane.
    Pdcp(Plane),
    /// RLC PDU.
    Rlc(RlcMode),
}

impl Protocol {
    fn id(self) -> ProtocolId {
        match self {
            Self::Pdcp(Plane::Control) => ProtocolId::PdcpControl,
            Self::Pdcp(Plane::Data) => ProtocolId::PdcpData,
            Self::Rlc(_) => ProtocolId::Rlc,
        }
    }

    /// Whether PDUs of this protocol end in a MAC-I field.
    pub fn has_mac(self) -> bool {
        self == Self::Pdcp(Plane::Control)
    }
}

/// Radio direction, the DIRECTION input of the 3GPP algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// UE to network.
    Uplink = 0,
    /// Network to UE.
    Downlink = 1,
}

/// Sequence number width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SnSize {
    /// 5 bits: PDCP control plane, RLC UM.
    Bits5 = 5,
    /// 7 bits: PDCP data plane, short SN.
    Bits7 = 7,
    /// 10 bits: RLC UM and AM.
    Bits10 = 10,
    /// 12 bits: PDCP data plane, long SN.
    Bits12 = 12,
    /// 15 bits: PDCP data plane, extended SN.
    Bits15 = 15,
    /// 18 bits: PDCP data plane (NR).
    Bits18 = 18,
}

impl SnSize {
    /// Width in bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Largest representable sequence number.
    #[inline]
    pub const fn max_sn(self) -> u32 {
        (1 << self.bits()) - 1
    }

    /// Largest representable HFN.
    #[inline]
    pub const fn max_hfn(self) -> u32 {
        u32::MAX >> self.bits()
    }

    /// Length of the PDU header holding the sequence number.
    pub const fn header_len(self) -> u8 {
        match self {
            Self::Bits5 | Self::Bits7 => 1,
            Self::Bits10 | Self::Bits12 | Self::Bits15 => 2,
            Self::Bits18 => 3,
        }
    }
}

/// Reference to caller-owned key bytes in DMA-visible memory.
///
/// Keys are referenced, not copied: the accelerator reads them through their
/// physical address on every job.
#[derive(Clone, Copy)]
pub struct KeyMaterial {
    ptr: *const u8,
    len: u32,
}

// SAFETY: KeyMaterial only carries an address; see `KeyMaterial::new`.
unsafe impl Send for KeyMaterial {}
unsafe impl Sync for KeyMaterial {}

impl KeyMaterial {
    /// Reference `len` key bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// The bytes must stay valid and reachable by the accelerator until the
    /// context using the key is deleted and its last packet notified, or the
    /// driver is released.
    pub unsafe fn new(ptr: *const u8, len: u32) -> Self {
        Self { ptr, len }
    }

    /// Reference a key that lives for the rest of the program.
    ///
    /// A slice longer than `u32::MAX` bytes is recorded as `u32::MAX` bytes,
    /// which no cipher or integrity configuration accepts.
    pub fn from_static(key: &'static [u8]) -> Self {
        Self {
            ptr: key.as_ptr(),
            len: u32::try_from(key.len()).unwrap_or(u32::MAX),
        }
    }

    /// Key start address.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Key length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the key is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Configuration of one radio bearer direction.
#[derive(Debug, Clone, Copy)]
pub struct PdcpConfig {
    /// Protocol and plane.
    pub protocol: Protocol,
    /// Sequence number width.
    pub sn_size: SnSize,
    /// Encapsulate (transmit) or decapsulate (receive).
    pub operation: OperationType,
    /// Uplink or downlink.
    pub direction: Direction,
    /// Radio bearer identity, 5 bits.
    pub bearer: u8,
    /// Ciphering algorithm.
    pub cipher: CipherAlgorithm,
    /// Ciphering key; required unless `cipher` is NULL.
    pub cipher_key: Option<KeyMaterial>,
    /// Integrity algorithm.
    pub integrity: IntegrityAlgorithm,
    /// Integrity key; required unless `integrity` is NULL.
    pub integrity_key: Option<KeyMaterial>,
    /// Initial hyper frame number.
    pub hfn: u32,
    /// HFN at and above which packets report the threshold status.
    pub hfn_threshold: u32,
    /// Whether packets may carry a per-packet HFN override.
    pub hfn_override: bool,
}

impl PdcpConfig {
    fn new(
        protocol: Protocol,
        sn_size: SnSize,
        operation: OperationType,
        direction: Direction,
    ) -> Self {
        Self {
            protocol,
            sn_size,
            operation,
            direction,
            bearer: 0,
            cipher: CipherAlgorithm::Null,
            cipher_key: None,
            integrity: IntegrityAlgorithm::Null,
            integrity_key: None,
            hfn: 0,
            hfn_threshold: sn_size.max_hfn(),
            hfn_override: false,
        }
    }

    /// PDCP control plane context (5-bit SN, MAC-I present).
    pub fn control_plane(operation: OperationType, direction: Direction) -> Self {
        Self::new(Protocol::Pdcp(Plane::Control), SnSize::Bits5, operation, direction)
    }

    /// PDCP data plane context.
    pub fn data_plane(sn_size: SnSize, operation: OperationType, direction: Direction) -> Self {
        Self::new(Protocol::Pdcp(Plane::Data), sn_size, operation, direction)
    }

    /// RLC ciphering context; the SN width follows from `mode`.
    pub fn rlc(mode: RlcMode, operation: OperationType, direction: Direction) -> Self {
        let sn_size = match mode {
            RlcMode::Um5 => SnSize::Bits5,
            RlcMode::Um10 | RlcMode::Am => SnSize::Bits10,
        };
        Self::new(Protocol::Rlc(mode), sn_size, operation, direction)
    }

    /// Set the radio bearer identity.
    pub fn with_bearer(mut self, bearer: u8) -> Self {
        self.bearer = bearer;
        self
    }

    /// Select the ciphering algorithm and key.
    pub fn with_cipher(mut self, alg: CipherAlgorithm, key: Option<KeyMaterial>) -> Self {
        self.cipher = alg;
        self.cipher_key = key;
        self
    }

    /// Select the integrity algorithm and key.
    pub fn with_integrity(mut self, alg: IntegrityAlgorithm, key: Option<KeyMaterial>) -> Self {
        self.integrity = alg;
        self.integrity_key = key;
        self
    }

    /// Set the initial HFN and the threshold HFN.
    pub fn with_hfn(mut self, hfn: u32, threshold: u32) -> Self {
        self.hfn = hfn;
        self.hfn_threshold = threshold;
        self
    }

    /// Allow per-packet HFN overrides.
    pub fn with_hfn_override(mut self, enabled: bool) -> Self {
        self.hfn_override = enabled;
        self
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> SecResult<()> {
        let sn_ok = match self.protocol {
            Protocol::Pdcp(Plane::Control) => self.sn_size == SnSize::Bits5,
            Protocol::Pdcp(Plane::Data) => matches!(
                self.sn_size,
                SnSize::Bits7 | SnSize::Bits12 | SnSize::Bits15 | SnSize::Bits18
            ),
            Protocol::Rlc(RlcMode::Um5) => self.sn_size == SnSize::Bits5,
            Protocol::Rlc(_) => self.sn_size == SnSize::Bits10,
        };
        if !sn_ok {
            return Err(SecError::InvalidConfig(format!(
                "{}-bit SN not valid for {:?}",
                self.sn_size.bits(),
                self.protocol
            )));
        }
        if !self.protocol.has_mac() && self.integrity != IntegrityAlgorithm::Null {
            return Err(SecError::InvalidConfig(format!(
                "integrity {} not supported for {:?}",
                self.integrity, self.protocol
            )));
        }
        if matches!(self.protocol, Protocol::Rlc(_)) && self.cipher == CipherAlgorithm::Aes {
            return Err(SecError::InvalidConfig(format!(
                "cipher {} not supported for RLC",
                self.cipher
            )));
        }
        if self.bearer > 0x1F {
            return Err(SecError::InvalidConfig(format!(
                "bearer {} exceeds 5 bits",
                self.bearer
            )));
        }
        check_key("cipher", self.cipher != CipherAlgorithm::Null, self.cipher_key)?;
        check_key(
            "integrity",
            self.integrity != IntegrityAlgorithm::Null,
            self.integrity_key,
        )?;
        let max_hfn = self.sn_size.max_hfn();
        if self.hfn > max_hfn || self.hfn_threshold > max_hfn {
            return Err(SecError::InvalidConfig(format!(
                "HFN {:#x} / threshold {:#x} exceed {} bits",
                self.hfn,
                self.hfn_threshold,
                32 - self.sn_size.bits()
            )));
        }
        Ok(())
    }
}

fn check_key(what: &str, required: bool, key: Option<KeyMaterial>) -> SecResult<()> {
    match key {
        None if required => Err(SecError::InvalidConfig(format!("missing {what} key"))),
        Some(k) if required && (k.as_ptr().is_null() || k.len() != KEY_LEN) => Err(
            SecError::InvalidConfig(format!("{what} key must be {KEY_LEN} bytes")),
        ),
        _ => Ok(()),
    }
}

/// Per-context data read by the accelerator for every job.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct ProtocolDataBlob {
    /// Mask extracting the SN from the big-endian header word.
    pub sn_mask: u32,
    /// Threshold HFN.
    pub hfn_threshold: u32,
    /// Header bytes holding the SN; copied verbatim, never ciphered.
    pub header_len: u8,
    /// SN width in bits.
    pub sn_bits: u8,
    /// `bearer << 3 | direction << 2`.
    pub bearer_dir: u8,
    reserved0: u8,
    /// Stream cipher IV with a zero COUNT.
    pub iv_template: [u8; 8],
    /// MAC IV with a zero COUNT.
    pub mac_iv_template: [u8; 16],
    reserved: [u8; 28],
}

const _: () = assert!(std::mem::size_of::<ProtocolDataBlob>() == 64);

impl ProtocolDataBlob {
    fn new(cfg: &PdcpConfig) -> Self {
        let bearer_dir = (cfg.bearer << 3) | ((cfg.direction as u8) << 2);
        let mut iv_template = [0u8; 8];
        iv_template[4] = bearer_dir;

        let mut mac_iv_template = [0u8; 16];
        match cfg.integrity {
            IntegrityAlgorithm::Snow => {
                // F9 register image: COUNT, FRESH, COUNT ^ DIR<<31, FRESH ^ DIR<<15.
                let fresh = (cfg.bearer as u32) << 27;
                let dir = cfg.direction as u32;
                mac_iv_template[4..8].copy_from_slice(&fresh.to_be_bytes());
                mac_iv_template[8..12].copy_from_slice(&(dir << 31).to_be_bytes());
                mac_iv_template[12..16].copy_from_slice(&(fresh ^ (dir << 15)).to_be_bytes());
            }
            IntegrityAlgorithm::Aes => mac_iv_template[..8].copy_from_slice(&iv_template),
            IntegrityAlgorithm::Null => {}
        }

        Self {
            sn_mask: cfg.sn_size.max_sn(),
            hfn_threshold: cfg.hfn_threshold,
            header_len: cfg.sn_size.header_len(),
            sn_bits: cfg.sn_size.bits() as u8,
            bearer_dir,
            reserved0: 0,
            iv_template,
            mac_iv_template,
            reserved: [0; 28],
        }
    }
}

/// Where a pass reads or writes its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    /// The caller's input packet.
    Input,
    /// The caller's output packet.
    Output,
    /// Nothing: the pass produces no data.
    None,
}

/// One hardware descriptor of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    /// Protocol operation word.
    pub op: u32,
    /// Header flags.
    pub flags: DescriptorFlags,
    /// Data read by the pass.
    pub source: Span,
    /// Data written by the pass.
    pub dest: Span,
    /// Leading bytes copied without processing.
    pub copy_len: u8,
}

impl Pass {
    /// Output length of this pass for `in_len` input bytes.
    pub fn out_len(&self, in_len: u32) -> SecResult<u32> {
        let len = if self.dest == Span::None {
            Some(0)
        } else if self.flags.contains(DescriptorFlags::APPEND_MAC) {
            in_len.checked_add(MAC_I_LEN)
        } else if self.flags.contains(DescriptorFlags::VERIFY_MAC) {
            in_len.checked_sub(MAC_I_LEN)
        } else {
            Some(in_len)
        };
        len.ok_or_else(|| SecError::InvalidInput(format!("packet length {in_len} out of range")))
    }
}

/// Descriptors submitted per packet, chosen once per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPlan {
    /// One combined descriptor.
    Single(Pass),
    /// Two fenced descriptors in consecutive ring slots.
    Double([Pass; 2]),
}

impl PassPlan {
    fn build(cfg: &PdcpConfig) -> Self {
        let op = cfg.operation;
        let proto = cfg.protocol.id();
        let copy_len = cfg.sn_size.header_len();
        let mac_flag = match (cfg.protocol.has_mac(), op) {
            (false, _) => DescriptorFlags::empty(),
            (true, OperationType::Encapsulate) => DescriptorFlags::APPEND_MAC,
            (true, OperationType::Decapsulate) => DescriptorFlags::VERIFY_MAC,
        };
        let cipher_flag = if cfg.cipher == CipherAlgorithm::Null {
            DescriptorFlags::empty()
        } else {
            DescriptorFlags::CIPHER
        };
        let auth_flags = match cfg.integrity {
            IntegrityAlgorithm::Null => DescriptorFlags::empty(),
            IntegrityAlgorithm::Snow => DescriptorFlags::INTEGRITY,
            IntegrityAlgorithm::Aes => {
                DescriptorFlags::INTEGRITY | DescriptorFlags::MAC_IV_PREPENDED
            }
        };

        if cfg.cipher.combines_with(cfg.integrity) {
            return Self::Single(Pass {
                op: op_word(op, proto, cfg.cipher, cfg.integrity),
                flags: cipher_flag | auth_flags | mac_flag,
                source: Span::Input,
                dest: Span::Output,
                copy_len,
            });
        }

        let integrity_op = op_word(op, proto, CipherAlgorithm::Null, cfg.integrity);
        let cipher_op = op_word(op, proto, cfg.cipher, IntegrityAlgorithm::Null);
        match op {
            // MAC over the plaintext PDU, then cipher payload and MAC-I in place.
            OperationType::Encapsulate => Self::Double([
                Pass {
                    op: integrity_op,
                    flags: auth_flags | mac_flag | DescriptorFlags::FIRST_PASS,
                    source: Span::Input,
                    dest: Span::Output,
                    copy_len: 0,
                },
                Pass {
                    op: cipher_op,
                    flags: cipher_flag | DescriptorFlags::FENCE,
                    source: Span::Output,
                    dest: Span::Output,
                    copy_len,
                },
            ]),
            // Decipher payload and MAC-I, then verify the MAC over the result.
            OperationType::Decapsulate => Self::Double([
                Pass {
                    op: cipher_op,
                    flags: cipher_flag | DescriptorFlags::FIRST_PASS,
                    source: Span::Input,
                    dest: Span::Output,
                    copy_len,
                },
                Pass {
                    op: integrity_op,
                    flags: auth_flags | mac_flag | DescriptorFlags::FENCE,
                    source: Span::Output,
                    dest: Span::None,
                    copy_len: 0,
                },
            ]),
        }
    }

    /// Passes in submission order.
    pub fn passes(&self) -> &[Pass] {
        match self {
            Self::Single(p) => std::slice::from_ref(p),
            Self::Double(p) => p,
        }
    }

    /// Number of descriptors per packet.
    pub fn descriptor_count(&self) -> usize {
        self.passes().len()
    }
}

/// Outcome of deriving COUNT for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountStep {
    /// COUNT used in the IVs.
    pub count: u32,
    /// Sequence number of the packet.
    pub sn: u32,
    /// Stored HFN after this packet.
    pub hfn: u32,
    /// Whether this packet's SN wrapped the HFN.
    pub rolled_over: bool,
    /// Whether the stored HFN is at or above the threshold.
    pub threshold_reached: bool,
    /// Whether COUNT came from an override; tracking is left unchanged.
    pub overridden: bool,
}

/// Hardware job template of one context.
#[derive(Debug)]
pub struct ContextDescriptor {
    pdb: DmaBox<ProtocolDataBlob>,
    plan: PassPlan,
    sn_size: SnSize,
    operation: OperationType,
    protocol: Protocol,
    cipher: CipherAlgorithm,
    integrity: IntegrityAlgorithm,
    cipher_key: Option<(PhysAddr, u32)>,
    integrity_key: Option<(PhysAddr, u32)>,
    hfn_override: bool,
}

fn translate_key<T: AddressTranslator + ?Sized>(
    what: &str,
    key: Option<KeyMaterial>,
    translator: &T,
) -> SecResult<Option<(PhysAddr, u32)>> {
    key.map(|k| {
        translator
            .virt_to_phys(k.as_ptr())
            .map(|phys| (phys, k.len()))
            .ok_or_else(|| SecError::InvalidConfig(format!("{what} key not DMA-visible")))
    })
    .transpose()
}

/// Validates `cfg` and materializes its job template.
pub fn build_context_descriptor(
    cfg: &PdcpConfig,
    mem: &Arc<dyn DmaMemory>,
) -> SecResult<ContextDescriptor> {
    cfg.validate()?;
    let cipher_key = match cfg.cipher {
        CipherAlgorithm::Null => None,
        _ => translate_key("cipher", cfg.cipher_key, &**mem)?,
    };
    let integrity_key = match cfg.integrity {
        IntegrityAlgorithm::Null => None,
        _ => translate_key("integrity", cfg.integrity_key, &**mem)?,
    };
    Ok(ContextDescriptor {
        pdb: DmaBox::new(mem, ProtocolDataBlob::new(cfg))?,
        plan: PassPlan::build(cfg),
        sn_size: cfg.sn_size,
        operation: cfg.operation,
        protocol: cfg.protocol,
        cipher: cfg.cipher,
        integrity: cfg.integrity,
        cipher_key,
        integrity_key,
        hfn_override: cfg.hfn_override,
    })
}

impl ContextDescriptor {
    /// Descriptors per packet.
    pub fn plan(&self) -> &PassPlan {
        &self.plan
    }

    /// Protocol data blob.
    pub fn pdb(&self) -> &ProtocolDataBlob {
        &self.pdb
    }

    /// Sequence number width.
    pub fn sn_size(&self) -> SnSize {
        self.sn_size
    }

    /// Whether per-packet HFN overrides are allowed.
    pub fn allows_hfn_override(&self) -> bool {
        self.hfn_override
    }

    fn mac_len(&self) -> u32 {
        if self.protocol.has_mac() {
            MAC_I_LEN
        } else {
            0
        }
    }

    /// Checks an input/output pair before any state is touched and returns
    /// the number of bytes the packet will occupy in the output.
    pub fn check_lengths(&self, input: &LogicalPacket, output: &LogicalPacket) -> SecResult<u32> {
        let in_len = input.total_length();
        let min_in = self.sn_size.header_len() as u32
            + match self.operation {
                OperationType::Encapsulate => 0,
                OperationType::Decapsulate => self.mac_len(),
            };
        if in_len < min_in {
            return Err(SecError::InvalidInput(format!(
                "input of {in_len} bytes shorter than {min_in}"
            )));
        }
        let mut len = in_len;
        let mut required = 0;
        for pass in self.plan.passes() {
            len = pass.out_len(len)?;
            required = required.max(len);
        }
        if output.total_length() < required {
            return Err(SecError::InvalidInput(format!(
                "output of {} bytes, {required} required",
                output.total_length()
            )));
        }
        match self.operation {
            OperationType::Encapsulate => in_len.checked_add(self.mac_len()),
            OperationType::Decapsulate => in_len.checked_sub(self.mac_len()),
        }
        .ok_or_else(|| SecError::InvalidInput(format!("packet length {in_len} out of range")))
    }

    /// Sequence number encoded in the leading header bytes of `packet`.
    pub fn extract_sn(&self, packet: &LogicalPacket) -> SecResult<u32> {
        let header_len = self.sn_size.header_len() as usize;
        let header = packet
            .head(header_len)
            .ok_or_else(|| SecError::InvalidInput("header not in first fragment".into()))?;
        let word = header.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
        Ok(word & self.pdb.sn_mask)
    }

    /// Derives COUNT for a packet carrying `sn`.
    ///
    /// `hfn` and `last_sn` are the context's stored tracking state. With an
    /// override, COUNT uses the override HFN and the returned step leaves
    /// the tracking state as it was.
    pub fn next_count(
        &self,
        hfn: u32,
        last_sn: Option<u32>,
        sn: u32,
        hfn_override: Option<u32>,
    ) -> CountStep {
        let bits = self.sn_size.bits();
        if let Some(ovr) = hfn_override {
            return CountStep {
                count: (ovr << bits) | sn,
                sn,
                hfn,
                rolled_over: false,
                threshold_reached: hfn >= self.pdb.hfn_threshold,
                overridden: true,
            };
        }
        let rolled_over = sn == 0 && last_sn == Some(self.sn_size.max_sn());
        let hfn = if rolled_over {
            hfn.wrapping_add(1) & self.sn_size.max_hfn()
        } else {
            hfn
        };
        CountStep {
            count: (hfn << bits) | sn,
            sn,
            hfn,
            rolled_over,
            threshold_reached: hfn >= self.pdb.hfn_threshold,
            overridden: false,
        }
    }
}

/// Writes the cipher and MAC IVs for `count` into a job's scratch area.
pub fn write_iv(ctx: &ContextDescriptor, scratch: &mut JobScratch, count: u32) {
    let pdb = ctx.pdb();
    let count_be = count.to_be_bytes();

    scratch.cipher_iv = [0; 16];
    if ctx.cipher != CipherAlgorithm::Null {
        scratch.cipher_iv[..8].copy_from_slice(&pdb.iv_template);
        scratch.cipher_iv[..4].copy_from_slice(&count_be);
    }

    scratch.mac_iv = pdb.mac_iv_template;
    match ctx.integrity {
        IntegrityAlgorithm::Snow => {
            // Words 0 and 2 of the F9 image carry COUNT.
            for word in [0usize, 8] {
                for (dst, src) in scratch.mac_iv[word..word + 4].iter_mut().zip(count_be) {
                    *dst ^= src;
                }
            }
        }
        IntegrityAlgorithm::Aes => scratch.mac_iv[..4].copy_from_slice(&count_be),
        IntegrityAlgorithm::Null => {}
    }
    scratch.mac = [0; 8];
}

/// Mutable parts of a job slot touched by [`update_packet_descriptor`].
pub struct JobView<'a> {
    /// Descriptor of the slot.
    pub desc: &'a mut JobDescriptor,
    /// Physical address of the IV/MAC scratch area used by the packet.
    pub scratch_phys: PhysAddr,
    /// Scatter-gather tables of the slot.
    pub sg: &'a mut SgContext,
}

fn packet_phys<T: AddressTranslator + ?Sized>(
    packet: &LogicalPacket,
    translator: &T,
    what: &str,
) -> SecResult<PhysAddr> {
    let frag = packet
        .first()
        .ok_or_else(|| SecError::InvalidInput(format!("{what} packet has no buffer")))?;
    translator
        .virt_to_phys(frag.addr())
        .map(|phys| phys + frag.offset() as PhysAddr)
        .ok_or_else(|| SecError::InvalidInput(format!("{what} buffer not DMA-visible")))
}

/// Fills `job` with descriptor `pass` of a packet.
///
/// `in_len` is the number of bytes the pass reads from its source span.
/// Returns the number of bytes it writes. On error the descriptor content
/// is unspecified and must not be committed.
pub fn update_packet_descriptor<T: AddressTranslator + ?Sized>(
    ctx: &ContextDescriptor,
    pass: &Pass,
    job: JobView<'_>,
    input: &LogicalPacket,
    output: &LogicalPacket,
    in_len: u32,
    translator: &T,
) -> SecResult<u32> {
    let JobView {
        desc,
        scratch_phys,
        sg,
    } = job;
    desc.reset();
    sg.clear();
    let mut flags = pass.flags;

    let source = match pass.source {
        Span::Output => output,
        _ => input,
    };
    let what = if pass.source == Span::Output {
        "output"
    } else {
        "input"
    };

    let mac_iv_len: u32 = match ctx.integrity {
        IntegrityAlgorithm::Snow => 16,
        IntegrityAlgorithm::Aes => 8,
        IntegrityAlgorithm::Null => 0,
    };
    let mut hw_in_len = in_len;
    desc.in_addr = if flags.contains(DescriptorFlags::MAC_IV_PREPENDED) {
        let prefix = scratch_phys + MAC_IV_OFFSET as PhysAddr;
        assemble_prefixed(&mut sg.input, prefix, mac_iv_len, source, translator)?;
        hw_in_len = hw_in_len
            .checked_add(mac_iv_len)
            .ok_or_else(|| SecError::InvalidInput(format!("{what} length {in_len} out of range")))?;
        flags |= DescriptorFlags::IN_SG;
        sg.input.phys()
    } else if source.is_scattered() {
        assemble(&mut sg.input, source, SgDirection::Input, translator)?;
        flags |= DescriptorFlags::IN_SG;
        sg.input.phys()
    } else {
        packet_phys(source, translator, what)?
    };

    let out_len = pass.out_len(in_len)?;
    desc.out_addr = match pass.dest {
        Span::None => 0,
        _ if output.is_scattered() => {
            assemble(&mut sg.output, output, SgDirection::Output, translator)?;
            flags |= DescriptorFlags::OUT_SG;
            sg.output.phys()
        }
        _ => packet_phys(output, translator, "output")?,
    };

    desc.header = flags.bits();
    desc.op = pass.op;
    desc.pdb_addr = ctx.pdb.phys();
    desc.in_len = hw_in_len;
    desc.out_len = out_len;

    let mut iv_len = 0;
    let mut key_len = 0;
    if flags.contains(DescriptorFlags::CIPHER) {
        let (key, len) = ctx.cipher_key.unwrap_or((0, 0));
        desc.iv_addr = scratch_phys + CIPHER_IV_OFFSET as PhysAddr;
        desc.key_addr = key;
        iv_len = CIPHER_IV_LEN;
        key_len = len as u8;
    }
    let mut mac_len = 0;
    if flags.contains(DescriptorFlags::INTEGRITY) {
        let (key, len) = ctx.integrity_key.unwrap_or((0, 0));
        desc.mac_iv_addr = scratch_phys + MAC_IV_OFFSET as PhysAddr;
        desc.auth_key_addr = key;
        desc.auth_key_len = len;
        mac_len = mac_iv_len as u8;
    }
    desc.set_lengths(iv_len, mac_len, pass.copy_len, key_len);
    Ok(out_len)
}
