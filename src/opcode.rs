// SEC PDCP Job Ring Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Algorithm selectors and protocol operation codes.
//!
//! The protocol operation word placed in every job descriptor packs the
//! operation type, the protocol identifier and the algorithm selectors:
//!
//! | Bits    | Field |
//! |---------|-------|
//! | [31:24] | operation type (encapsulate / decapsulate) |
//! | [23:16] | protocol identifier |
//! | [15:8]  | integrity algorithm |
//! | [7:0]   | cipher algorithm |

/// Ciphering algorithm of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CipherAlgorithm {
    /// No ciphering (EEA0).
    Null = 0x00,
    /// SNOW 3G F8 (EEA1).
    Snow = 0x01,
    /// AES-CTR (EEA2).
    Aes = 0x02,
    /// KASUMI F8.
    Kasumi = 0x03,
}

/// Integrity algorithm of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IntegrityAlgorithm {
    /// No integrity protection (EIA0).
    Null = 0x00,
    /// SNOW 3G F9 (EIA1).
    Snow = 0x01,
    /// AES-CMAC (EIA2).
    Aes = 0x02,
}

impl CipherAlgorithm {
    /// Returns the selector as a u8 value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns a human-readable name for the algorithm.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Snow => "SNOW_F8",
            Self::Aes => "AES_CTR",
            Self::Kasumi => "KASUMI_F8",
        }
    }

    /// Whether the hardware runs this cipher and `integrity` in one combined
    /// descriptor. Mixed families need a separate pass per algorithm.
    pub const fn combines_with(self, integrity: IntegrityAlgorithm) -> bool {
        matches!(
            (self, integrity),
            (Self::Null, _)
                | (_, IntegrityAlgorithm::Null)
                | (Self::Snow, IntegrityAlgorithm::Snow)
                | (Self::Aes, IntegrityAlgorithm::Aes)
        )
    }
}

impl IntegrityAlgorithm {
    /// Returns the selector as a u8 value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns a human-readable name for the algorithm.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Snow => "SNOW_F9",
            Self::Aes => "AES_CMAC",
        }
    }
}

impl std::fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}

impl std::fmt::Display for IntegrityAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}

/// Protocol operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationType {
    /// Receive side: decipher and verify.
    Decapsulate = 0x06,
    /// Transmit side: protect and cipher.
    Encapsulate = 0x07,
}

/// Protocol identifier understood by the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// PDCP data (user) plane.
    PdcpData = 0x42,
    /// PDCP control plane.
    PdcpControl = 0x43,
    /// RLC PDU ciphering.
    Rlc = 0x46,
}

/// Packs an operation word from its fields.
#[inline]
pub const fn op_word(
    op: OperationType,
    protocol: ProtocolId,
    cipher: CipherAlgorithm,
    integrity: IntegrityAlgorithm,
) -> u32 {
    ((op as u32) << 24)
        | ((protocol as u32) << 16)
        | ((integrity as u32) << 8)
        | cipher as u32
}

/// Cipher selector of a packed operation word.
#[inline]
pub const fn op_cipher(word: u32) -> u8 {
    word as u8
}

/// Integrity selector of a packed operation word.
#[inline]
pub const fn op_integrity(word: u32) -> u8 {
    (word >> 8) as u8
}

/// Operation type of a packed operation word.
#[inline]
pub const fn op_type(word: u32) -> u8 {
    (word >> 24) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_values() {
        assert_eq!(CipherAlgorithm::Null.as_u8(), 0x00);
        assert_eq!(CipherAlgorithm::Snow.as_u8(), 0x01);
        assert_eq!(CipherAlgorithm::Aes.as_u8(), 0x02);
        assert_eq!(CipherAlgorithm::Kasumi.as_u8(), 0x03);
        assert_eq!(IntegrityAlgorithm::Aes.as_u8(), 0x02);
    }

    #[test]
    fn test_algorithm_display() {
        assert_eq!(format!("{}", CipherAlgorithm::Snow), "SNOW_F8 (0x01)");
        assert_eq!(format!("{}", IntegrityAlgorithm::Aes), "AES_CMAC (0x02)");
    }

    #[test]
    fn test_combined_pairs() {
        assert!(CipherAlgorithm::Snow.combines_with(IntegrityAlgorithm::Snow));
        assert!(CipherAlgorithm::Aes.combines_with(IntegrityAlgorithm::Aes));
        assert!(CipherAlgorithm::Null.combines_with(IntegrityAlgorithm::Aes));
        assert!(CipherAlgorithm::Kasumi.combines_with(IntegrityAlgorithm::Null));
        assert!(!CipherAlgorithm::Snow.combines_with(IntegrityAlgorithm::Aes));
        assert!(!CipherAlgorithm::Kasumi.combines_with(IntegrityAlgorithm::Snow));
    }

    #[test]
    fn test_op_word_fields() {
        let w = op_word(
            OperationType::Encapsulate,
            ProtocolId::PdcpControl,
            CipherAlgorithm::Aes,
            IntegrityAlgorithm::Snow,
        );
        assert_eq!(w, 0x0743_0102);
        assert_eq!(op_type(w), 0x07);
        assert_eq!(op_cipher(w), 0x02);
        assert_eq!(op_integrity(w), 0x01);
    }
}
