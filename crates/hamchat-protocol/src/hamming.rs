//! Hamming(7,4) channel code.
//!
//! Bit positions are 1-indexed. Parity bits sit at 1, 2 and 4; data bits
//! d1..d4 sit at 3, 5, 6 and 7, with d1 the most significant bit of the
//! nibble:
//!
//! ```text
//! position: 1  2  3  4  5  6  7
//! bit:      p1 p2 d1 p3 d2 d3 d4
//! ```
//!
//! p1 covers d1,d2,d4; p2 covers d1,d3,d4; p3 covers d2,d3,d4.
//!
//! Known limitation: one flipped bit per block is corrected. Two or more
//! flipped bits in the same block produce a nonzero syndrome that points
//! at the wrong bit, so decode silently returns the wrong nibble. The
//! envelope CRC is what catches that case.

use crate::{ProtocolError, BLOCK_SIZE};

/// Symbols per codeword on the wire.
pub const CODE_BITS: usize = 7;

/// Filler byte that pads each 7-symbol codeword to [`BLOCK_SIZE`].
pub const FILLER: u8 = 0x00;

/// A 7-bit codeword. Bit `n - 1` of the inner byte holds position `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codeword(u8);

/// Result of decoding one codeword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Recovered 4-bit value.
    pub data: u8,
    /// 1-indexed position that was flipped back, or `None` when the
    /// syndrome was zero.
    pub corrected: Option<u8>,
}

impl Codeword {
    /// Build from the low 7 bits of `bits`.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x7F)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Value at 1-indexed `position` (1..=7).
    pub fn bit(self, position: u8) -> u8 {
        (self.0 >> (position - 1)) & 1
    }

    /// Copy with the bit at 1-indexed `position` inverted.
    pub fn flipped(self, position: u8) -> Self {
        Self(self.0 ^ (1 << (position - 1)))
    }

    /// Wire form: positions 1..=7 as ASCII '0'/'1', then the filler byte.
    pub fn to_block(self) -> [u8; BLOCK_SIZE] {
        let mut block = [FILLER; BLOCK_SIZE];
        for (i, slot) in block.iter_mut().take(CODE_BITS).enumerate() {
            *slot = if (self.0 >> i) & 1 == 1 { b'1' } else { b'0' };
        }
        block
    }

    /// Parse a wire block. Only the first 7 bytes are symbols; the filler is
    /// not inspected. `offset` is the block's position in the frame and is
    /// only used for error reporting.
    pub fn from_block(block: &[u8], offset: usize) -> Result<Self, ProtocolError> {
        if block.len() != BLOCK_SIZE {
            return Err(ProtocolError::PartialBlock { len: block.len() });
        }
        let mut bits = 0u8;
        for (i, &symbol) in block.iter().take(CODE_BITS).enumerate() {
            match symbol {
                b'0' => {}
                b'1' => bits |= 1 << i,
                other => {
                    return Err(ProtocolError::InvalidSymbol {
                        offset: offset + i,
                        byte: other,
                    })
                }
            }
        }
        Ok(Self(bits))
    }
}

/// Encode the low 4 bits of `nibble`.
pub fn encode(nibble: u8) -> Codeword {
    let d1 = (nibble >> 3) & 1;
    let d2 = (nibble >> 2) & 1;
    let d3 = (nibble >> 1) & 1;
    let d4 = nibble & 1;

    let p1 = d1 ^ d2 ^ d4;
    let p2 = d1 ^ d3 ^ d4;
    let p3 = d2 ^ d3 ^ d4;

    Codeword(p1 | (p2 << 1) | (d1 << 2) | (p3 << 3) | (d2 << 4) | (d3 << 5) | (d4 << 6))
}

/// Decode a codeword, correcting at most one flipped bit.
pub fn decode(code: Codeword) -> Decoded {
    let b = |pos| code.bit(pos);
    let s1 = b(1) ^ b(3) ^ b(5) ^ b(7);
    let s2 = b(2) ^ b(3) ^ b(6) ^ b(7);
    let s4 = b(4) ^ b(5) ^ b(6) ^ b(7);
    let syndrome = s1 | (s2 << 1) | (s4 << 2);

    let (fixed, corrected) = if syndrome == 0 {
        (code, None)
    } else {
        (code.flipped(syndrome), Some(syndrome))
    };

    let data = (fixed.bit(3) << 3) | (fixed.bit(5) << 2) | (fixed.bit(6) << 1) | fixed.bit(7);
    Decoded { data, corrected }
}
