//! Envelope: tag wrapping, checksum trailer, block channel coding.
//!
//! Text form before channel coding:
//!
//! ```text
//! <REQUEST>payload0A1B2C3D</REQUEST>
//! ```
//!
//! The checksum covers `<REQUEST>payload</REQUEST>` (the wrapped payload
//! without the checksum). The text is expanded to binary digits, most
//! significant bit of each byte first, and every 4-digit slice becomes one
//! Hamming(7,4) block of 8 wire bytes. One text byte therefore costs 16
//! wire bytes.

use crate::checksum::{checksum, parse_checksum_hex, CHECKSUM_HEX_LEN};
use crate::hamming::{self, Codeword};
use crate::{ProtocolError, BLOCK_SIZE};

/// Which side of the exchange an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
}

impl EnvelopeKind {
    pub fn tag(self) -> &'static str {
        match self {
            EnvelopeKind::Request => "REQUEST",
            EnvelopeKind::Response => "RESPONSE",
        }
    }

    fn open(self) -> &'static str {
        match self {
            EnvelopeKind::Request => "<REQUEST>",
            EnvelopeKind::Response => "<RESPONSE>",
        }
    }

    fn close(self) -> &'static str {
        match self {
            EnvelopeKind::Request => "</REQUEST>",
            EnvelopeKind::Response => "</RESPONSE>",
        }
    }
}

/// A logical request or response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub payload: String,
}

/// A block that needed a single-bit repair during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCorrection {
    /// Index of the block within the frame.
    pub block: usize,
    /// 1-indexed bit position that was flipped back.
    pub position: u8,
}

/// Outcome of [`Envelope::parse`].
#[derive(Debug, Clone)]
pub struct Parsed {
    pub envelope: Envelope,
    /// Whether the embedded checksum matched the recomputed one.
    pub checksum_ok: bool,
    pub expected: u32,
    pub computed: u32,
    pub corrections: Vec<BlockCorrection>,
}

impl Parsed {
    /// Reject the envelope unless its checksum verified.
    pub fn verify(self) -> Result<(Envelope, Vec<BlockCorrection>), ProtocolError> {
        if self.checksum_ok {
            Ok((self.envelope, self.corrections))
        } else {
            Err(ProtocolError::ChecksumMismatch {
                expected: self.expected,
                computed: self.computed,
            })
        }
    }
}

impl Envelope {
    pub fn request(payload: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            payload: payload.into(),
        }
    }

    pub fn response(payload: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            payload: payload.into(),
        }
    }

    /// Wrapped text including the checksum, before channel coding.
    pub fn to_text(&self) -> String {
        let wrapped = format!("{}{}{}", self.kind.open(), self.payload, self.kind.close());
        let crc = checksum(wrapped.as_bytes());
        format!(
            "{}{}{:08X}{}",
            self.kind.open(),
            self.payload,
            crc,
            self.kind.close()
        )
    }

    /// Length of [`Envelope::build`] output, without building it.
    pub fn wire_size(&self) -> usize {
        let text_len = self.kind.open().len()
            + self.payload.len()
            + CHECKSUM_HEX_LEN
            + self.kind.close().len();
        wire_len(text_len)
    }

    /// Channel-coded wire bytes (no frame terminator).
    pub fn build(&self) -> Vec<u8> {
        encode_blocks(self.to_text().as_bytes())
    }

    /// Decode wire bytes, repairing single-bit errors per block, and check
    /// the embedded checksum. Structural damage is an error; a checksum
    /// mismatch is reported through [`Parsed::checksum_ok`].
    pub fn parse(wire: &[u8]) -> Result<Parsed, ProtocolError> {
        let (text, corrections) = decode_blocks(wire)?;
        let text = String::from_utf8(text)
            .map_err(|_| ProtocolError::Malformed("envelope text is not UTF-8".into()))?;
        let mut parsed = Self::parse_text(&text)?;
        parsed.corrections = corrections;
        Ok(parsed)
    }

    /// Parse the text form produced by [`Envelope::to_text`].
    pub fn parse_text(text: &str) -> Result<Parsed, ProtocolError> {
        let kind = [EnvelopeKind::Request, EnvelopeKind::Response]
            .into_iter()
            .find(|k| text.starts_with(k.open()))
            .ok_or_else(|| ProtocolError::Malformed("missing opening tag".into()))?;

        let inner = text
            .strip_prefix(kind.open())
            .and_then(|rest| rest.strip_suffix(kind.close()))
            .ok_or_else(|| ProtocolError::Malformed(format!("missing </{}> tag", kind.tag())))?;

        if inner.len() < CHECKSUM_HEX_LEN || !inner.is_char_boundary(inner.len() - CHECKSUM_HEX_LEN)
        {
            return Err(ProtocolError::Malformed("missing checksum".into()));
        }
        let (payload, hex) = inner.split_at(inner.len() - CHECKSUM_HEX_LEN);
        let expected = parse_checksum_hex(hex)
            .ok_or_else(|| ProtocolError::Malformed(format!("bad checksum digits {hex:?}")))?;

        let wrapped = format!("{}{}{}", kind.open(), payload, kind.close());
        let computed = checksum(wrapped.as_bytes());

        Ok(Parsed {
            envelope: Envelope {
                kind,
                payload: payload.to_string(),
            },
            checksum_ok: expected == computed,
            expected,
            computed,
            corrections: Vec::new(),
        })
    }
}

/// Number of wire bytes `text_len` bytes of envelope text occupy.
pub fn wire_len(text_len: usize) -> usize {
    text_len * 2 * BLOCK_SIZE
}

/// Channel-code arbitrary bytes: two nibbles, two blocks per byte.
pub fn encode_blocks(text: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(wire_len(text.len()));
    for &byte in text {
        wire.extend_from_slice(&hamming::encode(byte >> 4).to_block());
        wire.extend_from_slice(&hamming::encode(byte & 0x0F).to_block());
    }
    wire
}

/// Inverse of [`encode_blocks`], returning any single-bit repairs made.
pub fn decode_blocks(wire: &[u8]) -> Result<(Vec<u8>, Vec<BlockCorrection>), ProtocolError> {
    if wire.len() % (2 * BLOCK_SIZE) != 0 {
        return Err(ProtocolError::PartialBlock { len: wire.len() });
    }

    let mut text = Vec::with_capacity(wire.len() / (2 * BLOCK_SIZE));
    let mut corrections = Vec::new();
    let mut high = None;

    for (index, block) in wire.chunks(BLOCK_SIZE).enumerate() {
        let code = Codeword::from_block(block, index * BLOCK_SIZE)?;
        let decoded = hamming::decode(code);
        if let Some(position) = decoded.corrected {
            corrections.push(BlockCorrection {
                block: index,
                position,
            });
        }
        match high.take() {
            None => high = Some(decoded.data),
            Some(h) => text.push((h << 4) | decoded.data),
        }
    }

    Ok((text, corrections))
}
