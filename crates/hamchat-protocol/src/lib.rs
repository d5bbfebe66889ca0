//! Hamchat Protocol -- envelope framing and channel coding.
//!
//! Plain TCP between client and server. Each envelope is tag-wrapped text
//! with a CRC32 trailer, channel-coded as Hamming(7,4) blocks of ASCII
//! '0'/'1' symbols and terminated by a newline.

pub mod checksum;
pub mod codec;
pub mod envelope;
pub mod hamming;
pub mod messages;

pub use checksum::{checksum, checksum_hex};
pub use codec::{EnvelopeCodec, Received};
pub use envelope::{BlockCorrection, Envelope, EnvelopeKind, Parsed};
pub use hamming::Codeword;
pub use messages::*;

/// Wire bytes per channel-coded block (7 symbols + 1 filler).
pub const BLOCK_SIZE: usize = 8;

/// Terminator written after the last block of an envelope.
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Default cap on a single framed envelope, in wire bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Longest accepted message body, in characters.
pub const MAX_BODY_LEN: usize = 50_000;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("checksum mismatch: envelope carries {expected:08X}, computed {computed:08X}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("invalid symbol {byte:#04x} at wire offset {offset}")]
    InvalidSymbol { offset: usize, byte: u8 },
    #[error("partial block: {len} wire bytes is not a multiple of 8")]
    PartialBlock { len: usize },
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("bad request payload: {0}")]
    BadPayload(String),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for errors that mean "this frame arrived damaged": the request is
    /// dropped but the stream itself is still usable.
    pub fn is_corrupt_frame(&self) -> bool {
        matches!(
            self,
            ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::InvalidSymbol { .. }
                | ProtocolError::PartialBlock { .. }
                | ProtocolError::Malformed(_)
        )
    }
}
