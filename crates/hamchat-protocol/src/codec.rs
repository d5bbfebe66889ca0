//! Newline-terminated envelope codec for TCP streams.
//!
//! Wire format: channel-coded envelope blocks followed by a single '\n'.
//! Blocks only ever contain '0', '1' and the 0x00 filler, so the
//! terminator cannot appear inside a frame.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::{BlockCorrection, Envelope};
use crate::{ProtocolError, DEFAULT_MAX_FRAME_BYTES, FRAME_TERMINATOR};

/// One decoded frame. Damaged frames are items rather than stream errors
/// so a caller can report them and keep reading.
#[derive(Debug)]
pub enum Received {
    Envelope {
        envelope: Envelope,
        corrections: Vec<BlockCorrection>,
    },
    Corrupt(ProtocolError),
}

/// Codec for framing [`Envelope`] values over a byte stream.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame_bytes: usize,
    /// How far into the buffer we already searched for a terminator.
    scanned: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            scanned: 0,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn receive(frame: &[u8]) -> Received {
        match Envelope::parse(frame).and_then(|parsed| parsed.verify()) {
            Ok((envelope, corrections)) => Received::Envelope {
                envelope,
                corrections,
            },
            Err(e) => {
                tracing::trace!(len = frame.len(), "codec: corrupt frame: {e}");
                Received::Corrupt(e)
            }
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Received;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let start = self.scanned.min(src.len());
            let found = src[start..]
                .iter()
                .position(|&b| b == FRAME_TERMINATOR)
                .map(|i| start + i);

            let Some(end) = found else {
                if src.len() > self.max_frame_bytes {
                    return Err(ProtocolError::FrameTooLarge {
                        size: src.len(),
                        max: self.max_frame_bytes,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            self.scanned = 0;
            let line = src.split_to(end + 1);
            let frame = &line[..end];

            if frame.is_empty() {
                // Blank keep-alive line
                continue;
            }
            if frame.len() > self.max_frame_bytes {
                return Err(ProtocolError::FrameTooLarge {
                    size: frame.len(),
                    max: self.max_frame_bytes,
                });
            }

            return Ok(Some(Self::receive(frame)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        self.scanned = 0;
        if src.is_empty() {
            return Ok(None);
        }
        // Peer closed mid-frame
        let len = src.len();
        src.clear();
        Ok(Some(Received::Corrupt(ProtocolError::Malformed(format!(
            "stream ended inside a frame ({len} bytes)"
        )))))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Envelope>>::encode(self, &item, dst)
    }
}

impl Encoder<&Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.build();

        if wire.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: wire.len(),
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(wire.len() + 1);
        dst.extend_from_slice(&wire);
        dst.put_u8(FRAME_TERMINATOR);

        Ok(())
    }
}
