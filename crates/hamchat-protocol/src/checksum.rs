//! CRC32 integrity check shared by client and server.
//!
//! Standard reflected CRC-32 (polynomial 0xEDB88320, LSB-first, register
//! seeded with 0xFFFFFFFF, final XOR 0xFFFFFFFF). Both ends must use this
//! routine; there is no negotiation.

/// Width of the rendered checksum inside an envelope.
pub const CHECKSUM_HEX_LEN: usize = 8;

/// CRC32 of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// CRC32 of `data` as 8 uppercase hex digits.
pub fn checksum_hex(data: &[u8]) -> String {
    format!("{:08X}", checksum(data))
}

/// Parse an 8-digit hex checksum as rendered by [`checksum_hex`].
pub fn parse_checksum_hex(text: &str) -> Option<u32> {
    if text.len() != CHECKSUM_HEX_LEN || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(text, 16).ok()
}
