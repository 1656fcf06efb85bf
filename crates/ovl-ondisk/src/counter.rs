//! The next-inode-number payload: exactly 8 bytes, little-endian `u64`.

use ovl_types::{InodeNumber, NEXT_INODE_NUMBER_LEN, ParseError, read_le_u64};

#[must_use]
pub fn encode_next_inode_number(next: InodeNumber) -> [u8; NEXT_INODE_NUMBER_LEN] {
    next.0.to_le_bytes()
}

/// Decode a next-inode-number payload.
///
/// Anything other than exactly [`NEXT_INODE_NUMBER_LEN`] bytes is rejected,
/// including longer payloads that happen to start with a valid integer.
pub fn decode_next_inode_number(data: &[u8]) -> Result<InodeNumber, ParseError> {
    if data.len() != NEXT_INODE_NUMBER_LEN {
        return Err(ParseError::InvalidField {
            field: "next_inode_number",
            reason: "payload must be exactly 8 bytes",
        });
    }
    read_le_u64(data, 0).map(InodeNumber)
}
