//! Internal key layout.
//!
//! The engine stores each user key with an 8-byte trailer packing a 56-bit
//! sequence number and an 8-bit value type, little-endian:
//!
//! ```text
//! [user key bytes][ (sequence << 8) | type : u64 LE ]
//! ```
//!
//! Blocks and the index hold internal keys; filters and prefix transforms
//! operate on the user-key portion.

use crate::encoding::decode_fixed64;
use crate::error::TableError;

/// Size of the sequence/type trailer.
pub const TAG_SIZE: usize = 8;

/// Largest representable sequence number (56 bits).
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 56) - 1;

/// What a table entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// A point tombstone.
    Deletion = 0,
    /// A regular value.
    Value = 1,
}

impl ValueType {
    fn from_u8(raw: u8) -> Option<ValueType> {
        match raw {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// An internal key split into its components. Borrows the user key from the
/// encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: u64,
    pub value_type: ValueType,
}

pub fn pack_sequence_and_type(sequence: u64, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | u64::from(value_type as u8)
}

/// Append `user_key` plus trailer to `dst`.
pub fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    sequence: u64,
    value_type: ValueType,
) {
    dst.extend_from_slice(user_key);
    dst.extend_from_slice(&pack_sequence_and_type(sequence, value_type).to_le_bytes());
}

/// The user-key portion of an encoded internal key.
///
/// Internal keys are produced by the engine and always carry the trailer;
/// this is enforced in debug builds only.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= TAG_SIZE);
    &internal_key[..internal_key.len().saturating_sub(TAG_SIZE)]
}

/// The raw `(sequence << 8) | type` trailer.
pub fn extract_tag(internal_key: &[u8]) -> u64 {
    debug_assert!(internal_key.len() >= TAG_SIZE);
    decode_fixed64(&internal_key[internal_key.len() - TAG_SIZE..])
}

/// Split an internal key into components.
///
/// Returns `Corruption` when the key is shorter than the trailer or carries
/// an unknown value type; `get` surfaces this to the caller.
pub fn parse_internal_key(internal_key: &[u8]) -> Result<ParsedInternalKey<'_>, TableError> {
    if internal_key.len() < TAG_SIZE {
        return Err(TableError::corruption("internal key too short"));
    }
    let tag = extract_tag(internal_key);
    let value_type = ValueType::from_u8((tag & 0xff) as u8)
        .ok_or_else(|| TableError::corruption(format!("unknown value type {}", tag & 0xff)))?;
    Ok(ParsedInternalKey {
        user_key: &internal_key[..internal_key.len() - TAG_SIZE],
        sequence: tag >> 8,
        value_type,
    })
}
