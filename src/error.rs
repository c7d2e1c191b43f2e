//! Status type shared by every layer of the table reader.
//!
//! Unlike the per-operation error enums used elsewhere in the ecosystem,
//! iterators need a *storable* status: a cursor that hit a checksum mismatch
//! keeps reporting it from `status()` until it is re-seated. `TableError` is
//! therefore `Clone` (I/O errors are captured as their display string).

use std::io;

use thiserror::Error;

use crate::encoding::EncodingError;

/// Errors surfaced by the table reader.
///
/// "Not found" is deliberately absent: a missing key is reported through
/// iterator invalidity or [`GetContext`](crate::table::GetContext) state,
/// never as an error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TableError {
    /// The file contents contradict the format: bad magic, bad checksum,
    /// undecodable handle, invalid filter structure.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A block was required but not resident, and the read options forbid
    /// file I/O (`ReadTier::BlockCacheTier`).
    #[error("incomplete: {0}")]
    Incomplete(String),

    /// The caller asked for something nonsensical, e.g. `prefetch` with
    /// `begin > end` or an index type this build does not know.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying I/O failure, captured as a message so the status stays
    /// cloneable inside iterators.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TableError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        TableError::Corruption(msg.into())
    }

    pub fn incomplete(msg: impl Into<String>) -> Self {
        TableError::Incomplete(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        TableError::InvalidArgument(msg.into())
    }

    /// True when the error means "not resident under no-I/O", which `get`
    /// translates into [`GetContext::mark_key_may_exist`](crate::table::GetContext::mark_key_may_exist).
    pub fn is_incomplete(&self) -> bool {
        matches!(self, TableError::Incomplete(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, TableError::Corruption(_))
    }
}

impl From<io::Error> for TableError {
    fn from(e: io::Error) -> Self {
        TableError::Io(e.to_string())
    }
}

impl From<EncodingError> for TableError {
    fn from(e: EncodingError) -> Self {
        TableError::Corruption(e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T, E = TableError> = std::result::Result<T, E>;

/// Status carried by iterators: `Ok(())` until the first failure.
pub type Status = Result<()>;
