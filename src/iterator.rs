//! Cursor contract shared by block, index, and table iterators.

use crate::error::Status;

/// A seekable cursor over `(key, value)` entries in comparator order.
///
/// Positioning calls leave the cursor either on an entry (`valid()`) or
/// off the end; `key`/`value` may only be called while valid. Errors stick:
/// once `status()` reports a failure the cursor stays invalid until it is
/// re-seated by a successful positioning call.
pub trait InternalIterator {
    fn valid(&self) -> bool;

    /// Position at the first entry with key ≥ `target`.
    fn seek(&mut self, target: &[u8]);

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Advance. Requires `valid()`.
    fn next(&mut self);

    /// Step backwards. Requires `valid()`.
    fn prev(&mut self);

    /// Current key. Requires `valid()`.
    fn key(&self) -> &[u8];

    /// Current value. Requires `valid()`.
    fn value(&self) -> &[u8];

    /// First error this cursor (or anything beneath it) encountered.
    fn status(&self) -> Status;
}
