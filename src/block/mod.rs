//! Restart-point blocks and their iterator.
//!
//! # Block payload layout
//!
//! ```text
//! +---------------------------------------------------------------+
//! | entry 0 | entry 1 | ... | entry n-1                           |
//! +---------------------------------------------------------------+
//! | restart[0] u32 | restart[1] u32 | ... | num_restarts u32      |
//! +---------------------------------------------------------------+
//! ```
//!
//! Each entry delta-encodes its key against the previous one:
//!
//! ```text
//! [shared: varint32][non_shared: varint32][value_len: varint32]
//! [key delta bytes][value bytes]
//! ```
//!
//! Entries at restart points store their full key (`shared == 0`), which is
//! what makes O(log n) seek possible: binary-search the restart array on
//! full keys, then scan linearly inside the winning interval.
//!
//! A block is immutable once constructed. Iterators share it through an
//! `Arc`, and when the block came out of a cache the iterator additionally
//! pins the cache entry for as long as it lives.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::CacheHandle;
use crate::comparator::{Comparator, SliceTransform};
use crate::encoding::{decode_fixed32, get_varint32};
use crate::error::{Result, Status, TableError};
use crate::format::{BlockContents, CompressionType};
use crate::hash::hash32;
use crate::iterator::InternalIterator;

const RESTART_ENTRY_SIZE: usize = 4;
const HASH_SEED: u32 = 0x8f4c_a6d1;

// ------------------------------------------------------------------------------------------------
// Block
// ------------------------------------------------------------------------------------------------

/// A parsed, immutable block.
pub struct Block {
    data: Vec<u8>,
    restart_offset: usize,
    num_restarts: u32,
    cachable: bool,
    hash_index: Option<BlockHashIndex>,
}

impl Block {
    /// Take ownership of uncompressed block contents and locate the restart
    /// array. Malformed tails are rejected here so iterators can trust the
    /// geometry.
    pub fn new(contents: BlockContents) -> Result<Block> {
        debug_assert_eq!(contents.compression, CompressionType::None);
        let data = contents.data;
        if data.len() < RESTART_ENTRY_SIZE {
            return Err(TableError::corruption("block too small for restart count"));
        }
        let num_restarts = decode_fixed32(&data[data.len() - RESTART_ENTRY_SIZE..]);
        let max_restarts = ((data.len() - RESTART_ENTRY_SIZE) / RESTART_ENTRY_SIZE) as u32;
        if num_restarts > max_restarts {
            return Err(TableError::corruption("restart count exceeds block size"));
        }
        let restart_offset =
            data.len() - RESTART_ENTRY_SIZE - num_restarts as usize * RESTART_ENTRY_SIZE;
        Ok(Block {
            data,
            restart_offset,
            num_restarts,
            cachable: contents.cachable,
            hash_index: None,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn cachable(&self) -> bool {
        self.cachable
    }

    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    /// Attach the prefix map built from the hash-index meta blocks. Done
    /// once, by the hash index reader, before the block is shared.
    pub fn set_hash_index(&mut self, index: BlockHashIndex) {
        self.hash_index = Some(index);
    }

    pub fn hash_index(&self) -> Option<&BlockHashIndex> {
        self.hash_index.as_ref()
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.data.len()
            + self
                .hash_index
                .as_ref()
                .map_or(0, BlockHashIndex::approximate_memory_usage)
    }

    fn restart_point(&self, index: u32) -> usize {
        decode_fixed32(&self.data[self.restart_offset + index as usize * RESTART_ENTRY_SIZE..])
            as usize
    }

    /// Build an iterator over this block.
    ///
    /// `use_hash_index` enables the prefix map (when attached) for `seek`;
    /// total-order scans pass `false`.
    pub fn iter(self: &Arc<Self>, comparator: Arc<dyn Comparator>, use_hash_index: bool) -> BlockIter {
        if self.num_restarts == 0 {
            // An empty block is a valid file artifact; the iterator is
            // permanently invalid but not an error.
            return BlockIter::empty(comparator);
        }
        BlockIter {
            block: Some(Arc::clone(self)),
            comparator,
            current: self.restart_offset,
            restart_index: self.num_restarts,
            key: Vec::new(),
            value: self.restart_offset..self.restart_offset,
            status: None,
            use_hash_index: use_hash_index && self.hash_index.is_some(),
            pin: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Hash index auxiliary
// ------------------------------------------------------------------------------------------------

/// Restart-interval `[start, end)` covering one prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRange {
    pub start: u32,
    pub end: u32,
}

/// Outcome of a prefix lookup during a hash-assisted seek.
pub enum PrefixLookup {
    /// The prefix maps to this restart interval.
    Range(RestartRange),
    /// The prefix is definitively absent from the block.
    Absent,
    /// The key is outside the transform's domain; use plain binary search.
    Fallback,
}

enum PrefixMap {
    /// Exact prefix bytes; membership answers are authoritative.
    Exact(HashMap<Vec<u8>, RestartRange>),
    /// Hash of the prefix only. Denser; collisions can only widen a hit,
    /// never turn a present prefix into a miss.
    Hashed(HashMap<u32, RestartRange>),
}

/// In-memory prefix → restart-range map attached to an index block.
pub struct BlockHashIndex {
    transform: Arc<dyn SliceTransform>,
    map: PrefixMap,
    memory: usize,
}

impl BlockHashIndex {
    /// Build from the two hash-index meta blocks.
    ///
    /// `prefixes` is a sequence of length-prefixed prefix slices;
    /// `prefixes_meta` a parallel sequence of `[start: varint32]
    /// [count: varint32]` restart ranges. A count mismatch or truncation is
    /// an error; the caller degrades to plain binary search.
    pub fn build(
        transform: Arc<dyn SliceTransform>,
        prefixes: &[u8],
        prefixes_meta: &[u8],
        num_restarts: u32,
        allow_collision: bool,
    ) -> Result<BlockHashIndex> {
        let mut names = Vec::new();
        let mut input = prefixes;
        while !input.is_empty() {
            let prefix = crate::encoding::get_length_prefixed_slice(&mut input)
                .map_err(|_| TableError::corruption("bad hash-index prefixes block"))?;
            names.push(prefix);
        }

        let mut ranges = Vec::new();
        let mut input = prefixes_meta;
        while !input.is_empty() {
            let start = get_varint32(&mut input)
                .map_err(|_| TableError::corruption("bad hash-index metadata block"))?;
            let count = get_varint32(&mut input)
                .map_err(|_| TableError::corruption("bad hash-index metadata block"))?;
            let end = start
                .checked_add(count)
                .filter(|&end| end <= num_restarts)
                .ok_or_else(|| TableError::corruption("hash-index range out of bounds"))?;
            ranges.push(RestartRange { start, end });
        }

        if names.len() != ranges.len() {
            return Err(TableError::corruption(format!(
                "hash-index block mismatch: {} prefixes, {} ranges",
                names.len(),
                ranges.len()
            )));
        }

        let mut memory = 0;
        let map = if allow_collision {
            let mut map = HashMap::with_capacity(names.len());
            for (name, range) in names.iter().zip(&ranges) {
                match map.entry(hash32(name, HASH_SEED)) {
                    std::collections::hash_map::Entry::Vacant(v) => {
                        v.insert(*range);
                    }
                    std::collections::hash_map::Entry::Occupied(mut o) => {
                        // Colliding prefixes share a widened interval.
                        let merged = RestartRange {
                            start: o.get().start.min(range.start),
                            end: o.get().end.max(range.end),
                        };
                        o.insert(merged);
                    }
                }
                memory += std::mem::size_of::<(u32, RestartRange)>();
            }
            PrefixMap::Hashed(map)
        } else {
            let mut map = HashMap::with_capacity(names.len());
            for (name, range) in names.iter().zip(&ranges) {
                memory += name.len() + std::mem::size_of::<RestartRange>();
                map.insert(name.to_vec(), *range);
            }
            PrefixMap::Exact(map)
        };

        Ok(BlockHashIndex {
            transform,
            map,
            memory,
        })
    }

    /// Look up the restart interval for `key`'s prefix.
    pub fn lookup(&self, key: &[u8]) -> PrefixLookup {
        if !self.transform.in_domain(key) {
            return PrefixLookup::Fallback;
        }
        let prefix = self.transform.transform(key);
        let hit = match &self.map {
            PrefixMap::Exact(map) => map.get(prefix).copied(),
            PrefixMap::Hashed(map) => map.get(&hash32(prefix, HASH_SEED)).copied(),
        };
        match hit {
            Some(range) => PrefixLookup::Range(range),
            None => PrefixLookup::Absent,
        }
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.memory
    }
}

// ------------------------------------------------------------------------------------------------
// BlockIter
// ------------------------------------------------------------------------------------------------

/// Cursor over one block.
///
/// Holds the block alive via `Arc` and, when the block was sourced from a
/// cache, keeps the cache entry pinned until dropped — the Rust shape of
/// "register a cleanup that releases the handle".
pub struct BlockIter {
    block: Option<Arc<Block>>,
    comparator: Arc<dyn Comparator>,
    /// Offset of the current entry; `== restart_offset` means "not valid".
    current: usize,
    /// Restart interval containing `current`.
    restart_index: u32,
    key: Vec<u8>,
    value: std::ops::Range<usize>,
    status: Option<TableError>,
    use_hash_index: bool,
    pin: Option<CacheHandle>,
}

impl BlockIter {
    /// A permanently-invalid iterator with `Ok` status.
    pub fn empty(comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block: None,
            comparator,
            current: 0,
            restart_index: 0,
            key: Vec::new(),
            value: 0..0,
            status: None,
            use_hash_index: false,
            pin: None,
        }
    }

    /// A permanently-invalid iterator carrying `error`.
    pub fn with_error(comparator: Arc<dyn Comparator>, error: TableError) -> BlockIter {
        let mut iter = BlockIter::empty(comparator);
        iter.status = Some(error);
        iter
    }

    /// Attach the cache pin this iterator must hold while alive.
    pub(crate) fn set_pin(&mut self, pin: CacheHandle) {
        debug_assert!(self.pin.is_none());
        self.pin = Some(pin);
    }

    pub fn set_status(&mut self, error: TableError) {
        self.status = Some(error);
        self.invalidate();
    }

    fn block(&self) -> &Block {
        self.block.as_deref().expect("iterator has no block")
    }

    fn invalidate(&mut self) {
        let end = self.block.as_deref().map_or(0, |block| block.restart_offset);
        if let Some(block) = self.block.as_deref() {
            self.restart_index = block.num_restarts;
        }
        self.current = end;
        self.key.clear();
        // Park the cursor at the entry-region boundary so a stray advance
        // in release builds re-detects the end instead of re-parsing.
        self.value = end..end;
    }

    fn corrupt(&mut self) {
        self.status = Some(TableError::corruption("bad entry in block"));
        self.invalidate();
    }

    /// Offset just past the current entry's value.
    fn next_entry_offset(&self) -> usize {
        self.value.end
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.restart_index = index;
        self.key.clear();
        let offset = self.block().restart_point(index);
        // Empty value range positioned at the restart; parse_next_entry
        // picks it up from `value.end`.
        self.value = offset..offset;
    }

    /// Decode the entry at `next_entry_offset`, extending the running key.
    /// Returns false (and poisons the iterator) at the end of the entry
    /// region or on malformed data.
    fn parse_next_entry(&mut self) -> bool {
        let offset = self.next_entry_offset();
        let block = match &self.block {
            Some(block) => Arc::clone(block),
            None => return false,
        };
        let restart_offset = block.restart_offset;
        if offset >= restart_offset {
            self.invalidate();
            return false;
        }

        let data = &block.data;
        let mut input = &data[offset..restart_offset];
        let header = (|| -> Result<(u32, u32, u32), crate::encoding::EncodingError> {
            let shared = get_varint32(&mut input)?;
            let non_shared = get_varint32(&mut input)?;
            let value_len = get_varint32(&mut input)?;
            Ok((shared, non_shared, value_len))
        })();
        let (shared, non_shared, value_len) = match header {
            Ok(header) => header,
            Err(_) => {
                self.corrupt();
                return false;
            }
        };

        let key_offset = restart_offset - input.len();
        let value_offset = key_offset + non_shared as usize;
        let value_end = value_offset + value_len as usize;
        if shared as usize > self.key.len() || value_end > restart_offset {
            self.corrupt();
            return false;
        }

        self.current = offset;
        self.key.truncate(shared as usize);
        self.key.extend_from_slice(&data[key_offset..value_offset]);
        self.value = value_offset..value_end;

        // Track which restart interval we are in, for prev().
        while self.restart_index + 1 < block.num_restarts
            && block.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    /// Linear scan from the current restart point to the first key ≥ target.
    fn scan_forward_to(&mut self, target: &[u8]) {
        use std::cmp::Ordering;
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    /// Binary-search the restart array within `[left, right]` for the last
    /// restart point whose key is < target, then scan linearly.
    fn seek_in_restart_range(&mut self, target: &[u8], mut left: u32, mut right: u32) {
        use std::cmp::Ordering;
        while left < right {
            let mid = (left + right + 1) / 2;
            let offset = self.block().restart_point(mid);
            match self.decode_restart_key(offset) {
                Some((key_start, key_end)) => {
                    let data = &self.block().data;
                    let key = &data[key_start..key_end];
                    if self.comparator.compare(key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                None => {
                    self.corrupt();
                    return;
                }
            }
        }
        self.seek_to_restart_point(left);
        self.scan_forward_to(target);
    }

    /// Decode the full key stored at a restart point, returning its byte
    /// range within the block. Restart entries always have `shared == 0`.
    fn decode_restart_key(&self, offset: usize) -> Option<(usize, usize)> {
        let block = self.block.as_deref()?;
        let restart_offset = block.restart_offset;
        let data = &block.data;
        let mut input = &data[offset..restart_offset];
        let shared = get_varint32(&mut input).ok()?;
        let non_shared = get_varint32(&mut input).ok()?;
        let _value_len = get_varint32(&mut input).ok()?;
        if shared != 0 {
            return None;
        }
        let key_offset = restart_offset - input.len();
        let key_end = key_offset + non_shared as usize;
        if key_end > restart_offset {
            return None;
        }
        Some((key_offset, key_end))
    }

    fn seek_with_hash_index(&mut self, target: &[u8]) -> bool {
        let lookup = match self.block().hash_index() {
            Some(index) => index.lookup(target),
            None => return false,
        };
        match lookup {
            PrefixLookup::Fallback => false,
            PrefixLookup::Absent => {
                // No key with this prefix exists in the block; invalid with
                // Ok status is the "definitively not here" answer.
                self.invalidate();
                true
            }
            PrefixLookup::Range(range) => {
                debug_assert!(range.start < range.end);
                self.seek_in_restart_range(target, range.start, range.end - 1);
                true
            }
        }
    }
}

impl InternalIterator for BlockIter {
    fn valid(&self) -> bool {
        match self.block.as_deref() {
            Some(block) => self.status.is_none() && self.current < block.restart_offset,
            None => false,
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.is_none() {
            return;
        }
        self.status = None;
        if self.use_hash_index && self.seek_with_hash_index(target) {
            return;
        }
        self.seek_in_restart_range(target, 0, self.block().num_restarts - 1);
    }

    fn seek_to_first(&mut self) {
        if self.block.is_none() {
            return;
        }
        self.status = None;
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.block.is_none() {
            return;
        }
        self.status = None;
        self.seek_to_restart_point(self.block().num_restarts - 1);
        // Walk to the final entry of the final interval.
        let restart_offset = self.block().restart_offset;
        while self.parse_next_entry() && self.next_entry_offset() < restart_offset {}
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Find the restart point strictly before the current entry.
        while self.block().restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.invalidate();
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        // Scan forward until the entry just before `original`.
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block().data[self.value.clone()]
    }

    fn status(&self) -> Status {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
