//! Filter policies and filter-block readers.
//!
//! A [`FilterPolicy`] defines the probabilistic structure (the built-in one
//! is a LevelDB-style bloom with double hashing); a [`FilterBlockReader`]
//! knows how a particular filter *shape* is laid out in the table:
//!
//! - **Full** — one filter over every key in the table.
//! - **Block-based** — one small filter per data block, addressed by the
//!   data block's file offset.
//! - **Fixed-size** — many same-sized filters, each covering a contiguous
//!   range of transformed keys; a separate filter *index* block (owned by
//!   the table layer) maps a key to the covering filter block.
//! - **Not-matching** — a constant sentinel that rejects everything, used
//!   when a key sorts past the last fixed-size filter range.
//!
//! Shapes are tagged variants rather than a trait object: there are
//! exactly four, the set is closed by the on-disk format, and `match`
//! keeps the offset-handling differences in one place.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::comparator::SliceTransform;
use crate::encoding::decode_fixed32;
use crate::error::{Result, TableError};
use crate::format::BlockContents;
use crate::hash::hash32;

const BLOOM_SEED: u32 = 0xbc9f_1d34;

/// Default `base_lg` for block-based filters: one filter per 2 KiB of
/// data-block offsets.
pub const FILTER_BASE_LG: u8 = 11;

// ------------------------------------------------------------------------------------------------
// Policy
// ------------------------------------------------------------------------------------------------

/// Reduces a user key before it is added to or probed against a filter
/// (e.g. down to its hashed components). Applied symmetrically by writer
/// and reader.
pub trait KeyTransformer: Send + Sync {
    fn transform<'a>(&self, user_key: &'a [u8]) -> &'a [u8];
}

/// A pluggable filter structure.
pub trait FilterPolicy: Send + Sync {
    /// Name recorded in the meta-index key (`filter.<NAME>` etc.). Readers
    /// only recognise filters built by a policy of the same name.
    fn name(&self) -> &'static str;

    /// Append a filter covering `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// May `key` be among the keys the filter was built from? False
    /// positives allowed, false negatives never.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;

    /// Optional reduction applied to user keys before probing.
    fn key_transformer(&self) -> Option<Arc<dyn KeyTransformer>> {
        None
    }
}

/// LevelDB-style bloom filter: k probes derived from one 32-bit hash by
/// double hashing, `k` stored in the filter's final byte.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: u8,
    transformer: Option<Arc<dyn KeyTransformer>>,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> BloomFilterPolicy {
        // k = bits_per_key * ln(2), clamped to something sensible.
        let k = ((bits_per_key as f64) * 0.69) as usize;
        BloomFilterPolicy {
            bits_per_key,
            k: k.clamp(1, 30) as u8,
            transformer: None,
        }
    }

    /// Same bloom structure, with `transformer` applied before probing.
    pub fn with_key_transformer(
        bits_per_key: usize,
        transformer: Arc<dyn KeyTransformer>,
    ) -> BloomFilterPolicy {
        BloomFilterPolicy {
            transformer: Some(transformer),
            ..BloomFilterPolicy::new(bits_per_key)
        }
    }

    fn bloom_hash(key: &[u8]) -> u32 {
        hash32(key, BLOOM_SEED)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "lapisdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // Round up for tiny key sets to keep the false-positive rate down.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = bits.div_ceil(8);
        let bits = bytes * 8;

        let start = dst.len();
        dst.resize(start + bytes, 0);
        for key in keys {
            let mut h = Self::bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit = (h as usize) % bits;
                dst[start + bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
        dst.push(self.k);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let k = filter[filter.len() - 1];
        if k > 30 {
            // Reserved for future encodings: treat as a match.
            return true;
        }
        let bits = (filter.len() - 1) * 8;
        let mut h = Self::bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit = (h as usize) % bits;
            if filter[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    fn key_transformer(&self) -> Option<Arc<dyn KeyTransformer>> {
        self.transformer.clone()
    }
}

// ------------------------------------------------------------------------------------------------
// Filter type discovered in the meta-index
// ------------------------------------------------------------------------------------------------

/// Which filter shape the table was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    NoFilter,
    BlockBased,
    Full,
    FixedSize,
}

// ------------------------------------------------------------------------------------------------
// Readers
// ------------------------------------------------------------------------------------------------

/// A filter block, ready to probe.
pub enum FilterBlockReader {
    BlockBased(BlockBasedFilter),
    Full(FullFilter),
    FixedSize(FixedSizeFilter),
    /// Constant sentinel: nothing matches.
    NotMatching,
}

impl FilterBlockReader {
    /// May `key` be present anywhere in the table?
    ///
    /// Unsupported for block-based filters, which only answer per-block
    /// questions; those conservatively return true here.
    pub fn key_may_match(&self, key: &[u8]) -> bool {
        match self {
            FilterBlockReader::BlockBased(_) => {
                debug_assert!(false, "block-based filters need a block offset");
                true
            }
            FilterBlockReader::Full(filter) => filter.key_may_match(key),
            FilterBlockReader::FixedSize(filter) => filter.key_may_match(key),
            FilterBlockReader::NotMatching => false,
        }
    }

    /// May `key` be present in the data block starting at `block_offset`?
    pub fn key_may_match_at(&self, key: &[u8], block_offset: u64) -> bool {
        match self {
            FilterBlockReader::BlockBased(filter) => filter.key_may_match_at(key, block_offset),
            FilterBlockReader::Full(filter) => filter.key_may_match(key),
            FilterBlockReader::FixedSize(filter) => filter.key_may_match(key),
            FilterBlockReader::NotMatching => false,
        }
    }

    /// May any key with `prefix` be present in the table?
    pub fn prefix_may_match(&self, prefix: &[u8]) -> bool {
        match self {
            FilterBlockReader::BlockBased(_) => {
                debug_assert!(false, "block-based filters need a block offset");
                true
            }
            FilterBlockReader::Full(filter) => filter.prefix_may_match(prefix),
            FilterBlockReader::FixedSize(filter) => filter.prefix_may_match(prefix),
            FilterBlockReader::NotMatching => false,
        }
    }

    /// May any key with `prefix` be present in the data block at
    /// `block_offset`?
    pub fn prefix_may_match_at(&self, prefix: &[u8], block_offset: u64) -> bool {
        match self {
            FilterBlockReader::BlockBased(filter) => filter.prefix_may_match_at(prefix, block_offset),
            FilterBlockReader::Full(filter) => filter.prefix_may_match(prefix),
            FilterBlockReader::FixedSize(filter) => filter.prefix_may_match(prefix),
            FilterBlockReader::NotMatching => false,
        }
    }

    pub fn approximate_memory_usage(&self) -> usize {
        match self {
            FilterBlockReader::BlockBased(filter) => filter.contents.data.len(),
            FilterBlockReader::Full(filter) => filter.contents.data.len(),
            FilterBlockReader::FixedSize(filter) => filter.contents.data.len(),
            FilterBlockReader::NotMatching => 0,
        }
    }
}

/// One filter per data block, indexed by data-block offset.
///
/// Block layout (offsets relative to the filter block):
///
/// ```text
/// [filter 0][filter 1]...[offset[0] u32]...[offset[n] u32]
/// [offset_array_start u32][base_lg u8]
/// ```
///
/// The filter for the data block at file offset `o` is entry `o >> base_lg`.
pub struct BlockBasedFilter {
    policy: Arc<dyn FilterPolicy>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    contents: BlockContents,
    offsets_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl BlockBasedFilter {
    pub fn new(
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
        contents: BlockContents,
    ) -> Result<BlockBasedFilter> {
        let data = &contents.data;
        if data.len() < 5 {
            return Err(TableError::corruption("block-based filter too short"));
        }
        let base_lg = data[data.len() - 1];
        let offsets_start = decode_fixed32(&data[data.len() - 5..]) as usize;
        let array_bytes = data
            .len()
            .checked_sub(5 + offsets_start)
            .ok_or_else(|| TableError::corruption("block-based filter offset array misplaced"))?;
        if array_bytes % 4 != 0 || array_bytes == 0 {
            return Err(TableError::corruption("block-based filter offset array ragged"));
        }
        let num_filters = array_bytes / 4 - 1;
        Ok(BlockBasedFilter {
            policy,
            prefix_extractor,
            whole_key_filtering,
            contents,
            offsets_start,
            num_filters,
            base_lg,
        })
    }

    fn filter_slice(&self, index: usize) -> Option<&[u8]> {
        if index >= self.num_filters {
            return None;
        }
        let data = &self.contents.data;
        let start = decode_fixed32(&data[self.offsets_start + index * 4..]) as usize;
        let limit = decode_fixed32(&data[self.offsets_start + (index + 1) * 4..]) as usize;
        if start > limit || limit > self.offsets_start {
            return None;
        }
        Some(&data[start..limit])
    }

    fn probe(&self, key: &[u8], block_offset: u64) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        match self.filter_slice(index) {
            // Empty filter means the block had no keys in the filter's
            // domain; a missing or ragged entry errs on "may match".
            Some([]) => false,
            Some(filter) => self.policy.key_may_match(key, filter),
            None => true,
        }
    }

    pub fn key_may_match_at(&self, key: &[u8], block_offset: u64) -> bool {
        if !self.whole_key_filtering {
            return true;
        }
        self.probe(key, block_offset)
    }

    pub fn prefix_may_match_at(&self, prefix: &[u8], block_offset: u64) -> bool {
        if self.prefix_extractor.is_none() {
            return true;
        }
        self.probe(prefix, block_offset)
    }
}

/// A single filter spanning the whole table.
pub struct FullFilter {
    policy: Arc<dyn FilterPolicy>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    contents: BlockContents,
}

impl FullFilter {
    pub fn new(
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
        contents: BlockContents,
    ) -> FullFilter {
        FullFilter {
            policy,
            prefix_extractor,
            whole_key_filtering,
            contents,
        }
    }

    pub fn key_may_match(&self, key: &[u8]) -> bool {
        if !self.whole_key_filtering {
            return true;
        }
        self.policy.key_may_match(key, &self.contents.data)
    }

    pub fn prefix_may_match(&self, prefix: &[u8]) -> bool {
        if self.prefix_extractor.is_none() {
            return true;
        }
        self.policy.key_may_match(prefix, &self.contents.data)
    }
}

/// One of many same-sized filters, each covering a contiguous range of
/// transformed keys. The table layer picks the right block via the filter
/// index before constructing this reader.
pub struct FixedSizeFilter {
    policy: Arc<dyn FilterPolicy>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    contents: BlockContents,
}

impl FixedSizeFilter {
    pub fn new(
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
        contents: BlockContents,
    ) -> FixedSizeFilter {
        FixedSizeFilter {
            policy,
            prefix_extractor,
            whole_key_filtering,
            contents,
        }
    }

    pub fn key_may_match(&self, key: &[u8]) -> bool {
        if !self.whole_key_filtering {
            return true;
        }
        self.policy.key_may_match(key, &self.contents.data)
    }

    pub fn prefix_may_match(&self, prefix: &[u8]) -> bool {
        if self.prefix_extractor.is_none() {
            return true;
        }
        self.policy.key_may_match(prefix, &self.contents.data)
    }
}
