//! Reader configuration.
//!
//! Three layers, mirroring how the engine hands configuration down:
//! [`Options`] carries the column-family-wide collaborators (comparator,
//! prefix extractor, statistics), [`TableOptions`] the table-format knobs
//! (index type, filter policy, caches, format version, checksum kind), and
//! [`ReadOptions`] the per-query switches.

use std::sync::Arc;

use crate::cache::{Cache, QueryId, NO_QUERY_ID};
use crate::comparator::{BytewiseComparator, Comparator, SliceTransform};
use crate::filter::FilterPolicy;
use crate::statistics::Statistics;

/// Which index structure the reader should expect.
///
/// The on-file property `rocksdb.block.based.table.index.type` wins over
/// this setting; it records what the writer actually emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// Plain binary search over the first-key-per-block index.
    BinarySearch,
    /// Binary search augmented with an in-memory prefix → restart-range map.
    HashSearch,
}

impl IndexType {
    /// Decode the on-file little-endian u32 tag.
    pub(crate) fn from_u32(raw: u32) -> Option<IndexType> {
        match raw {
            0 => Some(IndexType::BinarySearch),
            1 => Some(IndexType::HashSearch),
            _ => None,
        }
    }
}

/// Which checksum protects each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumType {
    NoChecksum = 0,
    Crc32 = 1,
}

impl ChecksumType {
    pub(crate) fn from_u8(raw: u8) -> Option<ChecksumType> {
        match raw {
            0 => Some(ChecksumType::NoChecksum),
            1 => Some(ChecksumType::Crc32),
            _ => None,
        }
    }
}

/// How far a read is allowed to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTier {
    /// Caches first, then the file.
    ReadAll,
    /// Caches only; a block that is not resident yields `Incomplete`
    /// instead of touching the file.
    BlockCacheTier,
}

/// Immutable engine-level collaborators, shared across all tables of a
/// column family.
#[derive(Clone)]
pub struct Options {
    pub comparator: Arc<dyn Comparator>,
    pub prefix_extractor: Option<Arc<dyn SliceTransform>>,
    pub statistics: Option<Arc<Statistics>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            prefix_extractor: None,
            statistics: None,
        }
    }
}

/// Table-format options. These describe the files being opened and the
/// caching policy for their blocks.
#[derive(Clone)]
pub struct TableOptions {
    pub index_type: IndexType,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    /// Cache for uncompressed blocks, filters, and index readers.
    pub block_cache: Option<Arc<dyn Cache>>,
    /// Cache for still-compressed block bytes.
    pub block_cache_compressed: Option<Arc<dyn Cache>>,
    /// Route index and filter blocks through `block_cache` instead of
    /// pinning them in the reader for its lifetime.
    pub cache_index_and_filter_blocks: bool,
    pub whole_key_filtering: bool,
    /// Use the denser, collision-tolerant structure for the hash index
    /// auxiliary instead of the exact prefix map.
    pub hash_index_allow_collision: bool,
    pub format_version: u32,
    pub checksum: ChecksumType,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            index_type: IndexType::BinarySearch,
            filter_policy: None,
            block_cache: None,
            block_cache_compressed: None,
            cache_index_and_filter_blocks: false,
            whole_key_filtering: true,
            hash_index_allow_collision: true,
            format_version: 2,
            checksum: ChecksumType::Crc32,
        }
    }
}

/// Per-query read switches.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub read_tier: ReadTier,
    /// Insert blocks read from the file into the configured caches.
    pub fill_cache: bool,
    pub verify_checksums: bool,
    /// Ignore prefix structures and expose every key in comparator order.
    pub total_order_seek: bool,
    /// Let scans consult the bloom filter on `seek` (fixed-size filters
    /// only); sound only when a scan stays within one hashed prefix.
    pub use_bloom_on_scan: bool,
    /// Opaque query tag fed to the cache's admission policy.
    pub query_id: QueryId,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            read_tier: ReadTier::ReadAll,
            fill_cache: true,
            verify_checksums: true,
            total_order_seek: false,
            use_bloom_on_scan: false,
            query_id: NO_QUERY_ID,
        }
    }
}

impl ReadOptions {
    pub(crate) fn no_io(&self) -> bool {
        self.read_tier == ReadTier::BlockCacheTier
    }
}
