//! The table reader: open, point get, ordered scans, prefetch.
//!
//! ## Control flow
//!
//! `open` parses the footer, the meta-index and the properties block,
//! discovers the filter block, and (optionally) pre-loads the index and
//! filter. `get` and iterators then go index → filter → data block; every
//! block access tries the uncompressed cache, then the compressed cache
//! (decompressing on a hit), then the file, inserting on cacheable reads.
//!
//! ## Ownership
//!
//! All reader state lives in a single `Rep`. Pre-loaded index/filter
//! readers share the reader's lifetime; cache-resident blocks are pinned
//! by the iterators that use them and released when those iterators drop.
//! The reader is immutable after `open` (installing a separate data file
//! via [`TableReader::set_data_file_reader`] requires `&mut`), so
//! concurrent `get`s and scans need no locking beyond the cache's own.

#[cfg(test)]
mod tests;

pub mod builder;
mod two_level;

pub use two_level::{BloomFilterAwareIterator, ScanIterator, TwoLevelIterator};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, warn};

use crate::block::{Block, BlockIter};
use crate::cache::{Cache, CacheHandle, CacheValue, QueryId};
use crate::comparator::{
    BytewiseComparator, Comparator, InternalKeyComparator, InternalKeySliceTransform,
    SliceTransform,
};
use crate::encoding::{decode_fixed32, decode_fixed64, put_varint64};
use crate::error::{Result, TableError};
use crate::file::RandomAccessFile;
use crate::filter::{
    BlockBasedFilter, FilterBlockReader, FilterType, FixedSizeFilter, FullFilter, KeyTransformer,
};
use crate::format::{
    read_block_contents, uncompress_block_contents, BlockContents, BlockHandle, CompressionType,
    Footer,
};
use crate::index::{BinarySearchIndexReader, HashIndexReader, IndexReader};
use crate::iterator::InternalIterator;
use crate::key::{
    append_internal_key, extract_user_key, parse_internal_key, ParsedInternalKey, ValueType,
    MAX_SEQUENCE_NUMBER,
};
use crate::options::{IndexType, Options, ReadOptions, TableOptions};
use crate::statistics::{record_tick, Statistics, Ticker};

// ------------------------------------------------------------------------------------------------
// Well-known meta-index names and properties
// ------------------------------------------------------------------------------------------------

/// Meta-index key of the properties block.
pub const PROPERTIES_BLOCK_NAME: &[u8] = b"rocksdb.properties";

/// Meta-index key prefix of a full filter block.
pub const FULL_FILTER_BLOCK_PREFIX: &str = "fullfilter.";

/// Meta-index key prefix of a block-based filter block.
pub const FILTER_BLOCK_PREFIX: &str = "filter.";

/// Meta-index key prefix of a fixed-size filter *index* block.
pub const FIXED_SIZE_FILTER_BLOCK_PREFIX: &str = "fixedsizefilter.";

/// Meta-index keys of the hash-index auxiliary blocks.
pub const HASH_INDEX_PREFIXES_BLOCK_NAME: &[u8] = b"rocksdb.hashindex.prefixes";
pub const HASH_INDEX_PREFIXES_METADATA_BLOCK_NAME: &[u8] = b"rocksdb.hashindex.prefixesmetadata";

/// User property recording the on-file index type (little-endian u32).
pub const PROP_INDEX_TYPE: &[u8] = b"rocksdb.block.based.table.index.type";

/// User properties gating filter probes; `"0"` disables, `"1"` or absence
/// enables (absence keeps old files working).
pub const PROP_WHOLE_KEY_FILTERING: &[u8] = b"rocksdb.whole.key.filtering";
pub const PROP_PREFIX_FILTERING: &[u8] = b"rocksdb.prefix.filtering";

/// User property with the total size of the data-block region
/// (little-endian u64); used by approximate-offset queries.
pub const PROP_DATA_SIZE: &[u8] = b"rocksdb.data.size";

// ------------------------------------------------------------------------------------------------
// Table properties
// ------------------------------------------------------------------------------------------------

/// Raw key/value properties read from the properties block.
#[derive(Debug, Default)]
pub struct TableProperties {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl TableProperties {
    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Decoded `rocksdb.data.size`, when present and well-formed.
    pub fn data_size(&self) -> Option<u64> {
        let raw = self.get(PROP_DATA_SIZE)?;
        (raw.len() == 8).then(|| decode_fixed64(raw))
    }

    /// `"0"` ⇒ false; `"1"` or absent ⇒ true; anything else is logged and
    /// treated as true so newer writers cannot brick old readers.
    fn feature_enabled(&self, name: &[u8]) -> bool {
        match self.get(name) {
            None | Some(b"1") => true,
            Some(b"0") => false,
            Some(other) => {
                warn!(
                    property = %String::from_utf8_lossy(name),
                    value = %String::from_utf8_lossy(other),
                    "invalid property value; treating as enabled"
                );
                true
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Get context
// ------------------------------------------------------------------------------------------------

/// Outcome of a point lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetState {
    /// No entry for the key was seen.
    NotFound,
    /// The newest entry is a value.
    Found,
    /// The newest entry is a tombstone.
    Deleted,
    /// A required block was not resident under no-I/O; the caller must
    /// escalate to a read that may do I/O.
    KeyMayExist,
}

/// Accumulates the result of a `get` as data-block entries stream by.
pub struct GetContext {
    user_comparator: Arc<dyn Comparator>,
    user_key: Vec<u8>,
    state: GetState,
    value: Option<Vec<u8>>,
}

impl GetContext {
    pub fn new(user_comparator: Arc<dyn Comparator>, user_key: &[u8]) -> GetContext {
        GetContext {
            user_comparator,
            user_key: user_key.to_vec(),
            state: GetState::NotFound,
            value: None,
        }
    }

    /// Feed one `(parsed internal key, value)` pair. Returns whether the
    /// caller should keep iterating.
    ///
    /// Entries arrive newest-first for a given user key, so the first
    /// matching entry decides the outcome.
    pub fn save_value(&mut self, parsed: &ParsedInternalKey<'_>, value: &[u8]) -> bool {
        if self
            .user_comparator
            .compare(parsed.user_key, &self.user_key)
            != std::cmp::Ordering::Equal
        {
            return false;
        }
        match parsed.value_type {
            ValueType::Value => {
                self.state = GetState::Found;
                self.value = Some(value.to_vec());
            }
            ValueType::Deletion => {
                self.state = GetState::Deleted;
            }
        }
        false
    }

    pub fn mark_key_may_exist(&mut self) {
        self.state = GetState::KeyMayExist;
    }

    pub fn state(&self) -> GetState {
        self.state
    }

    /// The found value, when `state() == Found`.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

// ------------------------------------------------------------------------------------------------
// Cache plumbing
// ------------------------------------------------------------------------------------------------

/// A file reader plus the cache-key prefixes identifying its blocks in
/// each cache. Two readers over the same file derive the same prefixes
/// (via the OS file identity), so they share cached blocks.
struct FileWithCacheKeys {
    reader: Arc<dyn RandomAccessFile>,
    cache_key_prefix: Vec<u8>,
    compressed_cache_key_prefix: Vec<u8>,
}

impl FileWithCacheKeys {
    fn new(reader: Arc<dyn RandomAccessFile>, table_options: &TableOptions) -> FileWithCacheKeys {
        let cache_key_prefix = table_options
            .block_cache
            .as_deref()
            .map(|cache| generate_cache_prefix(cache, reader.as_ref()))
            .unwrap_or_default();
        let compressed_cache_key_prefix = table_options
            .block_cache_compressed
            .as_deref()
            .map(|cache| generate_cache_prefix(cache, reader.as_ref()))
            .unwrap_or_default();
        FileWithCacheKeys {
            reader,
            cache_key_prefix,
            compressed_cache_key_prefix,
        }
    }
}

/// Prefix = OS file identity when available, else a varint of an id handed
/// out by the cache. Either way no two open files share a prefix, which is
/// what keeps cache keys unique across tables.
fn generate_cache_prefix(cache: &dyn Cache, file: &dyn RandomAccessFile) -> Vec<u8> {
    match file.unique_id() {
        Some(id) if !id.is_empty() => id,
        _ => {
            let mut prefix = Vec::new();
            put_varint64(&mut prefix, cache.new_id());
            prefix
        }
    }
}

/// Cache key for one block: file prefix + varint of the block offset.
fn cache_key(prefix: &[u8], handle: &BlockHandle) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 10);
    key.extend_from_slice(prefix);
    put_varint64(&mut key, handle.offset());
    key
}

fn get_entry_from_cache(
    cache: &dyn Cache,
    key: &[u8],
    miss_ticker: Ticker,
    hit_ticker: Ticker,
    statistics: &Option<Arc<Statistics>>,
    query_id: QueryId,
) -> Option<CacheHandle> {
    match cache.lookup(key, query_id) {
        Some(handle) => {
            record_tick(statistics, Ticker::BlockCacheHit);
            record_tick(statistics, hit_ticker);
            Some(handle)
        }
        None => {
            record_tick(statistics, Ticker::BlockCacheMiss);
            record_tick(statistics, miss_ticker);
            None
        }
    }
}

/// A filter that may be backed by a cache entry. Dropping this releases
/// the cache pin exactly once.
pub(crate) struct FilterEntry {
    filter: Option<Arc<FilterBlockReader>>,
    _handle: Option<CacheHandle>,
}

impl FilterEntry {
    fn none() -> FilterEntry {
        FilterEntry {
            filter: None,
            _handle: None,
        }
    }

    pub(crate) fn filter(&self) -> Option<&FilterBlockReader> {
        self.filter.as_deref()
    }
}

// ------------------------------------------------------------------------------------------------
// Rep
// ------------------------------------------------------------------------------------------------

/// Everything the reader knows about one open table.
struct Rep {
    options: Arc<Options>,
    table_options: TableOptions,
    internal_comparator: Arc<InternalKeyComparator>,
    /// Cleared when the table was opened with `skip_filters`.
    filter_policy: Option<Arc<dyn crate::filter::FilterPolicy>>,
    filter_key_transformer: Option<Arc<dyn KeyTransformer>>,
    footer: Footer,
    base_file: FileWithCacheKeys,
    /// Data blocks may live in a second file; equals the base file until
    /// [`TableReader::set_data_file_reader`] installs another.
    data_file: FileWithCacheKeys,
    filter_type: FilterType,
    /// Filter block handle; for fixed-size filters, the filter *index*
    /// block handle.
    filter_handle: BlockHandle,
    /// Pre-loaded readers (reader-lifetime); `None` when the block cache
    /// carries them instead.
    data_index_reader: Option<Arc<IndexReader>>,
    filter_index_reader: Option<Arc<IndexReader>>,
    filter: Option<Arc<FilterBlockReader>>,
    not_matching_filter: Arc<FilterBlockReader>,
    properties: Option<TableProperties>,
    whole_key_filtering: bool,
    prefix_filtering: bool,
    hash_index_allow_collision: bool,
    internal_prefix_transform: Option<Arc<dyn SliceTransform>>,
}

// ------------------------------------------------------------------------------------------------
// TableReader
// ------------------------------------------------------------------------------------------------

/// An open, immutable table. Safe for concurrent reads once `open`
/// returns.
pub struct TableReader {
    rep: Rep,
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader").finish_non_exhaustive()
    }
}

impl TableReader {
    /// Open a table from `base_file` (which holds at least the metadata;
    /// data blocks too unless a separate data file is installed later).
    ///
    /// `prefetch_index_and_filter` warms or pins the index and filter per
    /// the `cache_index_and_filter_blocks` table option. `skip_filters`
    /// disables filter probing for the reader's whole lifetime.
    pub fn open(
        options: Arc<Options>,
        table_options: TableOptions,
        internal_comparator: Arc<InternalKeyComparator>,
        base_file: Arc<dyn RandomAccessFile>,
        base_file_size: u64,
        prefetch_index_and_filter: bool,
        skip_filters: bool,
    ) -> Result<TableReader> {
        let footer = Footer::read_from_file(base_file.as_ref(), base_file_size)?;

        let filter_policy = if skip_filters {
            None
        } else {
            table_options.filter_policy.clone()
        };
        let filter_key_transformer = filter_policy
            .as_ref()
            .and_then(|policy| policy.key_transformer());

        let base_file = FileWithCacheKeys::new(base_file, &table_options);
        let data_file = FileWithCacheKeys {
            reader: Arc::clone(&base_file.reader),
            cache_key_prefix: base_file.cache_key_prefix.clone(),
            compressed_cache_key_prefix: base_file.compressed_cache_key_prefix.clone(),
        };

        let internal_prefix_transform = options
            .prefix_extractor
            .as_ref()
            .map(|extractor| {
                Arc::new(InternalKeySliceTransform::new(Arc::clone(extractor)))
                    as Arc<dyn SliceTransform>
            });

        let mut table = TableReader {
            rep: Rep {
                whole_key_filtering: table_options.whole_key_filtering,
                prefix_filtering: true,
                hash_index_allow_collision: table_options.hash_index_allow_collision,
                options,
                table_options,
                internal_comparator,
                filter_policy,
                filter_key_transformer,
                footer,
                base_file,
                data_file,
                filter_type: FilterType::NoFilter,
                filter_handle: BlockHandle::NULL,
                data_index_reader: None,
                filter_index_reader: None,
                filter: None,
                not_matching_filter: Arc::new(FilterBlockReader::NotMatching),
                properties: None,
                internal_prefix_transform,
            },
        };

        let (_meta_block, mut meta_iter) = table.read_meta_block()?;

        // Discover the filter block. First matched prefix wins, in the
        // fixed order fullfilter / filter / fixedsizefilter.
        if let Some(policy) = &table.rep.filter_policy {
            for (prefix, filter_type) in [
                (FULL_FILTER_BLOCK_PREFIX, FilterType::Full),
                (FILTER_BLOCK_PREFIX, FilterType::BlockBased),
                (FIXED_SIZE_FILTER_BLOCK_PREFIX, FilterType::FixedSize),
            ] {
                let mut name = prefix.as_bytes().to_vec();
                name.extend_from_slice(policy.name().as_bytes());
                if let Ok(handle) = find_meta_block(&mut meta_iter, &name) {
                    table.rep.filter_handle = handle;
                    table.rep.filter_type = filter_type;
                    break;
                }
            }
        }

        // Properties are advisory: a missing or unreadable block is
        // logged, never fatal.
        match find_meta_block(&mut meta_iter, PROPERTIES_BLOCK_NAME) {
            Ok(handle) => match table.read_properties(&handle) {
                Ok(properties) => table.rep.properties = Some(properties),
                Err(e) => {
                    warn!(error = %e, "error reading properties block");
                }
            },
            Err(_) => {
                warn!("table has no properties block");
            }
        }

        if let Some(properties) = &table.rep.properties {
            table.rep.whole_key_filtering &= properties.feature_enabled(PROP_WHOLE_KEY_FILTERING);
            table.rep.prefix_filtering &= properties.feature_enabled(PROP_PREFIX_FILTERING);
        }

        if prefetch_index_and_filter {
            if table.rep.filter_policy.is_some() && table.rep.filter_type == FilterType::FixedSize {
                // The filter index is always a binary-search index and is
                // always pinned: every fixed-size probe starts there.
                let reader = BinarySearchIndexReader::create(
                    table.rep.base_file.reader.as_ref(),
                    &table.rep.footer,
                    &table.rep.filter_handle,
                    Arc::new(BytewiseComparator),
                )?;
                table.rep.filter_index_reader = Some(Arc::new(reader));
            }

            if table.rep.table_options.cache_index_and_filter_blocks {
                // Warm the cache by going through the normal lookup paths.
                let read_options = ReadOptions::default();
                let iter = table.new_index_iterator(&read_options);
                iter.status()?;
                match table.rep.filter_type {
                    FilterType::Full | FilterType::BlockBased => {
                        let entry = table.get_filter(read_options.query_id, false, None);
                        drop(entry);
                    }
                    // Fixed-size filter blocks are never pre-warmed; only
                    // the probes themselves know which blocks matter.
                    FilterType::FixedSize | FilterType::NoFilter => {}
                }
            } else {
                // Pin the index and filter in the reader itself.
                let reader = table.create_data_block_index_reader(Some(&mut meta_iter))?;
                table.rep.data_index_reader = Some(Arc::new(reader));
                match table.rep.filter_type {
                    FilterType::Full | FilterType::BlockBased => {
                        let handle = table.rep.filter_handle;
                        table.rep.filter = table.read_filter_block(&handle).map(Arc::new);
                    }
                    FilterType::FixedSize | FilterType::NoFilter => {}
                }
            }
        }

        Ok(table)
    }

    /// Install a separate data file; subsequent data-block reads go there
    /// while metadata stays with the base file.
    pub fn set_data_file_reader(&mut self, data_file: Arc<dyn RandomAccessFile>) {
        self.rep.data_file = FileWithCacheKeys::new(data_file, &self.rep.table_options);
    }

    pub fn properties(&self) -> Option<&TableProperties> {
        self.rep.properties.as_ref()
    }

    /// Memory used by pre-loaded index and filter structures.
    pub fn approximate_memory_usage(&self) -> usize {
        let rep = &self.rep;
        rep.filter
            .as_ref()
            .map_or(0, |filter| filter.approximate_memory_usage())
            + rep
                .filter_index_reader
                .as_ref()
                .map_or(0, |reader| reader.approximate_memory_usage())
            + rep
                .data_index_reader
                .as_ref()
                .map_or(0, |reader| reader.approximate_memory_usage())
    }

    // --------------------------------------------------------------------------------------------
    // Meta blocks
    // --------------------------------------------------------------------------------------------

    fn read_meta_block(&self) -> Result<(Arc<Block>, BlockIter)> {
        let contents = read_block_contents(
            self.rep.base_file.reader.as_ref(),
            &self.rep.footer,
            true,
            &self.rep.footer.metaindex_handle,
            true,
        )?;
        let block = Arc::new(Block::new(contents)?);
        let iter = block.iter(Arc::new(BytewiseComparator), false);
        Ok((block, iter))
    }

    fn read_properties(&self, handle: &BlockHandle) -> Result<TableProperties> {
        let contents = read_block_contents(
            self.rep.base_file.reader.as_ref(),
            &self.rep.footer,
            true,
            handle,
            true,
        )?;
        let block = Arc::new(Block::new(contents)?);
        let mut iter = block.iter(Arc::new(BytewiseComparator), false);
        let mut properties = TableProperties::default();
        iter.seek_to_first();
        while iter.valid() {
            properties
                .entries
                .insert(iter.key().to_vec(), iter.value().to_vec());
            iter.next();
        }
        iter.status()?;
        Ok(properties)
    }

    // --------------------------------------------------------------------------------------------
    // Index
    // --------------------------------------------------------------------------------------------

    /// Build the data-block index reader per the on-file index type.
    ///
    /// `meta_iter` lets `open` reuse its meta-index iterator; later
    /// callers pass `None` and the meta block is re-read if needed.
    fn create_data_block_index_reader(
        &self,
        meta_iter: Option<&mut BlockIter>,
    ) -> Result<IndexReader> {
        // Old files have no index-type property; binary search is always
        // safe for them.
        let mut index_type = self.rep.table_options.index_type;
        if let Some(properties) = &self.rep.properties {
            if let Some(raw) = properties.get(PROP_INDEX_TYPE) {
                if raw.len() == 4 {
                    index_type = IndexType::from_u32(decode_fixed32(raw)).ok_or_else(|| {
                        TableError::invalid_argument(format!(
                            "unrecognized index type on file: {}",
                            decode_fixed32(raw)
                        ))
                    })?;
                } else {
                    warn!("malformed index-type property; using binary search");
                    index_type = IndexType::BinarySearch;
                }
            }
        }

        if index_type == IndexType::HashSearch && self.rep.options.prefix_extractor.is_none() {
            warn!(
                "hash-search index requires a prefix extractor; \
                 falling back to binary search"
            );
            index_type = IndexType::BinarySearch;
        }

        let comparator: Arc<dyn Comparator> = self.rep.internal_comparator.clone();
        match index_type {
            IndexType::BinarySearch => BinarySearchIndexReader::create(
                self.rep.base_file.reader.as_ref(),
                &self.rep.footer,
                &self.rep.footer.index_handle,
                comparator,
            ),
            IndexType::HashSearch => {
                let transform = self
                    .rep
                    .internal_prefix_transform
                    .clone()
                    .expect("prefix extractor checked above");

                let (prefixes_handle, prefixes_meta_handle) = match meta_iter {
                    Some(iter) => hash_index_aux_handles(iter),
                    None => match self.read_meta_block() {
                        Ok((_block, mut iter)) => hash_index_aux_handles(&mut iter),
                        Err(e) => {
                            warn!(error = %e, "cannot re-read metaindex for hash index");
                            (None, None)
                        }
                    },
                };

                HashIndexReader::create(
                    self.rep.base_file.reader.as_ref(),
                    &self.rep.footer,
                    &self.rep.footer.index_handle,
                    comparator,
                    transform,
                    prefixes_handle,
                    prefixes_meta_handle,
                    self.rep.hash_index_allow_collision,
                )
            }
        }
    }

    /// An iterator over the data-block index.
    ///
    /// Prefers the pre-loaded reader; otherwise goes through the block
    /// cache, creating and inserting the reader on a miss (`Incomplete`
    /// under no-I/O). Errors come back as an iterator carrying the status.
    pub(crate) fn new_index_iterator(&self, read_options: &ReadOptions) -> BlockIter {
        let comparator: Arc<dyn Comparator> = self.rep.internal_comparator.clone();

        if let Some(reader) = &self.rep.data_index_reader {
            return reader.new_iterator(read_options.total_order_seek);
        }

        let Some(cache) = self.rep.table_options.block_cache.as_deref() else {
            // Nothing pre-loaded and no cache to keep a reader in: build a
            // transient one. The iterator keeps the block alive by itself.
            return match self.create_data_block_index_reader(None) {
                Ok(reader) => reader.new_iterator(read_options.total_order_seek),
                Err(e) => BlockIter::with_error(comparator, e),
            };
        };

        let key = cache_key(
            &self.rep.base_file.cache_key_prefix,
            &self.rep.footer.index_handle,
        );
        let statistics = &self.rep.options.statistics;
        let cache_handle = get_entry_from_cache(
            cache,
            &key,
            Ticker::BlockCacheIndexMiss,
            Ticker::BlockCacheIndexHit,
            statistics,
            read_options.query_id,
        );

        if let Some(handle) = cache_handle {
            let Some(reader) = handle.value().as_index().cloned() else {
                return BlockIter::with_error(
                    comparator,
                    TableError::corruption("index cache entry has wrong type"),
                );
            };
            let mut iter = reader.new_iterator(read_options.total_order_seek);
            iter.set_pin(handle);
            return iter;
        }

        if read_options.no_io() {
            return BlockIter::with_error(comparator, TableError::incomplete("no blocking io"));
        }

        match self.create_data_block_index_reader(None) {
            Ok(reader) => {
                let reader = Arc::new(reader);
                let charge = reader.approximate_memory_usage();
                let mut iter = reader.new_iterator(read_options.total_order_seek);
                match cache.insert(
                    &key,
                    read_options.query_id,
                    CacheValue::Index(Arc::clone(&reader)),
                    charge,
                ) {
                    Ok(handle) => iter.set_pin(handle),
                    // Not admitted: the iterator still owns the block.
                    Err(_) => {}
                }
                iter
            }
            Err(e) => BlockIter::with_error(comparator, e),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Data blocks
    // --------------------------------------------------------------------------------------------

    /// Resolve an encoded index value into an iterator over its data
    /// block, via the caches or the file.
    pub(crate) fn new_data_block_iterator(
        &self,
        read_options: &ReadOptions,
        index_value: &[u8],
    ) -> BlockIter {
        let comparator: Arc<dyn Comparator> = self.rep.internal_comparator.clone();

        let mut input = index_value;
        // Extra bytes after the handle are tolerated for future fields.
        let handle = match BlockHandle::decode_from(&mut input) {
            Ok(handle) => handle,
            Err(e) => return BlockIter::with_error(comparator, e),
        };

        let block_cache = self.rep.table_options.block_cache.as_deref();
        let compressed_cache = self.rep.table_options.block_cache_compressed.as_deref();

        let mut resolved: Option<(Arc<Block>, Option<CacheHandle>)> = None;

        if block_cache.is_some() || compressed_cache.is_some() {
            let key = cache_key(&self.rep.data_file.cache_key_prefix, &handle);
            let compressed_key =
                cache_key(&self.rep.data_file.compressed_cache_key_prefix, &handle);

            match self.get_data_block_from_cache(&key, &compressed_key, read_options) {
                Ok(from_cache) => resolved = from_cache,
                Err(e) => return BlockIter::with_error(comparator, e),
            }

            if resolved.is_none() && !read_options.no_io() && read_options.fill_cache {
                // Keep raw bytes when a compressed cache wants them.
                let raw = read_block_contents(
                    self.rep.data_file.reader.as_ref(),
                    &self.rep.footer,
                    read_options.verify_checksums,
                    &handle,
                    compressed_cache.is_none(),
                );
                match raw.and_then(|raw| {
                    self.put_data_block_to_cache(&key, &compressed_key, read_options, raw)
                }) {
                    Ok(cached) => resolved = Some(cached),
                    Err(e) => return BlockIter::with_error(comparator, e),
                }
            }
        }

        let (block, pin) = match resolved {
            Some((block, pin)) => (block, pin),
            None => {
                if read_options.no_io() {
                    return BlockIter::with_error(
                        comparator,
                        TableError::incomplete("no blocking io"),
                    );
                }
                let direct = read_block_contents(
                    self.rep.data_file.reader.as_ref(),
                    &self.rep.footer,
                    read_options.verify_checksums,
                    &handle,
                    true,
                )
                .and_then(|contents| Block::new(contents).map(Arc::new));
                match direct {
                    Ok(block) => (block, None),
                    Err(e) => return BlockIter::with_error(comparator, e),
                }
            }
        };

        let mut iter = block.iter(comparator, false);
        if let Some(pin) = pin {
            iter.set_pin(pin);
        }
        iter
    }

    /// Uncompressed cache first; then the compressed cache, decompressing
    /// and promoting the block on a hit.
    fn get_data_block_from_cache(
        &self,
        key: &[u8],
        compressed_key: &[u8],
        read_options: &ReadOptions,
    ) -> Result<Option<(Arc<Block>, Option<CacheHandle>)>> {
        let statistics = &self.rep.options.statistics;
        let block_cache = self.rep.table_options.block_cache.as_deref();

        if let Some(cache) = block_cache {
            if let Some(handle) = get_entry_from_cache(
                cache,
                key,
                Ticker::BlockCacheDataMiss,
                Ticker::BlockCacheDataHit,
                statistics,
                read_options.query_id,
            ) {
                let Some(block) = handle.value().as_block().cloned() else {
                    return Err(TableError::corruption("data cache entry has wrong type"));
                };
                return Ok(Some((block, Some(handle))));
            }
        }

        let Some(compressed_cache) = self.rep.table_options.block_cache_compressed.as_deref()
        else {
            return Ok(None);
        };

        let Some(compressed_handle) = compressed_cache.lookup(compressed_key, read_options.query_id)
        else {
            record_tick(statistics, Ticker::BlockCacheCompressedMiss);
            return Ok(None);
        };
        record_tick(statistics, Ticker::BlockCacheCompressedHit);

        let Some(raw) = compressed_handle.value().as_raw().cloned() else {
            return Err(TableError::corruption(
                "compressed cache entry has wrong type",
            ));
        };
        debug_assert!(raw.compression != CompressionType::None);

        let contents = uncompress_block_contents(
            &raw.data,
            raw.compression,
            self.rep.footer.format_version,
        )?;
        let block = Arc::new(Block::new(contents)?);

        let mut pin = None;
        if let Some(cache) = block_cache {
            if read_options.fill_cache && block.cachable() {
                let charge = block.approximate_memory_usage();
                if let Ok(handle) = cache.insert(
                    key,
                    read_options.query_id,
                    CacheValue::Block(Arc::clone(&block)),
                    charge,
                ) {
                    pin = Some(handle);
                }
            }
        }

        // Hold on the compressed entry released here.
        drop(compressed_handle);
        Ok(Some((block, pin)))
    }

    /// Insert a freshly read block into both caches per policy: raw bytes
    /// into the compressed cache (when they are still compressed), the
    /// parsed block into the uncompressed cache. Insert failures fall back
    /// to an unmanaged block.
    fn put_data_block_to_cache(
        &self,
        key: &[u8],
        compressed_key: &[u8],
        read_options: &ReadOptions,
        raw: BlockContents,
    ) -> Result<(Arc<Block>, Option<CacheHandle>)> {
        let statistics = &self.rep.options.statistics;

        let (block, raw_for_compressed_cache) = if raw.compression != CompressionType::None {
            let plain = uncompress_block_contents(
                &raw.data,
                raw.compression,
                self.rep.footer.format_version,
            )?;
            (Arc::new(Block::new(plain)?), Some(raw))
        } else {
            (Arc::new(Block::new(raw)?), None)
        };

        if let (Some(cache), Some(raw)) = (
            self.rep.table_options.block_cache_compressed.as_deref(),
            raw_for_compressed_cache,
        ) {
            if raw.cachable {
                let charge = raw.data.len();
                match cache.insert(
                    compressed_key,
                    read_options.query_id,
                    CacheValue::Raw(Arc::new(raw)),
                    charge,
                ) {
                    Ok(handle) => {
                        record_tick(statistics, Ticker::BlockCacheCompressedAdd);
                        drop(handle);
                    }
                    Err(_) => {
                        record_tick(statistics, Ticker::BlockCacheCompressedAddFailure);
                    }
                }
            }
        }

        let mut pin = None;
        if let Some(cache) = self.rep.table_options.block_cache.as_deref() {
            if block.cachable() {
                let charge = block.approximate_memory_usage();
                if let Ok(handle) = cache.insert(
                    key,
                    read_options.query_id,
                    CacheValue::Block(Arc::clone(&block)),
                    charge,
                ) {
                    pin = Some(handle);
                }
            }
        }

        Ok((block, pin))
    }

    // --------------------------------------------------------------------------------------------
    // Filters
    // --------------------------------------------------------------------------------------------

    /// The key actually probed against filters: the user key, optionally
    /// reduced by the policy's key transformer.
    pub(crate) fn filter_key<'a>(&self, internal_key: &'a [u8]) -> &'a [u8] {
        let user_key = extract_user_key(internal_key);
        match &self.rep.filter_key_transformer {
            Some(transformer) => transformer.transform(user_key),
            None => user_key,
        }
    }

    /// Locate the fixed-size filter block covering `filter_key` via the
    /// filter index. A null handle means the key sorts past every covered
    /// range.
    fn get_fixed_size_filter_handle(&self, filter_key: &[u8]) -> Result<BlockHandle> {
        let reader = self.rep.filter_index_reader.as_ref().ok_or_else(|| {
            TableError::corruption("fixed-size filter index not loaded")
        })?;
        let mut iter = reader.new_iterator(true);
        iter.seek(filter_key);
        if iter.valid() {
            let mut input = iter.value();
            BlockHandle::decode_from(&mut input)
        } else {
            Ok(BlockHandle::NULL)
        }
    }

    /// Build a filter reader from the block at `handle`. Read or parse
    /// failures disable the filter (logged); lookups then behave as if the
    /// table had none.
    fn read_filter_block(&self, handle: &BlockHandle) -> Option<FilterBlockReader> {
        if self.rep.filter_type == FilterType::NoFilter {
            return None;
        }
        let contents = match read_block_contents(
            self.rep.base_file.reader.as_ref(),
            &self.rep.footer,
            true,
            handle,
            false,
        ) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "error reading filter block");
                return None;
            }
        };

        let policy = Arc::clone(self.rep.filter_policy.as_ref()?);
        let prefix_extractor = if self.rep.prefix_filtering {
            self.rep.options.prefix_extractor.clone()
        } else {
            None
        };
        let whole_key_filtering = self.rep.whole_key_filtering;

        match self.rep.filter_type {
            FilterType::NoFilter => None,
            FilterType::BlockBased => {
                match BlockBasedFilter::new(policy, prefix_extractor, whole_key_filtering, contents)
                {
                    Ok(filter) => Some(FilterBlockReader::BlockBased(filter)),
                    Err(e) => {
                        warn!(error = %e, "malformed block-based filter");
                        None
                    }
                }
            }
            FilterType::Full => Some(FilterBlockReader::Full(FullFilter::new(
                policy,
                prefix_extractor,
                whole_key_filtering,
                contents,
            ))),
            FilterType::FixedSize => Some(FilterBlockReader::FixedSize(FixedSizeFilter::new(
                policy,
                prefix_extractor,
                whole_key_filtering,
                contents,
            ))),
        }
    }

    /// Fetch the filter for a query.
    ///
    /// Pre-loaded filters are returned directly. Cached filters are looked
    /// up (and read+inserted on a miss) under the filter block's cache
    /// key. `filter_key` is required for fixed-size filters, which must
    /// first consult the filter index; a key past the covered ranges gets
    /// the not-matching sentinel. Fixed-size filter fetches ignore `no_io`
    /// — they always go through the cache and may read.
    pub(crate) fn get_filter(
        &self,
        query_id: QueryId,
        no_io: bool,
        filter_key: Option<&[u8]>,
    ) -> FilterEntry {
        let is_fixed_size = self.rep.filter_type == FilterType::FixedSize;
        debug_assert!(!is_fixed_size || filter_key.is_some());

        // Non-fixed filters outside cache_index_and_filter_blocks mode are
        // pre-populated (or permanently absent after a failed open read).
        if !self.rep.table_options.cache_index_and_filter_blocks && !is_fixed_size {
            return FilterEntry {
                filter: self.rep.filter.clone(),
                _handle: None,
            };
        }

        let Some(cache) = self.rep.table_options.block_cache.as_deref() else {
            return FilterEntry::none();
        };
        if self.rep.filter_policy.is_none() {
            return FilterEntry::none();
        }

        let filter_handle = if is_fixed_size {
            match self.get_fixed_size_filter_handle(filter_key.expect("required for fixed-size")) {
                Ok(handle) if handle.is_null() => {
                    // Past the filter index: nothing with this key exists.
                    return FilterEntry {
                        filter: Some(Arc::clone(&self.rep.not_matching_filter)),
                        _handle: None,
                    };
                }
                Ok(handle) => handle,
                Err(e) => {
                    // Filter corruption must not fail reads in production,
                    // but should be loud during development.
                    error!(error = %e, "failed to resolve fixed-size filter block");
                    debug_assert!(
                        false,
                        "failed to resolve fixed-size filter block: {e}"
                    );
                    return FilterEntry::none();
                }
            }
        } else {
            self.rep.filter_handle
        };

        let key = cache_key(&self.rep.base_file.cache_key_prefix, &filter_handle);
        let statistics = &self.rep.options.statistics;
        let cache_handle = get_entry_from_cache(
            cache,
            &key,
            Ticker::BlockCacheFilterMiss,
            Ticker::BlockCacheFilterHit,
            statistics,
            query_id,
        );

        if let Some(handle) = cache_handle {
            let filter = handle.value().as_filter().cloned();
            return FilterEntry {
                filter,
                _handle: Some(handle),
            };
        }

        if no_io && !is_fixed_size {
            return FilterEntry::none();
        }

        match self.read_filter_block(&filter_handle) {
            Some(filter) => {
                let filter = Arc::new(filter);
                let charge = filter.approximate_memory_usage();
                let handle = cache
                    .insert(&key, query_id, CacheValue::Filter(Arc::clone(&filter)), charge)
                    .ok();
                FilterEntry {
                    filter: Some(filter),
                    _handle: handle,
                }
            }
            None => FilterEntry::none(),
        }
    }

    /// Whole-key plus (when a prefix extractor applies) prefix probe for
    /// full and fixed-size filters. `false` is definitive.
    pub(crate) fn non_block_based_filter_key_may_match(
        &self,
        filter: Option<&FilterBlockReader>,
        filter_key: &[u8],
    ) -> bool {
        debug_assert!(self.rep.filter_type != FilterType::BlockBased);
        let Some(filter) = filter else {
            return true;
        };
        record_tick(&self.rep.options.statistics, Ticker::BloomFilterChecked);
        if !filter.key_may_match(filter_key) {
            return false;
        }
        if let Some(extractor) = &self.rep.options.prefix_extractor {
            if extractor.in_domain(filter_key)
                && !filter.prefix_may_match(extractor.transform(filter_key))
            {
                return false;
            }
        }
        true
    }

    // --------------------------------------------------------------------------------------------
    // Point get
    // --------------------------------------------------------------------------------------------

    /// Point lookup for `internal_key`, feeding matching entries to
    /// `get_context` until it is satisfied.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        internal_key: &[u8],
        get_context: &mut GetContext,
        skip_filters: bool,
    ) -> Result<()> {
        let statistics = &self.rep.options.statistics;

        let mut filter_entry = FilterEntry::none();
        let mut filter_key: &[u8] = &[];
        if !skip_filters {
            filter_key = self.filter_key(internal_key);
            filter_entry = self.get_filter(read_options.query_id, read_options.no_io(), Some(filter_key));
        }
        let filter = filter_entry.filter();
        let is_block_based = self.rep.filter_type == FilterType::BlockBased;

        let mut result = Ok(());

        if !is_block_based && !self.non_block_based_filter_key_may_match(filter, filter_key) {
            // Whole-table filters rule the key out entirely.
            record_tick(statistics, Ticker::BloomFilterUseful);
        } else {
            let mut index_iter = self.new_index_iterator(read_options);
            index_iter.seek(internal_key);

            let mut done = false;
            while index_iter.valid() && !done {
                let handle_encoded = index_iter.value().to_vec();

                if !skip_filters && is_block_based {
                    record_tick(statistics, Ticker::BloomFilterChecked);
                    let mut input = handle_encoded.as_slice();
                    let absent_from_filter = match BlockHandle::decode_from(&mut input) {
                        Ok(handle) => filter
                            .map_or(false, |f| !f.key_may_match_at(filter_key, handle.offset())),
                        Err(_) => false,
                    };
                    if absent_from_filter {
                        // The per-block filter covers exactly this block,
                        // and the seek put us on the only block whose key
                        // range can hold the key. Definitive not-found.
                        record_tick(statistics, Ticker::BloomFilterUseful);
                        break;
                    }
                }

                let mut block_iter = self.new_data_block_iterator(read_options, &handle_encoded);

                if read_options.no_io()
                    && matches!(block_iter.status(), Err(ref e) if e.is_incomplete())
                {
                    // Not resident and not allowed to read: the caller
                    // only learns the key *may* exist.
                    get_context.mark_key_may_exist();
                    break;
                }
                if let Err(e) = block_iter.status() {
                    result = Err(e);
                    break;
                }

                block_iter.seek(internal_key);
                while block_iter.valid() {
                    match parse_internal_key(block_iter.key()) {
                        Ok(parsed) => {
                            if !get_context.save_value(&parsed, block_iter.value()) {
                                done = true;
                                break;
                            }
                        }
                        Err(e) => {
                            result = Err(e);
                            done = true;
                            break;
                        }
                    }
                    block_iter.next();
                }
                if result.is_ok() {
                    if let Err(e) = block_iter.status() {
                        result = Err(e);
                    }
                }
                if result.is_err() {
                    break;
                }
                index_iter.next();
            }

            if result.is_ok() {
                if let Err(e) = index_iter.status() {
                    result = Err(e);
                }
            }
        }

        drop(filter_entry);
        result
    }

    // --------------------------------------------------------------------------------------------
    // Prefix probe
    // --------------------------------------------------------------------------------------------

    /// May any key sharing `internal_key`'s prefix exist in this table?
    ///
    /// Requires the standard prefix-extractor properties (`key` starts
    /// with `prefix(key)`, `prefix(key) ≤ key`, prefix monotonicity);
    /// given those, a `false` answer is definitive. Never performs I/O:
    /// all lookups run at the block-cache tier.
    pub fn prefix_may_match(&self, internal_key: &[u8]) -> bool {
        if self.rep.filter_policy.is_none() {
            return true;
        }
        let Some(extractor) = self.rep.options.prefix_extractor.as_deref() else {
            return true;
        };

        let user_key = extract_user_key(internal_key);
        let filter_key = self.filter_key(internal_key);
        if !extractor.in_domain(filter_key) || !extractor.in_domain(user_key) {
            return true;
        }
        let user_key_prefix = extractor.transform(user_key);
        let filter_key_prefix = extractor.transform(filter_key);

        // Seek target: the smallest internal key carrying the prefix.
        let mut internal_prefix = Vec::new();
        append_internal_key(
            &mut internal_prefix,
            user_key_prefix,
            MAX_SEQUENCE_NUMBER,
            ValueType::Value,
        );

        let no_io_options = ReadOptions {
            read_tier: crate::options::ReadTier::BlockCacheTier,
            ..ReadOptions::default()
        };

        let mut may_match = true;

        let filter_entry = self.get_filter(no_io_options.query_id, true, Some(filter_key));
        let filter = filter_entry.filter();
        let is_block_based = self.rep.filter_type == FilterType::BlockBased;

        if let Some(filter) = filter {
            if !is_block_based {
                may_match = filter.prefix_may_match(filter_key_prefix);
            }
        }

        if may_match {
            let mut index_iter = self.new_index_iterator(&no_io_options);
            index_iter.seek(&internal_prefix);

            if !index_iter.valid() {
                // Past the end of the file — unless the index was simply
                // not resident, in which case we must stay conservative.
                may_match = matches!(index_iter.status(), Err(ref e) if e.is_incomplete());
            } else if extract_user_key(index_iter.key()).starts_with(user_key_prefix) {
                // The block ending at this key may hold the prefix, and so
                // may the next one; play it safe.
                may_match = true;
            } else if let Some(filter) = filter {
                if is_block_based {
                    // This is the only block that could contain the
                    // prefix; ask its per-block filter.
                    let mut input = index_iter.value();
                    if let Ok(handle) = BlockHandle::decode_from(&mut input) {
                        may_match = filter.prefix_may_match_at(filter_key_prefix, handle.offset());
                    }
                }
            }
        }

        let statistics = &self.rep.options.statistics;
        record_tick(statistics, Ticker::BloomFilterPrefixChecked);
        if !may_match {
            record_tick(statistics, Ticker::BloomFilterPrefixUseful);
        }

        may_match
    }

    // --------------------------------------------------------------------------------------------
    // Scans
    // --------------------------------------------------------------------------------------------

    /// An ordered iterator over the whole table.
    ///
    /// With `use_bloom_on_scan`, `seek` consults the fixed-size filter and
    /// invalidates the iterator outright when the filter rules the hashed
    /// prefix out — sound only while a scan stays within one such prefix.
    pub fn new_iterator(&self, read_options: &ReadOptions, skip_filters: bool) -> ScanIterator<'_> {
        let inner = TwoLevelIterator::new(self, read_options.clone(), skip_filters);
        if read_options.use_bloom_on_scan {
            ScanIterator::BloomAware(BloomFilterAwareIterator::new(
                self,
                read_options.clone(),
                skip_filters,
                inner,
            ))
        } else {
            ScanIterator::Plain(inner)
        }
    }

    // --------------------------------------------------------------------------------------------
    // Prefetch & approximation
    // --------------------------------------------------------------------------------------------

    /// Warm the cache for the key range `[begin, end)`; open bounds warm
    /// from the start / to the end. One boundary block past `end` is also
    /// loaded so scans crossing it stay warm.
    pub fn prefetch(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let comparator = &self.rep.internal_comparator;
        if let (Some(begin), Some(end)) = (begin, end) {
            if comparator.compare(begin, end) == std::cmp::Ordering::Greater {
                return Err(TableError::invalid_argument(
                    "prefetch range is inverted (begin > end)",
                ));
            }
        }

        let read_options = ReadOptions::default();
        let mut index_iter = self.new_index_iterator(&read_options);
        match begin {
            Some(begin) => index_iter.seek(begin),
            None => index_iter.seek_to_first(),
        }
        index_iter.status()?;

        let mut prefetching_boundary_block = false;
        while index_iter.valid() {
            if let Some(end) = end {
                if comparator.compare(index_iter.key(), end) != std::cmp::Ordering::Less {
                    if prefetching_boundary_block {
                        break;
                    }
                    // This index key is the last key of its block, so the
                    // block itself still overlaps the range. Load it, then
                    // stop.
                    prefetching_boundary_block = true;
                }
            }

            let handle_encoded = index_iter.value().to_vec();
            let block_iter = self.new_data_block_iterator(&read_options, &handle_encoded);
            block_iter.status()?;

            index_iter.next();
        }
        index_iter.status()
    }

    /// Approximate file offset at which `key`'s data would live.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.new_index_iterator(&ReadOptions::default());
        index_iter.seek(key);
        if index_iter.valid() {
            let mut input = index_iter.value();
            match BlockHandle::decode_from(&mut input) {
                Ok(handle) => handle.offset(),
                // Undecodable handle: the metaindex offset is the closest
                // thing to "end of the data region" we know.
                Err(_) => self.rep.footer.metaindex_handle.offset(),
            }
        } else {
            // Past the last key. Prefer the recorded data size; fall back
            // to the metaindex offset, which is just past the data blocks.
            self.rep
                .properties
                .as_ref()
                .and_then(TableProperties::data_size)
                .filter(|&size| size > 0)
                .unwrap_or_else(|| self.rep.footer.metaindex_handle.offset())
        }
    }

    // --------------------------------------------------------------------------------------------
    // Test hooks
    // --------------------------------------------------------------------------------------------

    /// Whether the data block that would serve `internal_key` is resident
    /// in the uncompressed cache. Test instrumentation.
    pub fn key_in_cache(&self, read_options: &ReadOptions, internal_key: &[u8]) -> bool {
        let mut index_iter = self.new_index_iterator(read_options);
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            return false;
        }
        let mut input = index_iter.value();
        let Ok(handle) = BlockHandle::decode_from(&mut input) else {
            return false;
        };
        let Some(cache) = self.rep.table_options.block_cache.as_deref() else {
            return false;
        };
        let key = cache_key(&self.rep.data_file.cache_key_prefix, &handle);
        cache.lookup(&key, read_options.query_id).is_some()
    }

    /// Whether a filter block was pinned into the reader at open.
    pub fn filter_block_preloaded(&self) -> bool {
        self.rep.filter.is_some()
    }

    /// Whether the data-block index reader was pinned at open.
    pub fn index_reader_preloaded(&self) -> bool {
        self.rep.data_index_reader.is_some()
    }

    pub(crate) fn filter_type(&self) -> FilterType {
        self.rep.filter_type
    }

    pub(crate) fn statistics(&self) -> &Option<Arc<Statistics>> {
        &self.rep.options.statistics
    }

    pub(crate) fn has_prefix_extractor(&self) -> bool {
        self.rep.options.prefix_extractor.is_some()
    }
}

// ------------------------------------------------------------------------------------------------
// Meta-index helpers
// ------------------------------------------------------------------------------------------------

/// Exact-match lookup of `name` in the meta-index.
fn find_meta_block(meta_iter: &mut BlockIter, name: &[u8]) -> Result<BlockHandle> {
    meta_iter.seek(name);
    if meta_iter.valid() && meta_iter.key() == name {
        let mut input = meta_iter.value();
        BlockHandle::decode_from(&mut input)
    } else {
        Err(TableError::corruption(format!(
            "meta block not found: {}",
            String::from_utf8_lossy(name)
        )))
    }
}

/// Handles of the two hash-index auxiliary blocks, when present.
fn hash_index_aux_handles(meta_iter: &mut BlockIter) -> (Option<BlockHandle>, Option<BlockHandle>) {
    (
        find_meta_block(meta_iter, HASH_INDEX_PREFIXES_BLOCK_NAME).ok(),
        find_meta_block(meta_iter, HASH_INDEX_PREFIXES_METADATA_BLOCK_NAME).ok(),
    )
}
