//! Table writer used to produce fixtures for the reader's test suites.
//!
//! The production write path lives with the engine's flush/compaction
//! code; this builder exists so the reader can be tested against real,
//! format-conformant files — including every filter shape, the hash-index
//! auxiliary blocks, and compressed blocks — without depending on that
//! engine. Nothing on the read path calls into this module.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::comparator::SliceTransform;
use crate::encoding::{put_fixed32, put_fixed64, put_length_prefixed_slice, put_varint32};
use crate::filter::{FilterPolicy, FilterType, FILTER_BASE_LG};
use crate::format::{block_checksum, BlockHandle, CompressionType, Footer};
use crate::key::extract_user_key;
use crate::options::{ChecksumType, IndexType};
use crate::table::{
    FILTER_BLOCK_PREFIX, FIXED_SIZE_FILTER_BLOCK_PREFIX, FULL_FILTER_BLOCK_PREFIX,
    HASH_INDEX_PREFIXES_BLOCK_NAME, HASH_INDEX_PREFIXES_METADATA_BLOCK_NAME, PROPERTIES_BLOCK_NAME,
    PROP_DATA_SIZE, PROP_INDEX_TYPE, PROP_PREFIX_FILTERING, PROP_WHOLE_KEY_FILTERING,
};

// ------------------------------------------------------------------------------------------------
// BlockBuilder
// ------------------------------------------------------------------------------------------------

/// Builds one restart-point block from keys added in comparator order.
pub struct BlockBuilder {
    restart_interval: usize,
    buf: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> BlockBuilder {
        debug_assert!(restart_interval >= 1);
        BlockBuilder {
            restart_interval,
            buf: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes `finish` would currently produce.
    pub fn size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    /// Append an entry. `key` must sort after every key added so far
    /// under the comparator the block will be read with (which for
    /// internal keys is not bytewise order).
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter < self.restart_interval {
            self.last_key
                .iter()
                .zip(key)
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
            0
        };

        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, (key.len() - shared) as u32);
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.counter += 1;
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
    }

    /// Append the restart array and return the block payload.
    pub fn finish(mut self) -> Vec<u8> {
        let restarts = std::mem::take(&mut self.restarts);
        for restart in &restarts {
            put_fixed32(&mut self.buf, *restart);
        }
        put_fixed32(&mut self.buf, restarts.len() as u32);
        self.buf
    }
}

// ------------------------------------------------------------------------------------------------
// Filter builders
// ------------------------------------------------------------------------------------------------

/// Builds the block-based filter block: one filter per `1 << base_lg`
/// bytes of data-block offsets.
pub struct BlockBasedFilterBuilder {
    policy: Arc<dyn FilterPolicy>,
    base_lg: u8,
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl BlockBasedFilterBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> BlockBasedFilterBuilder {
        BlockBasedFilterBuilder {
            policy,
            base_lg: FILTER_BASE_LG,
            keys: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Announce that a data block begins at `block_offset`; keys added
    /// afterwards belong to that block's filter.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = (block_offset >> self.base_lg) as usize;
        debug_assert!(filter_index >= self.filter_offsets.len());
        while self.filter_offsets.len() < filter_index {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // Empty filter: matches nothing, by on-disk convention.
            return;
        }
        let refs: Vec<&[u8]> = self.keys.iter().map(Vec::as_slice).collect();
        self.policy.create_filter(&refs, &mut self.result);
        self.keys.clear();
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        let offsets = std::mem::take(&mut self.filter_offsets);
        for offset in &offsets {
            put_fixed32(&mut self.result, *offset);
        }
        // Final array entry: the end of the filter data, so filter i is
        // always [offset[i], offset[i+1]).
        put_fixed32(&mut self.result, array_offset);
        put_fixed32(&mut self.result, array_offset);
        self.result.push(self.base_lg);
        self.result
    }
}

/// Builds a full filter: a single structure over every added key.
pub struct FullFilterBuilder {
    policy: Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
}

impl FullFilterBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> FullFilterBuilder {
        FullFilterBuilder {
            policy,
            keys: Vec::new(),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let refs: Vec<&[u8]> = self.keys.iter().map(Vec::as_slice).collect();
        let mut result = Vec::new();
        self.policy.create_filter(&refs, &mut result);
        result
    }
}

// ------------------------------------------------------------------------------------------------
// TableBuilder
// ------------------------------------------------------------------------------------------------

/// Knobs for [`TableBuilder`]. Defaults produce a plain binary-search
/// table with no filter and no compression.
pub struct BuilderOptions {
    pub block_size: usize,
    pub block_restart_interval: usize,
    pub compression: CompressionType,
    pub format_version: u32,
    pub checksum: ChecksumType,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    /// Which filter shape to emit (requires `filter_policy`).
    pub filter_kind: FilterType,
    pub prefix_extractor: Option<Arc<dyn SliceTransform>>,
    /// Values recorded in the properties block.
    pub whole_key_filtering: bool,
    pub prefix_filtering: bool,
    pub index_type: IndexType,
    /// Also emit the hash-index auxiliary blocks (requires
    /// `prefix_extractor`).
    pub emit_hash_index: bool,
    /// Keys covered per fixed-size filter block.
    pub keys_per_fixed_filter: usize,
    /// Extra user properties, written after (and overriding) the
    /// defaults.
    pub extra_properties: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_restart_interval: 16,
            compression: CompressionType::None,
            format_version: 2,
            checksum: ChecksumType::Crc32,
            filter_policy: None,
            filter_kind: FilterType::NoFilter,
            prefix_extractor: None,
            whole_key_filtering: true,
            prefix_filtering: true,
            index_type: IndexType::BinarySearch,
            emit_hash_index: false,
            keys_per_fixed_filter: 64,
            extra_properties: Vec::new(),
        }
    }
}

/// Assembles a complete table image in memory. Keys must be internal keys
/// added in internal-key order; `finish` returns the file bytes.
pub struct TableBuilder {
    opts: BuilderOptions,
    buf: Vec<u8>,
    data_block: BlockBuilder,
    index_entries: Vec<(Vec<u8>, BlockHandle)>,
    last_key: Vec<u8>,
    block_based_filter: Option<BlockBasedFilterBuilder>,
    full_filter: Option<FullFilterBuilder>,
    /// Transformed filter keys, in order, for fixed-size chunking.
    fixed_filter_keys: Vec<Vec<u8>>,
    /// `(prefix, first block, last block)` runs for the hash index.
    prefix_runs: Vec<(Vec<u8>, u32, u32)>,
}

impl TableBuilder {
    pub fn new(opts: BuilderOptions) -> TableBuilder {
        debug_assert!(
            opts.filter_kind == FilterType::NoFilter || opts.filter_policy.is_some(),
            "a filter shape needs a policy"
        );
        let block_based_filter = match (&opts.filter_kind, &opts.filter_policy) {
            (FilterType::BlockBased, Some(policy)) => {
                Some(BlockBasedFilterBuilder::new(Arc::clone(policy)))
            }
            _ => None,
        };
        let full_filter = match (&opts.filter_kind, &opts.filter_policy) {
            (FilterType::Full, Some(policy)) => Some(FullFilterBuilder::new(Arc::clone(policy))),
            _ => None,
        };
        let restart_interval = opts.block_restart_interval;
        TableBuilder {
            opts,
            buf: Vec::new(),
            data_block: BlockBuilder::new(restart_interval),
            index_entries: Vec::new(),
            last_key: Vec::new(),
            block_based_filter,
            full_filter,
            fixed_filter_keys: Vec::new(),
            prefix_runs: Vec::new(),
        }
    }

    /// The key the filter stores and probes for `internal_key`.
    fn filter_key<'a>(&self, internal_key: &'a [u8]) -> &'a [u8] {
        let user_key = extract_user_key(internal_key);
        match self
            .opts
            .filter_policy
            .as_ref()
            .and_then(|policy| policy.key_transformer())
        {
            Some(transformer) => transformer.transform(user_key),
            None => user_key,
        }
    }

    /// Append one entry; `internal_key` must sort after all previous ones
    /// under the internal-key order.
    pub fn add(&mut self, internal_key: &[u8], value: &[u8]) {
        let user_key = extract_user_key(internal_key);
        let current_block = self.index_entries.len() as u32;

        if self.data_block.is_empty() {
            if let Some(filter) = &mut self.block_based_filter {
                filter.start_block(self.buf.len() as u64);
            }
        }

        // Filter bookkeeping.
        let filter_key = self.filter_key(internal_key).to_vec();
        match self.opts.filter_kind {
            FilterType::NoFilter => {}
            FilterType::BlockBased | FilterType::Full => {
                let prefix = self.opts.prefix_extractor.as_ref().and_then(|extractor| {
                    extractor
                        .in_domain(user_key)
                        .then(|| extractor.transform(user_key).to_vec())
                });
                if let Some(filter) = &mut self.block_based_filter {
                    filter.add_key(&filter_key);
                    if let Some(prefix) = &prefix {
                        filter.add_key(prefix);
                    }
                }
                if let Some(filter) = &mut self.full_filter {
                    filter.add_key(&filter_key);
                    if let Some(prefix) = &prefix {
                        filter.add_key(prefix);
                    }
                }
            }
            FilterType::FixedSize => {
                if self.fixed_filter_keys.last().map(Vec::as_slice) != Some(filter_key.as_slice()) {
                    self.fixed_filter_keys.push(filter_key);
                }
            }
        }

        // Hash-index bookkeeping: runs of equal prefixes over block
        // numbers.
        if self.opts.emit_hash_index {
            if let Some(extractor) = &self.opts.prefix_extractor {
                if extractor.in_domain(user_key) {
                    let prefix = extractor.transform(user_key);
                    match self.prefix_runs.last_mut() {
                        Some((last, _, end)) if last.as_slice() == prefix => *end = current_block,
                        _ => self.prefix_runs.push((prefix.to_vec(), current_block, current_block)),
                    }
                }
            }
        }

        self.data_block.add(internal_key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(internal_key);

        if self.data_block.size_estimate() >= self.opts.block_size {
            self.flush_data_block();
        }
    }

    fn flush_data_block(&mut self) {
        if self.data_block.is_empty() {
            return;
        }
        let payload = std::mem::replace(
            &mut self.data_block,
            BlockBuilder::new(self.opts.block_restart_interval),
        )
        .finish();
        let handle = self.write_block(&payload, self.opts.compression);
        self.index_entries.push((self.last_key.clone(), handle));
    }

    /// Write a block with the trailer, compressing when it pays off.
    fn write_block(&mut self, payload: &[u8], compression: CompressionType) -> BlockHandle {
        let (bytes, tag) = match compression {
            CompressionType::None => (payload.to_vec(), CompressionType::None),
            CompressionType::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(payload)
                    .unwrap_or_else(|_| payload.to_vec());
                if compressed.len() < payload.len() {
                    (compressed, CompressionType::Snappy)
                } else {
                    (payload.to_vec(), CompressionType::None)
                }
            }
            CompressionType::Lz4 => {
                let compressed = lz4_flex::block::compress_prepend_size(payload);
                if compressed.len() < payload.len() {
                    (compressed, CompressionType::Lz4)
                } else {
                    (payload.to_vec(), CompressionType::None)
                }
            }
        };
        self.write_raw_block(&bytes, tag)
    }

    fn write_raw_block(&mut self, payload: &[u8], tag: CompressionType) -> BlockHandle {
        let handle = BlockHandle::new(self.buf.len() as u64, payload.len() as u64);
        self.buf.extend_from_slice(payload);
        self.buf.push(tag as u8);
        put_fixed32(&mut self.buf, block_checksum(payload, tag as u8));
        handle
    }

    /// Write all meta blocks, the index, and the footer; returns the
    /// complete file image.
    pub fn finish(mut self) -> Vec<u8> {
        self.flush_data_block();
        let data_size = self.buf.len() as u64;

        let mut meta_entries: BTreeMap<Vec<u8>, BlockHandle> = BTreeMap::new();

        // Filter block(s).
        if let Some(policy) = self.opts.filter_policy.clone() {
            match self.opts.filter_kind {
                FilterType::NoFilter => {}
                FilterType::BlockBased => {
                    let payload = self
                        .block_based_filter
                        .take()
                        .expect("builder created with the shape")
                        .finish();
                    let handle = self.write_raw_block(&payload, CompressionType::None);
                    let mut name = FILTER_BLOCK_PREFIX.as_bytes().to_vec();
                    name.extend_from_slice(policy.name().as_bytes());
                    meta_entries.insert(name, handle);
                }
                FilterType::Full => {
                    let payload = self
                        .full_filter
                        .take()
                        .expect("builder created with the shape")
                        .finish();
                    let handle = self.write_raw_block(&payload, CompressionType::None);
                    let mut name = FULL_FILTER_BLOCK_PREFIX.as_bytes().to_vec();
                    name.extend_from_slice(policy.name().as_bytes());
                    meta_entries.insert(name, handle);
                }
                FilterType::FixedSize => {
                    let handle = self.write_fixed_size_filters(policy.as_ref());
                    let mut name = FIXED_SIZE_FILTER_BLOCK_PREFIX.as_bytes().to_vec();
                    name.extend_from_slice(policy.name().as_bytes());
                    meta_entries.insert(name, handle);
                }
            }
        }

        // Hash-index auxiliary blocks.
        if self.opts.emit_hash_index && !self.prefix_runs.is_empty() {
            let mut prefixes = Vec::new();
            let mut meta = Vec::new();
            for (prefix, first, last) in &self.prefix_runs {
                put_length_prefixed_slice(&mut prefixes, prefix);
                put_varint32(&mut meta, *first);
                put_varint32(&mut meta, *last - *first + 1);
            }
            let prefixes_handle = self.write_raw_block(&prefixes, CompressionType::None);
            let meta_handle = self.write_raw_block(&meta, CompressionType::None);
            meta_entries.insert(HASH_INDEX_PREFIXES_BLOCK_NAME.to_vec(), prefixes_handle);
            meta_entries.insert(
                HASH_INDEX_PREFIXES_METADATA_BLOCK_NAME.to_vec(),
                meta_handle,
            );
        }

        // Properties block.
        {
            let mut properties: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            let mut index_type = Vec::new();
            put_fixed32(&mut index_type, self.opts.index_type as u32);
            properties.insert(PROP_INDEX_TYPE.to_vec(), index_type);
            let mut data_size_raw = Vec::new();
            put_fixed64(&mut data_size_raw, data_size);
            properties.insert(PROP_DATA_SIZE.to_vec(), data_size_raw);
            properties.insert(
                PROP_WHOLE_KEY_FILTERING.to_vec(),
                if self.opts.whole_key_filtering { b"1".to_vec() } else { b"0".to_vec() },
            );
            properties.insert(
                PROP_PREFIX_FILTERING.to_vec(),
                if self.opts.prefix_filtering { b"1".to_vec() } else { b"0".to_vec() },
            );
            for (name, value) in std::mem::take(&mut self.opts.extra_properties) {
                properties.insert(name, value);
            }

            let mut block = BlockBuilder::new(1);
            for (name, value) in &properties {
                block.add(name, value);
            }
            let handle = self.write_raw_block(&block.finish(), CompressionType::None);
            meta_entries.insert(PROPERTIES_BLOCK_NAME.to_vec(), handle);
        }

        // Metaindex block.
        let metaindex_handle = {
            let mut block = BlockBuilder::new(1);
            for (name, handle) in &meta_entries {
                let mut encoded = Vec::new();
                handle.encode_to(&mut encoded);
                block.add(name, &encoded);
            }
            self.write_raw_block(&block.finish(), CompressionType::None)
        };

        // Index block: one restart per entry so hash-index restart ranges
        // address entries directly.
        let index_handle = {
            let mut block = BlockBuilder::new(1);
            for (last_key, handle) in &self.index_entries {
                let mut encoded = Vec::new();
                handle.encode_to(&mut encoded);
                block.add(last_key, &encoded);
            }
            let payload = block.finish();
            self.write_block(&payload, self.opts.compression)
        };

        let footer = Footer {
            checksum: self.opts.checksum,
            metaindex_handle,
            index_handle,
            format_version: self.opts.format_version,
        };
        footer.encode_to(&mut self.buf);
        self.buf
    }

    /// Write one bloom block per chunk of transformed keys plus the filter
    /// index mapping each chunk's last key to its block.
    fn write_fixed_size_filters(&mut self, policy: &dyn FilterPolicy) -> BlockHandle {
        let chunk_size = self.opts.keys_per_fixed_filter.max(1);
        let chunks: Vec<(Vec<u8>, BlockHandle)> = {
            let keys = std::mem::take(&mut self.fixed_filter_keys);
            keys.chunks(chunk_size)
                .map(|chunk| {
                    let refs: Vec<&[u8]> = chunk.iter().map(Vec::as_slice).collect();
                    let mut payload = Vec::new();
                    policy.create_filter(&refs, &mut payload);
                    let handle = self.write_raw_block(&payload, CompressionType::None);
                    (chunk.last().expect("chunks are non-empty").clone(), handle)
                })
                .collect()
        };

        let mut index = BlockBuilder::new(1);
        for (last_key, handle) in &chunks {
            let mut encoded = Vec::new();
            handle.encode_to(&mut encoded);
            index.add(last_key, &encoded);
        }
        self.write_raw_block(&index.finish(), CompressionType::None)
    }
}

/// Convenience: build an internal key in one call.
pub fn internal_key(user_key: &[u8], sequence: u64, value_type: crate::key::ValueType) -> Vec<u8> {
    let mut out = Vec::new();
    crate::key::append_internal_key(&mut out, user_key, sequence, value_type);
    out
}
