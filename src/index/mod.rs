//! Index readers over the first-key-per-block index.
//!
//! Both shapes wrap the same on-disk index block — entries mapping "last
//! key of data block *i*" to block *i*'s handle — and differ only in how
//! `seek` locates a restart interval:
//!
//! - [`BinarySearchIndexReader`] relies on the block's own restart-point
//!   binary search.
//! - [`HashIndexReader`] additionally attaches an in-memory prefix →
//!   restart-range map built from the two hash-index meta blocks. Building
//!   that auxiliary can fail for all sorts of file-level reasons; none of
//!   them are fatal, the reader just degrades to plain binary search and
//!   says so in the log.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::warn;

use crate::block::{Block, BlockHashIndex, BlockIter};
use crate::comparator::{Comparator, SliceTransform};
use crate::error::Result;
use crate::file::RandomAccessFile;
use crate::format::{read_block_contents, BlockHandle, Footer};

/// A loaded index block, ready to hand out iterators.
pub enum IndexReader {
    BinarySearch(BinarySearchIndexReader),
    Hash(HashIndexReader),
}

impl IndexReader {
    /// An iterator over index entries. With `total_order_seek`, any
    /// attached prefix map is bypassed so every entry is reachable in
    /// comparator order.
    pub fn new_iterator(&self, total_order_seek: bool) -> BlockIter {
        match self {
            IndexReader::BinarySearch(reader) => {
                reader.block.iter(Arc::clone(&reader.comparator), false)
            }
            IndexReader::Hash(reader) => reader
                .block
                .iter(Arc::clone(&reader.comparator), !total_order_seek),
        }
    }

    /// Memory used outside any block cache.
    pub fn approximate_memory_usage(&self) -> usize {
        match self {
            IndexReader::BinarySearch(reader) => reader.block.approximate_memory_usage(),
            IndexReader::Hash(reader) => reader.block.approximate_memory_usage(),
        }
    }

    /// Encoded size of the underlying index block.
    pub fn size(&self) -> usize {
        match self {
            IndexReader::BinarySearch(reader) => reader.block.size(),
            IndexReader::Hash(reader) => reader.block.size(),
        }
    }
}

/// Thin wrapper over the index block's built-in binary search.
pub struct BinarySearchIndexReader {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,
}

impl BinarySearchIndexReader {
    /// Read the index block at `handle` and wrap it.
    pub fn create(
        file: &dyn RandomAccessFile,
        footer: &Footer,
        handle: &BlockHandle,
        comparator: Arc<dyn Comparator>,
    ) -> Result<IndexReader> {
        let contents = read_block_contents(file, footer, true, handle, true)?;
        let block = Arc::new(Block::new(contents)?);
        Ok(IndexReader::BinarySearch(BinarySearchIndexReader {
            block,
            comparator,
        }))
    }
}

/// Index block with a prefix hash map for O(1) interval location.
pub struct HashIndexReader {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,
}

impl HashIndexReader {
    /// Read the index block and attach the prefix map built from the
    /// `prefixes` / `prefixes_meta` auxiliary blocks.
    ///
    /// Only a failure to read the index block itself is an error. Missing
    /// or malformed auxiliaries degrade to binary search: the map is an
    /// optimization, and an old or partially-written pair of meta blocks
    /// must not brick the table.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        file: &dyn RandomAccessFile,
        footer: &Footer,
        handle: &BlockHandle,
        comparator: Arc<dyn Comparator>,
        transform: Arc<dyn SliceTransform>,
        prefixes_handle: Option<BlockHandle>,
        prefixes_meta_handle: Option<BlockHandle>,
        allow_collision: bool,
    ) -> Result<IndexReader> {
        let contents = read_block_contents(file, footer, true, handle, true)?;
        let mut block = Block::new(contents)?;

        let (Some(prefixes_handle), Some(prefixes_meta_handle)) =
            (prefixes_handle, prefixes_meta_handle)
        else {
            warn!("hash-index meta blocks absent; falling back to binary search");
            return Ok(IndexReader::Hash(HashIndexReader {
                block: Arc::new(block),
                comparator,
            }));
        };

        match Self::build_hash_index(
            file,
            footer,
            &prefixes_handle,
            &prefixes_meta_handle,
            Arc::clone(&transform),
            block.num_restarts(),
            allow_collision,
        ) {
            Ok(index) => block.set_hash_index(index),
            Err(e) => {
                warn!(error = %e, "failed to build hash index; falling back to binary search");
            }
        }

        Ok(IndexReader::Hash(HashIndexReader {
            block: Arc::new(block),
            comparator,
        }))
    }

    fn build_hash_index(
        file: &dyn RandomAccessFile,
        footer: &Footer,
        prefixes_handle: &BlockHandle,
        prefixes_meta_handle: &BlockHandle,
        transform: Arc<dyn SliceTransform>,
        num_restarts: u32,
        allow_collision: bool,
    ) -> Result<BlockHashIndex> {
        let prefixes = read_block_contents(file, footer, true, prefixes_handle, true)?;
        let prefixes_meta = read_block_contents(file, footer, true, prefixes_meta_handle, true)?;
        BlockHashIndex::build(
            transform,
            &prefixes.data,
            &prefixes_meta.data,
            num_restarts,
            allow_collision,
        )
    }
}
