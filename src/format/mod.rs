//! On-disk format: block handles, the footer, and physical block reads.
//!
//! # File layout
//!
//! ```text
//! +--------------------------+
//! | block 0                  |  payload + 5-byte trailer
//! +--------------------------+
//! | ...                      |
//! +--------------------------+
//! | meta blocks              |  filters, properties, hash-index aux
//! +--------------------------+
//! | metaindex block          |
//! +--------------------------+
//! | index block              |
//! +--------------------------+
//! | footer (53 bytes)        |
//! +--------------------------+
//! ```
//!
//! Every block is followed by a trailer of `[compression: u8][crc32: u32 LE]`;
//! the checksum covers the payload *and* the compression byte, so a flipped
//! tag is caught the same way as flipped data.
//!
//! The footer is fixed-size and self-describing:
//!
//! ```text
//! [checksum_type: u8][metaindex handle][index handle][pad to 40]
//! [format_version: u32 LE][magic: u64 LE]
//! ```
//!
//! Handles are varint-encoded `(offset, size)` pairs, so the two-handle
//! region is padded to its maximum width to keep the footer fixed.

use std::fmt;

use crate::encoding::{
    get_varint64, put_fixed32, put_fixed64, put_varint64, EncodingError, MAX_VARINT64_LENGTH,
};
use crate::error::{Result, TableError};
use crate::file::RandomAccessFile;
use crate::options::ChecksumType;

/// Magic number at the very end of every table file.
pub const TABLE_MAGIC_NUMBER: u64 = 0x7d5b_c1a3_e8a6_f1d9;

/// Trailer appended to every block: 1-byte compression tag + crc32.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Encoded footer length.
pub const FOOTER_ENCODED_LENGTH: usize = 1 + 2 * BlockHandle::MAX_ENCODED_LENGTH + 4 + 8;

const HANDLE_REGION_LENGTH: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH;

/// Is `version` a footer format this build understands?
pub fn supported_format_version(version: u32) -> bool {
    (1..=2).contains(&version)
}

// ------------------------------------------------------------------------------------------------
// BlockHandle
// ------------------------------------------------------------------------------------------------

/// Location of a contiguous byte range within a file: `(offset, size)`,
/// both varint64-encoded. `size` excludes the block trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    /// Two maximal varints.
    pub const MAX_ENCODED_LENGTH: usize = 2 * MAX_VARINT64_LENGTH;

    /// The `(0, 0)` stub, used by the fixed-size filter index to mean
    /// "past the covered key range".
    pub const NULL: BlockHandle = BlockHandle { offset: 0, size: 0 };

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.offset == 0 && self.size == 0
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    /// Decode from a cursor, advancing past the handle. Trailing bytes are
    /// intentionally tolerated so index values can grow extra fields later.
    pub fn decode_from(input: &mut &[u8]) -> Result<BlockHandle> {
        let bad = |_: EncodingError| TableError::corruption("bad block handle");
        let offset = get_varint64(input).map_err(bad)?;
        let size = get_varint64(input).map_err(bad)?;
        Ok(BlockHandle { offset, size })
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}+{}]", self.offset, self.size)
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// Fixed-size trailer locating the metaindex and index blocks.
#[derive(Debug, Clone)]
pub struct Footer {
    pub checksum: ChecksumType,
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
    pub format_version: u32,
}

impl Footer {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        dst.push(self.checksum as u8);
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        dst.resize(start + 1 + HANDLE_REGION_LENGTH, 0);
        put_fixed32(dst, self.format_version);
        put_fixed64(dst, TABLE_MAGIC_NUMBER);
        debug_assert_eq!(dst.len() - start, FOOTER_ENCODED_LENGTH);
    }

    pub fn decode_from(raw: &[u8]) -> Result<Footer> {
        if raw.len() < FOOTER_ENCODED_LENGTH {
            return Err(TableError::corruption("footer too short"));
        }
        let raw = &raw[raw.len() - FOOTER_ENCODED_LENGTH..];

        let magic = crate::encoding::decode_fixed64(&raw[FOOTER_ENCODED_LENGTH - 8..]);
        if magic != TABLE_MAGIC_NUMBER {
            return Err(TableError::corruption("not a table file (bad magic number)"));
        }

        let format_version = crate::encoding::decode_fixed32(&raw[FOOTER_ENCODED_LENGTH - 12..]);
        if !supported_format_version(format_version) {
            return Err(TableError::corruption(format!(
                "unknown footer version {format_version}; file written by a newer build?"
            )));
        }

        let checksum = ChecksumType::from_u8(raw[0])
            .ok_or_else(|| TableError::corruption(format!("unknown checksum type {}", raw[0])))?;

        let mut handles = &raw[1..1 + HANDLE_REGION_LENGTH];
        let metaindex_handle = BlockHandle::decode_from(&mut handles)?;
        let index_handle = BlockHandle::decode_from(&mut handles)?;

        Ok(Footer {
            checksum,
            metaindex_handle,
            index_handle,
            format_version,
        })
    }

    /// Read and decode the footer from the tail of `file`.
    pub fn read_from_file(file: &dyn RandomAccessFile, file_size: u64) -> Result<Footer> {
        if file_size < FOOTER_ENCODED_LENGTH as u64 {
            return Err(TableError::corruption(
                "file is too short to be a table file",
            ));
        }
        let raw = file.read_at(
            file_size - FOOTER_ENCODED_LENGTH as u64,
            FOOTER_ENCODED_LENGTH,
        )?;
        Footer::decode_from(&raw)
    }
}

// ------------------------------------------------------------------------------------------------
// Compression
// ------------------------------------------------------------------------------------------------

/// Per-block compression tag, stored in the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
    /// LZ4 with a size-prepended frame; only legal in format version 2+.
    Lz4 = 2,
}

impl CompressionType {
    pub fn from_u8(raw: u8) -> Option<CompressionType> {
        match raw {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            2 => Some(CompressionType::Lz4),
            _ => None,
        }
    }

    /// The decoder set is indexed by the footer's format version; a tag
    /// from a newer set inside an older file is corruption, not a feature.
    pub fn supported_by_version(self, format_version: u32) -> bool {
        match self {
            CompressionType::None | CompressionType::Snappy => true,
            CompressionType::Lz4 => format_version >= 2,
        }
    }
}

/// Raw block bytes plus how they are (still) encoded.
#[derive(Debug)]
pub struct BlockContents {
    pub data: Vec<u8>,
    pub compression: CompressionType,
    /// Whether the cache may take ownership of a copy of these bytes. The
    /// writer decides; the reader treats it as opaque.
    pub cachable: bool,
}

/// Decompress `data` (tagged `compression`) into fresh block contents.
pub fn uncompress_block_contents(
    data: &[u8],
    compression: CompressionType,
    format_version: u32,
) -> Result<BlockContents> {
    if !compression.supported_by_version(format_version) {
        return Err(TableError::corruption(format!(
            "compression type {:?} not legal in format version {format_version}",
            compression
        )));
    }
    let data = match compression {
        CompressionType::None => data.to_vec(),
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| TableError::corruption(format!("snappy decompression failed: {e}")))?,
        CompressionType::Lz4 => lz4_flex::block::decompress_size_prepended(data)
            .map_err(|e| TableError::corruption(format!("lz4 decompression failed: {e}")))?,
    };
    Ok(BlockContents {
        data,
        compression: CompressionType::None,
        cachable: true,
    })
}

// ------------------------------------------------------------------------------------------------
// Physical block reads
// ------------------------------------------------------------------------------------------------

/// Checksum of a block as stored in its trailer: payload plus the
/// compression byte.
pub fn block_checksum(data: &[u8], compression_tag: u8) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.update(&[compression_tag]);
    hasher.finalize()
}

/// Read the block identified by `handle`, verify its trailer, and
/// optionally decompress.
///
/// With `decompress = false` the contents keep their on-disk encoding and
/// compression tag; this is how raw bytes are fetched for the compressed
/// block cache.
pub fn read_block_contents(
    file: &dyn RandomAccessFile,
    footer: &Footer,
    verify_checksums: bool,
    handle: &BlockHandle,
    decompress: bool,
) -> Result<BlockContents> {
    let payload_len = usize::try_from(handle.size())
        .map_err(|_| TableError::corruption("block handle size out of range"))?;
    let raw = file.read_at(handle.offset(), payload_len + BLOCK_TRAILER_SIZE)?;

    let (payload, trailer) = raw.split_at(payload_len);
    let compression_tag = trailer[0];

    if verify_checksums && footer.checksum == ChecksumType::Crc32 {
        let stored = crate::encoding::decode_fixed32(&trailer[1..]);
        let actual = block_checksum(payload, compression_tag);
        if stored != actual {
            return Err(TableError::corruption(format!(
                "block checksum mismatch at {handle}: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }
    }

    let compression = CompressionType::from_u8(compression_tag).ok_or_else(|| {
        TableError::corruption(format!("unknown compression type {compression_tag}"))
    })?;
    if !compression.supported_by_version(footer.format_version) {
        return Err(TableError::corruption(format!(
            "compression type {compression:?} not legal in format version {}",
            footer.format_version
        )));
    }

    if decompress && compression != CompressionType::None {
        return uncompress_block_contents(payload, compression, footer.format_version);
    }

    Ok(BlockContents {
        data: payload.to_vec(),
        compression,
        cachable: true,
    })
}
