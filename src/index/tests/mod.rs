//! Index reader tests: both shapes over a hand-assembled file, degradation
//! paths, and total-order bypass.

use std::io::Write;
use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator, FixedPrefixTransform};
use crate::encoding::{put_length_prefixed_slice, put_varint32};
use crate::format::{block_checksum, BlockHandle, CompressionType, Footer};
use crate::index::{BinarySearchIndexReader, HashIndexReader, IndexReader};
use crate::iterator::InternalIterator;
use crate::options::ChecksumType;
use crate::table::builder::BlockBuilder;

/// Append `payload` as a checksummed block, returning its handle.
fn append_block(file: &mut Vec<u8>, payload: &[u8]) -> BlockHandle {
    let handle = BlockHandle::new(file.len() as u64, payload.len() as u64);
    file.extend_from_slice(payload);
    file.push(CompressionType::None as u8);
    file.extend_from_slice(&block_checksum(payload, CompressionType::None as u8).to_le_bytes());
    handle
}

fn footer() -> Footer {
    Footer {
        checksum: ChecksumType::Crc32,
        metaindex_handle: BlockHandle::NULL,
        index_handle: BlockHandle::NULL,
        format_version: 2,
    }
}

fn cmp() -> Arc<dyn Comparator> {
    Arc::new(BytewiseComparator)
}

struct Fixture {
    file: std::fs::File,
    index_handle: BlockHandle,
    prefixes_handle: BlockHandle,
    prefixes_meta_handle: BlockHandle,
}

/// An index block of six entries over three prefixes, with matching
/// hash-index auxiliary blocks.
fn fixture() -> Fixture {
    let mut bytes = Vec::new();

    let mut index = BlockBuilder::new(1);
    for (key, handle_bytes) in [
        (&b"aaa:1"[..], &b"h0"[..]),
        (b"aaa:3", b"h1"),
        (b"bbb:2", b"h2"),
        (b"ccc:1", b"h3"),
        (b"ccc:5", b"h4"),
        (b"ccc:9", b"h5"),
    ] {
        index.add(key, handle_bytes);
    }
    let index_handle = append_block(&mut bytes, &index.finish());

    let mut prefixes = Vec::new();
    let mut meta = Vec::new();
    for (prefix, start, count) in [(&b"aaa:"[..], 0u32, 2u32), (b"bbb:", 2, 1), (b"ccc:", 3, 3)] {
        put_length_prefixed_slice(&mut prefixes, prefix);
        put_varint32(&mut meta, start);
        put_varint32(&mut meta, count);
    }
    let prefixes_handle = append_block(&mut bytes, &prefixes);
    let prefixes_meta_handle = append_block(&mut bytes, &meta);

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&bytes).unwrap();

    Fixture {
        file,
        index_handle,
        prefixes_handle,
        prefixes_meta_handle,
    }
}

#[test]
fn binary_search_reader_iterates_in_order() {
    let fx = fixture();
    let reader =
        BinarySearchIndexReader::create(&fx.file, &footer(), &fx.index_handle, cmp()).unwrap();

    let mut iter = reader.new_iterator(true);
    iter.seek(b"bbb:0");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"bbb:2");
    assert_eq!(iter.value(), b"h2");

    iter.seek_to_first();
    let mut count = 0;
    while iter.valid() {
        count += 1;
        iter.next();
    }
    assert_eq!(count, 6);
    assert!(reader.approximate_memory_usage() > 0);
}

#[test]
fn binary_search_reader_propagates_read_errors() {
    let fx = fixture();
    let bogus = BlockHandle::new(1 << 20, 64);
    assert!(BinarySearchIndexReader::create(&fx.file, &footer(), &bogus, cmp()).is_err());
}

#[test]
fn hash_reader_uses_prefix_map_for_seeks() {
    for allow_collision in [false, true] {
        let fx = fixture();
        let reader = HashIndexReader::create(
            &fx.file,
            &footer(),
            &fx.index_handle,
            cmp(),
            Arc::new(FixedPrefixTransform::new(4)),
            Some(fx.prefixes_handle),
            Some(fx.prefixes_meta_handle),
            allow_collision,
        )
        .unwrap();

        let mut iter = reader.new_iterator(false);
        iter.seek(b"ccc:4");
        assert!(iter.valid(), "collision={allow_collision}");
        assert_eq!(iter.key(), b"ccc:5");

        // Absent prefix: definitively invalid without scanning.
        iter.seek(b"qqq:1");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }
}

#[test]
fn hash_reader_total_order_seek_bypasses_map() {
    let fx = fixture();
    let reader = HashIndexReader::create(
        &fx.file,
        &footer(),
        &fx.index_handle,
        cmp(),
        Arc::new(FixedPrefixTransform::new(4)),
        Some(fx.prefixes_handle),
        Some(fx.prefixes_meta_handle),
        false,
    )
    .unwrap();

    let mut iter = reader.new_iterator(true);
    // An absent prefix still lands on the following entry in total order.
    iter.seek(b"qqq:1");
    assert_eq!(iter.key(), b"ccc:5");
}

#[test]
fn hash_reader_degrades_without_aux_blocks() {
    let fx = fixture();
    let reader = HashIndexReader::create(
        &fx.file,
        &footer(),
        &fx.index_handle,
        cmp(),
        Arc::new(FixedPrefixTransform::new(4)),
        None,
        None,
        false,
    )
    .unwrap();
    assert!(matches!(&reader, IndexReader::Hash(_)));

    // Binary search still works; absent prefixes are no longer definitive.
    let mut iter = reader.new_iterator(false);
    iter.seek(b"qqq:1");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"ccc:5");
}

#[test]
fn hash_reader_degrades_on_corrupt_aux_blocks() {
    let fx = fixture();
    // Swap the two auxiliary handles so the build sees garbage.
    let reader = HashIndexReader::create(
        &fx.file,
        &footer(),
        &fx.index_handle,
        cmp(),
        Arc::new(FixedPrefixTransform::new(4)),
        Some(fx.prefixes_meta_handle),
        Some(fx.prefixes_handle),
        false,
    )
    .unwrap();

    let mut iter = reader.new_iterator(false);
    iter.seek(b"aaa:2");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"aaa:3");
}
