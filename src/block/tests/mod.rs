//! Block iterator tests: cursor movement, restart-point seeks, prefix-map
//! assisted seeks, and malformed-payload handling.

use std::sync::Arc;

use crate::block::{Block, BlockHashIndex};
use crate::comparator::{BytewiseComparator, Comparator, FixedPrefixTransform};
use crate::format::{BlockContents, CompressionType};
use crate::iterator::InternalIterator;
use crate::table::builder::BlockBuilder;

fn contents(data: Vec<u8>) -> BlockContents {
    BlockContents {
        data,
        compression: CompressionType::None,
        cachable: true,
    }
}

/// Build a block of `(key, value)` pairs with the given restart interval.
fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
    let mut builder = BlockBuilder::new(restart_interval);
    for (key, value) in entries {
        builder.add(key, value);
    }
    Arc::new(Block::new(contents(builder.finish())).unwrap())
}

fn cmp() -> Arc<dyn Comparator> {
    Arc::new(BytewiseComparator)
}

const FRUIT: &[(&[u8], &[u8])] = &[
    (b"apple", b"1"),
    (b"apricot", b"2"),
    (b"banana", b"3"),
    (b"blueberry", b"4"),
    (b"cherry", b"5"),
    (b"damson", b"6"),
    (b"elderberry", b"7"),
];

#[test]
fn forward_scan_yields_all_entries() {
    for restart_interval in [1, 2, 3, 16] {
        let block = build_block(FRUIT, restart_interval);
        let mut iter = block.iter(cmp(), false);
        iter.seek_to_first();
        for (key, value) in FRUIT {
            assert!(iter.valid(), "interval {restart_interval}");
            assert_eq!(iter.key(), *key);
            assert_eq!(iter.value(), *value);
            iter.next();
        }
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }
}

#[test]
fn reverse_scan_yields_all_entries() {
    for restart_interval in [1, 2, 3, 16] {
        let block = build_block(FRUIT, restart_interval);
        let mut iter = block.iter(cmp(), false);
        iter.seek_to_last();
        for (key, value) in FRUIT.iter().rev() {
            assert!(iter.valid(), "interval {restart_interval}");
            assert_eq!(iter.key(), *key);
            assert_eq!(iter.value(), *value);
            iter.prev();
        }
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }
}

#[test]
fn seek_lands_on_first_key_at_or_after_target() {
    let block = build_block(FRUIT, 2);
    let mut iter = block.iter(cmp(), false);

    iter.seek(b"banana");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"banana");

    // Between two keys: lands on the later one.
    iter.seek(b"blue");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"blueberry");

    // Before the first key.
    iter.seek(b"");
    assert_eq!(iter.key(), b"apple");

    // Past the last key: invalid, not an error.
    iter.seek(b"zucchini");
    assert!(!iter.valid());
    assert!(iter.status().is_ok());
}

#[test]
fn seek_then_walk_both_directions() {
    let block = build_block(FRUIT, 3);
    let mut iter = block.iter(cmp(), false);

    iter.seek(b"cherry");
    assert_eq!(iter.key(), b"cherry");
    iter.prev();
    assert_eq!(iter.key(), b"blueberry");
    iter.next();
    assert_eq!(iter.key(), b"cherry");
    iter.next();
    assert_eq!(iter.key(), b"damson");
}

#[test]
fn prev_from_first_entry_invalidates() {
    let block = build_block(FRUIT, 2);
    let mut iter = block.iter(cmp(), false);
    iter.seek_to_first();
    iter.prev();
    assert!(!iter.valid());
    assert!(iter.status().is_ok());
}

#[test]
fn single_entry_block() {
    let block = build_block(&[(b"only", b"one")], 16);
    let mut iter = block.iter(cmp(), false);
    iter.seek_to_last();
    assert_eq!(iter.key(), b"only");
    iter.seek(b"only");
    assert_eq!(iter.value(), b"one");
}

#[test]
fn shared_prefix_compression_round_trips() {
    // Long runs of shared prefixes stress the delta decoder.
    let keys: Vec<Vec<u8>> = (0..100u32)
        .map(|i| format!("user/{:06}/profile", i).into_bytes())
        .collect();
    let entries: Vec<(&[u8], &[u8])> = keys.iter().map(|k| (k.as_slice(), b"v" as &[u8])).collect();
    let block = build_block(&entries, 4);

    let mut iter = block.iter(cmp(), false);
    iter.seek_to_first();
    for key in &keys {
        assert!(iter.valid());
        assert_eq!(iter.key(), key.as_slice());
        iter.next();
    }
    assert!(!iter.valid());

    let mut iter = block.iter(cmp(), false);
    iter.seek(b"user/000050/profile");
    assert_eq!(iter.key(), b"user/000050/profile");
}

#[test]
fn rejects_bad_restart_geometry() {
    // Too short for even the restart count.
    assert!(Block::new(contents(vec![0u8; 2])).is_err());

    // Restart count claims more entries than the block can hold.
    let mut data = vec![0u8; 8];
    data[4..8].copy_from_slice(&100u32.to_le_bytes());
    assert!(Block::new(contents(data)).is_err());
}

#[test]
fn corrupt_entry_sets_status() {
    let mut builder = BlockBuilder::new(1);
    builder.add(b"aaa", b"1");
    builder.add(b"bbb", b"2");
    let mut data = builder.finish();
    // Inflate the second entry's value length varint far past the block.
    // Entry 1 begins at the second restart point.
    let restart1 = u32::from_le_bytes(data[data.len() - 8..data.len() - 4].try_into().unwrap());
    data[restart1 as usize + 2] = 0xf0;
    let block = Arc::new(Block::new(contents(data)).unwrap());

    let mut iter = block.iter(cmp(), false);
    iter.seek_to_first();
    assert!(iter.valid());
    iter.next();
    assert!(!iter.valid());
    assert!(iter.status().unwrap_err().is_corruption());
}

// ------------------------------------------------------------------------------------------------
// Hash-index assisted seeks
// ------------------------------------------------------------------------------------------------

/// Index-style block: one entry per restart point, prefix map over the
/// 4-byte key prefix.
fn prefixed_block(allow_collision: bool) -> Arc<Block> {
    let entries: &[(&[u8], &[u8])] = &[
        (b"aaa:1", b"h1"),
        (b"aaa:2", b"h2"),
        (b"bbb:1", b"h3"),
        (b"ccc:1", b"h4"),
        (b"ccc:2", b"h5"),
        (b"ccc:3", b"h6"),
    ];
    let mut builder = BlockBuilder::new(1);
    for (key, value) in entries {
        builder.add(key, value);
    }
    let mut block = Block::new(contents(builder.finish())).unwrap();

    let transform = Arc::new(FixedPrefixTransform::new(4));
    let mut prefixes = Vec::new();
    let mut meta = Vec::new();
    for (prefix, start, count) in [(&b"aaa:"[..], 0u32, 2u32), (b"bbb:", 2, 1), (b"ccc:", 3, 3)] {
        crate::encoding::put_length_prefixed_slice(&mut prefixes, prefix);
        crate::encoding::put_varint32(&mut meta, start);
        crate::encoding::put_varint32(&mut meta, count);
    }
    let index = BlockHashIndex::build(
        transform,
        &prefixes,
        &meta,
        block.num_restarts(),
        allow_collision,
    )
    .unwrap();
    block.set_hash_index(index);
    Arc::new(block)
}

#[test]
fn hash_seek_finds_keys_within_prefix() {
    for allow_collision in [false, true] {
        let block = prefixed_block(allow_collision);
        let mut iter = block.iter(cmp(), true);

        iter.seek(b"ccc:2");
        assert!(iter.valid(), "collision={allow_collision}");
        assert_eq!(iter.key(), b"ccc:2");

        iter.seek(b"bbb:0");
        assert_eq!(iter.key(), b"bbb:1");
    }
}

#[test]
fn hash_seek_absent_prefix_is_definitively_invalid() {
    for allow_collision in [false, true] {
        let block = prefixed_block(allow_collision);
        let mut iter = block.iter(cmp(), true);
        iter.seek(b"zzz:9");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }
}

#[test]
fn out_of_domain_key_falls_back_to_binary_search() {
    let block = prefixed_block(false);
    let mut iter = block.iter(cmp(), true);
    // Shorter than the prefix length: transform does not apply.
    iter.seek(b"bb");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"bbb:1");
}

#[test]
fn total_order_iterator_ignores_hash_index() {
    let block = prefixed_block(false);
    let mut iter = block.iter(cmp(), false);
    iter.seek(b"zzz:9");
    assert!(!iter.valid());
    iter.seek_to_first();
    let mut count = 0;
    while iter.valid() {
        count += 1;
        iter.next();
    }
    assert_eq!(count, 6);
}

#[test]
fn hash_index_build_rejects_mismatched_blocks() {
    let transform = Arc::new(FixedPrefixTransform::new(4));
    let mut prefixes = Vec::new();
    crate::encoding::put_length_prefixed_slice(&mut prefixes, b"aaa:");
    // Two ranges for one prefix.
    let mut meta = Vec::new();
    crate::encoding::put_varint32(&mut meta, 0);
    crate::encoding::put_varint32(&mut meta, 1);
    crate::encoding::put_varint32(&mut meta, 1);
    crate::encoding::put_varint32(&mut meta, 1);
    assert!(BlockHashIndex::build(transform.clone(), &prefixes, &meta, 6, false).is_err());

    // Range running past the restart count.
    let mut meta = Vec::new();
    crate::encoding::put_varint32(&mut meta, 5);
    crate::encoding::put_varint32(&mut meta, 9);
    assert!(BlockHashIndex::build(transform, &prefixes, &meta, 6, false).is_err());
}
