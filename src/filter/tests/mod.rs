//! Filter tests: bloom guarantees (no false negatives, bounded false
//! positives), per-shape probe semantics, and the not-matching sentinel.

use std::sync::Arc;

use rand::{Rng, SeedableRng};

use crate::filter::{
    BlockBasedFilter, BloomFilterPolicy, FilterBlockReader, FilterPolicy, FullFilter,
};
use crate::format::{BlockContents, CompressionType};
use crate::table::builder::{BlockBasedFilterBuilder, FullFilterBuilder};

fn contents(data: Vec<u8>) -> BlockContents {
    BlockContents {
        data,
        compression: CompressionType::None,
        cachable: true,
    }
}

fn policy() -> Arc<dyn FilterPolicy> {
    Arc::new(BloomFilterPolicy::new(10))
}

// ------------------------------------------------------------------------------------------------
// Bloom policy
// ------------------------------------------------------------------------------------------------

#[test]
fn bloom_never_forgets_a_key() {
    let policy = policy();
    let keys: Vec<Vec<u8>> = (0..2000u32).map(|i| format!("key{i}").into_bytes()).collect();
    let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();

    let mut filter = Vec::new();
    policy.create_filter(&refs, &mut filter);
    for key in &keys {
        assert!(policy.key_may_match(key, &filter), "lost {key:?}");
    }
}

#[test]
fn bloom_false_positive_rate_is_bounded() {
    // 10 bits per key targets ~1% false positives; assert a loose 2% so
    // the test is stable across hash tweaks.
    let policy = policy();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

    let keys: Vec<Vec<u8>> = (0..10_000)
        .map(|_| rng.gen::<u64>().to_le_bytes().to_vec())
        .collect();
    let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
    let mut filter = Vec::new();
    policy.create_filter(&refs, &mut filter);

    let mut false_positives = 0;
    let probes = 10_000;
    for _ in 0..probes {
        let salt = rng.gen::<u64>();
        let probe = format!("absent-{salt}").into_bytes();
        if policy.key_may_match(&probe, &filter) {
            false_positives += 1;
        }
    }
    assert!(
        false_positives < probes / 50,
        "false positive rate too high: {false_positives}/{probes}"
    );
}

#[test]
fn bloom_tiny_key_sets_get_minimum_size() {
    let policy = policy();
    let mut filter = Vec::new();
    policy.create_filter(&[b"lonely"], &mut filter);
    // 64-bit floor plus the k byte.
    assert!(filter.len() >= 9);
    assert!(policy.key_may_match(b"lonely", &filter));
}

#[test]
fn bloom_degenerate_filters() {
    let policy = policy();
    // Too short to be a filter: must not match.
    assert!(!policy.key_may_match(b"k", b"\x01"));
    // Reserved k values are treated as "may match".
    assert!(policy.key_may_match(b"k", &[0x00, 0x00, 31]));
}

// ------------------------------------------------------------------------------------------------
// Block-based shape
// ------------------------------------------------------------------------------------------------

/// Three data blocks at offsets 0, 4096 and 8192, with disjoint key sets.
fn three_block_filter(whole_key_filtering: bool) -> FilterBlockReader {
    let mut builder = BlockBasedFilterBuilder::new(policy());
    builder.start_block(0);
    builder.add_key(b"alpha");
    builder.start_block(4096);
    builder.add_key(b"mike");
    builder.start_block(8192);
    builder.add_key(b"zulu");
    let data = builder.finish();

    FilterBlockReader::BlockBased(
        BlockBasedFilter::new(policy(), None, whole_key_filtering, contents(data)).unwrap(),
    )
}

#[test]
fn block_based_probes_the_right_block() {
    let filter = three_block_filter(true);
    assert!(filter.key_may_match_at(b"alpha", 0));
    assert!(filter.key_may_match_at(b"mike", 4096));
    assert!(filter.key_may_match_at(b"zulu", 8192));

    assert!(!filter.key_may_match_at(b"alpha", 4096));
    assert!(!filter.key_may_match_at(b"zulu", 0));
    assert!(!filter.key_may_match_at(b"nobody", 0));
}

#[test]
fn block_based_out_of_range_offset_matches_conservatively() {
    let filter = three_block_filter(true);
    assert!(filter.key_may_match_at(b"anything", 1 << 30));
}

#[test]
fn block_based_without_whole_key_filtering_passes_everything() {
    let filter = three_block_filter(false);
    assert!(filter.key_may_match_at(b"nobody", 0));
}

#[test]
fn block_based_offsetless_probe_is_unsupported() {
    // Release behavior: conservatively true. (Debug builds assert.)
    let filter = three_block_filter(true);
    if !cfg!(debug_assertions) {
        assert!(filter.key_may_match(b"alpha"));
    }
}

#[test]
fn block_based_rejects_ragged_layout() {
    assert!(BlockBasedFilter::new(policy(), None, true, contents(vec![1, 2, 3])).is_err());

    // Offset array start past the end.
    let mut data = vec![0u8; 10];
    let at = data.len() - 5;
    data[at..at + 4].copy_from_slice(&100u32.to_le_bytes());
    assert!(BlockBasedFilter::new(policy(), None, true, contents(data)).is_err());
}

// ------------------------------------------------------------------------------------------------
// Full shape
// ------------------------------------------------------------------------------------------------

#[test]
fn full_filter_covers_keys_and_prefixes() {
    use crate::comparator::{FixedPrefixTransform, SliceTransform};

    let extractor: Arc<dyn SliceTransform> = Arc::new(FixedPrefixTransform::new(3));
    let mut builder = FullFilterBuilder::new(policy());
    for key in [&b"app-1"[..], b"app-2", b"net-9"] {
        builder.add_key(key);
        builder.add_key(extractor.transform(key));
    }
    let filter = FilterBlockReader::Full(FullFilter::new(
        policy(),
        Some(extractor),
        true,
        contents(builder.finish()),
    ));

    assert!(filter.key_may_match(b"app-1"));
    assert!(filter.prefix_may_match(b"app"));
    assert!(filter.prefix_may_match(b"net"));
    assert!(!filter.key_may_match(b"app-3"));
    assert!(!filter.prefix_may_match(b"xyz"));

    // Offset parameter is ignored for full filters.
    assert!(filter.key_may_match_at(b"app-1", 123_456));
}

#[test]
fn full_filter_flag_suppression() {
    let mut builder = FullFilterBuilder::new(policy());
    builder.add_key(b"present");
    let data = builder.finish();

    // whole_key_filtering off: key probes pass unconditionally.
    let no_whole = FullFilter::new(policy(), None, false, contents(data.clone()));
    assert!(no_whole.key_may_match(b"definitely-absent"));

    // No prefix extractor: prefix probes pass unconditionally.
    let no_prefix = FullFilter::new(policy(), None, true, contents(data));
    assert!(no_prefix.prefix_may_match(b"anything"));
}

// ------------------------------------------------------------------------------------------------
// Sentinel
// ------------------------------------------------------------------------------------------------

#[test]
fn not_matching_sentinel_rejects_everything() {
    let sentinel = FilterBlockReader::NotMatching;
    assert!(!sentinel.key_may_match(b"k"));
    assert!(!sentinel.key_may_match_at(b"k", 0));
    assert!(!sentinel.prefix_may_match(b"p"));
    assert!(!sentinel.prefix_may_match_at(b"p", 4096));
    assert_eq!(sentinel.approximate_memory_usage(), 0);
}
