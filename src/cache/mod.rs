//! Block caches: refcounted handles over a sharded LRU.
//!
//! The reader drives two logical caches — one for uncompressed blocks,
//! filters and index readers, one for still-compressed block bytes — both
//! behind the same [`Cache`] trait so tests can substitute counting or
//! failing implementations.
//!
//! # Handle discipline
//!
//! Every successful `lookup`/`insert` returns a [`CacheHandle`] that pins
//! the entry. Dropping the handle is the release; since handles are not
//! `Clone` and not `Copy`, each pin is released exactly once. "Cloning" a
//! handle means performing a fresh `lookup`.
//!
//! Eviction removes an entry from the cache's tables but cannot free a
//! pinned value: values are shared `Arc`s, so the deleter (the value's
//! `Drop`) runs when the last handle goes away. The cache tracks the number
//! of outstanding pins, which tests use to verify the release discipline.
//!
//! # Admission policy and `query_id`
//!
//! `query_id` never participates in key equality. The LRU uses it for scan
//! resistance: repeated hits from the *same* query do not refresh an
//! entry's recency, so one large scan cannot wash out the working set of
//! everyone else.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::Block;
use crate::filter::FilterBlockReader;
use crate::format::BlockContents;
use crate::hash::hash32;
use crate::index::IndexReader;

/// Opaque query tag carried by read options into the admission policy.
pub type QueryId = u64;

/// The id used when the caller does not track queries.
pub const NO_QUERY_ID: QueryId = 0;

const SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << SHARD_BITS;
const SHARD_SEED: u32 = 0x3a1c_96f5;

// ------------------------------------------------------------------------------------------------
// Values and handles
// ------------------------------------------------------------------------------------------------

/// What a cache slot can hold.
pub enum CacheValue {
    /// An uncompressed, parsed block.
    Block(Arc<Block>),
    /// Raw, still-compressed block bytes (compressed cache only).
    Raw(Arc<BlockContents>),
    /// A filter reader built from its block.
    Filter(Arc<FilterBlockReader>),
    /// An index reader (when index blocks go through the cache).
    Index(Arc<IndexReader>),
}

impl std::fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            CacheValue::Block(_) => "Block",
            CacheValue::Raw(_) => "Raw",
            CacheValue::Filter(_) => "Filter",
            CacheValue::Index(_) => "Index",
        };
        f.debug_tuple(variant).finish()
    }
}

impl CacheValue {
    pub fn as_block(&self) -> Option<&Arc<Block>> {
        match self {
            CacheValue::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Arc<BlockContents>> {
        match self {
            CacheValue::Raw(contents) => Some(contents),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> Option<&Arc<FilterBlockReader>> {
        match self {
            CacheValue::Filter(filter) => Some(filter),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<&Arc<IndexReader>> {
        match self {
            CacheValue::Index(index) => Some(index),
            _ => None,
        }
    }

    fn share(&self) -> CacheValue {
        match self {
            CacheValue::Block(b) => CacheValue::Block(Arc::clone(b)),
            CacheValue::Raw(r) => CacheValue::Raw(Arc::clone(r)),
            CacheValue::Filter(f) => CacheValue::Filter(Arc::clone(f)),
            CacheValue::Index(i) => CacheValue::Index(Arc::clone(i)),
        }
    }
}

/// A pinned reference to a cache entry. Dropping it is the release.
pub struct CacheHandle {
    value: CacheValue,
    pins: Arc<AtomicUsize>,
}

impl CacheHandle {
    fn new(value: CacheValue, pins: &Arc<AtomicUsize>) -> CacheHandle {
        pins.fetch_add(1, Ordering::Relaxed);
        CacheHandle {
            value,
            pins: Arc::clone(pins),
        }
    }

    pub fn value(&self) -> &CacheValue {
        &self.value
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::Relaxed);
    }
}

// ------------------------------------------------------------------------------------------------
// Cache trait
// ------------------------------------------------------------------------------------------------

/// Shared block cache. Thread safety is the implementation's problem;
/// operations on one key are atomic, with no ordering across keys.
pub trait Cache: Send + Sync {
    /// Pin and return the entry under `key`, if resident.
    fn lookup(&self, key: &[u8], query_id: QueryId) -> Option<CacheHandle>;

    /// Insert `value` with the given charge, evicting as needed, and pin
    /// it. On failure (the value cannot be admitted) the value is handed
    /// back so the caller can keep using it unmanaged.
    fn insert(
        &self,
        key: &[u8],
        query_id: QueryId,
        value: CacheValue,
        charge: usize,
    ) -> Result<CacheHandle, CacheValue>;

    /// Drop the entry under `key`, if resident. Pinned values stay alive
    /// until their handles go away.
    fn erase(&self, key: &[u8]);

    /// A process-unique id, used to synthesize cache-key prefixes for
    /// files without a stable OS identity.
    fn new_id(&self) -> u64;

    /// Number of outstanding pinned handles.
    fn pinned_count(&self) -> usize;

    /// Total charge of resident entries.
    fn usage(&self) -> usize;
}

// ------------------------------------------------------------------------------------------------
// Sharded LRU implementation
// ------------------------------------------------------------------------------------------------

struct Entry {
    value: CacheValue,
    charge: usize,
    /// Recency tick; also the key into the LRU order map.
    tick: u64,
    /// Query that last refreshed this entry.
    last_query: QueryId,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<Vec<u8>, Entry>,
    /// tick → key, ordered coldest first.
    order: BTreeMap<u64, Vec<u8>>,
    usage: usize,
    next_tick: u64,
}

impl Shard {
    fn touch(&mut self, key: &[u8], query_id: QueryId) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        // Same query hammering the same entry does not refresh recency.
        if entry.last_query == query_id && query_id != NO_QUERY_ID {
            return;
        }
        let old_tick = entry.tick;
        entry.tick = self.next_tick;
        entry.last_query = query_id;
        self.next_tick += 1;
        if let Some(moved) = self.order.remove(&old_tick) {
            self.order.insert(entry.tick, moved);
        }
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.usage > capacity {
            let Some((&tick, _)) = self.order.iter().next() else {
                break;
            };
            let key = self.order.remove(&tick).expect("order map out of sync");
            if let Some(entry) = self.entries.remove(&key) {
                self.usage -= entry.charge;
            }
        }
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some(entry) = self.entries.remove(key) {
            self.usage -= entry.charge;
            self.order.remove(&entry.tick);
        }
    }
}

/// LRU cache split into [`NUM_SHARDS`] independently locked shards.
pub struct ShardedLruCache {
    shards: Vec<Mutex<Shard>>,
    per_shard_capacity: usize,
    next_id: AtomicU64,
    pins: Arc<AtomicUsize>,
}

impl ShardedLruCache {
    /// A cache holding roughly `capacity` bytes of charge.
    pub fn new(capacity: usize) -> ShardedLruCache {
        let per_shard_capacity = capacity.div_ceil(NUM_SHARDS);
        ShardedLruCache {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(Shard::default())).collect(),
            per_shard_capacity,
            next_id: AtomicU64::new(1),
            pins: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn shard(&self, key: &[u8]) -> &Mutex<Shard> {
        let hash = hash32(key, SHARD_SEED);
        &self.shards[(hash >> (32 - SHARD_BITS)) as usize]
    }

    #[cfg(test)]
    pub(crate) fn shard_index_for_test(&self, key: &[u8]) -> usize {
        (hash32(key, SHARD_SEED) >> (32 - SHARD_BITS)) as usize
    }
}

impl Cache for ShardedLruCache {
    fn lookup(&self, key: &[u8], query_id: QueryId) -> Option<CacheHandle> {
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        shard.touch(key, query_id);
        let value = shard.entries.get(key)?.value.share();
        Some(CacheHandle::new(value, &self.pins))
    }

    fn insert(
        &self,
        key: &[u8],
        query_id: QueryId,
        value: CacheValue,
        charge: usize,
    ) -> Result<CacheHandle, CacheValue> {
        if charge > self.per_shard_capacity {
            // Would evict an entire shard and still not fit.
            return Err(value);
        }
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        shard.remove(key);

        let tick = shard.next_tick;
        shard.next_tick += 1;
        let handle = CacheHandle::new(value.share(), &self.pins);
        shard.entries.insert(
            key.to_vec(),
            Entry {
                value,
                charge,
                tick,
                last_query: query_id,
            },
        );
        shard.order.insert(tick, key.to_vec());
        shard.usage += charge;
        shard.evict_to(self.per_shard_capacity);
        Ok(handle)
    }

    fn erase(&self, key: &[u8]) {
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        shard.remove(key);
    }

    fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn pinned_count(&self) -> usize {
        self.pins.load(Ordering::Relaxed)
    }

    fn usage(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("cache shard poisoned").usage)
            .sum()
    }
}
