//! Lock-free event counters.
//!
//! The reader never interprets these numbers; it only bumps them. Callers
//! pass a [`Statistics`] by `Arc` (or none at all), and tests substitute a
//! fresh instance to assert on individual tickers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Countable events on the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Ticker {
    BlockCacheHit,
    BlockCacheMiss,
    BlockCacheIndexHit,
    BlockCacheIndexMiss,
    BlockCacheFilterHit,
    BlockCacheFilterMiss,
    BlockCacheDataHit,
    BlockCacheDataMiss,
    BlockCacheCompressedHit,
    BlockCacheCompressedMiss,
    BlockCacheCompressedAdd,
    BlockCacheCompressedAddFailure,
    BloomFilterChecked,
    BloomFilterUseful,
    BloomFilterPrefixChecked,
    BloomFilterPrefixUseful,
}

const TICKER_COUNT: usize = Ticker::BloomFilterPrefixUseful as usize + 1;

/// Atomic counter sink, one slot per [`Ticker`].
#[derive(Debug, Default)]
pub struct Statistics {
    counters: [AtomicU64; TICKER_COUNT],
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, ticker: Ticker) {
        self.counters[ticker as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticker_count(&self, ticker: Ticker) -> u64 {
        self.counters[ticker as usize].load(Ordering::Relaxed)
    }
}

/// Bump `ticker` when a sink is configured.
pub(crate) fn record_tick(statistics: &Option<Arc<Statistics>>, ticker: Ticker) {
    if let Some(stats) = statistics {
        stats.record_tick(ticker);
    }
}
