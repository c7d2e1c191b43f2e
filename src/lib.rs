//! # LapisDB table
//!
//! The read path of a **block-based sorted string table (SST)** for
//! LSM-tree storage engines: point lookups, forward/reverse ordered
//! scans, and approximate-offset queries over immutable on-disk tables,
//! with bloom-style filters to skip irrelevant tables and two independent
//! block caches (uncompressed and compressed) to amortize I/O and
//! decompression.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        TableReader                            │
//! │                                                               │
//! │   get / scan                                                  │
//! │      │                                                        │
//! │      ▼                                                        │
//! │  ┌─────────┐    ┌──────────┐    ┌───────────────────────────┐ │
//! │  │ filters │───▶│  index   │───▶│ data-block iterators      │ │
//! │  │ (bloom) │    │ readers  │    │ (two-level composition)   │ │
//! │  └─────────┘    └──────────┘    └────────────┬──────────────┘ │
//! │                                              │                │
//! │                 ┌────────────────────────────▼─────────────┐  │
//! │                 │ block cache │ compressed cache │ file    │  │
//! │                 └──────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`table`] | Open tables, point gets, scans, prefetch |
//! | [`block`] | Restart-point blocks and their iterator |
//! | [`index`] | Binary-search and hash-augmented index readers |
//! | [`filter`] | Bloom policy; full, block-based, fixed-size filter readers |
//! | [`cache`] | Sharded LRU block cache with refcounted handles |
//! | [`format`] | Footer, block handles, checksums, compression |
//! | [`encoding`] | Varint and fixed-width wire primitives |
//! | [`comparator`] | Key ordering and prefix extraction |
//! | [`key`] | Internal key layout (user key + sequence/type) |
//! | [`options`] | Reader, table, and per-query configuration |
//! | [`statistics`] | Lock-free event counters |
//! | [`file`] | Random-access file abstraction (pread / mmap) |
//!
//! ## Guarantees
//!
//! - **Immutability:** the reader never mutates table files; each open
//!   reader observes its file's contents forever.
//! - **Concurrency:** after `open` completes, point gets and scans are
//!   safe from any number of threads; shared mutability is confined to
//!   the caches.
//! - **Integrity:** every block carries a checksum; a flipped byte
//!   anywhere surfaces as `Corruption` on the next read that touches it.
//! - **Resource discipline:** cache handles are released exactly once;
//!   dropping an iterator releases its block pins.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lapisdb::cache::ShardedLruCache;
//! use lapisdb::comparator::InternalKeyComparator;
//! use lapisdb::key::{append_internal_key, ValueType, MAX_SEQUENCE_NUMBER};
//! use lapisdb::options::{Options, ReadOptions, TableOptions};
//! use lapisdb::table::{GetContext, TableReader};
//!
//! let options = Arc::new(Options::default());
//! let table_options = TableOptions {
//!     block_cache: Some(Arc::new(ShardedLruCache::new(8 << 20))),
//!     ..TableOptions::default()
//! };
//! let comparator = Arc::new(InternalKeyComparator::new(options.comparator.clone()));
//!
//! let file = std::fs::File::open("000042.sst").unwrap();
//! let size = file.metadata().unwrap().len();
//! let table = TableReader::open(
//!     options.clone(),
//!     table_options,
//!     comparator,
//!     Arc::new(file),
//!     size,
//!     true,  // prefetch index and filter
//!     false, // use filters
//! )
//! .unwrap();
//!
//! let mut lookup_key = Vec::new();
//! append_internal_key(&mut lookup_key, b"hello", MAX_SEQUENCE_NUMBER, ValueType::Value);
//! let mut ctx = GetContext::new(options.comparator.clone(), b"hello");
//! table.get(&ReadOptions::default(), &lookup_key, &mut ctx, false).unwrap();
//! ```

pub mod block;
pub mod cache;
pub mod comparator;
pub mod encoding;
pub mod error;
pub mod file;
pub mod filter;
pub mod format;
mod hash;
pub mod index;
pub mod iterator;
pub mod key;
pub mod options;
pub mod statistics;
pub mod table;

pub use error::{Result, Status, TableError};
pub use iterator::InternalIterator;
