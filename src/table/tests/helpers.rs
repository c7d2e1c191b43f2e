//! Shared fixtures for the table reader tests: building tables on disk,
//! opening readers, and instrumented file / cache wrappers.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::cache::{Cache, CacheHandle, CacheValue, QueryId, ShardedLruCache};
use crate::comparator::InternalKeyComparator;
use crate::file::RandomAccessFile;
use crate::key::{append_internal_key, ValueType, MAX_SEQUENCE_NUMBER};
use crate::options::{Options, ReadOptions, TableOptions};
use crate::table::builder::{BuilderOptions, TableBuilder};
use crate::table::{GetContext, GetState, TableReader};

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

// ------------------------------------------------------------------------------------------------
// Keys and entries
// ------------------------------------------------------------------------------------------------

pub fn ikey(user_key: &[u8], sequence: u64, value_type: ValueType) -> Vec<u8> {
    let mut out = Vec::new();
    append_internal_key(&mut out, user_key, sequence, value_type);
    out
}

/// The key a caller would look up `user_key` with: newest visible first.
pub fn lookup_key(user_key: &[u8]) -> Vec<u8> {
    ikey(user_key, MAX_SEQUENCE_NUMBER, ValueType::Value)
}

/// `(user key, sequence, value-or-tombstone)`.
pub type Entry<'a> = (&'a [u8], u64, Option<&'a [u8]>);

// ------------------------------------------------------------------------------------------------
// Building and opening
// ------------------------------------------------------------------------------------------------

/// Write a table of `entries` (already in user-key order; versions of one
/// key newest-first) into `dir`.
pub fn build_table(dir: &TempDir, name: &str, entries: &[Entry<'_>], opts: BuilderOptions) -> PathBuf {
    let mut builder = TableBuilder::new(opts);
    for (user_key, sequence, value) in entries {
        let (value_type, value) = match value {
            Some(value) => (ValueType::Value, *value),
            None => (ValueType::Deletion, &[][..]),
        };
        builder.add(&ikey(user_key, *sequence, value_type), value);
    }
    let path = dir.path().join(name);
    std::fs::write(&path, builder.finish()).unwrap();
    path
}

pub fn open_table(
    path: &Path,
    options: Arc<Options>,
    table_options: TableOptions,
    prefetch_index_and_filter: bool,
    skip_filters: bool,
) -> crate::error::Result<TableReader> {
    let file = File::open(path).unwrap();
    let size = file.metadata().unwrap().len();
    open_table_with_file(Arc::new(file), size, options, table_options, prefetch_index_and_filter, skip_filters)
}

pub fn open_table_with_file(
    file: Arc<dyn RandomAccessFile>,
    size: u64,
    options: Arc<Options>,
    table_options: TableOptions,
    prefetch_index_and_filter: bool,
    skip_filters: bool,
) -> crate::error::Result<TableReader> {
    let internal_comparator = Arc::new(InternalKeyComparator::new(options.comparator.clone()));
    TableReader::open(
        options,
        table_options,
        internal_comparator,
        file,
        size,
        prefetch_index_and_filter,
        skip_filters,
    )
}

/// Run a point lookup for `user_key`; returns the final state and value.
pub fn get(
    table: &TableReader,
    options: &Arc<Options>,
    read_options: &ReadOptions,
    user_key: &[u8],
) -> (GetState, Option<Vec<u8>>) {
    let mut ctx = GetContext::new(options.comparator.clone(), user_key);
    table
        .get(read_options, &lookup_key(user_key), &mut ctx, false)
        .unwrap();
    let value = ctx.value().map(<[u8]>::to_vec);
    (ctx.state(), value)
}

/// Key transformer reducing a user key to its first `len` bytes, standing
/// in for an engine's hashed-components reduction.
pub struct TruncatingTransformer {
    pub len: usize,
}

impl crate::filter::KeyTransformer for TruncatingTransformer {
    fn transform<'a>(&self, user_key: &'a [u8]) -> &'a [u8] {
        &user_key[..self.len.min(user_key.len())]
    }
}

// ------------------------------------------------------------------------------------------------
// Instrumented collaborators
// ------------------------------------------------------------------------------------------------

/// File wrapper counting positional reads, for asserting which paths
/// touch the file.
pub struct CountingFile {
    inner: File,
    reads: Arc<AtomicUsize>,
}

impl CountingFile {
    pub fn open(path: &Path) -> (CountingFile, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let file = CountingFile {
            inner: File::open(path).unwrap(),
            reads: Arc::clone(&reads),
        };
        (file, reads)
    }
}

impl RandomAccessFile for CountingFile {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        RandomAccessFile::read_at(&self.inner, offset, len)
    }

    fn unique_id(&self) -> Option<Vec<u8>> {
        RandomAccessFile::unique_id(&self.inner)
    }
}

/// Cache wrapper recording every inserted key, so tests can evict
/// deterministically.
pub struct RecordingCache {
    inner: ShardedLruCache,
    inserted: Mutex<Vec<Vec<u8>>>,
}

impl RecordingCache {
    pub fn new(capacity: usize) -> RecordingCache {
        RecordingCache {
            inner: ShardedLruCache::new(capacity),
            inserted: Mutex::new(Vec::new()),
        }
    }

    /// Erase everything that was ever inserted.
    pub fn wipe(&self) {
        for key in self.inserted.lock().unwrap().iter() {
            self.inner.erase(key);
        }
    }
}

impl Cache for RecordingCache {
    fn lookup(&self, key: &[u8], query_id: QueryId) -> Option<CacheHandle> {
        self.inner.lookup(key, query_id)
    }

    fn insert(
        &self,
        key: &[u8],
        query_id: QueryId,
        value: CacheValue,
        charge: usize,
    ) -> Result<CacheHandle, CacheValue> {
        self.inserted.lock().unwrap().push(key.to_vec());
        self.inner.insert(key, query_id, value, charge)
    }

    fn erase(&self, key: &[u8]) {
        self.inner.erase(key);
    }

    fn new_id(&self) -> u64 {
        self.inner.new_id()
    }

    fn pinned_count(&self) -> usize {
        self.inner.pinned_count()
    }

    fn usage(&self) -> usize {
        self.inner.usage()
    }
}
