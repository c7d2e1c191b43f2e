//! Two-level iteration: an index cursor over lazily materialized
//! data-block cursors, plus the filter-aware wrapper used by prefix scans.

use crate::block::BlockIter;
use crate::error::{Status, TableError};
use crate::filter::FilterType;
use crate::iterator::InternalIterator;
use crate::options::ReadOptions;
use crate::statistics::{record_tick, Ticker};
use crate::table::TableReader;

// ------------------------------------------------------------------------------------------------
// TwoLevelIterator
// ------------------------------------------------------------------------------------------------

/// Composes the index iterator (primary) with data-block iterators
/// (secondary). Moving the primary tears down the old secondary — along
/// with its cache pin — and builds the next one on demand.
pub struct TwoLevelIterator<'a> {
    table: &'a TableReader,
    read_options: ReadOptions,
    skip_filters: bool,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    /// Encoded handle of the block `data_iter` currently covers, so a
    /// re-seek into the same block reuses it instead of re-resolving.
    data_block_handle: Vec<u8>,
    status: Option<TableError>,
}

impl<'a> TwoLevelIterator<'a> {
    pub(crate) fn new(
        table: &'a TableReader,
        read_options: ReadOptions,
        skip_filters: bool,
    ) -> TwoLevelIterator<'a> {
        let index_iter = table.new_index_iterator(&read_options);
        TwoLevelIterator {
            table,
            read_options,
            skip_filters,
            index_iter,
            data_iter: None,
            data_block_handle: Vec::new(),
            status: None,
        }
    }

    fn check_prefix_may_match(&self) -> bool {
        self.read_options.total_order_seek
            || self.skip_filters
            || !self.table.has_prefix_extractor()
    }

    /// Replace the secondary, preserving the first error the old one hit.
    fn set_data_iter(&mut self, iter: Option<BlockIter>) {
        if self.status.is_none() {
            if let Some(old) = &self.data_iter {
                if let Err(e) = old.status() {
                    self.status = Some(e);
                }
            }
        }
        self.data_iter = iter;
    }

    /// Point the secondary at the block the primary currently designates.
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.set_data_iter(None);
            return;
        }
        let handle = self.index_iter.value().to_vec();
        let reusable = self.data_iter.as_ref().is_some_and(|iter| {
            self.data_block_handle == handle
                && !matches!(iter.status(), Err(ref e) if e.is_incomplete())
        });
        if reusable {
            return;
        }
        let iter = self.table.new_data_block_iterator(&self.read_options, &handle);
        self.data_block_handle = handle;
        self.set_data_iter(Some(iter));
    }

    /// Move forward over exhausted blocks. Stops rather than skips when a
    /// block is non-resident under no-I/O, so `Incomplete` surfaces.
    fn skip_empty_data_blocks_forward(&mut self) {
        loop {
            let stuck = match &self.data_iter {
                None => true,
                Some(iter) => {
                    !iter.valid() && !matches!(iter.status(), Err(ref e) if e.is_incomplete())
                }
            };
            if !stuck {
                return;
            }
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(iter) = &mut self.data_iter {
                iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        loop {
            let stuck = match &self.data_iter {
                None => true,
                Some(iter) => {
                    !iter.valid() && !matches!(iter.status(), Err(ref e) if e.is_incomplete())
                }
            };
            if !stuck {
                return;
            }
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(iter) = &mut self.data_iter {
                iter.seek_to_last();
            }
        }
    }
}

impl InternalIterator for TwoLevelIterator<'_> {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(BlockIter::valid)
    }

    fn seek(&mut self, target: &[u8]) {
        if !self.check_prefix_may_match() && !self.table.prefix_may_match(target) {
            // The filter says no key with this prefix exists in the whole
            // table; definitively empty without touching a data block.
            self.set_data_iter(None);
            return;
        }
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.data_iter {
            iter.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.data_iter {
            iter.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().expect("valid() checked").key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().expect("valid() checked").value()
    }

    fn status(&self) -> Status {
        self.index_iter.status()?;
        if let Some(iter) = &self.data_iter {
            iter.status()?;
        }
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// BloomFilterAwareIterator
// ------------------------------------------------------------------------------------------------

/// Scan iterator that consults the fixed-size filter on `seek`.
///
/// Intended for scans confined to a single hashed-prefix range, probed
/// with a policy whose transformer reduces keys to that prefix: when the
/// filter rules the prefix out, *no* key of interest exists anywhere in
/// this table, so the iterator goes invalid without advancing. For other
/// filter shapes every operation just forwards.
pub struct BloomFilterAwareIterator<'a> {
    table: &'a TableReader,
    read_options: ReadOptions,
    skip_filters: bool,
    inner: TwoLevelIterator<'a>,
    valid: bool,
}

impl<'a> BloomFilterAwareIterator<'a> {
    pub(crate) fn new(
        table: &'a TableReader,
        read_options: ReadOptions,
        skip_filters: bool,
        inner: TwoLevelIterator<'a>,
    ) -> BloomFilterAwareIterator<'a> {
        BloomFilterAwareIterator {
            table,
            read_options,
            skip_filters,
            inner,
            valid: false,
        }
    }

    fn internal_seek(&mut self, internal_key: &[u8]) {
        self.inner.seek(internal_key);
        self.valid = self.inner.valid();
    }
}

impl InternalIterator for BloomFilterAwareIterator<'_> {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek(&mut self, internal_key: &[u8]) {
        if self.skip_filters {
            self.internal_seek(internal_key);
            return;
        }
        if self.table.filter_type() == FilterType::FixedSize {
            let filter_key = self.table.filter_key(internal_key);
            let filter_entry = self.table.get_filter(
                self.read_options.query_id,
                self.read_options.no_io(),
                Some(filter_key),
            );
            if self
                .table
                .non_block_based_filter_key_may_match(filter_entry.filter(), filter_key)
            {
                self.internal_seek(internal_key);
            } else {
                // No key with these hashed components exists in this
                // table. Do not advance; just report emptiness.
                record_tick(self.table.statistics(), Ticker::BloomFilterUseful);
                self.valid = false;
            }
        } else {
            self.internal_seek(internal_key);
        }
    }

    fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
        self.valid = self.inner.valid();
    }

    fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
        self.valid = self.inner.valid();
    }

    fn next(&mut self) {
        self.inner.next();
        self.valid = self.inner.valid();
    }

    fn prev(&mut self) {
        self.inner.prev();
        self.valid = self.inner.valid();
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn status(&self) -> Status {
        self.inner.status()
    }
}

// ------------------------------------------------------------------------------------------------
// ScanIterator
// ------------------------------------------------------------------------------------------------

/// The iterator handed out by [`TableReader::new_iterator`]: plain
/// two-level, or filter-aware when the read options ask for bloom-checked
/// scans.
pub enum ScanIterator<'a> {
    Plain(TwoLevelIterator<'a>),
    BloomAware(BloomFilterAwareIterator<'a>),
}

impl InternalIterator for ScanIterator<'_> {
    fn valid(&self) -> bool {
        match self {
            ScanIterator::Plain(iter) => iter.valid(),
            ScanIterator::BloomAware(iter) => iter.valid(),
        }
    }

    fn seek(&mut self, target: &[u8]) {
        match self {
            ScanIterator::Plain(iter) => iter.seek(target),
            ScanIterator::BloomAware(iter) => iter.seek(target),
        }
    }

    fn seek_to_first(&mut self) {
        match self {
            ScanIterator::Plain(iter) => iter.seek_to_first(),
            ScanIterator::BloomAware(iter) => iter.seek_to_first(),
        }
    }

    fn seek_to_last(&mut self) {
        match self {
            ScanIterator::Plain(iter) => iter.seek_to_last(),
            ScanIterator::BloomAware(iter) => iter.seek_to_last(),
        }
    }

    fn next(&mut self) {
        match self {
            ScanIterator::Plain(iter) => iter.next(),
            ScanIterator::BloomAware(iter) => iter.next(),
        }
    }

    fn prev(&mut self) {
        match self {
            ScanIterator::Plain(iter) => iter.prev(),
            ScanIterator::BloomAware(iter) => iter.prev(),
        }
    }

    fn key(&self) -> &[u8] {
        match self {
            ScanIterator::Plain(iter) => iter.key(),
            ScanIterator::BloomAware(iter) => iter.key(),
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            ScanIterator::Plain(iter) => iter.value(),
            ScanIterator::BloomAware(iter) => iter.value(),
        }
    }

    fn status(&self) -> Status {
        match self {
            ScanIterator::Plain(iter) => iter.status(),
            ScanIterator::BloomAware(iter) => iter.status(),
        }
    }
}
