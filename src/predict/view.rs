//! Row sources read by the block kernel.
//!
//! A [`RowSource`] hands each worker task a [`RowCursor`] through which the
//! rows of its blocks are read as sparse `&[Entry]` slices.
//!
//! - [`PageView`] reads rows of an existing [`SparsePage`] in place.
//! - [`AdapterView`] converts rows of an [`Adapter`] on demand into the
//!   calling task's window of an [`UnrollBuffer`], dropping missing values.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::data::{Adapter, Entry, SparsePage};

/// Random access to sparse rows.
pub trait RowSource: Sync {
    /// Per-task reader.
    type Cursor<'a>: RowCursor
    where
        Self: 'a;

    /// Number of rows.
    fn n_rows(&self) -> usize;

    /// Global id of local row 0.
    fn base_row_id(&self) -> usize;

    /// Reader owned by one worker task until it is dropped.
    fn cursor(&self) -> Self::Cursor<'_>;
}

/// Reader over the rows of a [`RowSource`].
pub trait RowCursor {
    /// Local row `idx` as sparse entries.
    ///
    /// The returned slice is valid until the next call.
    fn row(&mut self, idx: usize) -> &[Entry];
}

// =============================================================================
// PageView
// =============================================================================

/// Materialized rows of a sparse page. Row access is a direct slice.
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    page: &'a SparsePage,
}

impl<'a> PageView<'a> {
    pub fn new(page: &'a SparsePage) -> Self {
        Self { page }
    }
}

impl RowSource for PageView<'_> {
    type Cursor<'c>
        = PageCursor<'c>
    where
        Self: 'c;

    fn n_rows(&self) -> usize {
        self.page.n_rows()
    }

    fn base_row_id(&self) -> usize {
        self.page.base_row_id()
    }

    fn cursor(&self) -> PageCursor<'_> {
        PageCursor { page: self.page }
    }
}

pub struct PageCursor<'a> {
    page: &'a SparsePage,
}

impl RowCursor for PageCursor<'_> {
    #[inline]
    fn row(&mut self, idx: usize) -> &[Entry] {
        self.page.row(idx)
    }
}

// =============================================================================
// UnrollBuffer
// =============================================================================

/// Conversion scratch for adapter rows, one window per worker task.
///
/// Each window holds `unroll_depth` slots of `n_columns` entries.
/// Consecutive conversions through one cursor use consecutive slots, wrapping
/// after `unroll_depth`, so that many rows converted by the same task stay
/// intact at once. Windows sit on a free list between cursors; the lock is
/// only taken to check a window out or back in.
#[derive(Debug)]
pub struct UnrollBuffer {
    free: Mutex<Vec<UnrollWindow>>,
    n_columns: usize,
    unroll_depth: usize,
}

#[derive(Debug, Default)]
struct UnrollWindow {
    entries: Box<[Entry]>,
    lens: Box<[usize]>,
    n_columns: usize,
    next_slot: usize,
}

impl UnrollBuffer {
    /// Allocate `n_columns * unroll_depth` entries for each of `n_partitions` workers.
    pub fn new(n_columns: usize, unroll_depth: usize, n_partitions: usize) -> Self {
        assert!(unroll_depth > 0, "unroll_depth must be at least 1");
        let windows = (0..n_partitions)
            .map(|_| UnrollWindow::new(n_columns, unroll_depth))
            .collect();
        Self {
            free: Mutex::new(windows),
            n_columns,
            unroll_depth,
        }
    }

    fn free(&self) -> MutexGuard<'_, Vec<UnrollWindow>> {
        // Windows only hold scratch rows; a poisoned list is safe to reuse.
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of windows not checked out by a cursor.
    pub fn n_partitions(&self) -> usize {
        self.free().len()
    }

    /// Total number of entries over the free windows.
    pub fn len(&self) -> usize {
        self.free().iter().map(|w| w.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn checkout(&self) -> UnrollWindow {
        let window = self.free().pop();
        window.unwrap_or_else(|| UnrollWindow::new(self.n_columns, self.unroll_depth))
    }

    fn checkin(&self, mut window: UnrollWindow) {
        window.next_slot = 0;
        self.free().push(window);
    }
}

impl UnrollWindow {
    fn new(n_columns: usize, unroll_depth: usize) -> Self {
        Self {
            entries: vec![Entry::default(); n_columns * unroll_depth].into_boxed_slice(),
            lens: vec![0; unroll_depth].into_boxed_slice(),
            n_columns,
            next_slot: 0,
        }
    }

    fn unroll_depth(&self) -> usize {
        self.lens.len()
    }

    /// Convert `row` into the next slot, skipping NaN and `missing`.
    fn convert<A: Adapter>(&mut self, adapter: &A, row: usize, missing: f32) -> &[Entry] {
        let slot = self.next_slot;
        self.next_slot = (slot + 1) % self.unroll_depth();

        let begin = slot * self.n_columns;
        let dst = &mut self.entries[begin..begin + self.n_columns];
        let mut len = 0;
        adapter.for_each_in_row(row, |column, value| {
            if value.is_nan() || value == missing {
                return;
            }
            if let Some(entry) = dst.get_mut(len) {
                *entry = Entry::new(column, value);
                len += 1;
            }
        });
        self.lens[slot] = len;
        &self.entries[begin..begin + len]
    }

    fn slot(&self, slot: usize) -> &[Entry] {
        let begin = slot * self.n_columns;
        &self.entries[begin..begin + self.lens[slot]]
    }
}

// =============================================================================
// AdapterView
// =============================================================================

/// Rows of an [`Adapter`], converted on access.
pub struct AdapterView<'a, A> {
    adapter: &'a A,
    missing: f32,
    unroll: &'a UnrollBuffer,
}

impl<'a, A: Adapter> AdapterView<'a, A> {
    /// View `adapter`, treating NaN and `missing` as absent.
    ///
    /// # Panics
    ///
    /// Panics if `unroll` was sized for fewer columns than the adapter has.
    pub fn new(adapter: &'a A, missing: f32, unroll: &'a UnrollBuffer) -> Self {
        assert!(
            unroll.n_columns >= adapter.n_columns(),
            "unroll buffer is narrower than the adapter"
        );
        Self { adapter, missing, unroll }
    }
}

impl<A: Adapter> RowSource for AdapterView<'_, A> {
    type Cursor<'c>
        = AdapterCursor<'c, A>
    where
        Self: 'c;

    fn n_rows(&self) -> usize {
        self.adapter.n_rows()
    }

    fn base_row_id(&self) -> usize {
        0
    }

    fn cursor(&self) -> AdapterCursor<'_, A> {
        AdapterCursor {
            adapter: self.adapter,
            missing: self.missing,
            unroll: self.unroll,
            window: self.unroll.checkout(),
        }
    }
}

/// A worker task's exclusive reader over an [`AdapterView`].
///
/// Owns one window of the unroll buffer and returns it on drop.
pub struct AdapterCursor<'a, A> {
    adapter: &'a A,
    missing: f32,
    unroll: &'a UnrollBuffer,
    window: UnrollWindow,
}

impl<A> Drop for AdapterCursor<'_, A> {
    fn drop(&mut self) {
        self.unroll.checkin(std::mem::take(&mut self.window));
    }
}

impl<A> AdapterCursor<'_, A> {
    /// Current contents of unroll slot `slot`.
    pub fn slot(&self, slot: usize) -> &[Entry] {
        self.window.slot(slot)
    }

    /// Slot the next conversion will write.
    pub fn next_slot(&self) -> usize {
        self.window.next_slot
    }
}

impl<A: Adapter> RowCursor for AdapterCursor<'_, A> {
    #[inline]
    fn row(&mut self, idx: usize) -> &[Entry] {
        self.window.convert(self.adapter, idx, self.missing)
    }
}
