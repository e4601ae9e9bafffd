//! Sparse row storage.

/// One stored feature of a sparse row.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Entry {
    /// Feature index.
    pub index: u32,
    /// Feature value. NaN is treated as missing.
    pub value: f32,
}

impl Entry {
    #[inline]
    pub const fn new(index: u32, value: f32) -> Self {
        Self { index, value }
    }
}

/// A batch of sparse rows in CSR layout.
///
/// Row `i` of the page is global row `base_row_id + i` of its dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct SparsePage {
    base_row_id: usize,
    offsets: Vec<usize>,
    entries: Vec<Entry>,
}

impl SparsePage {
    /// Create an empty page whose first row has global id `base_row_id`.
    pub fn new(base_row_id: usize) -> Self {
        Self {
            base_row_id,
            offsets: vec![0],
            entries: Vec::new(),
        }
    }

    /// Append a row.
    pub fn push_row<I: IntoIterator<Item = Entry>>(&mut self, row: I) {
        self.entries.extend(row);
        self.offsets.push(self.entries.len());
    }

    /// Global id of the page's first row.
    #[inline]
    pub fn base_row_id(&self) -> usize {
        self.base_row_id
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.offsets.len() - 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    /// Number of stored entries over all rows.
    #[inline]
    pub fn n_entries(&self) -> usize {
        self.entries.len()
    }

    /// Entries of local row `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= n_rows()`.
    #[inline]
    pub fn row(&self, i: usize) -> &[Entry] {
        &self.entries[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Iterate over rows in order.
    pub fn rows(&self) -> impl ExactSizeIterator<Item = &[Entry]> + '_ {
        self.offsets.windows(2).map(|w| &self.entries[w[0]..w[1]])
    }
}
