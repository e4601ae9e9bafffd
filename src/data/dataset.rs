//! Paged sparse datasets.

use ndarray::ArrayView2;

use super::page::{Entry, SparsePage};

/// Row source consumed by batch prediction.
///
/// A source is a sequence of [`SparsePage`]s covering rows `0..n_rows()` in
/// order. Pages may be iterated any number of times within one call.
pub trait DataSource: Sync {
    /// Iterator over the source's pages.
    type Pages<'a>: Iterator<Item = &'a SparsePage>
    where
        Self: 'a;

    /// Total number of rows.
    fn n_rows(&self) -> usize;

    /// Number of feature columns.
    fn n_features(&self) -> usize;

    /// Per-row, per-group initial margin, if supplied.
    fn base_margin(&self) -> Option<&[f32]>;

    /// Iterate over pages in row order.
    fn pages(&self) -> Self::Pages<'_>;
}

/// In-memory [`DataSource`] made of one or more sparse pages.
///
/// # Example
///
/// ```
/// use forest_infer::data::{DataSource, SparseDataset};
///
/// let data = ndarray::array![[1.0f32, f32::NAN], [0.5, 2.0]];
/// let dataset = SparseDataset::from_dense(data.view(), f32::NAN);
/// assert_eq!(dataset.n_rows(), 2);
/// assert_eq!(dataset.pages().next().unwrap().row(0).len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct SparseDataset {
    pages: Vec<SparsePage>,
    n_rows: usize,
    n_features: usize,
    base_margin: Option<Vec<f32>>,
}

impl SparseDataset {
    /// Build a single-page dataset from sparse rows.
    pub fn from_rows<R, I>(n_features: usize, rows: R) -> Self
    where
        R: IntoIterator<Item = I>,
        I: IntoIterator<Item = Entry>,
    {
        let mut page = SparsePage::new(0);
        for row in rows {
            page.push_row(row);
        }
        Self {
            n_rows: page.n_rows(),
            pages: vec![page],
            n_features,
            base_margin: None,
        }
    }

    /// Build from a dense `[n_rows, n_features]` view.
    ///
    /// NaN values and values equal to `missing` are not stored.
    pub fn from_dense(data: ArrayView2<'_, f32>, missing: f32) -> Self {
        let rows = data.rows().into_iter().map(|row| {
            row.into_iter()
                .enumerate()
                .filter(|&(_, &v)| !v.is_nan() && v != missing)
                .map(|(i, &v)| Entry::new(i as u32, v))
                .collect::<Vec<_>>()
        });
        Self::from_rows(data.ncols(), rows)
    }

    /// Attach a base margin of `n_rows * n_groups` values.
    ///
    /// The length is checked at prediction time; a mismatch falls back to
    /// the model's base score.
    pub fn with_base_margin(mut self, base_margin: Vec<f32>) -> Self {
        self.base_margin = Some(base_margin);
        self
    }

    /// Re-split rows into pages of at most `rows_per_page` rows.
    ///
    /// # Panics
    ///
    /// Panics if `rows_per_page == 0`.
    pub fn with_page_size(self, rows_per_page: usize) -> Self {
        assert!(rows_per_page > 0, "rows_per_page must be at least 1");
        let mut pages = Vec::with_capacity(self.n_rows.div_ceil(rows_per_page));
        let mut current = SparsePage::new(0);
        let mut row_id = 0;
        for row in self.pages.iter().flat_map(SparsePage::rows) {
            if current.n_rows() == rows_per_page {
                pages.push(std::mem::replace(&mut current, SparsePage::new(row_id)));
            }
            current.push_row(row.iter().copied());
            row_id += 1;
        }
        if !current.is_empty() {
            pages.push(current);
        }
        Self { pages, ..self }
    }

    /// Number of pages.
    pub fn n_pages(&self) -> usize {
        self.pages.len()
    }
}

impl DataSource for SparseDataset {
    type Pages<'a> = std::slice::Iter<'a, SparsePage>;

    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn base_margin(&self) -> Option<&[f32]> {
        self.base_margin.as_deref()
    }

    fn pages(&self) -> Self::Pages<'_> {
        self.pages.iter()
    }
}
