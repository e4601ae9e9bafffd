//! External row layouts consumed without conversion to a sparse page.
//!
//! An [`Adapter`] exposes its shape and a per-row iteration over
//! `(column, value)` pairs. Missing values may be yielded; the consumer
//! filters them. [`InplaceInput`] is the closed set of layouts the CPU
//! predictor accepts directly.

use std::any::Any;

use ndarray::ArrayView2;

/// Row-oriented view over an external data layout.
pub trait Adapter: Sync {
    /// Number of rows.
    fn n_rows(&self) -> usize;

    /// Number of columns.
    fn n_columns(&self) -> usize;

    /// Call `f(column, value)` for every stored value of `row`.
    ///
    /// # Panics
    ///
    /// May panic if `row >= n_rows()`.
    fn for_each_in_row<F: FnMut(u32, f32)>(&self, row: usize, f: F);
}

// ============================================================================
// DenseAdapter
// ============================================================================

/// Row-major contiguous `f32` buffer.
#[derive(Debug, Clone, Copy)]
pub struct DenseAdapter<'a> {
    values: &'a [f32],
    n_rows: usize,
    n_columns: usize,
}

impl<'a> DenseAdapter<'a> {
    /// Wrap a row-major buffer of `n_rows * n_columns` values.
    ///
    /// Returns `None` if the buffer length does not match the shape.
    pub fn new(values: &'a [f32], n_rows: usize, n_columns: usize) -> Option<Self> {
        if values.len() != n_rows * n_columns {
            return None;
        }
        Some(Self { values, n_rows, n_columns })
    }
}

impl Adapter for DenseAdapter<'_> {
    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn n_columns(&self) -> usize {
        self.n_columns
    }

    #[inline]
    fn for_each_in_row<F: FnMut(u32, f32)>(&self, row: usize, mut f: F) {
        let start = row * self.n_columns;
        for (column, &value) in self.values[start..start + self.n_columns].iter().enumerate() {
            f(column as u32, value);
        }
    }
}

// ============================================================================
// ArrayAdapter
// ============================================================================

/// Two-dimensional `[n_rows, n_columns]` array view of any stride.
#[derive(Debug, Clone, Copy)]
pub struct ArrayAdapter<'a> {
    view: ArrayView2<'a, f32>,
}

impl<'a> ArrayAdapter<'a> {
    pub fn new(view: ArrayView2<'a, f32>) -> Self {
        Self { view }
    }
}

impl Adapter for ArrayAdapter<'_> {
    fn n_rows(&self) -> usize {
        self.view.nrows()
    }

    fn n_columns(&self) -> usize {
        self.view.ncols()
    }

    #[inline]
    fn for_each_in_row<F: FnMut(u32, f32)>(&self, row: usize, mut f: F) {
        for (column, &value) in self.view.row(row).iter().enumerate() {
            f(column as u32, value);
        }
    }
}

// ============================================================================
// CsrAdapter
// ============================================================================

/// Integer type usable for CSR row offsets and column indices.
pub trait CsrIndex: Copy + Sync + std::fmt::Debug {
    /// The value as an offset, or `None` if it is negative or does not fit.
    fn to_usize(self) -> Option<usize>;

    /// Unchecked conversion for values already accepted by [`to_usize`](Self::to_usize).
    fn as_usize(self) -> usize;
}

macro_rules! impl_csr_index {
    ($($ty:ty),*) => {
        $(
            impl CsrIndex for $ty {
                #[inline]
                fn to_usize(self) -> Option<usize> {
                    usize::try_from(self).ok()
                }

                #[inline]
                fn as_usize(self) -> usize {
                    self as usize
                }
            }
        )*
    };
}

impl_csr_index!(u32, u64, usize, i32, i64);

/// Compressed sparse rows: `indptr`, `indices`, `values`.
///
/// Row offsets `P` and column indices `I` may be any [`CsrIndex`] type, so
/// arrays produced with 32- or 64-bit, signed or unsigned indices are read
/// without conversion.
#[derive(Debug, Clone, Copy)]
pub struct CsrAdapter<'a, P = usize, I = u32> {
    indptr: &'a [P],
    indices: &'a [I],
    values: &'a [f32],
    n_columns: usize,
}

impl<'a, P: CsrIndex, I: CsrIndex> CsrAdapter<'a, P, I> {
    /// Wrap CSR arrays.
    ///
    /// Returns `None` unless `indptr` is non-empty, starts at 0, is
    /// non-decreasing, and ends at `indices.len() == values.len()`; every
    /// column index is below `n_columns`; and no row stores more than
    /// `n_columns` values.
    pub fn new(indptr: &'a [P], indices: &'a [I], values: &'a [f32], n_columns: usize) -> Option<Self> {
        if indices.len() != values.len() {
            return None;
        }
        let offsets: Option<Vec<usize>> = indptr.iter().map(|p| p.to_usize()).collect();
        let offsets = offsets?;
        let well_formed = offsets.first() == Some(&0)
            && offsets.last() == Some(&values.len())
            && offsets.windows(2).all(|w| w[0] <= w[1] && w[1] - w[0] <= n_columns);
        let in_range = indices
            .iter()
            .all(|i| i.to_usize().is_some_and(|c| c < n_columns && u32::try_from(c).is_ok()));
        (well_formed && in_range).then_some(Self {
            indptr,
            indices,
            values,
            n_columns,
        })
    }
}

impl<P: CsrIndex, I: CsrIndex> Adapter for CsrAdapter<'_, P, I> {
    fn n_rows(&self) -> usize {
        self.indptr.len() - 1
    }

    fn n_columns(&self) -> usize {
        self.n_columns
    }

    #[inline]
    fn for_each_in_row<F: FnMut(u32, f32)>(&self, row: usize, mut f: F) {
        let range = self.indptr[row].as_usize()..self.indptr[row + 1].as_usize();
        for (&column, &value) in self.indices[range.clone()].iter().zip(&self.values[range]) {
            f(column.as_usize() as u32, value);
        }
    }
}

// ============================================================================
// InplaceInput
// ============================================================================

/// Input accepted by in-place prediction.
///
/// `Foreign` carries a handle meant for a different backend. The CPU
/// predictor declines it so the caller can route it elsewhere.
#[derive(Clone, Copy)]
pub enum InplaceInput<'a> {
    Dense(DenseAdapter<'a>),
    Array(ArrayAdapter<'a>),
    Csr(CsrAdapter<'a>),
    Foreign(&'a (dyn Any + Sync)),
}

impl std::fmt::Debug for InplaceInput<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dense(a) => f.debug_tuple("Dense").field(a).finish(),
            Self::Array(a) => f.debug_tuple("Array").field(a).finish(),
            Self::Csr(a) => f.debug_tuple("Csr").field(a).finish(),
            Self::Foreign(_) => f.write_str("Foreign(..)"),
        }
    }
}

impl<'a> From<DenseAdapter<'a>> for InplaceInput<'a> {
    fn from(adapter: DenseAdapter<'a>) -> Self {
        Self::Dense(adapter)
    }
}

impl<'a> From<ArrayAdapter<'a>> for InplaceInput<'a> {
    fn from(adapter: ArrayAdapter<'a>) -> Self {
        Self::Array(adapter)
    }
}

impl<'a> From<CsrAdapter<'a>> for InplaceInput<'a> {
    fn from(adapter: CsrAdapter<'a>) -> Self {
        Self::Csr(adapter)
    }
}

impl<'a> From<ArrayView2<'a, f32>> for InplaceInput<'a> {
    fn from(view: ArrayView2<'a, f32>) -> Self {
        Self::Array(ArrayAdapter::new(view))
    }
}
