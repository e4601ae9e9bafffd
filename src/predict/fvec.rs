//! Dense per-row feature buffers and the per-worker pool that owns them.
//!
//! A [`FeatureVector`] is a dense `f32` buffer sized to the model's feature
//! count. Sparse rows are overlaid onto it with [`FeatureVector::fill`] and
//! removed again with [`FeatureVector::drop_row`], which resets exactly the
//! entries the row touched. Missing values are `f32::NAN`.
//!
//! [`FeatureVectorPool`] keeps partitions of vectors between calls. A worker
//! task leases a whole partition for as long as it runs and returns it when
//! the lease drops, so concurrent blocks never share a vector and no lock is
//! held while rows are evaluated.

use std::sync::{Mutex, MutexGuard};

use crate::data::Entry;

// =============================================================================
// FeatureVector
// =============================================================================

/// Dense feature buffer for one row, with missing-value tracking.
///
/// Absent features hold `NaN`. `has_missing` is true unless every feature
/// holds a non-NaN value, which lets traversal pick the fast path that skips
/// missing checks.
#[derive(Debug, Clone, Default)]
pub struct FeatureVector {
    values: Box<[f32]>,
    n_present: usize,
}

impl FeatureVector {
    /// Create a vector with all `n_features` entries missing.
    pub fn new(n_features: usize) -> Self {
        Self {
            values: vec![f32::NAN; n_features].into_boxed_slice(),
            n_present: 0,
        }
    }

    /// Number of feature slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overlay a sparse row onto the buffer.
    ///
    /// Entries whose index is beyond the buffer are ignored. NaN values are
    /// stored but count as missing.
    #[inline]
    pub fn fill(&mut self, row: &[Entry]) {
        let mut present = 0;
        for entry in row {
            if let Some(slot) = self.values.get_mut(entry.index as usize) {
                *slot = entry.value;
                present += usize::from(!entry.value.is_nan());
            }
        }
        self.n_present = present;
    }

    /// Remove a previously filled row, resetting only the entries it touched.
    #[inline]
    pub fn drop_row(&mut self, row: &[Entry]) {
        for entry in row {
            if let Some(slot) = self.values.get_mut(entry.index as usize) {
                *slot = f32::NAN;
            }
        }
        self.n_present = 0;
    }

    /// Reset every slot to missing.
    pub fn reset(&mut self) {
        self.values.fill(f32::NAN);
        self.n_present = 0;
    }

    /// Whether any feature is missing for the current row.
    #[inline]
    pub fn has_missing(&self) -> bool {
        self.n_present != self.values.len()
    }

    /// Whether feature `i` is missing. Out-of-range features are missing.
    #[inline]
    pub fn is_missing(&self, i: usize) -> bool {
        self.fvalue(i).is_nan()
    }

    /// Value of feature `i`, or `NaN` if missing or out of range.
    #[inline]
    pub fn fvalue(&self, i: usize) -> f32 {
        self.values.get(i).copied().unwrap_or(f32::NAN)
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

// =============================================================================
// FeatureVectorPool
// =============================================================================

/// Reusable feature vectors, handed out one partition per worker task.
///
/// Each partition holds `block_size` vectors so every row of a block being
/// processed by a task has a private vector. The pool only grows: calls with
/// smaller requirements leave it unchanged, and leased partitions come back
/// to the free list when their lease drops.
#[derive(Debug, Default)]
pub struct FeatureVectorPool {
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Vec<FeatureVector>>,
    n_partitions: usize,
    block_size: usize,
}

impl FeatureVectorPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        // The state is only touched to pop or push a partition, so a panic
        // elsewhere cannot leave it half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Grow the pool to at least `n_partitions * block_size` vectors.
    pub fn reserve(&self, n_partitions: usize, block_size: usize) {
        let mut state = self.state();
        if block_size > state.block_size {
            for vectors in &mut state.free {
                vectors.resize_with(block_size, FeatureVector::default);
            }
            state.block_size = block_size;
        }
        while state.n_partitions < n_partitions {
            let vectors = std::iter::repeat_with(FeatureVector::default)
                .take(state.block_size)
                .collect();
            state.free.push(vectors);
            state.n_partitions += 1;
        }
    }

    /// Number of partitions owned by the pool, leased or not.
    pub fn n_partitions(&self) -> usize {
        self.state().n_partitions
    }

    /// Vectors per partition.
    pub fn block_size(&self) -> usize {
        self.state().block_size
    }

    /// Total number of pooled vectors.
    pub fn capacity(&self) -> usize {
        let state = self.state();
        state.n_partitions * state.block_size
    }

    /// Lease a free partition, creating one if every partition is in use.
    ///
    /// Vectors handed out by the lease are sized to `n_features` on first
    /// touch.
    pub fn lease(&self, n_features: usize) -> FeatureLease<'_> {
        let mut state = self.state();
        let vectors = match state.free.pop() {
            Some(vectors) => vectors,
            None => {
                state.n_partitions += 1;
                tracing::trace!(partitions = state.n_partitions, "feature vector pool grew");
                Vec::with_capacity(state.block_size)
            }
        };
        FeatureLease {
            pool: self,
            vectors,
            n_features,
        }
    }

    fn release(&self, mut vectors: Vec<FeatureVector>) {
        let mut state = self.state();
        if vectors.len() < state.block_size {
            let block_size = state.block_size;
            vectors.resize_with(block_size, FeatureVector::default);
        }
        state.free.push(vectors);
    }
}

/// Exclusive use of one partition of a [`FeatureVectorPool`].
///
/// The partition goes back to the pool on drop. A lease dropped while its
/// thread unwinds resets every vector first, since a row may still be filled.
#[derive(Debug)]
pub struct FeatureLease<'p> {
    pool: &'p FeatureVectorPool,
    vectors: Vec<FeatureVector>,
    n_features: usize,
}

impl FeatureLease<'_> {
    /// The first `n` vectors of the partition, sized to the model.
    pub fn block(&mut self, n: usize) -> &mut [FeatureVector] {
        if self.vectors.len() < n {
            self.vectors.resize_with(n, FeatureVector::default);
        }
        let block = &mut self.vectors[..n];
        for fvec in block.iter_mut() {
            if fvec.len() != self.n_features {
                *fvec = FeatureVector::new(self.n_features);
            }
        }
        block
    }

    /// Vector in slot `slot` of the partition, sized to the model.
    pub fn slot(&mut self, slot: usize) -> &mut FeatureVector {
        &mut self.block(slot + 1)[slot]
    }
}

impl Drop for FeatureLease<'_> {
    fn drop(&mut self) {
        let mut vectors = std::mem::take(&mut self.vectors);
        if std::thread::panicking() {
            vectors.iter_mut().for_each(FeatureVector::reset);
        }
        self.pool.release(vectors);
    }
}
