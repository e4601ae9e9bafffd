//! Cache-blocked batch evaluation.
//!
//! Rows are processed in fixed-size blocks. Each block is owned by one worker
//! task which fills one feature vector per row, evaluates every requested tree
//! over the whole block, then drops the rows again. Iterating trees in the
//! outer loop keeps each tree's nodes hot in cache across the block.
//!
//! Blocks cover disjoint rows and therefore disjoint output slices, so they
//! run in any order without synchronization on the output. Scratch is
//! leased once per worker task, not per block, and is never locked while a
//! block is evaluated, so a prediction may itself run inside a rayon job.

use std::ops::Range;

use crate::repr::gbdt::Forest;
use crate::utils::Parallelism;

use super::fvec::{FeatureVector, FeatureVectorPool};
use super::view::{RowCursor, RowSource};

/// Splits a row source into blocks and runs a per-block evaluation.
///
/// Shared by every batch mode: prediction, leaf indices and contributions
/// differ only in what they write for a filled block.
pub struct BlockScheduler<'p> {
    pool: &'p FeatureVectorPool,
    n_features: usize,
    block_size: usize,
    parallelism: Parallelism,
    n_partitions: usize,
}

impl<'p> BlockScheduler<'p> {
    /// Grows `pool` to `n_partitions` partitions of `block_size` vectors so
    /// the expected number of concurrent tasks never allocates.
    pub fn new(
        pool: &'p FeatureVectorPool,
        n_features: usize,
        block_size: usize,
        parallelism: Parallelism,
        n_partitions: usize,
    ) -> Self {
        assert!(block_size > 0, "block_size must be at least 1");
        pool.reserve(n_partitions, block_size);
        Self {
            pool,
            n_features,
            block_size,
            parallelism,
            n_partitions,
        }
    }

    /// Scratch partitions provisioned for this schedule.
    #[inline]
    pub fn n_partitions(&self) -> usize {
        self.n_partitions
    }

    #[inline]
    pub fn parallelism(&self) -> Parallelism {
        self.parallelism
    }

    /// Number of blocks needed for `n_rows` rows.
    #[inline]
    pub fn n_blocks(&self, n_rows: usize) -> usize {
        n_rows.div_ceil(self.block_size)
    }

    /// Run `eval` once per block of `source`.
    ///
    /// `out` is the output of the whole dataset with `cells_per_row` cells per
    /// row; the rows of `source` start at `source.base_row_id()`. `eval`
    /// receives the global id of the block's first row, the block's filled
    /// feature vectors and the block's output slice.
    pub fn run<S, F>(&self, source: &S, out: &mut [f32], cells_per_row: usize, eval: F)
    where
        S: RowSource,
        F: Fn(usize, &[FeatureVector], &mut [f32]) + Sync + Send,
    {
        self.run_with_scratch(source, out, cells_per_row, || (), |_, first_row, fvecs, block_out| {
            eval(first_row, fvecs, block_out)
        });
    }

    /// Like [`run`](Self::run), with per-task scratch created by `init` and
    /// reused across every block the task processes.
    pub fn run_with_scratch<S, T, INIT, F>(
        &self,
        source: &S,
        out: &mut [f32],
        cells_per_row: usize,
        init: INIT,
        eval: F,
    ) where
        S: RowSource,
        INIT: Fn() -> T + Sync + Send,
        F: Fn(&mut T, usize, &[FeatureVector], &mut [f32]) + Sync + Send,
    {
        let n_rows = source.n_rows();
        let first_row = source.base_row_id();
        let out = &mut out[first_row * cells_per_row..(first_row + n_rows) * cells_per_row];
        if n_rows == 0 || cells_per_row == 0 {
            return;
        }

        let blocks: Vec<(usize, &mut [f32])> = out
            .chunks_mut(self.block_size * cells_per_row)
            .enumerate()
            .collect();
        self.parallelism.maybe_par_for_each_init(
            blocks,
            || (self.pool.lease(self.n_features), source.cursor(), init()),
            |(lease, cursor, scratch), (block_idx, block_out)| {
                let begin = block_idx * self.block_size;
                let len = block_out.len() / cells_per_row;
                let fvecs = lease.block(len);

                for (i, fvec) in fvecs.iter_mut().enumerate() {
                    fvec.fill(cursor.row(begin + i));
                }
                eval(scratch, first_row + begin, fvecs, block_out);
                for (i, fvec) in fvecs.iter_mut().enumerate() {
                    fvec.drop_row(cursor.row(begin + i));
                }
            },
        );
    }
}

/// Add the leaf value of every tree in `trees` to its group's output cell.
///
/// `out` holds `n_groups` cells per row and must already be initialized.
pub fn predict_blocks<S: RowSource>(
    scheduler: &BlockScheduler<'_>,
    source: &S,
    forest: &Forest,
    trees: Range<usize>,
    out: &mut [f32],
) {
    let n_groups = forest.n_groups();
    tracing::debug!(
        n_rows = source.n_rows(),
        n_blocks = scheduler.n_blocks(source.n_rows()),
        n_trees = trees.len(),
        partitions = scheduler.n_partitions,
        "predicting blocks"
    );

    scheduler.run(source, out, n_groups, |_, fvecs, block_out| {
        for t in trees.clone() {
            let tree = forest.tree(t);
            let group = forest.tree_group(t);
            for (fvec, row_out) in fvecs.iter().zip(block_out.chunks_exact_mut(n_groups)) {
                row_out[group] += tree.predict(fvec);
            }
        }
    });
}

/// Write the leaf id reached in each of trees `0..n_trees`, one cell per tree.
pub fn predict_leaf_blocks<S: RowSource>(
    scheduler: &BlockScheduler<'_>,
    source: &S,
    forest: &Forest,
    n_trees: usize,
    out: &mut [f32],
) {
    scheduler.run(source, out, n_trees, |_, fvecs, block_out| {
        for t in 0..n_trees {
            let tree = forest.tree(t);
            for (fvec, row_out) in fvecs.iter().zip(block_out.chunks_exact_mut(n_trees)) {
                row_out[t] = tree.leaf_for(fvec) as f32;
            }
        }
    });
}
