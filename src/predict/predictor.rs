//! CPU predictor for tree ensembles.
//!
//! [`CpuPredictor`] is the entry point for every prediction mode:
//!
//! | Method | Output cells |
//! |--------|--------------|
//! | [`predict`](CpuPredictor::predict), [`predict_batch`](CpuPredictor::predict_batch) | `n_rows * n_groups` |
//! | [`inplace_predict`](CpuPredictor::inplace_predict) | `n_rows * n_groups` |
//! | [`predict_instance`](CpuPredictor::predict_instance) | `n_groups` |
//! | [`predict_leaf`](CpuPredictor::predict_leaf) | `n_rows * tree_limit` |
//! | [`predict_contribution`](CpuPredictor::predict_contribution) | `n_rows * n_groups * (n_columns + 1)` |
//! | [`predict_interaction_contributions`](CpuPredictor::predict_interaction_contributions) | `n_rows * n_groups * (n_columns + 1)^2` |
//!
//! All batch modes run through the block scheduler in [`super::kernel`] and
//! reuse the predictor's [`FeatureVectorPool`] across calls.
//!
//! # Example
//!
//! ```
//! use forest_infer::data::{Entry, SparseDataset};
//! use forest_infer::repr::gbdt::{Forest, Tree};
//! use forest_infer::{CpuPredictor, TreeRange};
//!
//! let mut forest = Forest::for_regression(1).with_base_score(0.1);
//! forest.push_tree(Tree::leaf(1.5), 0);
//! forest.push_tree(Tree::leaf(-0.5), 0);
//!
//! let data = SparseDataset::from_rows(1, [[Entry::new(0, 3.0)]]);
//! let predictor = CpuPredictor::new(&forest).unwrap();
//! let preds = predictor.predict(&data, TreeRange::all()).unwrap();
//! assert!((preds[0] - 1.1).abs() < 1e-6);
//! ```

use std::borrow::Cow;
use std::ops::Range;

use crate::config::{ContributionOptions, PredictorConfig};
use crate::data::{Adapter, DataSource, Entry, InplaceInput};
use crate::error::PredictError;
use crate::explain::{Condition, FeatureGroupMap, PathBuffer};
use crate::repr::gbdt::{Forest, NodeMeans, TreeRange};
use crate::utils::{run_with_threads, Parallelism};

use super::fvec::{FeatureVector, FeatureVectorPool};
use super::kernel::{predict_blocks, predict_leaf_blocks, BlockScheduler};
use super::view::{AdapterView, PageView, UnrollBuffer};

/// Result of [`CpuPredictor::inplace_predict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InplaceOutcome {
    /// The input was predicted and the output written.
    Handled,
    /// The input layout is not supported by this backend. Nothing was written.
    Declined,
}

/// Batch predictor over a borrowed [`Forest`].
///
/// Construction validates the model once; every call afterwards only checks
/// the shapes of its own arguments. Scratch feature vectors are pooled
/// inside the predictor and grow to the largest call seen.
///
/// Calls may overlap: each worker task leases its own partition of the pool,
/// so a predictor can be shared across threads or called from inside a rayon
/// job without blocking on another call.
pub struct CpuPredictor<'f> {
    forest: &'f Forest,
    config: PredictorConfig,
    pool: FeatureVectorPool,
}

impl<'f> CpuPredictor<'f> {
    /// Create a predictor with the default configuration.
    pub fn new(forest: &'f Forest) -> Result<Self, PredictError> {
        Self::with_config(forest, PredictorConfig::default())
    }

    /// Create a predictor with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails if the model uses vector leaves, has no output groups, or does
    /// not pass [`Forest::validate`].
    pub fn with_config(forest: &'f Forest, config: PredictorConfig) -> Result<Self, PredictError> {
        let params = forest.params();
        if params.leaf_vector_size != 0 {
            return Err(PredictError::LeafVectorUnsupported(params.leaf_vector_size));
        }
        if params.n_groups == 0 {
            return Err(PredictError::ZeroOutputGroups);
        }
        forest.validate()?;

        Ok(Self {
            forest,
            config,
            pool: FeatureVectorPool::new(),
        })
    }

    #[inline]
    pub fn forest(&self) -> &'f Forest {
        self.forest
    }

    #[inline]
    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    #[inline]
    pub fn n_groups(&self) -> usize {
        self.forest.n_groups()
    }

    // =========================================================================
    // Output initialization
    // =========================================================================

    /// Size `out` to `n_rows * n_groups` and seed it.
    ///
    /// A base margin of exactly that length is copied verbatim. Otherwise
    /// every cell gets the model's base score; a non-empty margin of the
    /// wrong length is ignored with a warning.
    pub fn init_predictions(&self, n_rows: usize, base_margin: Option<&[f32]>, out: &mut Vec<f32>) {
        out.clear();
        match self.checked_margin(base_margin, n_rows) {
            Some(margin) => out.extend_from_slice(margin),
            None => out.resize(n_rows * self.n_groups(), self.forest.base_score()),
        }
    }

    fn checked_margin<'m>(&self, base_margin: Option<&'m [f32]>, n_rows: usize) -> Option<&'m [f32]> {
        let expected = n_rows * self.n_groups();
        match base_margin {
            Some(margin) if margin.len() == expected => Some(margin),
            Some(margin) if !margin.is_empty() => {
                tracing::warn!(
                    expected,
                    actual = margin.len(),
                    n_groups = self.n_groups(),
                    base_score = self.forest.base_score(),
                    "base margin has the wrong length; expected n_rows * n_groups values, using the base score"
                );
                None
            }
            _ => None,
        }
    }

    // =========================================================================
    // Batch prediction
    // =========================================================================

    /// Predict every row of `data`, returning `n_rows * n_groups` margins.
    ///
    /// Output is seeded from the data's base margin (see
    /// [`init_predictions`](Self::init_predictions)).
    pub fn predict<D: DataSource>(&self, data: &D, trees: TreeRange) -> Result<Vec<f32>, PredictError> {
        let mut out = Vec::new();
        self.init_predictions(data.n_rows(), data.base_margin(), &mut out);
        self.predict_batch(data, &mut out, trees)?;
        Ok(out)
    }

    /// Add the leaf values of `trees` to an initialized output buffer.
    ///
    /// # Errors
    ///
    /// Fails without touching `out` if it does not have exactly
    /// `n_rows * n_groups` cells or the tree range is out of bounds.
    pub fn predict_batch<D: DataSource>(
        &self,
        data: &D,
        out: &mut [f32],
        trees: TreeRange,
    ) -> Result<(), PredictError> {
        let expected = data.n_rows() * self.n_groups();
        if out.len() != expected {
            return Err(PredictError::OutputSizeMismatch {
                expected,
                actual: out.len(),
            });
        }
        let trees = trees.resolve(self.forest.n_trees())?;

        self.run(|parallelism| {
            self.with_scheduler(parallelism, |scheduler| {
                for page in data.pages() {
                    predict_blocks(scheduler, &PageView::new(page), self.forest, trees.clone(), out);
                }
            })
        });
        Ok(())
    }

    // =========================================================================
    // In-place prediction
    // =========================================================================

    /// Predict directly from an external layout without building pages.
    ///
    /// Values that are NaN or equal to `missing` are treated as absent.
    /// Returns [`InplaceOutcome::Declined`] without writing `out` when the
    /// input is meant for another backend.
    ///
    /// # Errors
    ///
    /// Fails if the input's column count differs from the model's feature
    /// count, or the tree range is out of bounds.
    pub fn inplace_predict(
        &self,
        input: InplaceInput<'_>,
        missing: f32,
        base_margin: Option<&[f32]>,
        trees: TreeRange,
        out: &mut Vec<f32>,
    ) -> Result<InplaceOutcome, PredictError> {
        match input {
            InplaceInput::Dense(adapter) => self.predict_adapter(&adapter, missing, base_margin, trees, out)?,
            InplaceInput::Array(adapter) => self.predict_adapter(&adapter, missing, base_margin, trees, out)?,
            InplaceInput::Csr(adapter) => self.predict_adapter(&adapter, missing, base_margin, trees, out)?,
            InplaceInput::Foreign(_) => return Ok(InplaceOutcome::Declined),
        }
        Ok(InplaceOutcome::Handled)
    }

    /// In-place prediction over any [`Adapter`], such as a
    /// [`CsrAdapter`](crate::data::CsrAdapter) with 64-bit or signed indices.
    ///
    /// # Errors
    ///
    /// As for [`inplace_predict`](Self::inplace_predict).
    pub fn predict_adapter<A: Adapter>(
        &self,
        adapter: &A,
        missing: f32,
        base_margin: Option<&[f32]>,
        trees: TreeRange,
        out: &mut Vec<f32>,
    ) -> Result<(), PredictError> {
        let n_features = self.forest.n_features();
        if adapter.n_columns() != n_features {
            return Err(PredictError::FeatureCountMismatch {
                model: n_features,
                data: adapter.n_columns(),
            });
        }
        let trees = trees.resolve(self.forest.n_trees())?;
        self.init_predictions(adapter.n_rows(), base_margin, out);

        self.run(|parallelism| {
            self.with_scheduler(parallelism, |scheduler| {
                let unroll = UnrollBuffer::new(n_features, self.config.unroll_depth, scheduler.n_partitions());
                let view = AdapterView::new(adapter, missing, &unroll);
                predict_blocks(scheduler, &view, self.forest, trees, out);
            })
        });
        Ok(())
    }

    // =========================================================================
    // Single row
    // =========================================================================

    /// Predict one sparse row without blocking or parallelism.
    ///
    /// `tree_limit` counts boosting rounds: the first
    /// `tree_limit * n_groups` trees are used, or all trees when it is `0`
    /// or past the end. Returns one margin per group.
    pub fn predict_instance(&self, row: &[Entry], tree_limit: usize) -> Vec<f32> {
        let limit = clamp_tree_limit(tree_limit.saturating_mul(self.n_groups()), self.forest.n_trees());

        let mut lease = self.pool.lease(self.forest.n_features());
        let fvec = lease.slot(0);

        fvec.fill(row);
        let mut out = vec![self.forest.base_score(); self.n_groups()];
        for t in 0..limit {
            out[self.forest.tree_group(t)] += self.forest.tree(t).predict(fvec);
        }
        fvec.drop_row(row);
        out
    }

    // =========================================================================
    // Leaf indices
    // =========================================================================

    /// Leaf node id reached by every row in each of the first `tree_limit`
    /// trees (all trees when `0` or past the end).
    ///
    /// Output is row-major with one cell per tree.
    pub fn predict_leaf<D: DataSource>(&self, data: &D, tree_limit: usize) -> Vec<f32> {
        let limit = clamp_tree_limit(tree_limit, self.forest.n_trees());
        let mut out = vec![0.0; data.n_rows() * limit];

        self.run(|parallelism| {
            self.with_scheduler(parallelism, |scheduler| {
                for page in data.pages() {
                    predict_leaf_blocks(scheduler, &PageView::new(page), self.forest, limit, &mut out);
                }
            })
        });
        out
    }

    // =========================================================================
    // Contributions
    // =========================================================================

    /// Per-feature attribution of every row's prediction.
    ///
    /// For each row and group there are `n_columns + 1` cells: one per
    /// column (feature, or feature group) and the bias last. Each row's cells
    /// sum to its margin over the selected trees.
    ///
    /// # Errors
    ///
    /// Fails if tree weights are given but do not have one entry per tree,
    /// or the feature group map does not cover the model's features.
    pub fn predict_contribution<D: DataSource>(
        &self,
        data: &D,
        options: &ContributionOptions<'_>,
    ) -> Result<Vec<f32>, PredictError> {
        let plan = self.contribution_plan(data, options)?;
        let mut out = vec![0.0; data.n_rows() * self.n_groups() * plan.n_cols()];

        self.run(|parallelism| {
            let means = NodeMeans::compute(self.forest, plan.trees.end, parallelism);
            self.with_scheduler(parallelism, |scheduler| {
                let conditioning = (options.condition, options.condition_column);
                self.contributions_into(scheduler, data, &plan, &means, conditioning, &mut out);
            })
        });
        Ok(out)
    }

    /// Pairwise interaction attribution of every row's prediction.
    ///
    /// For each row and group the output is an `(n_columns + 1)^2` matrix.
    /// Entry `[i][k]` for `k != i` is half the difference between the
    /// attribution of `k` with column `i` forced on and forced off. The
    /// diagonal holds what remains of column `i`'s plain attribution, so
    /// each matrix row sums to that attribution.
    ///
    /// This runs `2 * (n_columns + 1) + 1` full contribution passes.
    pub fn predict_interaction_contributions<D: DataSource>(
        &self,
        data: &D,
        options: &ContributionOptions<'_>,
    ) -> Result<Vec<f32>, PredictError> {
        let plan = self.contribution_plan(data, options)?;
        let n_groups = self.n_groups();
        let n_cols = plan.n_cols();
        let row_cells = n_groups * n_cols;
        let matrix_cells = n_cols * n_cols;
        let n_rows = data.n_rows();

        let mut out = vec![0.0f32; n_rows * n_groups * matrix_cells];
        let mut diag = vec![0.0f32; n_rows * row_cells];
        let mut off = vec![0.0f32; n_rows * row_cells];
        let mut on = vec![0.0f32; n_rows * row_cells];

        self.run(|parallelism| {
            let means = NodeMeans::compute(self.forest, plan.trees.end, parallelism);
            self.with_scheduler(parallelism, |scheduler| {
                self.contributions_into(scheduler, data, &plan, &means, (Condition::None, 0), &mut diag);

                for i in 0..n_cols {
                    tracing::trace!(column = i, n_columns = n_cols, "interaction pass");
                    self.contributions_into(scheduler, data, &plan, &means, (Condition::Off, i as u32), &mut off);
                    self.contributions_into(scheduler, data, &plan, &means, (Condition::On, i as u32), &mut on);

                    let rows: Vec<_> = out
                        .chunks_mut(n_groups * matrix_cells)
                        .zip(diag.chunks(row_cells))
                        .zip(off.chunks(row_cells).zip(on.chunks(row_cells)))
                        .collect();
                    parallelism.maybe_par_for_each(rows, |((row_out, diag), (off, on))| {
                        for group in 0..n_groups {
                            let c = group * n_cols;
                            let o = group * matrix_cells + i * n_cols;
                            let interactions = &mut row_out[o..o + n_cols];
                            interactions[i] = 0.0;
                            for k in 0..n_cols {
                                if k == i {
                                    interactions[i] += diag[c + k];
                                } else {
                                    interactions[k] = (on[c + k] - off[c + k]) / 2.0;
                                    interactions[i] -= interactions[k];
                                }
                            }
                        }
                    });
                }
            })
        });
        Ok(out)
    }

    fn contribution_plan<'a, D: DataSource>(
        &self,
        data: &'a D,
        options: &ContributionOptions<'a>,
    ) -> Result<ContributionPlan<'a>, PredictError> {
        let n_trees = self.forest.n_trees();
        let n_features = self.forest.n_features();

        if let Some(weights) = options.tree_weights {
            if weights.len() != n_trees {
                return Err(PredictError::TreeWeightsMismatch {
                    expected: n_trees,
                    actual: weights.len(),
                });
            }
        }

        let columns = match options.feature_groups {
            Some(map) if map.n_features() != n_features => {
                return Err(PredictError::FeatureGroupMismatch {
                    n_features,
                    mapped: map.n_features(),
                });
            }
            Some(map) => Cow::Borrowed(map),
            None => Cow::Owned(FeatureGroupMap::identity(n_features)),
        };

        Ok(ContributionPlan {
            trees: 0..clamp_tree_limit(options.tree_limit, n_trees),
            weights: options.tree_weights,
            columns,
            approximate: options.approximate,
            margin: self.checked_margin(data.base_margin(), data.n_rows()),
        })
    }

    /// One contribution pass over `data`, overwriting `out`.
    fn contributions_into<D: DataSource>(
        &self,
        scheduler: &BlockScheduler<'_>,
        data: &D,
        plan: &ContributionPlan<'_>,
        means: &NodeMeans,
        (condition, condition_column): (Condition, u32),
        out: &mut [f32],
    ) {
        out.fill(0.0);
        let n_groups = self.n_groups();
        let n_cols = plan.n_cols();
        let base_score = self.forest.base_score();
        let forest = self.forest;

        // Per-task scratch: one tree's attribution and the path stack.
        let scratch = || (vec![0.0f32; n_cols], PathBuffer::with_max_depth(means.max_depth()));

        for page in data.pages() {
            let source = PageView::new(page);
            let eval = |(tree_contribs, path): &mut (Vec<f32>, PathBuffer),
                        first_row: usize,
                        fvecs: &[FeatureVector],
                        block_out: &mut [f32]| {
                let rows = fvecs.iter().zip(block_out.chunks_exact_mut(n_groups * n_cols));
                for (i, (fvec, row_out)) in rows.enumerate() {
                    let row = first_row + i;
                    for (group, group_out) in row_out.chunks_exact_mut(n_cols).enumerate() {
                        for t in plan.trees.clone() {
                            if forest.tree_group(t) != group {
                                continue;
                            }
                            let tree = forest.tree(t);
                            tree_contribs.fill(0.0);
                            if plan.approximate {
                                tree.calculate_contributions_approx(fvec, means.tree(t), &plan.columns, tree_contribs);
                            } else {
                                tree.calculate_contributions(
                                    fvec,
                                    means.tree(t),
                                    &plan.columns,
                                    tree_contribs,
                                    condition,
                                    condition_column,
                                    path,
                                );
                            }
                            let weight = plan.weights.map_or(1.0, |w| w[t]);
                            for (cell, c) in group_out.iter_mut().zip(tree_contribs.iter()) {
                                *cell += c * weight;
                            }
                        }
                        group_out[n_cols - 1] += plan.margin.map_or(base_score, |m| m[row * n_groups + group]);
                    }
                }
            };
            scheduler.run_with_scratch(&source, out, n_groups * n_cols, scratch, eval);
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn run<T: Send>(&self, f: impl FnOnce(Parallelism) -> T + Send) -> T {
        run_with_threads(self.config.thread_count(), f)
    }

    /// Provision the pool for this call and build its block schedule.
    ///
    /// The partition count is read once here and fixed for the call. No lock
    /// is held while `f` runs.
    fn with_scheduler<T>(&self, parallelism: Parallelism, f: impl FnOnce(&BlockScheduler<'_>) -> T) -> T {
        let n_partitions = parallelism.n_partitions();
        let scheduler = BlockScheduler::new(
            &self.pool,
            self.forest.n_features(),
            self.config.block_size,
            parallelism,
            n_partitions,
        );
        f(&scheduler)
    }
}

/// Validated inputs of a contribution call.
struct ContributionPlan<'a> {
    trees: Range<usize>,
    weights: Option<&'a [f32]>,
    columns: Cow<'a, FeatureGroupMap>,
    approximate: bool,
    margin: Option<&'a [f32]>,
}

impl ContributionPlan<'_> {
    /// Cells per row and group: one per column plus the bias.
    fn n_cols(&self) -> usize {
        self.columns.n_columns() + 1
    }
}

/// `0` and limits past the end select every tree.
#[inline]
fn clamp_tree_limit(limit: usize, n_trees: usize) -> usize {
    if limit == 0 || limit > n_trees {
        n_trees
    } else {
        limit
    }
}
