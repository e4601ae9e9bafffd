//! Canonical forest representation (collection of trees).

use std::ops::Range;

use crate::error::PredictError;
use crate::utils::Parallelism;

use super::tree::{Tree, TreeValidationError};

/// Structural validation errors for [`Forest`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ForestValidationError {
    #[error("{len} tree group assignments for {n_trees} trees")]
    TreeGroupsLenMismatch { n_trees: usize, len: usize },

    #[error("tree {tree_idx} is assigned to group {group}, model has {n_groups} groups")]
    TreeGroupOutOfRange { tree_idx: usize, group: u32, n_groups: usize },

    #[error("tree {tree_idx} splits on feature {feature}, model has {n_features} features")]
    SplitFeatureOutOfRange { tree_idx: usize, feature: u32, n_features: usize },

    #[error("tree {tree_idx}: {error}")]
    InvalidTree {
        tree_idx: usize,
        #[source]
        error: TreeValidationError,
    },
}

// ============================================================================
// ModelParams
// ============================================================================

/// Learner-level parameters shared by every tree of a [`Forest`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParams {
    /// Number of input features the model was trained on.
    pub n_features: usize,
    /// Number of output groups (1 for regression, one per class otherwise).
    pub n_groups: usize,
    /// Additive offset applied to every prediction.
    pub base_score: f32,
    /// Length of vector-valued leaves. Scalar-leaf models use 0.
    pub leaf_vector_size: u32,
}

// ============================================================================
// Forest
// ============================================================================

/// Forest of decision trees.
///
/// Stores trees with their group assignments for multi-class support.
#[derive(Debug, Clone)]
pub struct Forest {
    trees: Vec<Tree>,
    tree_groups: Vec<u32>,
    params: ModelParams,
}

impl Forest {
    /// Create a new forest over `n_features` features with `n_groups` outputs.
    pub fn new(n_features: usize, n_groups: usize) -> Self {
        Self {
            trees: Vec::new(),
            tree_groups: Vec::new(),
            params: ModelParams {
                n_features,
                n_groups,
                base_score: 0.0,
                leaf_vector_size: 0,
            },
        }
    }

    /// Create a forest for regression (single output group).
    pub fn for_regression(n_features: usize) -> Self {
        Self::new(n_features, 1)
    }

    /// Set the base score.
    pub fn with_base_score(mut self, base_score: f32) -> Self {
        self.params.base_score = base_score;
        self
    }

    /// Set the leaf vector size parameter.
    pub fn with_leaf_vector_size(mut self, leaf_vector_size: u32) -> Self {
        self.params.leaf_vector_size = leaf_vector_size;
        self
    }

    /// Add a tree to the forest.
    pub fn push_tree(&mut self, tree: Tree, group: u32) {
        debug_assert!((group as usize) < self.params.n_groups, "group out of range");
        self.trees.push(tree);
        self.tree_groups.push(group);
    }

    /// Number of trees.
    #[inline]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Number of output groups.
    #[inline]
    pub fn n_groups(&self) -> usize {
        self.params.n_groups
    }

    /// Number of input features.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.params.n_features
    }

    #[inline]
    pub fn base_score(&self) -> f32 {
        self.params.base_score
    }

    #[inline]
    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    /// Get a reference to a specific tree.
    #[inline]
    pub fn tree(&self, idx: usize) -> &Tree {
        &self.trees[idx]
    }

    /// Output group of tree `idx`.
    #[inline]
    pub fn tree_group(&self, idx: usize) -> usize {
        self.tree_groups[idx] as usize
    }

    /// Get all tree group assignments as a slice.
    #[inline]
    pub fn tree_groups(&self) -> &[u32] {
        &self.tree_groups
    }

    /// Iterate over trees.
    pub fn trees(&self) -> impl Iterator<Item = &Tree> {
        self.trees.iter()
    }

    /// Depth of the deepest tree among the first `n_trees`.
    pub fn max_depth(&self, n_trees: usize) -> usize {
        self.trees[..n_trees].iter().map(Tree::max_depth).max().unwrap_or(0)
    }

    /// Validate structural invariants for this forest (trees, group
    /// assignments, split features).
    pub fn validate(&self) -> Result<(), ForestValidationError> {
        if self.tree_groups.len() != self.trees.len() {
            return Err(ForestValidationError::TreeGroupsLenMismatch {
                n_trees: self.trees.len(),
                len: self.tree_groups.len(),
            });
        }

        for (i, &g) in self.tree_groups.iter().enumerate() {
            if g as usize >= self.params.n_groups {
                return Err(ForestValidationError::TreeGroupOutOfRange {
                    tree_idx: i,
                    group: g,
                    n_groups: self.params.n_groups,
                });
            }
        }

        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate()
                .map_err(|e| ForestValidationError::InvalidTree { tree_idx: i, error: e })?;
            if let Some(feature) = tree.max_split_index() {
                if feature as usize >= self.params.n_features {
                    return Err(ForestValidationError::SplitFeatureOutOfRange {
                        tree_idx: i,
                        feature,
                        n_features: self.params.n_features,
                    });
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// TreeRange
// ============================================================================

/// Half-open interval `[begin, end)` of tree indices.
///
/// `end == 0` means "through the last tree" and is resolved against the
/// model by [`TreeRange::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeRange {
    pub begin: usize,
    pub end: usize,
}

impl TreeRange {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    /// Every tree of the model.
    pub fn all() -> Self {
        Self::default()
    }

    /// The first `n` trees, or all of them when `n == 0`.
    pub fn first(n: usize) -> Self {
        Self { begin: 0, end: n }
    }

    /// Resolve against a model with `n_trees` trees.
    pub fn resolve(self, n_trees: usize) -> Result<Range<usize>, PredictError> {
        let end = if self.end == 0 { n_trees } else { self.end };
        if self.begin > end || end > n_trees {
            return Err(PredictError::InvalidTreeRange {
                begin: self.begin,
                end: self.end,
                n_trees,
            });
        }
        Ok(self.begin..end)
    }
}

impl From<Range<usize>> for TreeRange {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

// ============================================================================
// NodeMeans
// ============================================================================

/// Per-node expected values for a prefix of a forest's trees.
///
/// Produced by a parallel pass over the trees before any attribution is
/// computed; see [`Tree::node_mean_values`]. The same pass records the
/// deepest of those trees so attribution scratch can be sized once.
#[derive(Debug, Clone)]
pub struct NodeMeans {
    means: Vec<Box<[f32]>>,
    max_depth: usize,
}

impl NodeMeans {
    /// Compute mean tables for trees `0..n_trees`, one task per tree.
    pub fn compute(forest: &Forest, n_trees: usize, parallelism: Parallelism) -> Self {
        let tables = parallelism.maybe_par_map(0..n_trees, |t| {
            let tree = forest.tree(t);
            (tree.node_mean_values(), tree.max_depth())
        });
        let max_depth = tables.iter().map(|(_, depth)| *depth).max().unwrap_or(0);
        let means = tables.into_iter().map(|(means, _)| means).collect();
        Self { means, max_depth }
    }

    /// Mean table of tree `idx`.
    #[inline]
    pub fn tree(&self, idx: usize) -> &[f32] {
        &self.means[idx]
    }

    #[inline]
    pub fn n_trees(&self) -> usize {
        self.means.len()
    }

    /// Depth of the deepest covered tree.
    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}
