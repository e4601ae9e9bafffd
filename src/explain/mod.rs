//! Per-tree feature attribution.
//!
//! Two attribution routines are implemented on [`Tree`](crate::repr::gbdt::Tree):
//!
//! - **Exact** ([`Tree::calculate_contributions`](crate::repr::gbdt::Tree::calculate_contributions)):
//!   TreeSHAP from Lundberg et al. (2020), "From local explanations to global
//!   understanding with explainable AI for trees", extended with on/off
//!   conditioning on one column so interaction values can be derived.
//! - **Approximate** ([`Tree::calculate_contributions_approx`](crate::repr::gbdt::Tree::calculate_contributions_approx)):
//!   Saabas path attribution, crediting each split with the change in
//!   expected value along the decision path.
//!
//! Both write into a row of `n_columns + 1` cells, the last being the bias.
//! Columns are features, or feature groups when a [`FeatureGroupMap`] merges
//! several features into one player.

mod approx;
mod shap;

pub use shap::{Condition, PathBuffer};

/// Mapping from feature index to attribution column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureGroupMap {
    /// Every feature is its own column.
    Identity { n_features: usize },
    /// Features are merged into `n_columns` groups.
    Grouped { columns: Box<[u32]>, n_columns: usize },
}

impl FeatureGroupMap {
    /// One column per feature.
    pub fn identity(n_features: usize) -> Self {
        Self::Identity { n_features }
    }

    /// Assign feature `i` to column `columns[i]`.
    ///
    /// The number of columns is one past the largest column id.
    pub fn grouped(columns: Vec<u32>) -> Self {
        let n_columns = columns.iter().max().map_or(0, |&c| c as usize + 1);
        Self::Grouped {
            columns: columns.into_boxed_slice(),
            n_columns,
        }
    }

    /// Number of features mapped.
    pub fn n_features(&self) -> usize {
        match self {
            Self::Identity { n_features } => *n_features,
            Self::Grouped { columns, .. } => columns.len(),
        }
    }

    /// Number of attribution columns, excluding the bias.
    pub fn n_columns(&self) -> usize {
        match self {
            Self::Identity { n_features } => *n_features,
            Self::Grouped { n_columns, .. } => *n_columns,
        }
    }

    /// Column of `feature`.
    #[inline]
    pub fn column(&self, feature: u32) -> u32 {
        match self {
            Self::Identity { .. } => feature,
            Self::Grouped { columns, .. } => columns[feature as usize],
        }
    }

    /// Index of the bias cell in an attribution row.
    #[inline]
    pub fn bias_index(&self) -> usize {
        self.n_columns()
    }
}
