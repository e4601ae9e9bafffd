//! Error types for prediction calls.

use crate::repr::gbdt::ForestValidationError;

/// Errors that abort a prediction call.
///
/// Every variant is a contract violation by the caller or the model
/// builder. Calls validate up front, so no output cell has been written when
/// one of these is returned. Recoverable conditions (a mis-sized base margin,
/// an input layout this backend does not handle) are not errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredictError {
    /// Output buffer does not have the exact size the call requires.
    #[error("output buffer has {actual} cells, expected {expected}")]
    OutputSizeMismatch { expected: usize, actual: usize },

    /// Model uses vector leaves, which the blocked kernel does not support.
    #[error("leaf_vector_size must be 0, got {0}")]
    LeafVectorUnsupported(u32),

    /// Model declares no output groups.
    #[error("model has zero output groups")]
    ZeroOutputGroups,

    /// In-place input has a different column count than the model.
    #[error("number of columns in data ({data}) must equal the trained model's feature count ({model})")]
    FeatureCountMismatch { model: usize, data: usize },

    /// Tree range is out of bounds.
    #[error("invalid tree range [{begin}, {end}) for a model with {n_trees} trees")]
    InvalidTreeRange { begin: usize, end: usize, n_trees: usize },

    /// Per-tree weights do not cover every tree of the model.
    #[error("tree weights have {actual} entries, expected {expected}")]
    TreeWeightsMismatch { expected: usize, actual: usize },

    /// Feature group map does not match the model.
    #[error("feature group map covers {mapped} features, model has {n_features}")]
    FeatureGroupMismatch { n_features: usize, mapped: usize },

    /// Model failed structural validation.
    #[error("invalid model: {0}")]
    InvalidModel(#[from] ForestValidationError),
}

/// Errors that can occur during configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("block_size must be at least 1")]
    InvalidBlockSize,

    #[error("unroll_depth must be at least 1")]
    InvalidUnrollDepth,
}
