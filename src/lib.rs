//! forest-infer: CPU batch inference for decision-tree ensembles.
//!
//! This crate evaluates gradient-boosted tree ensembles over batches of rows,
//! producing margins, leaf indices, and per-feature attributions (SHAP values
//! and pairwise interactions).
//!
//! # Key Types
//!
//! - [`Forest`] / [`Tree`]: the model, built with [`TreeBuilder`]
//! - [`SparseDataset`] and the [`data`] adapters: input rows
//! - [`CpuPredictor`]: every prediction mode
//! - [`PredictorConfig`]: block size, unroll depth and thread count
//!
//! Work is split into fixed-size row blocks and distributed over a rayon
//! thread pool. See [`predict`] for the pipeline.

#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod data;
pub mod error;
pub mod explain;
pub mod predict;
pub mod repr;
pub mod utils;

pub use config::{ContributionOptions, PredictorConfig};
pub use data::{DataSource, Entry, SparseDataset};
pub use error::{ConfigError, PredictError};
pub use explain::{Condition, FeatureGroupMap};
pub use predict::{CpuPredictor, InplaceOutcome};
pub use repr::gbdt::{Forest, Tree, TreeBuilder, TreeRange};
pub use utils::{run_with_threads, Parallelism};
