//! Batch prediction for tree ensembles.
//!
//! The pipeline has three layers:
//!
//! - [`FeatureVectorPool`]: reusable dense feature vectors, leased one
//!   partition per worker task, so a filled block never allocates.
//! - [`RowSource`]: where block rows come from. [`PageView`] reads a
//!   materialized [`SparsePage`](crate::data::SparsePage); [`AdapterView`]
//!   converts external rows on demand into an [`UnrollBuffer`].
//! - [`BlockScheduler`]: splits rows into blocks, fills them, runs a per-block
//!   evaluation and drops them again.
//!
//! [`CpuPredictor`] ties these together for every prediction mode.
//!
//! # Quick Start
//!
//! ```
//! use forest_infer::data::SparseDataset;
//! use forest_infer::repr::gbdt::{Forest, TreeBuilder};
//! use forest_infer::{CpuPredictor, TreeRange};
//!
//! let mut builder = TreeBuilder::new();
//! builder.add_split(0, 0.5, true, 1, 2);
//! builder.add_leaf(-1.0);
//! builder.add_leaf(1.0);
//!
//! let mut forest = Forest::for_regression(1);
//! forest.push_tree(builder.build(), 0);
//!
//! let data = ndarray::array![[0.2f32], [0.9], [f32::NAN]];
//! let dataset = SparseDataset::from_dense(data.view(), f32::NAN);
//!
//! let predictor = CpuPredictor::new(&forest).unwrap();
//! let preds = predictor.predict(&dataset, TreeRange::all()).unwrap();
//! assert_eq!(preds, vec![-1.0, 1.0, -1.0]);
//! ```
//!
//! # Block Size
//!
//! Blocks default to 64 rows. Within a block trees are the outer loop, so a
//! tree's nodes stay in cache while every row of the block walks it.
//! Tune with [`PredictorConfig::block_size`](crate::PredictorConfig::block_size).

mod fvec;
mod kernel;
mod predictor;
mod view;

pub use fvec::{FeatureLease, FeatureVector, FeatureVectorPool};
pub use kernel::{predict_blocks, predict_leaf_blocks, BlockScheduler};
pub use predictor::{CpuPredictor, InplaceOutcome};
pub use view::{AdapterCursor, AdapterView, PageCursor, PageView, RowCursor, RowSource, UnrollBuffer};
