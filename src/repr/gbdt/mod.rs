//! Gradient-boosted decision tree (GBDT) canonical representations.

/// Canonical node identifier used by the GBDT representation.
///
/// Internally this is just an index into the tree's SoA arrays.
pub type NodeId = u32;

pub mod forest;
pub mod tree;

pub use forest::{Forest, ForestValidationError, ModelParams, NodeMeans, TreeRange};
pub use tree::{Tree, TreeBuilder, TreeValidationError};
