//! Shared fixtures for integration tests: seeded random forests and data.

#![allow(dead_code)]

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use forest_infer::data::SparseDataset;
use forest_infer::repr::gbdt::{Forest, Tree, TreeBuilder};

/// Random forest with trees assigned to groups round-robin.
pub fn random_forest(seed: u64, n_features: usize, n_groups: usize, n_trees: usize, depth: usize) -> Forest {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut forest = Forest::new(n_features, n_groups).with_base_score(0.5);
    for t in 0..n_trees {
        forest.push_tree(complete_tree(&mut rng, n_features, depth), (t % n_groups) as u32);
    }
    forest
}

/// Complete binary tree in heap order: node `i` has children `2i + 1` and
/// `2i + 2`.
pub fn complete_tree(rng: &mut impl Rng, n_features: usize, depth: usize) -> Tree {
    let n_splits = (1usize << depth) - 1;
    let n_nodes = (1usize << (depth + 1)) - 1;
    let mut builder = TreeBuilder::new();
    for i in 0..n_nodes {
        if i < n_splits {
            let feature = rng.gen_range(0..n_features) as u32;
            let threshold = rng.r#gen::<f32>();
            let default_left = rng.gen_bool(0.5);
            builder.add_split(feature, threshold, default_left, (2 * i + 1) as u32, (2 * i + 2) as u32);
        } else {
            let leaf = builder.add_leaf(rng.gen_range(-1.0f32..1.0));
            builder.set_cover(leaf, rng.gen_range(1.0f32..10.0));
        }
    }
    builder.build()
}

/// Row-major dense values in `[0, 1)` with roughly `missing_rate` NaNs.
pub fn random_dense(seed: u64, n_rows: usize, n_features: usize, missing_rate: f32) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n_rows * n_features)
        .map(|_| {
            if rng.r#gen::<f32>() < missing_rate {
                f32::NAN
            } else {
                rng.r#gen::<f32>()
            }
        })
        .collect()
}

/// Sparse dataset over the same values as [`random_dense`].
pub fn dataset(values: &[f32], n_rows: usize, n_features: usize) -> SparseDataset {
    let view = ndarray::ArrayView2::from_shape((n_rows, n_features), values).unwrap();
    SparseDataset::from_dense(view, f32::NAN)
}
