//! Saabas path attribution.

use crate::predict::FeatureVector;
use crate::repr::gbdt::Tree;

use super::FeatureGroupMap;

impl Tree {
    /// Add this tree's approximate attributions for one row to `out`.
    ///
    /// Walks the decision path and credits each split's column with the
    /// change in expected value from the node to the child taken. The bias
    /// cell receives the tree's expected value `means[0]`.
    pub fn calculate_contributions_approx(
        &self,
        fvec: &FeatureVector,
        means: &[f32],
        columns: &FeatureGroupMap,
        out: &mut [f32],
    ) {
        debug_assert_eq!(out.len(), columns.n_columns() + 1);
        let mut node_value = means[0];
        out[columns.bias_index()] += node_value;

        let mut node = 0;
        let mut column = 0;
        while !self.is_leaf(node) {
            let feature = self.split_index(node);
            column = columns.column(feature) as usize;
            node = self.next_node(node, fvec.fvalue(feature as usize));
            let value = means[node as usize];
            out[column] += value - node_value;
            node_value = value;
        }

        if node != 0 {
            out[column] += self.leaf_value(node) - node_value;
        }
    }
}
