//! Exact TreeSHAP with optional conditioning on one column.

use crate::predict::FeatureVector;
use crate::repr::gbdt::{NodeId, Tree};

use super::FeatureGroupMap;

/// Conditioning applied to one column during an attribution pass.
///
/// Interaction values are the difference between a pass with the column
/// forced on and a pass with it forced off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    /// The column is treated as absent from every coalition.
    Off,
    /// No conditioning.
    #[default]
    None,
    /// The column is treated as present in every coalition.
    On,
}

/// One step of the unique decision path.
#[derive(Debug, Clone, Copy, Default)]
struct PathElement {
    /// Column split on, or -1 for the root sentinel.
    column: i64,
    /// Fraction of zero paths (column absent) flowing through this branch.
    zero_fraction: f64,
    /// Fraction of one paths (column present) flowing through this branch.
    one_fraction: f64,
    /// Permutation weight.
    pweight: f64,
}

/// Reusable stack for the unique decision paths of exact attribution.
///
/// Recursion copies the parent path into a fresh segment at every level, so
/// a tree of depth `d` needs `(d + 2)(d + 3) / 2` elements. The buffer only
/// grows; size it once for the deepest tree and reuse it across rows.
#[derive(Debug, Clone, Default)]
pub struct PathBuffer {
    elements: Vec<PathElement>,
    max_depth: usize,
}

impl PathBuffer {
    /// Buffer for trees of depth up to `max_depth`.
    pub fn with_max_depth(max_depth: usize) -> Self {
        let mut buffer = Self::default();
        buffer.reserve(max_depth);
        buffer
    }

    /// Grow to fit trees of depth up to `max_depth`.
    pub fn reserve(&mut self, max_depth: usize) {
        let levels = max_depth + 2;
        let needed = levels * (levels + 1) / 2;
        if self.elements.len() < needed {
            self.elements.resize(needed, PathElement::default());
        }
        self.max_depth = self.max_depth.max(max_depth);
    }

    /// Deepest tree the buffer fits.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

/// Grow the path by one column, updating permutation weights.
fn extend_path(path: &mut [PathElement], depth: usize, zero_fraction: f64, one_fraction: f64, column: i64) {
    path[depth] = PathElement {
        column,
        zero_fraction,
        one_fraction,
        pweight: if depth == 0 { 1.0 } else { 0.0 },
    };
    let scale = (depth + 1) as f64;
    for i in (0..depth).rev() {
        path[i + 1].pweight += one_fraction * path[i].pweight * (i + 1) as f64 / scale;
        path[i].pweight = zero_fraction * path[i].pweight * (depth - i) as f64 / scale;
    }
}

/// Undo a previous extension at `path_index`.
fn unwind_path(path: &mut [PathElement], depth: usize, path_index: usize) {
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let scale = (depth + 1) as f64;
    let mut next_one_portion = path[depth].pweight;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = path[i].pweight;
            path[i].pweight = next_one_portion * scale / ((i + 1) as f64 * one_fraction);
            next_one_portion = tmp - path[i].pweight * zero_fraction * (depth - i) as f64 / scale;
        } else {
            path[i].pweight = path[i].pweight * scale / (zero_fraction * (depth - i) as f64);
        }
    }

    for i in path_index..depth {
        path[i].column = path[i + 1].column;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
}

/// Total permutation weight of the path if `path_index` were unwound.
fn unwound_path_sum(path: &[PathElement], depth: usize, path_index: usize) -> f64 {
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let scale = (depth + 1) as f64;
    let mut next_one_portion = path[depth].pweight;
    let mut total = 0.0;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = next_one_portion * scale / ((i + 1) as f64 * one_fraction);
            total += tmp;
            next_one_portion = path[i].pweight - tmp * zero_fraction * (depth - i) as f64 / scale;
        } else {
            total += path[i].pweight / (zero_fraction * (depth - i) as f64 / scale);
        }
    }
    total
}

/// Fractions and column carried from a parent into a child.
#[derive(Clone, Copy)]
struct Incoming {
    zero_fraction: f64,
    one_fraction: f64,
    column: i64,
}

struct TreeShap<'a> {
    tree: &'a Tree,
    fvec: &'a FeatureVector,
    columns: &'a FeatureGroupMap,
    condition: Condition,
    condition_column: i64,
}

impl TreeShap<'_> {
    fn recurse(
        &self,
        phi: &mut [f32],
        parent_path: &mut [PathElement],
        node: NodeId,
        depth: usize,
        incoming: Incoming,
        condition_fraction: f64,
    ) {
        if condition_fraction == 0.0 {
            return;
        }

        // The child path lives right after the parent's `depth + 1` elements.
        let (parent, path) = parent_path.split_at_mut(depth + 1);
        path[..=depth].copy_from_slice(parent);

        if self.condition == Condition::None || self.condition_column != incoming.column {
            extend_path(path, depth, incoming.zero_fraction, incoming.one_fraction, incoming.column);
        }

        let tree = self.tree;
        if tree.is_leaf(node) {
            let leaf_value = f64::from(tree.leaf_value(node));
            for i in 1..=depth {
                let weight = unwound_path_sum(path, depth, i);
                let el = path[i];
                let contribution = weight * (el.one_fraction - el.zero_fraction) * leaf_value * condition_fraction;
                phi[el.column as usize] += contribution as f32;
            }
            return;
        }

        let feature = tree.split_index(node);
        let column = i64::from(self.columns.column(feature));
        let hot = tree.next_node(node, self.fvec.fvalue(feature as usize));
        let cold = if hot == tree.left_child(node) {
            tree.right_child(node)
        } else {
            tree.left_child(node)
        };
        let cover = f64::from(tree.cover(node));
        let hot_zero_fraction = f64::from(tree.cover(hot)) / cover;
        let cold_zero_fraction = f64::from(tree.cover(cold)) / cover;
        let mut incoming_zero_fraction = 1.0;
        let mut incoming_one_fraction = 1.0;

        // Depth may drop to -1 before the children add one back.
        let mut depth = depth as isize;

        // A column already on the path is unwound and re-split here.
        if let Some(path_index) = path[..=depth as usize].iter().position(|el| el.column == column) {
            incoming_zero_fraction = path[path_index].zero_fraction;
            incoming_one_fraction = path[path_index].one_fraction;
            unwind_path(path, depth as usize, path_index);
            depth -= 1;
        }

        let mut hot_condition_fraction = condition_fraction;
        let mut cold_condition_fraction = condition_fraction;
        if column == self.condition_column {
            match self.condition {
                Condition::On => {
                    cold_condition_fraction = 0.0;
                    depth -= 1;
                }
                Condition::Off => {
                    hot_condition_fraction *= hot_zero_fraction;
                    cold_condition_fraction *= cold_zero_fraction;
                    depth -= 1;
                }
                Condition::None => {}
            }
        }

        let child_depth = (depth + 1) as usize;
        self.recurse(
            phi,
            path,
            hot,
            child_depth,
            Incoming {
                zero_fraction: hot_zero_fraction * incoming_zero_fraction,
                one_fraction: incoming_one_fraction,
                column,
            },
            hot_condition_fraction,
        );
        self.recurse(
            phi,
            path,
            cold,
            child_depth,
            Incoming {
                zero_fraction: cold_zero_fraction * incoming_zero_fraction,
                one_fraction: 0.0,
                column,
            },
            cold_condition_fraction,
        );
    }
}

impl Tree {
    /// Add this tree's exact SHAP values for one row to `out`.
    ///
    /// `out` has `columns.n_columns() + 1` cells; the last is the bias. The
    /// tree's expected value `means[0]` is added to the bias only for an
    /// unconditioned pass. `means` comes from [`Tree::node_mean_values`].
    ///
    /// With a [`Condition`] other than `None`, `condition_column` is forced
    /// on or off and receives no attribution of its own.
    ///
    /// # Panics
    ///
    /// Panics if `path` was sized for a shallower tree.
    pub fn calculate_contributions(
        &self,
        fvec: &FeatureVector,
        means: &[f32],
        columns: &FeatureGroupMap,
        out: &mut [f32],
        condition: Condition,
        condition_column: u32,
        path: &mut PathBuffer,
    ) {
        debug_assert_eq!(out.len(), columns.n_columns() + 1);
        debug_assert!(path.max_depth() >= self.max_depth(), "path buffer is shallower than the tree");
        if condition == Condition::None {
            out[columns.bias_index()] += means[0];
        }

        let shap = TreeShap {
            tree: self,
            fvec,
            columns,
            condition,
            condition_column: i64::from(condition_column),
        };
        let root = Incoming {
            zero_fraction: 1.0,
            one_fraction: 1.0,
            column: -1,
        };
        // The root's parent path is an empty prefix of the buffer.
        shap.recurse(out, &mut path.elements, 0, 0, root, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Entry;
    use crate::repr::gbdt::TreeBuilder;
    use approx::assert_abs_diff_eq;

    fn fvec(values: &[f32]) -> FeatureVector {
        let mut fvec = FeatureVector::new(values.len());
        let row: Vec<Entry> = values
            .iter()
            .enumerate()
            .map(|(i, &value)| Entry { index: i as u32, value })
            .collect();
        fvec.fill(&row);
        fvec
    }

    fn stump() -> Tree {
        let mut builder = TreeBuilder::new();
        builder.add_split(0, 0.5, true, 1, 2);
        builder.add_leaf(-1.0);
        builder.add_leaf(1.0);
        builder.with_covers(&[100.0, 50.0, 50.0]).build()
    }

    /// Depth-2 tree over two features with uneven covers.
    fn two_feature_tree() -> Tree {
        let mut builder = TreeBuilder::new();
        builder.add_split(0, 0.5, true, 1, 2);
        builder.add_split(1, 0.5, false, 3, 4);
        builder.add_split(1, 0.2, true, 5, 6);
        builder.add_leaf(1.0);
        builder.add_leaf(2.0);
        builder.add_leaf(3.0);
        builder.add_leaf(5.0);
        builder.with_covers(&[10.0, 6.0, 4.0, 2.0, 4.0, 1.0, 3.0]).build()
    }

    fn contributions(tree: &Tree, row: &[f32], condition: Condition, column: u32) -> Vec<f32> {
        let columns = FeatureGroupMap::identity(row.len());
        let means = tree.node_mean_values();
        let mut out = vec![0.0; row.len() + 1];
        let mut path = PathBuffer::with_max_depth(tree.max_depth());
        tree.calculate_contributions(&fvec(row), &means, &columns, &mut out, condition, column, &mut path);
        out
    }

    #[test]
    fn stump_attributes_split_feature() {
        let out = contributions(&stump(), &[0.3, 0.9], Condition::None, 0);
        assert_abs_diff_eq!(out[0], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[2], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn contributions_sum_to_prediction() {
        let tree = two_feature_tree();
        for row in [[0.1, 0.1], [0.1, 0.9], [0.9, 0.1], [0.9, 0.9], [f32::NAN, 0.3]] {
            let out = contributions(&tree, &row, Condition::None, 0);
            let total: f32 = out.iter().sum();
            assert_abs_diff_eq!(total, tree.predict(&fvec(&row)), epsilon = 1e-5);
        }
    }

    #[test]
    fn bias_is_expected_value() {
        let tree = two_feature_tree();
        let out = contributions(&tree, &[0.1, 0.1], Condition::None, 0);
        assert_abs_diff_eq!(out[2], tree.node_mean_values()[0], epsilon = 1e-6);
    }

    #[test]
    fn conditioned_passes_skip_bias_and_condition_column() {
        let tree = two_feature_tree();
        for condition in [Condition::On, Condition::Off] {
            let out = contributions(&tree, &[0.9, 0.1], condition, 0);
            assert_eq!(out[0], 0.0);
            assert_eq!(out[2], 0.0);
        }
    }

    #[test]
    fn on_off_difference_splits_interaction() {
        // For a stump there is nothing left to attribute once the only
        // split column is conditioned.
        let tree = stump();
        let on = contributions(&tree, &[0.3, 0.0], Condition::On, 0);
        let off = contributions(&tree, &[0.3, 0.0], Condition::Off, 0);
        assert!(on.iter().chain(&off).all(|&v| v == 0.0));
    }

    #[test]
    fn grouped_columns_merge_players() {
        let tree = two_feature_tree();
        let columns = FeatureGroupMap::grouped(vec![0, 0]);
        let means = tree.node_mean_values();
        let mut out = vec![0.0; 2];
        let row = fvec(&[0.9, 0.9]);
        let mut path = PathBuffer::with_max_depth(tree.max_depth());
        tree.calculate_contributions(&row, &means, &columns, &mut out, Condition::None, 0, &mut path);

        // One player takes the whole deviation from the expected value.
        assert_abs_diff_eq!(out[0], tree.predict(&row) - means[0], epsilon = 1e-5);
        assert_abs_diff_eq!(out[1], means[0], epsilon = 1e-6);
    }

    #[test]
    fn path_buffer_is_reused_across_trees_and_rows() {
        let deep = two_feature_tree();
        let shallow = stump();
        let columns = FeatureGroupMap::identity(2);
        let mut path = PathBuffer::with_max_depth(deep.max_depth());

        for tree in [&deep, &shallow, &deep] {
            let means = tree.node_mean_values();
            for row in [[0.1, 0.9], [0.9, 0.1]] {
                let mut out = vec![0.0; 3];
                tree.calculate_contributions(&fvec(&row), &means, &columns, &mut out, Condition::None, 0, &mut path);
                assert_eq!(out, contributions(tree, &row, Condition::None, 0));
            }
        }

        path.reserve(1);
        assert_eq!(path.max_depth(), 2);
    }

    #[test]
    fn repeated_feature_on_path_is_unwound() {
        let mut builder = TreeBuilder::new();
        builder.add_split(0, 0.5, true, 1, 2);
        builder.add_split(0, 0.2, true, 3, 4);
        builder.add_leaf(4.0);
        builder.add_leaf(1.0);
        builder.add_leaf(2.0);
        let tree = builder.build();

        let out = contributions(&tree, &[0.3], Condition::None, 0);
        let means = tree.node_mean_values();
        assert_abs_diff_eq!(out[0], 2.0 - means[0], epsilon = 1e-5);
    }
}
