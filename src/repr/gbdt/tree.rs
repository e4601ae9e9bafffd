//! Canonical tree representation (SoA) and its builder.
//!
//! This module provides:
//! - [`Tree`]: Immutable SoA tree storage for efficient traversal
//! - [`TreeBuilder`]: Node-by-node construction
//! - [`TreeValidationError`]: Structural validation errors
//!
//! Attribution routines over a tree live in [`crate::explain`].

use crate::predict::FeatureVector;

use super::NodeId;

// ============================================================================
// TreeValidationError
// ============================================================================

/// Structural validation errors for [`Tree`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TreeValidationError {
    /// Tree has no nodes.
    #[error("tree has no nodes")]
    EmptyTree,
    /// A child pointer references an out-of-bounds node.
    #[error("node {node} has {side} child {child} outside of {n_nodes} nodes")]
    ChildOutOfBounds {
        node: NodeId,
        side: &'static str,
        child: NodeId,
        n_nodes: usize,
    },
    /// A node references itself as a child.
    #[error("node {node} references itself as a child")]
    SelfLoop { node: NodeId },
    /// A node was reached by more than one path.
    #[error("node {node} is reachable by more than one path")]
    DuplicateVisit { node: NodeId },
    /// A cycle was detected during traversal.
    #[error("cycle detected at node {node}")]
    CycleDetected { node: NodeId },
    /// A node exists in storage but is unreachable from the root.
    #[error("node {node} is unreachable from the root")]
    UnreachableNode { node: NodeId },
    /// A split node has a cover that cannot weight its children.
    #[error("split node {node} has non-positive cover {cover}")]
    InvalidCover { node: NodeId, cover: f32 },
}

// ============================================================================
// Tree
// ============================================================================

/// Structure-of-Arrays tree storage for efficient traversal.
///
/// Stores tree nodes in flat arrays for cache-friendly traversal.
/// Child indices are local to this tree (0 = root). Splits are numeric:
/// a value strictly below the threshold goes left, a missing value follows
/// the node's default direction.
///
/// Each node carries a cover (the training hessian sum reaching it), used to
/// weight subtrees when computing expected values for attribution.
#[derive(Debug, Clone)]
pub struct Tree {
    split_indices: Box<[u32]>,
    split_thresholds: Box<[f32]>,
    left_children: Box<[NodeId]>,
    right_children: Box<[NodeId]>,
    default_left: Box<[bool]>,
    is_leaf: Box<[bool]>,
    leaf_values: Box<[f32]>,
    covers: Box<[f32]>,
}

impl Tree {
    /// A tree consisting of a single leaf.
    pub fn leaf(value: f32) -> Self {
        let mut builder = TreeBuilder::new();
        builder.add_leaf(value);
        builder.build()
    }

    /// Number of nodes in the tree.
    #[inline]
    pub fn n_nodes(&self) -> usize {
        self.is_leaf.len()
    }

    /// Number of leaves.
    pub fn n_leaves(&self) -> usize {
        self.is_leaf.iter().filter(|&&leaf| leaf).count()
    }

    #[inline]
    pub fn is_leaf(&self, node: NodeId) -> bool {
        self.is_leaf[node as usize]
    }

    /// Feature index tested by a split node.
    #[inline]
    pub fn split_index(&self, node: NodeId) -> u32 {
        self.split_indices[node as usize]
    }

    #[inline]
    pub fn split_threshold(&self, node: NodeId) -> f32 {
        self.split_thresholds[node as usize]
    }

    #[inline]
    pub fn left_child(&self, node: NodeId) -> NodeId {
        self.left_children[node as usize]
    }

    #[inline]
    pub fn right_child(&self, node: NodeId) -> NodeId {
        self.right_children[node as usize]
    }

    #[inline]
    pub fn default_left(&self, node: NodeId) -> bool {
        self.default_left[node as usize]
    }

    /// Child taken by missing values.
    #[inline]
    pub fn default_child(&self, node: NodeId) -> NodeId {
        if self.default_left(node) {
            self.left_child(node)
        } else {
            self.right_child(node)
        }
    }

    #[inline]
    pub fn leaf_value(&self, node: NodeId) -> f32 {
        self.leaf_values[node as usize]
    }

    #[inline]
    pub fn cover(&self, node: NodeId) -> f32 {
        self.covers[node as usize]
    }

    /// Child reached from split `node` for the given feature value.
    #[inline]
    pub fn next_node(&self, node: NodeId, fvalue: f32) -> NodeId {
        if fvalue.is_nan() {
            self.default_child(node)
        } else if fvalue < self.split_threshold(node) {
            self.left_child(node)
        } else {
            self.right_child(node)
        }
    }

    /// Traverse from the root to the leaf selected by `fvec`.
    ///
    /// With `HAS_MISSING = false` the missing check is skipped, which is only
    /// correct when every feature of the row is present. Callers select the
    /// variant with [`FeatureVector::has_missing`]; see [`Tree::leaf_for`].
    #[inline]
    pub fn leaf_index<const HAS_MISSING: bool>(&self, fvec: &FeatureVector) -> NodeId {
        let mut node: NodeId = 0;
        while !self.is_leaf(node) {
            let fvalue = fvec.fvalue(self.split_index(node) as usize);
            node = if HAS_MISSING {
                self.next_node(node, fvalue)
            } else if fvalue < self.split_threshold(node) {
                self.left_child(node)
            } else {
                self.right_child(node)
            };
        }
        node
    }

    /// Leaf reached by `fvec`, choosing the traversal by its missing flag.
    #[inline]
    pub fn leaf_for(&self, fvec: &FeatureVector) -> NodeId {
        if fvec.has_missing() {
            self.leaf_index::<true>(fvec)
        } else {
            self.leaf_index::<false>(fvec)
        }
    }

    /// Leaf value reached by `fvec`.
    #[inline]
    pub fn predict(&self, fvec: &FeatureVector) -> f32 {
        self.leaf_value(self.leaf_for(fvec))
    }

    /// Depth of the deepest leaf (a single leaf has depth 0).
    pub fn max_depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(0 as NodeId, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            if self.is_leaf(node) {
                max_depth = max_depth.max(depth);
            } else {
                stack.push((self.left_child(node), depth + 1));
                stack.push((self.right_child(node), depth + 1));
            }
        }
        max_depth
    }

    /// Cover-weighted mean leaf value of every node's subtree.
    ///
    /// A leaf's mean is its value. A split's mean is the cover-weighted
    /// average of its children's means. Index 0 therefore holds the tree's
    /// expected output.
    pub fn node_mean_values(&self) -> Box<[f32]> {
        let mut means = vec![0.0f32; self.n_nodes()].into_boxed_slice();
        self.fill_node_mean(0, &mut means);
        means
    }

    fn fill_node_mean(&self, node: NodeId, means: &mut [f32]) -> f32 {
        let mean = if self.is_leaf(node) {
            self.leaf_value(node)
        } else {
            let left = self.left_child(node);
            let right = self.right_child(node);
            let weighted = self.fill_node_mean(left, means) * self.cover(left)
                + self.fill_node_mean(right, means) * self.cover(right);
            weighted / self.cover(node)
        };
        means[node as usize] = mean;
        mean
    }

    /// Largest split feature index used by the tree, if it has any split.
    pub fn max_split_index(&self) -> Option<u32> {
        (0..self.n_nodes() as NodeId)
            .filter(|&node| !self.is_leaf(node))
            .map(|node| self.split_index(node))
            .max()
    }

    /// Validate structural invariants.
    ///
    /// Checks that every child pointer is in bounds, that the nodes form a
    /// tree rooted at 0 (no cycles, no shared children, no unreachable
    /// nodes), and that split covers are positive.
    pub fn validate(&self) -> Result<(), TreeValidationError> {
        let n_nodes = self.n_nodes();
        if n_nodes == 0 {
            return Err(TreeValidationError::EmptyTree);
        }

        // 0 = unvisited, 1 = visiting, 2 = done
        let mut color = vec![0u8; n_nodes];
        let mut stack: Vec<(NodeId, bool)> = vec![(0, false)];

        while let Some((node, finished)) = stack.pop() {
            let node_usize = node as usize;
            if finished {
                color[node_usize] = 2;
                continue;
            }
            match color[node_usize] {
                0 => {}
                1 => return Err(TreeValidationError::CycleDetected { node }),
                _ => return Err(TreeValidationError::DuplicateVisit { node }),
            }
            color[node_usize] = 1;
            stack.push((node, true));

            if self.is_leaf(node) {
                continue;
            }

            let cover = self.cover(node);
            if cover.is_nan() || cover <= 0.0 {
                return Err(TreeValidationError::InvalidCover { node, cover });
            }

            for (side, child) in [("right", self.right_child(node)), ("left", self.left_child(node))] {
                if child == node {
                    return Err(TreeValidationError::SelfLoop { node });
                }
                if child as usize >= n_nodes {
                    return Err(TreeValidationError::ChildOutOfBounds {
                        node,
                        side,
                        child,
                        n_nodes,
                    });
                }
                stack.push((child, false));
            }
        }

        match color.iter().position(|&c| c == 0) {
            Some(i) => Err(TreeValidationError::UnreachableNode { node: i as NodeId }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// TreeBuilder
// ============================================================================

/// Node-by-node tree construction.
///
/// Nodes are appended in any order; child pointers refer to indices returned
/// by earlier or later `add_*` calls. Covers not set explicitly are derived
/// at [`build`](TreeBuilder::build) time: a leaf covers 1.0 and a split
/// covers the sum of its children.
#[derive(Debug, Clone, Default)]
pub struct TreeBuilder {
    split_indices: Vec<u32>,
    split_thresholds: Vec<f32>,
    left_children: Vec<NodeId>,
    right_children: Vec<NodeId>,
    default_left: Vec<bool>,
    is_leaf: Vec<bool>,
    leaf_values: Vec<f32>,
    covers: Vec<Option<f32>>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a split node. Returns the node index.
    pub fn add_split(
        &mut self,
        feature_index: u32,
        threshold: f32,
        default_left: bool,
        left_child: NodeId,
        right_child: NodeId,
    ) -> NodeId {
        let idx = self.is_leaf.len() as NodeId;
        self.split_indices.push(feature_index);
        self.split_thresholds.push(threshold);
        self.left_children.push(left_child);
        self.right_children.push(right_child);
        self.default_left.push(default_left);
        self.is_leaf.push(false);
        self.leaf_values.push(0.0);
        self.covers.push(None);
        idx
    }

    /// Add a leaf node. Returns the node index.
    pub fn add_leaf(&mut self, value: f32) -> NodeId {
        let idx = self.is_leaf.len() as NodeId;
        self.split_indices.push(0);
        self.split_thresholds.push(0.0);
        self.left_children.push(0);
        self.right_children.push(0);
        self.default_left.push(false);
        self.is_leaf.push(true);
        self.leaf_values.push(value);
        self.covers.push(None);
        idx
    }

    /// Set the cover of an existing node.
    ///
    /// # Panics
    ///
    /// Panics if `node` has not been added yet.
    pub fn set_cover(&mut self, node: NodeId, cover: f32) -> &mut Self {
        self.covers[node as usize] = Some(cover);
        self
    }

    /// Set every node's cover at once, in node order.
    ///
    /// # Panics
    ///
    /// Panics if `covers` does not have one entry per node.
    pub fn with_covers(mut self, covers: &[f32]) -> Self {
        assert_eq!(covers.len(), self.is_leaf.len(), "one cover per node");
        self.covers = covers.iter().copied().map(Some).collect();
        self
    }

    /// Number of nodes added so far.
    pub fn n_nodes(&self) -> usize {
        self.is_leaf.len()
    }

    /// Build the tree storage.
    pub fn build(self) -> Tree {
        let covers = self.derive_covers();
        Tree {
            split_indices: self.split_indices.into_boxed_slice(),
            split_thresholds: self.split_thresholds.into_boxed_slice(),
            left_children: self.left_children.into_boxed_slice(),
            right_children: self.right_children.into_boxed_slice(),
            default_left: self.default_left.into_boxed_slice(),
            is_leaf: self.is_leaf.into_boxed_slice(),
            leaf_values: self.leaf_values.into_boxed_slice(),
            covers,
        }
    }

    /// Post-order pass filling unset covers. Malformed links (out of bounds
    /// or back edges) contribute nothing; [`Tree::validate`] reports them.
    fn derive_covers(&self) -> Box<[f32]> {
        let n_nodes = self.is_leaf.len();
        let mut covers: Vec<f32> = self
            .covers
            .iter()
            .zip(&self.is_leaf)
            .map(|(cover, &leaf)| cover.unwrap_or(if leaf { 1.0 } else { f32::NAN }))
            .collect();
        if n_nodes == 0 {
            return covers.into_boxed_slice();
        }

        let mut state = vec![0u8; n_nodes];
        let mut stack = vec![0usize];
        while let Some(&node) = stack.last() {
            if state[node] == 0 {
                state[node] = 1;
                if !self.is_leaf[node] {
                    for child in [self.left_children[node], self.right_children[node]] {
                        let child = child as usize;
                        if child < n_nodes && state[child] == 0 {
                            stack.push(child);
                        }
                    }
                }
                continue;
            }
            stack.pop();
            if state[node] == 1 {
                state[node] = 2;
                if covers[node].is_nan() {
                    covers[node] = [self.left_children[node], self.right_children[node]]
                        .iter()
                        .filter_map(|&c| covers.get(c as usize))
                        .filter(|c| c.is_finite())
                        .sum();
                }
            }
        }

        for cover in covers.iter_mut().filter(|c| c.is_nan()) {
            *cover = 1.0;
        }
        covers.into_boxed_slice()
    }
}
