//! Partial-likelihood store.
//!
//! Holds, per node, conditional likelihoods laid out as
//! `[category][pattern][state]`, per matrix slot the transition matrices as
//! `[category][from][to]`, and per node and pattern the log scale factor.
//! Every buffer exists twice; a per-node (per-slot) index selects the
//! current copy. Writers flip the index before their first write after a
//! [`store`](PartialsStore::store), so the stored copy is never overwritten
//! and [`restore`](PartialsStore::restore) only swaps index arrays.

use cyanea_core::Revertible;

use crate::tree::NodeId;

/// Partials whose per-pattern maximum falls below this are rescaled.
const SCALING_THRESHOLD: f64 = 1.0e-100;

/// How a child's partials reach its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Through the transition matrices held in a slot.
    Matrix(usize),
    /// Unchanged: the lineage cannot change along the branch.
    Identity,
}

#[derive(Debug, Clone)]
pub struct PartialsStore {
    n_patterns: usize,
    n_states: usize,
    n_categories: usize,
    partials: [Vec<Vec<f64>>; 2],
    current_partials: Vec<usize>,
    stored_partials: Vec<usize>,
    /// Set once a node's partials have moved off the stored buffer.
    partials_flipped: Vec<bool>,
    scale_factors: [Vec<Vec<f64>>; 2],
    matrices: [Vec<Vec<f64>>; 2],
    current_matrices: Vec<usize>,
    stored_matrices: Vec<usize>,
    matrices_flipped: Vec<bool>,
    states: Vec<Option<Vec<usize>>>,
    use_scaling: bool,
}

impl PartialsStore {
    pub fn new(
        n_nodes: usize,
        n_matrix_slots: usize,
        n_patterns: usize,
        n_states: usize,
        n_categories: usize,
    ) -> Self {
        let matrix_len = n_categories * n_states * n_states;
        let slots = || vec![vec![0.0; matrix_len]; n_matrix_slots];
        Self {
            n_patterns,
            n_states,
            n_categories,
            partials: [vec![Vec::new(); n_nodes], vec![Vec::new(); n_nodes]],
            current_partials: vec![0; n_nodes],
            stored_partials: vec![0; n_nodes],
            partials_flipped: vec![false; n_nodes],
            scale_factors: [vec![Vec::new(); n_nodes], vec![Vec::new(); n_nodes]],
            matrices: [slots(), slots()],
            current_matrices: vec![0; n_matrix_slots],
            stored_matrices: vec![0; n_matrix_slots],
            matrices_flipped: vec![false; n_matrix_slots],
            states: vec![None; n_nodes],
            use_scaling: false,
        }
    }

    /// Allocate both partial buffers of an internal node.
    pub fn create_node_partials(&mut self, node: NodeId) {
        let len = self.n_categories * self.n_patterns * self.n_states;
        for buf in 0..2 {
            if self.partials[buf][node].len() != len {
                self.partials[buf][node] = vec![0.0; len];
                self.scale_factors[buf][node] = vec![0.0; self.n_patterns];
            }
        }
    }

    /// Fix the observed state of a leaf for each pattern.
    pub fn set_node_states(&mut self, node: NodeId, states: &[usize]) {
        self.states[node] = Some(states.to_vec());
    }

    pub fn node_states(&self, node: NodeId) -> Option<&[usize]> {
        self.states[node].as_deref()
    }

    /// Move a matrix slot off its stored buffer before rewriting it. Later
    /// calls before the next store, restore or unstore keep the buffer.
    pub fn set_node_matrix_for_update(&mut self, slot: usize) {
        if !self.matrices_flipped[slot] {
            self.current_matrices[slot] = 1 - self.current_matrices[slot];
            self.matrices_flipped[slot] = true;
        }
    }

    /// Write the `n_states x n_states` matrix of one category.
    pub fn set_node_matrix(&mut self, slot: usize, category: usize, matrix: &[Vec<f64>]) {
        let s = self.n_states;
        let buf = self.current_matrices[slot];
        let dest = &mut self.matrices[buf][slot][category * s * s..(category + 1) * s * s];
        for (row_out, row_in) in dest.chunks_exact_mut(s).zip(matrix) {
            row_out.copy_from_slice(&row_in[..s]);
        }
    }

    pub fn node_matrix(&self, slot: usize) -> &[f64] {
        &self.matrices[self.current_matrices[slot]][slot]
    }

    /// Move a node's partials off their stored buffer before recomputing them.
    pub fn set_node_partials_for_update(&mut self, node: NodeId) {
        if !self.partials_flipped[node] {
            self.current_partials[node] = 1 - self.current_partials[node];
            self.partials_flipped[node] = true;
        }
    }

    pub fn node_partials(&self, node: NodeId) -> &[f64] {
        &self.partials[self.current_partials[node]][node]
    }

    pub fn set_use_scaling(&mut self, use_scaling: bool) {
        self.use_scaling = use_scaling;
    }

    pub fn use_scaling(&self) -> bool {
        self.use_scaling
    }

    /// Combine two children into the current buffer of `node`.
    pub fn calculate_partials(
        &mut self,
        child1: (NodeId, Branch),
        child2: (NodeId, Branch),
        node: NodeId,
    ) {
        self.create_node_partials(node);
        let buf = self.current_partials[node];
        let mut out = std::mem::take(&mut self.partials[buf][node]);

        let (s, p) = (self.n_states, self.n_patterns);
        for cat in 0..self.n_categories {
            for pattern in 0..p {
                let base = (cat * p + pattern) * s;
                for x in 0..s {
                    out[base + x] = self.contribution(child1, cat, pattern, x)
                        * self.contribution(child2, cat, pattern, x);
                }
            }
        }
        self.partials[buf][node] = out;

        if self.use_scaling {
            self.scale_partials(node);
        }
    }

    /// Probability of the child's data given state `x` at the top of its branch.
    fn contribution(&self, (child, branch): (NodeId, Branch), cat: usize, pattern: usize, x: usize) -> f64 {
        let s = self.n_states;
        match (&self.states[child], branch) {
            (Some(states), Branch::Identity) => {
                let y = states[pattern];
                if y >= s || y == x {
                    1.0
                } else {
                    0.0
                }
            }
            (Some(states), Branch::Matrix(slot)) => {
                let y = states[pattern];
                if y >= s {
                    return 1.0;
                }
                self.node_matrix(slot)[cat * s * s + x * s + y]
            }
            (None, Branch::Identity) => {
                self.node_partials(child)[(cat * self.n_patterns + pattern) * s + x]
            }
            (None, Branch::Matrix(slot)) => {
                let m = &self.node_matrix(slot)[cat * s * s + x * s..cat * s * s + (x + 1) * s];
                let base = (cat * self.n_patterns + pattern) * s;
                let partial = &self.node_partials(child)[base..base + s];
                m.iter().zip(partial).map(|(a, b)| a * b).sum()
            }
        }
    }

    /// Divide each pattern by its maximum over categories and states when
    /// that maximum is tiny, recording the log of the divisor.
    fn scale_partials(&mut self, node: NodeId) {
        let buf = self.current_partials[node];
        let (s, p) = (self.n_states, self.n_patterns);
        for pattern in 0..p {
            let max = (0..self.n_categories)
                .flat_map(|cat| {
                    let base = (cat * p + pattern) * s;
                    self.partials[buf][node][base..base + s].iter().copied()
                })
                .fold(0.0f64, f64::max);
            let factor = if max > 0.0 && max < SCALING_THRESHOLD {
                for cat in 0..self.n_categories {
                    let base = (cat * p + pattern) * s;
                    for v in &mut self.partials[buf][node][base..base + s] {
                        *v /= max;
                    }
                }
                max.ln()
            } else {
                0.0
            };
            self.scale_factors[buf][node][pattern] = factor;
        }
    }

    /// Sum of all nodes' current log scale factors for one pattern.
    pub fn log_scaling_factor(&self, pattern: usize) -> f64 {
        if !self.use_scaling {
            return 0.0;
        }
        self.current_partials
            .iter()
            .enumerate()
            .filter_map(|(node, &buf)| self.scale_factors[buf][node].get(pattern))
            .sum()
    }

    /// Make the stored buffers current again, discarding updates since the
    /// last [`store`](Self::store) without swapping.
    pub fn unstore(&mut self) {
        self.current_partials.copy_from_slice(&self.stored_partials);
        self.current_matrices.copy_from_slice(&self.stored_matrices);
        self.clear_flipped();
    }

    fn clear_flipped(&mut self) {
        self.partials_flipped.iter_mut().for_each(|f| *f = false);
        self.matrices_flipped.iter_mut().for_each(|f| *f = false);
    }
}

impl Revertible for PartialsStore {
    fn store(&mut self) {
        self.stored_partials.copy_from_slice(&self.current_partials);
        self.stored_matrices.copy_from_slice(&self.current_matrices);
        self.clear_flipped();
    }

    fn restore(&mut self) {
        std::mem::swap(&mut self.current_partials, &mut self.stored_partials);
        std::mem::swap(&mut self.current_matrices, &mut self.stored_matrices);
        self.clear_flipped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subst_model::jc69_probability;

    fn jc(t: f64) -> Vec<Vec<f64>> {
        jc69_probability(t).iter().map(|r| r.to_vec()).collect()
    }

    /// Leaves 1 and 2 under node 0, one pattern, one category.
    fn cherry(a: usize, b: usize) -> PartialsStore {
        let mut core = PartialsStore::new(3, 3, 1, 4, 1);
        core.set_node_states(1, &[a]);
        core.set_node_states(2, &[b]);
        core.create_node_partials(0);
        core
    }

    #[test]
    fn cherry_with_matrices() {
        let mut core = cherry(0, 2);
        core.set_node_matrix(1, 0, &jc(0.1));
        core.set_node_matrix(2, 0, &jc(0.3));
        core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        let (p1, p2) = (jc69_probability(0.1), jc69_probability(0.3));
        for x in 0..4 {
            let expected = p1[x][0] * p2[x][2];
            assert!((core.node_partials(0)[x] - expected).abs() < 1e-15);
        }
    }

    #[test]
    fn identity_branch_pins_the_state() {
        let mut core = cherry(1, 3);
        core.set_node_matrix(2, 0, &jc(0.5));
        core.calculate_partials((1, Branch::Identity), (2, Branch::Matrix(2)), 0);
        let p = jc69_probability(0.5);
        let partials = core.node_partials(0);
        assert_eq!(partials[0], 0.0);
        assert!((partials[1] - p[1][3]).abs() < 1e-15);
        assert_eq!(partials[2], 0.0);
        assert_eq!(partials[3], 0.0);
    }

    #[test]
    fn internal_child_through_matrix() {
        // node 3 is the parent of cherry node 0 and leaf 4
        let mut core = PartialsStore::new(5, 5, 1, 4, 1);
        core.set_node_states(1, &[0]);
        core.set_node_states(2, &[0]);
        core.set_node_states(4, &[1]);
        core.set_node_matrix(1, 0, &jc(0.2));
        core.set_node_matrix(2, 0, &jc(0.2));
        core.set_node_matrix(0, 0, &jc(0.4));
        core.set_node_matrix(4, 0, &jc(0.6));
        core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        core.calculate_partials((0, Branch::Matrix(0)), (4, Branch::Matrix(4)), 3);

        let (p2, p4, p6) = (jc69_probability(0.2), jc69_probability(0.4), jc69_probability(0.6));
        for x in 0..4 {
            let inner: f64 = (0..4).map(|y| p4[x][y] * p2[y][0] * p2[y][0]).sum();
            let expected = inner * p6[x][1];
            assert!((core.node_partials(3)[x] - expected).abs() < 1e-15);
        }
    }

    #[test]
    fn store_restore_swaps_indices_only() {
        let mut core = cherry(0, 0);
        core.set_node_matrix(1, 0, &jc(0.1));
        core.set_node_matrix(2, 0, &jc(0.1));
        core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        let before = core.node_partials(0).to_vec();

        core.store();
        core.restore();
        assert_eq!(core.node_partials(0), before.as_slice());

        core.store();
        core.set_node_matrix_for_update(1);
        core.set_node_matrix(1, 0, &jc(2.0));
        core.set_node_partials_for_update(0);
        core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        assert_ne!(core.node_partials(0), before.as_slice());
        core.restore();
        assert_eq!(core.node_partials(0), before.as_slice());
    }

    #[test]
    fn repeated_updates_keep_the_stored_buffer() {
        let mut core = cherry(0, 1);
        core.set_node_matrix(1, 0, &jc(0.1));
        core.set_node_matrix(2, 0, &jc(0.1));
        core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        core.store();
        let before = core.node_partials(0).to_vec();
        let stored_matrix = core.node_matrix(1).to_vec();

        for t in [0.7, 1.3] {
            core.set_node_matrix_for_update(1);
            core.set_node_matrix(1, 0, &jc(t));
            core.set_node_partials_for_update(0);
            core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        }
        assert_ne!(core.node_partials(0), before.as_slice());

        core.restore();
        assert_eq!(core.node_partials(0), before.as_slice());
        assert_eq!(core.node_matrix(1), stored_matrix.as_slice());
    }

    #[test]
    fn unstore_discards_updates() {
        let mut core = cherry(0, 1);
        core.set_node_matrix(1, 0, &jc(0.1));
        core.set_node_matrix(2, 0, &jc(0.1));
        core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        core.store();
        let before = core.node_partials(0).to_vec();
        core.set_node_partials_for_update(0);
        core.calculate_partials((1, Branch::Identity), (2, Branch::Identity), 0);
        core.unstore();
        assert_eq!(core.node_partials(0), before.as_slice());
    }

    #[test]
    fn tiny_partials_are_rescaled() {
        let mut core = cherry(0, 0);
        let tiny = vec![vec![1e-60; 4]; 4];
        core.set_node_matrix(1, 0, &tiny);
        core.set_node_matrix(2, 0, &tiny);
        core.set_use_scaling(true);
        core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        // every entry is 1e-120, so the scaled partials are all one
        for &v in core.node_partials(0) {
            assert!((v - 1.0).abs() < 1e-12, "scaled partial {}", v);
        }
        let expected = (1e-120f64).ln();
        assert!((core.log_scaling_factor(0) - expected).abs() < 1e-9);

        core.set_use_scaling(false);
        assert_eq!(core.log_scaling_factor(0), 0.0);
    }

    #[test]
    fn ordinary_partials_are_left_alone() {
        let mut core = cherry(0, 0);
        core.set_node_matrix(1, 0, &jc(0.1));
        core.set_node_matrix(2, 0, &jc(0.1));
        core.set_use_scaling(true);
        core.calculate_partials((1, Branch::Matrix(1)), (2, Branch::Matrix(2)), 0);
        assert_eq!(core.log_scaling_factor(0), 0.0);
    }
}
