//! Log-probabilities that collapsed leaves never change.
//!
//! A haplotype leaf stands for several identical sequences. Instead of a
//! transition matrix per copy, the engine records for each leaf the log of
//! the probability that its observed state stays put over the whole
//! collapsed duration, per category and pattern. The contributions of all
//! leaves are summed at the root.

use cyanea_core::Revertible;

use crate::tree::NodeId;

/// Two `[category][pattern]` buffers per leaf plus an active index.
#[derive(Debug, Clone)]
pub struct LeafScaleCache {
    n_categories: usize,
    n_patterns: usize,
    leaves: Vec<NodeId>,
    buffers: Vec<[Vec<f64>; 2]>,
    active: Vec<usize>,
    stored_active: Vec<usize>,
    /// Set once a leaf has moved off its stored buffer.
    flipped: Vec<bool>,
}

impl LeafScaleCache {
    pub fn new(n_nodes: usize, leaves: &[NodeId], n_categories: usize, n_patterns: usize) -> Self {
        let mut buffers = vec![[Vec::new(), Vec::new()]; n_nodes];
        for &leaf in leaves {
            let len = n_categories * n_patterns;
            buffers[leaf] = [vec![0.0; len], vec![0.0; len]];
        }
        Self {
            n_categories,
            n_patterns,
            leaves: leaves.to_vec(),
            buffers,
            active: vec![0; n_nodes],
            stored_active: vec![0; n_nodes],
            flipped: vec![false; n_nodes],
        }
    }

    /// Write new values for `leaf`. The first write after a store goes to the
    /// inactive buffer, which then becomes active; later writes reuse it.
    ///
    /// `log_probs` is laid out `[category][state]`; `states` holds the leaf's
    /// observed state per pattern.
    pub fn record(&mut self, leaf: NodeId, log_probs: &[f64], states: &[usize]) {
        let n_states = log_probs.len() / self.n_categories.max(1);
        if !self.flipped[leaf] {
            self.active[leaf] = 1 - self.active[leaf];
            self.flipped[leaf] = true;
        }
        let buf = &mut self.buffers[leaf][self.active[leaf]];
        for cat in 0..self.n_categories {
            let row = &log_probs[cat * n_states..(cat + 1) * n_states];
            let out = &mut buf[cat * self.n_patterns..(cat + 1) * self.n_patterns];
            for (v, &s) in out.iter_mut().zip(states) {
                *v = row.get(s).copied().unwrap_or(0.0);
            }
        }
    }

    /// The active buffer of one leaf.
    pub fn values(&self, leaf: NodeId) -> &[f64] {
        &self.buffers[leaf][self.active[leaf]]
    }

    /// Sum of all leaves' active buffers into `out` (`[category][pattern]`).
    pub fn accumulate(&self, out: &mut [f64]) {
        out.iter_mut().for_each(|v| *v = 0.0);
        for &leaf in &self.leaves {
            for (acc, v) in out.iter_mut().zip(self.values(leaf)) {
                *acc += v;
            }
        }
    }
}

impl Revertible for LeafScaleCache {
    fn store(&mut self) {
        self.stored_active.copy_from_slice(&self.active);
        self.flipped.iter_mut().for_each(|f| *f = false);
    }

    fn restore(&mut self) {
        std::mem::swap(&mut self.active, &mut self.stored_active);
        self.flipped.iter_mut().for_each(|f| *f = false);
    }
}
