//! Tree likelihood for quasi-species trees.
//!
//! Felsenstein peeling over a [`QsTree`], with two twists:
//!
//! - A haplotype leaf collapses several identical sequences. Its branch
//!   contributes only the log-probability that the observed state never
//!   changes over the summed attachment durations, kept in a
//!   [`LeafScaleCache`] and folded back in at the root for every rate
//!   category after the first.
//! - The branch above the node where a haplotype starts is split at the
//!   start. Only the segment above the split evolves freely; its matrix is
//!   kept in a slot addressed by the haplotype, not the node.
//!
//! Work is skipped for subtrees whose nodes are clean and whose branch
//! lengths are unchanged. [`store`](Revertible::store) and
//! [`restore`](Revertible::restore) flip buffer indices only.

use tracing::{debug, trace, warn};

use crate::leaf_scale::LeafScaleCache;
use crate::partials::{Branch, PartialsStore};
use crate::patterns::Patterns;
use crate::site_model::{BranchId, BranchRateModel, SiteModel};
use crate::subst_model::SubstitutionModel;
use crate::tree::{HaploId, NodeId, QsNode, QsTree, UpdateStatus};
use cyanea_core::{ArithmeticFailure, CyaneaError, Result, Revertible, Summarizable};

/// Initial value of the adaptive scale factor.
const INITIAL_SCALE_FACTOR: f64 = 1.01;
/// The scale factor stops growing past this value.
const MAX_SCALE_FACTOR: f64 = 10.0;

/// When partial likelihoods are rescaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Scaling {
    /// Never rescale.
    None,
    /// Rescale from the first evaluation.
    Always,
    /// Turn rescaling on once the likelihood underflows.
    #[default]
    Default,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LikelihoodConfig {
    pub scaling: Scaling,
    /// Branch length times rate differences up to this value count as unchanged.
    pub tolerance: f64,
    /// Root state prior; the substitution model's frequencies when unset.
    pub root_frequencies: Option<Vec<f64>>,
    /// Evaluations with scaling on after which the scaling policy is consulted.
    pub scaling_check_interval: usize,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            scaling: Scaling::Default,
            tolerance: 0.0,
            root_frequencies: None,
            scaling_check_interval: 100,
        }
    }
}

/// Why a traversal stopped early.
#[derive(Debug)]
enum EvalError {
    /// The state is impossible; reported as `-inf`.
    Arithmetic(ArithmeticFailure),
    Fatal(CyaneaError),
}

impl From<ArithmeticFailure> for EvalError {
    fn from(e: ArithmeticFailure) -> Self {
        EvalError::Arithmetic(e)
    }
}

impl From<CyaneaError> for EvalError {
    fn from(e: CyaneaError) -> Self {
        EvalError::Fatal(e)
    }
}

type Eval<T> = std::result::Result<T, EvalError>;

/// Likelihood of fixed-state site patterns on a quasi-species tree.
pub struct QsTreeLikelihood {
    patterns: Patterns,
    subst_model: Box<dyn SubstitutionModel>,
    site_model: Box<dyn SiteModel>,
    branch_rates: Box<dyn BranchRateModel>,
    config: LikelihoodConfig,

    n_nodes: usize,
    n_states: usize,
    n_categories: usize,
    n_patterns: usize,
    /// Alignment row of each leaf.
    leaf_taxa: Vec<Option<usize>>,
    constant_patterns: Vec<usize>,

    core: PartialsStore,
    leaf_scale: LeafScaleCache,

    /// Branch length times rate last used per matrix slot; `n_nodes + h`
    /// holds the upper segment of haplotype `h`.
    branch_lengths: Vec<f64>,
    stored_branch_lengths: Vec<f64>,
    no_change_rates: Vec<f64>,
    stored_no_change_rates: Vec<f64>,
    /// `[category][pattern]`
    accumulated_leaf_scale: Vec<f64>,
    stored_accumulated_leaf_scale: Vec<f64>,
    /// `[pattern][state]`
    root_partials: Vec<f64>,
    stored_root_partials: Vec<f64>,
    pattern_log_likelihoods: Vec<f64>,
    stored_pattern_log_likelihoods: Vec<f64>,
    log_p: f64,
    stored_log_p: f64,

    /// `[category][state]` scratch for leaf no-change log-probabilities.
    log_probabilities: Vec<f64>,
    /// Staleness that applies to every node, e.g. after a model change.
    pending: UpdateStatus,
    model_changed: bool,
    scale_factor: f64,
    evaluations_since_scaling: usize,
}

impl QsTreeLikelihood {
    /// Set up an engine for `tree`'s shape and the given data and models.
    ///
    /// Leaves are matched to alignment rows by name. The alignment may hold
    /// more taxa than the tree has leaves.
    pub fn new(
        tree: &QsTree,
        patterns: Patterns,
        subst_model: Box<dyn SubstitutionModel>,
        site_model: Box<dyn SiteModel>,
        branch_rates: Box<dyn BranchRateModel>,
        config: LikelihoodConfig,
    ) -> Result<Self> {
        if !site_model.integrate_across_categories() {
            return Err(CyaneaError::Unsupported(
                "site categories must be integrated over".into(),
            ));
        }
        let leaves = tree.leaves();
        if leaves.len() < 2 {
            return Err(CyaneaError::InvalidTree(format!(
                "need at least 2 leaves, tree has {}",
                leaves.len()
            )));
        }
        let n_states = subst_model.n_states();
        if n_states != patterns.n_states() {
            return Err(CyaneaError::InvalidInput(format!(
                "substitution model has {} states, patterns have {}",
                n_states,
                patterns.n_states()
            )));
        }
        if let Some(freqs) = &config.root_frequencies {
            if freqs.len() != n_states {
                return Err(CyaneaError::InvalidInput(format!(
                    "expected {} root frequencies, got {}",
                    n_states,
                    freqs.len()
                )));
            }
        }
        let n_categories = site_model.category_count();
        if n_categories == 0 {
            return Err(CyaneaError::InvalidInput("site model has no rate categories".into()));
        }

        let n_nodes = tree.node_count();
        let n_patterns = patterns.pattern_count();
        let mut leaf_taxa = vec![None; n_nodes];
        let mut core = PartialsStore::new(n_nodes, 2 * n_nodes, n_patterns, n_states, n_categories);
        for &leaf in &leaves {
            let name = tree
                .get_node(leaf)
                .and_then(|n| n.name.as_deref())
                .ok_or_else(|| CyaneaError::InvalidTree(format!("leaf {} has no name", leaf)))?;
            let taxon = patterns.taxon_index(name).ok_or_else(|| {
                CyaneaError::InvalidInput(format!("could not find sequence {} in the alignment", name))
            })?;
            core.set_node_states(leaf, patterns.taxon_states(taxon));
            leaf_taxa[leaf] = Some(taxon);
        }
        for id in tree.internal_nodes().into_iter().chain(std::iter::once(tree.root())) {
            core.create_node_partials(id);
        }
        if config.scaling == Scaling::Always {
            core.set_use_scaling(true);
        }

        let leaf_rows: Vec<usize> = leaf_taxa.iter().flatten().copied().collect();
        let constant_patterns = patterns.constant_pattern_indices(&leaf_rows);
        let no_change_rates = subst_model.no_change_rates();

        debug!(
            nodes = n_nodes,
            patterns = n_patterns,
            states = n_states,
            categories = n_categories,
            core = "peeling",
            "quasi-species tree likelihood initialised"
        );

        Ok(Self {
            leaf_scale: LeafScaleCache::new(n_nodes, &leaves, n_categories, n_patterns),
            patterns,
            subst_model,
            site_model,
            branch_rates,
            config,
            n_nodes,
            n_states,
            n_categories,
            n_patterns,
            leaf_taxa,
            constant_patterns,
            core,
            branch_lengths: vec![f64::NAN; 2 * n_nodes],
            stored_branch_lengths: vec![f64::NAN; 2 * n_nodes],
            stored_no_change_rates: no_change_rates.clone(),
            no_change_rates,
            accumulated_leaf_scale: vec![0.0; n_categories * n_patterns],
            stored_accumulated_leaf_scale: vec![0.0; n_categories * n_patterns],
            root_partials: vec![0.0; n_patterns * n_states],
            stored_root_partials: vec![0.0; n_patterns * n_states],
            pattern_log_likelihoods: vec![0.0; n_patterns],
            stored_pattern_log_likelihoods: vec![0.0; n_patterns],
            log_p: f64::NEG_INFINITY,
            stored_log_p: f64::NEG_INFINITY,
            log_probabilities: vec![0.0; n_categories * n_states],
            pending: UpdateStatus::Filthy,
            model_changed: false,
            scale_factor: INITIAL_SCALE_FACTOR,
            evaluations_since_scaling: 0,
        })
    }

    /// Log-likelihood of the patterns on `tree`.
    ///
    /// Only stale parts of the tree are recomputed. An arithmetically
    /// impossible state gives `-inf`; a tree whose haplotype annotations
    /// are inconsistent is an error.
    pub fn evaluate(&mut self, tree: &QsTree) -> Result<f64> {
        if tree.node_count() != self.n_nodes {
            return Err(CyaneaError::InvalidTree(format!(
                "engine was built for {} nodes, tree has {}",
                self.n_nodes,
                tree.node_count()
            )));
        }
        if self.model_changed {
            self.no_change_rates = self.subst_model.no_change_rates();
            self.model_changed = false;
        }

        match self.traverse(tree, tree.root()) {
            Ok(status) => {
                if !status.is_clean() {
                    self.calculate_log_p(tree.root());
                }
            }
            Err(EvalError::Arithmetic(e)) => {
                trace!(error = %e, "likelihood evaluation hit an impossible state");
                self.log_p = f64::NEG_INFINITY;
                return Ok(self.log_p);
            }
            Err(EvalError::Fatal(e)) => return Err(e),
        }

        self.evaluations_since_scaling += 1;
        if self.log_p > 0.0
            || (self.core.use_scaling()
                && self.evaluations_since_scaling > self.config.scaling_check_interval)
        {
            // scaling stays as it is
            trace!(log_p = self.log_p, "scaling policy consulted");
        } else if self.log_p == f64::NEG_INFINITY
            && self.scale_factor < MAX_SCALE_FACTOR
            && self.config.scaling != Scaling::None
        {
            self.evaluations_since_scaling = 0;
            self.scale_factor *= INITIAL_SCALE_FACTOR;
            warn!(
                scale_factor = self.scale_factor,
                "turning on scaling to prevent numeric instability"
            );
            self.core.set_use_scaling(true);
            self.core.unstore();
            self.pending = UpdateStatus::Filthy;
            match self.traverse(tree, tree.root()) {
                Ok(_) => self.calculate_log_p(tree.root()),
                Err(EvalError::Arithmetic(e)) => {
                    trace!(error = %e, "likelihood evaluation hit an impossible state");
                    self.log_p = f64::NEG_INFINITY;
                    return Ok(self.log_p);
                }
                Err(EvalError::Fatal(e)) => return Err(e),
            }
        }

        self.pending = UpdateStatus::Clean;
        Ok(self.log_p)
    }

    /// Visit `id` and its subtree, refreshing stale matrices and partials.
    /// Returns how stale the subtree was.
    fn traverse(&mut self, tree: &QsTree, id: NodeId) -> Eval<UpdateStatus> {
        tree.validate_junction(id)?;
        let node = tree
            .get_node(id)
            .ok_or_else(|| CyaneaError::InvalidTree(format!("node {} not in tree", id)))?;
        let mut update = node.status | self.pending;
        let parent_height = node.parent.and_then(|p| tree.get_node(p)).map(|p| p.height);
        let branch_rate = self.branch_rates.rate_for_branch(BranchId::Node(id));

        if let Some(h) = node.haplo_above {
            update |= self.update_haplo_segment(tree, h, parent_height, update)?;
        }

        if node.is_leaf() {
            update |= self.update_leaf(tree, id, branch_rate, update)?;
            return Ok(update);
        }

        // a lineage that carries a haplotype reaches its parent through the
        // haplotype's segment or unchanged, never through its own slot
        if parent_height.is_some() && node.haplo_above.is_none() && node.continuing.is_none() {
            let duration = tree.length_without_haplo(id);
            let branch_time = duration * branch_rate;
            if !update.is_clean() || self.branch_changed(id, branch_time) {
                self.branch_lengths[id] = branch_time;
                self.core.set_node_matrix_for_update(id);
                for cat in 0..self.n_categories {
                    let joint = self.site_model.rate_for_category(cat, BranchId::Node(id)) * branch_rate;
                    let p = self.subst_model.checked_transition_probs(duration * joint)?;
                    self.core.set_node_matrix(id, cat, &p);
                }
                update |= UpdateStatus::Dirty;
            }
        }

        let (child1, child2) = match node.children.as_slice() {
            &[a, b] => (a, b),
            other => {
                return Err(CyaneaError::InvalidTree(format!(
                    "node {} has {} children, expected 2",
                    id,
                    other.len()
                ))
                .into())
            }
        };
        let update1 = self.traverse(tree, child1)?;
        let update2 = self.traverse(tree, child2)?;

        if !(update | update1 | update2).is_clean() {
            update |= update1 | update2;
            self.core.set_node_partials_for_update(id);
            let b1 = self.branch_to_parent(tree, child1)?;
            let b2 = self.branch_to_parent(tree, child2)?;
            self.core.calculate_partials((child1, b1), (child2, b2), id);
        }
        Ok(update)
    }

    /// Refresh the matrices of the segment between haplotype `h`'s start
    /// and the node above it.
    fn update_haplo_segment(
        &mut self,
        tree: &QsTree,
        h: HaploId,
        parent_height: Option<f64>,
        update: UpdateStatus,
    ) -> Eval<UpdateStatus> {
        let slot = self.n_nodes + h;
        let branch = BranchId::HaploStart(h);
        let (rate, duration) = match parent_height {
            Some(ph) => (self.branch_rates.rate_for_branch(branch), ph - tree.haplotype_start(h)),
            None => (1.0, 0.0),
        };
        let branch_time = duration * rate;
        if update.is_clean() && !self.branch_changed(slot, branch_time) {
            return Ok(UpdateStatus::Clean);
        }
        self.branch_lengths[slot] = branch_time;
        self.core.set_node_matrix_for_update(slot);
        for cat in 0..self.n_categories {
            let joint = self.site_model.rate_for_category(cat, branch) * rate;
            let p = self.subst_model.checked_transition_probs(duration * joint)?;
            self.core.set_node_matrix(slot, cat, &p);
        }
        Ok(UpdateStatus::Dirty)
    }

    /// Refresh the no-change log-probabilities of a collapsed leaf.
    fn update_leaf(
        &mut self,
        tree: &QsTree,
        id: NodeId,
        branch_rate: f64,
        update: UpdateStatus,
    ) -> Eval<UpdateStatus> {
        let taxon = self.leaf_taxa[id].ok_or_else(|| {
            CyaneaError::InvalidTree(format!("leaf {} is not mapped to an alignment row", id))
        })?;
        let states = self.patterns.taxon_states(taxon);
        if update >= UpdateStatus::Filthy {
            self.core.set_node_states(id, states);
        }

        let duration = tree.total_branch_duration(id);
        let branch_time = duration * branch_rate;
        if update.is_clean() && !self.branch_changed(id, branch_time) {
            return Ok(UpdateStatus::Clean);
        }
        self.branch_lengths[id] = branch_time;
        let s = self.n_states;
        for cat in 0..self.n_categories {
            let joint = self.site_model.rate_for_category(cat, BranchId::Node(id)) * branch_rate;
            for (state, &q) in self.no_change_rates.iter().enumerate() {
                self.log_probabilities[cat * s + state] = duration * joint * q;
            }
        }
        self.leaf_scale.record(id, &self.log_probabilities, states);
        Ok(UpdateStatus::Dirty)
    }

    /// How the partials of `child` travel up to its parent.
    fn branch_to_parent(&self, tree: &QsTree, child: NodeId) -> Eval<Branch> {
        let node: &QsNode = tree
            .get_node(child)
            .ok_or_else(|| CyaneaError::InvalidTree(format!("node {} not in tree", child)))?;
        Ok(match (node.haplo_above, node.continuing) {
            (Some(h), _) => Branch::Matrix(self.n_nodes + h),
            (None, Some(_)) => Branch::Identity,
            (None, None) => Branch::Matrix(child),
        })
    }

    fn branch_changed(&self, slot: usize, branch_time: f64) -> bool {
        let old = self.branch_lengths[slot];
        old.is_nan() || (branch_time - old).abs() > self.config.tolerance
    }

    /// Integrate the root partials into per-pattern and total log-likelihoods.
    fn calculate_log_p(&mut self, root: NodeId) {
        self.leaf_scale.accumulate(&mut self.accumulated_leaf_scale);

        let (s, p) = (self.n_states, self.n_patterns);
        let proportions = self.site_model.category_proportions(BranchId::Node(root));
        let partials = self.core.node_partials(root);
        self.root_partials.iter_mut().for_each(|v| *v = 0.0);
        for (cat, &prop) in proportions.iter().enumerate().take(self.n_categories) {
            for pattern in 0..p {
                let w = if cat == 0 {
                    prop
                } else {
                    prop * self.accumulated_leaf_scale[cat * p + pattern].exp()
                };
                let base = (cat * p + pattern) * s;
                for x in 0..s {
                    self.root_partials[pattern * s + x] += w * partials[base + x];
                }
            }
        }

        let p_inv = self.site_model.proportion_invariant();
        if p_inv > 0.0 {
            for &i in &self.constant_patterns {
                self.root_partials[i] += p_inv;
            }
        }

        let freqs = self
            .config
            .root_frequencies
            .as_deref()
            .unwrap_or_else(|| self.subst_model.frequencies());
        for pattern in 0..p {
            let sum: f64 = self.root_partials[pattern * s..(pattern + 1) * s]
                .iter()
                .zip(freqs)
                .map(|(a, f)| a * f)
                .sum();
            self.pattern_log_likelihoods[pattern] = sum.ln() + self.core.log_scaling_factor(pattern);
        }

        let correction = self.patterns.ascertainment_correction(&self.pattern_log_likelihoods);
        let log_p: f64 = self
            .patterns
            .weights()
            .iter()
            .zip(&self.pattern_log_likelihoods)
            .filter(|&(&w, _)| w > 0.0)
            .map(|(w, ll)| w * (ll - correction))
            .sum();
        self.log_p = if log_p.is_nan() { f64::NEG_INFINITY } else { log_p };
    }

    /// Log-likelihood from the last evaluation.
    pub fn log_likelihood(&self) -> f64 {
        self.log_p
    }

    /// True when the next evaluation has work to do.
    pub fn is_dirty(&self, tree: &QsTree) -> bool {
        !self.pending.is_clean() || self.model_changed || tree.something_is_dirty()
    }

    /// Per-pattern log-likelihoods from the last evaluation, before the
    /// ascertainment correction.
    pub fn pattern_log_likelihoods(&self) -> &[f64] {
        &self.pattern_log_likelihoods
    }

    /// Category-integrated root partials (`[pattern][state]`), before the
    /// root frequencies are applied.
    pub fn root_partials(&self) -> &[f64] {
        &self.root_partials
    }

    pub fn patterns(&self) -> &Patterns {
        &self.patterns
    }

    pub fn config(&self) -> &LikelihoodConfig {
        &self.config
    }

    /// Current adaptive scale factor; grows each time an underflow turns
    /// scaling on.
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn uses_scaling(&self) -> bool {
        self.core.use_scaling()
    }

    pub fn substitution_model(&self) -> &dyn SubstitutionModel {
        self.subst_model.as_ref()
    }

    /// Mutable access to the substitution model. Every branch is
    /// recomputed on the next evaluation.
    pub fn substitution_model_mut(&mut self) -> &mut dyn SubstitutionModel {
        self.model_changed = true;
        self.pending |= UpdateStatus::Dirty;
        self.subst_model.as_mut()
    }

    pub fn site_model(&self) -> &dyn SiteModel {
        self.site_model.as_ref()
    }

    pub fn site_model_mut(&mut self) -> &mut dyn SiteModel {
        self.pending |= UpdateStatus::Dirty;
        self.site_model.as_mut()
    }

    pub fn branch_rates(&self) -> &dyn BranchRateModel {
        self.branch_rates.as_ref()
    }

    pub fn branch_rates_mut(&mut self) -> &mut dyn BranchRateModel {
        self.pending |= UpdateStatus::Dirty;
        self.branch_rates.as_mut()
    }

    /// Force a full recomputation, leaf states included.
    pub fn mark_data_changed(&mut self) {
        self.pending = UpdateStatus::Filthy;
    }
}

impl Revertible for QsTreeLikelihood {
    fn store(&mut self) {
        self.core.store();
        self.leaf_scale.store();
        self.stored_branch_lengths.copy_from_slice(&self.branch_lengths);
        self.stored_no_change_rates.clone_from(&self.no_change_rates);
        self.stored_accumulated_leaf_scale
            .copy_from_slice(&self.accumulated_leaf_scale);
        self.stored_root_partials.copy_from_slice(&self.root_partials);
        self.stored_pattern_log_likelihoods
            .copy_from_slice(&self.pattern_log_likelihoods);
        self.stored_log_p = self.log_p;
    }

    fn restore(&mut self) {
        self.core.restore();
        self.leaf_scale.restore();
        std::mem::swap(&mut self.branch_lengths, &mut self.stored_branch_lengths);
        std::mem::swap(&mut self.no_change_rates, &mut self.stored_no_change_rates);
        std::mem::swap(
            &mut self.accumulated_leaf_scale,
            &mut self.stored_accumulated_leaf_scale,
        );
        std::mem::swap(&mut self.root_partials, &mut self.stored_root_partials);
        std::mem::swap(
            &mut self.pattern_log_likelihoods,
            &mut self.stored_pattern_log_likelihoods,
        );
        std::mem::swap(&mut self.log_p, &mut self.stored_log_p);
        self.pending = UpdateStatus::Clean;
    }
}

impl Summarizable for QsTreeLikelihood {
    fn summary(&self) -> String {
        format!(
            "QsTreeLikelihood: {} nodes, {} patterns, {} states, {} categories, log P = {}",
            self.n_nodes, self.n_patterns, self.n_states, self.n_categories, self.log_p
        )
    }
}
