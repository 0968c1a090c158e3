//! Quasi-species tree data structures.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<QsNode>` and are
//! referenced by `NodeId` (a `usize` index). Node heights are times before
//! the present, so the root is the highest node.
//!
//! Every leaf is the observed representative of one haplotype. The haplotype
//! is identified by the leaf's `NodeId` and may carry an [`AttachmentTimes`]
//! record listing when its unobserved copies split off; the oldest of those
//! times is where the haplotype starts. Between the leaf and the start the
//! lineage does not change, and the nodes it passes through are annotated
//! with the haplotype (see [`QsTree::assign_haplotype_branches`]).

use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};

use cyanea_core::{CyaneaError, Result, Revertible, Summarizable};

use crate::attachment::AttachmentTimes;

/// Index into the tree's node arena.
pub type NodeId = usize;

/// Haplotype identifier: the id of the leaf that represents it.
pub type HaploId = NodeId;

/// How stale the cached likelihood state of a node is.
///
/// Statuses combine with `|`, which keeps the stalest of the two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UpdateStatus {
    /// Nothing changed.
    #[default]
    Clean,
    /// A height, rate or attachment time changed.
    Dirty,
    /// Structure or data changed; every cached value is invalid.
    Filthy,
}

impl UpdateStatus {
    pub fn is_clean(self) -> bool {
        self == UpdateStatus::Clean
    }
}

impl BitOr for UpdateStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.max(rhs)
    }
}

impl BitOrAssign for UpdateStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

/// A single node in a quasi-species tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QsNode {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes.
    pub children: Vec<NodeId>,
    /// Time before present.
    pub height: f64,
    /// Taxon or clade label.
    pub name: Option<String>,
    /// Haplotype whose start lies on the branch directly above this node.
    pub haplo_above: Option<HaploId>,
    /// Haplotype whose unchanged lineage runs through this node.
    pub continuing: Option<HaploId>,
    /// Staleness flag read by the likelihood engine.
    pub status: UpdateStatus,
}

impl QsNode {
    pub(crate) fn new(id: NodeId, parent: Option<NodeId>, height: f64, name: Option<String>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            height,
            name,
            haplo_above: None,
            continuing: None,
            status: UpdateStatus::Filthy,
        }
    }

    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// True if this node has both parent and children.
    pub fn is_internal(&self) -> bool {
        !self.is_leaf() && !self.is_root()
    }
}

/// A rooted, height-annotated tree with haplotype and incidence records.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QsTree {
    nodes: Vec<QsNode>,
    root: NodeId,
    haplotypes: BTreeMap<HaploId, AttachmentTimes>,
    incidences: Vec<AttachmentTimes>,
    stored_nodes: Vec<QsNode>,
    stored_root: NodeId,
}

impl QsTree {
    /// Create a new tree with a single unnamed root node at `root_height`.
    pub fn new(root_height: f64) -> Self {
        let nodes = vec![QsNode::new(0, None, root_height, None)];
        Self {
            stored_nodes: nodes.clone(),
            nodes,
            root: 0,
            haplotypes: BTreeMap::new(),
            incidences: Vec::new(),
            stored_root: 0,
        }
    }

    /// Create a tree from pre-built nodes and a root index.
    ///
    /// Parent and child links must agree and every child must sit no higher
    /// than its parent.
    pub fn from_nodes(nodes: Vec<QsNode>, root: NodeId) -> Result<Self> {
        if nodes.is_empty() {
            return Err(CyaneaError::InvalidInput("empty node list".into()));
        }
        if root >= nodes.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "root index {} out of range ({})",
                root,
                nodes.len()
            )));
        }
        for (i, node) in nodes.iter().enumerate() {
            if node.id != i {
                return Err(CyaneaError::InvalidTree(format!(
                    "node at index {} carries id {}",
                    i, node.id
                )));
            }
            for &c in &node.children {
                let child = nodes.get(c).ok_or_else(|| {
                    CyaneaError::InvalidTree(format!("child {} of node {} out of range", c, i))
                })?;
                if child.parent != Some(i) {
                    return Err(CyaneaError::InvalidTree(format!(
                        "child {} does not point back to parent {}",
                        c, i
                    )));
                }
                if child.height > node.height {
                    return Err(CyaneaError::InvalidTree(format!(
                        "child {} at height {} is above parent {} at height {}",
                        c, child.height, i, node.height
                    )));
                }
            }
        }
        if nodes[root].parent.is_some() {
            return Err(CyaneaError::InvalidTree(format!(
                "root {} has a parent",
                root
            )));
        }
        Ok(Self {
            stored_nodes: nodes.clone(),
            nodes,
            root,
            haplotypes: BTreeMap::new(),
            incidences: Vec::new(),
            stored_root: root,
        })
    }

    /// Add a child at `height` below `parent` and return its `NodeId`.
    pub fn add_child(&mut self, parent: NodeId, name: Option<String>, height: f64) -> Result<NodeId> {
        let parent_height = self.get_node(parent).map(|p| p.height).ok_or_else(|| {
            CyaneaError::InvalidInput(format!(
                "parent index {} out of range ({})",
                parent,
                self.nodes.len()
            ))
        })?;
        if height > parent_height {
            return Err(CyaneaError::InvalidInput(format!(
                "child height {} is above parent height {}",
                height, parent_height
            )));
        }
        let id = self.nodes.len();
        self.nodes.push(QsNode::new(id, Some(parent), height, name));
        self.nodes[parent].children.push(id);
        self.nodes[parent].status = UpdateStatus::Filthy;
        Ok(id)
    }

    /// Access a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&QsNode> {
        self.nodes.get(id)
    }

    /// Mutable access to a node by id.
    ///
    /// Changes made this way are not flagged; use [`make_dirty`](Self::make_dirty).
    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut QsNode> {
        self.nodes.get_mut(id)
    }

    fn node(&self, id: NodeId) -> Result<&QsNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| CyaneaError::InvalidInput(format!("node id {} out of range", id)))
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// All leaf node ids.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// All internal (non-leaf, non-root) node ids.
    pub fn internal_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_internal())
            .map(|n| n.id)
            .collect()
    }

    /// Sorted list of leaf names (leaves without names are excluded).
    pub fn leaf_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .filter_map(|n| n.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Id of the node labelled `name`, if any.
    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.name.as_deref() == Some(name))
            .map(|n| n.id)
    }

    /// Pre-order (parent before children) traversal yielding node ids.
    pub fn iter_preorder(&self) -> PreorderIter<'_> {
        PreorderIter {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// Post-order (children before parent) traversal yielding node ids.
    pub fn iter_postorder(&self) -> impl Iterator<Item = NodeId> {
        let mut sequence = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            sequence.push(id);
            stack.extend(self.nodes[id].children.iter().copied());
        }
        sequence.into_iter().rev()
    }

    /// Move a node to `height`, flagging it and its children dirty.
    pub fn set_height(&mut self, id: NodeId, height: f64) -> Result<()> {
        let node = self.node(id)?;
        if let Some(p) = node.parent {
            if height > self.nodes[p].height {
                return Err(CyaneaError::InvalidInput(format!(
                    "height {} is above parent height {}",
                    height, self.nodes[p].height
                )));
            }
        }
        if let Some(&c) = node.children.iter().find(|&&c| self.nodes[c].height > height) {
            return Err(CyaneaError::InvalidInput(format!(
                "height {} is below child {} at {}",
                height, c, self.nodes[c].height
            )));
        }
        let children = node.children.clone();
        self.nodes[id].height = height;
        self.nodes[id].status |= UpdateStatus::Dirty;
        for c in children {
            self.nodes[c].status |= UpdateStatus::Dirty;
        }
        Ok(())
    }

    // --- haplotypes ---------------------------------------------------------

    /// Attach an attachment-time record to the haplotype of `leaf`.
    pub fn set_haplotype(&mut self, leaf: HaploId, record: AttachmentTimes) -> Result<()> {
        if !self.node(leaf)?.is_leaf() {
            return Err(CyaneaError::InvalidInput(format!(
                "haplotype id {} is not a leaf",
                leaf
            )));
        }
        self.haplotypes.insert(leaf, record);
        self.nodes[leaf].status = UpdateStatus::Filthy;
        Ok(())
    }

    pub fn haplotype(&self, leaf: HaploId) -> Option<&AttachmentTimes> {
        self.haplotypes.get(&leaf)
    }

    /// Mutable access to a haplotype record.
    ///
    /// Flags the leaf and the node where the haplotype starts dirty, since
    /// both the collapsed duration and the start time may change.
    pub fn haplotype_mut(&mut self, leaf: HaploId) -> Option<&mut AttachmentTimes> {
        if self.haplotypes.contains_key(&leaf) {
            let top = self.haplotype_top(leaf);
            self.nodes[leaf].status |= UpdateStatus::Dirty;
            self.nodes[top].status |= UpdateStatus::Dirty;
        }
        self.haplotypes.get_mut(&leaf)
    }

    /// Iterate over all haplotype records keyed by leaf id.
    pub fn haplotypes(&self) -> impl Iterator<Item = (HaploId, &AttachmentTimes)> {
        self.haplotypes.iter().map(|(&h, rec)| (h, rec))
    }

    /// Height at which the haplotype of `leaf` starts: its oldest
    /// attachment time, or the leaf height when it has no copies.
    pub fn haplotype_start(&self, leaf: HaploId) -> f64 {
        let leaf_height = self.nodes.get(leaf).map_or(0.0, |n| n.height);
        self.haplotypes
            .get(&leaf)
            .and_then(|rec| rec.last())
            .map_or(leaf_height, |t| t.max(leaf_height))
    }

    /// Top-most node the haplotype of `leaf` passes through.
    fn haplotype_top(&self, leaf: HaploId) -> NodeId {
        let mut cur = leaf;
        while let Some(p) = self.nodes[cur].parent {
            if self.nodes[cur].haplo_above == Some(leaf) || self.nodes[p].continuing != Some(leaf) {
                break;
            }
            cur = p;
        }
        cur
    }

    /// Recompute `haplo_above`/`continuing` on every node from the
    /// haplotype records.
    ///
    /// Each haplotype climbs from its leaf while the parent is younger than
    /// the haplotype start. Every visited node continues the haplotype; the
    /// top-most one also has it starting above. Haplotype records get the
    /// height of the first node above the start as their ancestor bound.
    pub fn assign_haplotype_branches(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.haplo_above = None;
            node.continuing = None;
        }
        for leaf in self.leaves() {
            let start = self.haplotype_start(leaf);
            let mut cur = leaf;
            loop {
                if let Some(other) = self.nodes[cur].continuing {
                    return Err(CyaneaError::InvalidTree(format!(
                        "node {} is claimed by haplotypes {} and {}",
                        cur, other, leaf
                    )));
                }
                self.nodes[cur].continuing = Some(leaf);
                match self.nodes[cur].parent {
                    Some(p) if self.nodes[p].height < start => cur = p,
                    _ => break,
                }
            }
            self.nodes[cur].haplo_above = Some(leaf);
            let bound = self.nodes[cur]
                .parent
                .map_or(f64::INFINITY, |p| self.nodes[p].height);
            if let Some(rec) = self.haplotypes.get_mut(&leaf) {
                rec.set_ancestor_bound(bound)?;
            }
        }
        for node in &mut self.nodes {
            node.status = UpdateStatus::Filthy;
        }
        Ok(())
    }

    /// Total time the haplotype of `leaf` spends unchanged: the sum over its
    /// attachment times of the time elapsed since the leaf.
    pub fn total_branch_duration(&self, leaf: HaploId) -> f64 {
        let leaf_height = self.nodes.get(leaf).map_or(0.0, |n| n.height);
        self.haplotypes
            .get(&leaf)
            .map_or(0.0, |rec| rec.times().iter().map(|t| t - leaf_height).sum())
    }

    /// Length of the branch above `id` that evolves freely: zero when the
    /// branch lies inside a haplotype or starts one, and for the root.
    pub fn length_without_haplo(&self, id: NodeId) -> f64 {
        let Some(node) = self.nodes.get(id) else {
            return 0.0;
        };
        if node.haplo_above.is_some() || node.continuing.is_some() {
            return 0.0;
        }
        node.parent
            .map_or(0.0, |p| self.nodes[p].height - node.height)
    }

    /// Check the haplotype annotations where the children of `id` meet.
    ///
    /// Each internal node has exactly two children. A child that starts a
    /// haplotype also continues it, and that haplotype cannot continue
    /// through the parent. Any other child may only continue the parent's
    /// haplotype, and a parent continuing a haplotype passes it to exactly
    /// one child. Leaves always continue their own haplotype.
    pub fn validate_junction(&self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        if node.is_leaf() {
            if node.continuing != Some(id) {
                return Err(CyaneaError::InvalidTree(format!(
                    "leaf {} does not carry its own haplotype (continuing {:?})",
                    id, node.continuing
                )));
            }
            return Ok(());
        }
        if node.children.len() != 2 {
            return Err(CyaneaError::InvalidTree(format!(
                "node {} has {} children, expected 2",
                id,
                node.children.len()
            )));
        }
        let mut carriers = 0;
        for &c in &node.children {
            let child = &self.nodes[c];
            match child.haplo_above {
                Some(h) => {
                    if child.continuing != Some(h) {
                        return Err(CyaneaError::InvalidTree(format!(
                            "node {} starts haplotype {} but continues {:?}",
                            c, h, child.continuing
                        )));
                    }
                    if node.continuing == Some(h) {
                        return Err(CyaneaError::InvalidTree(format!(
                            "haplotype {} starts above node {} but also continues through parent {}",
                            h, c, id
                        )));
                    }
                }
                None => {
                    if child.continuing.is_some() && child.continuing != node.continuing {
                        return Err(CyaneaError::InvalidTree(format!(
                            "node {} continues haplotype {:?} but parent {} carries {:?}",
                            c, child.continuing, id, node.continuing
                        )));
                    }
                    if child.continuing.is_some() {
                        carriers += 1;
                    }
                }
            }
        }
        if node.continuing.is_some() && carriers != 1 {
            return Err(CyaneaError::InvalidTree(format!(
                "haplotype {:?} continues into {} children of node {}",
                node.continuing, carriers, id
            )));
        }
        Ok(())
    }

    // --- dirty flags --------------------------------------------------------

    pub fn status(&self, id: NodeId) -> UpdateStatus {
        self.nodes.get(id).map_or(UpdateStatus::Clean, |n| n.status)
    }

    /// Raise the staleness of one node.
    pub fn make_dirty(&mut self, id: NodeId, status: UpdateStatus) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status |= status;
        }
    }

    /// Raise the staleness of every node.
    pub fn make_all_dirty(&mut self, status: UpdateStatus) {
        for node in &mut self.nodes {
            node.status |= status;
        }
    }

    /// True when any node or record changed since the last [`mark_clean`](Self::mark_clean).
    pub fn something_is_dirty(&self) -> bool {
        self.nodes.iter().any(|n| !n.status.is_clean())
            || self.haplotypes.values().any(|r| r.changed())
            || self.incidences.iter().any(|r| r.changed())
    }

    /// Clear every staleness flag, typically after an accepted move.
    pub fn mark_clean(&mut self) {
        for node in &mut self.nodes {
            node.status = UpdateStatus::Clean;
        }
        for rec in self.haplotypes.values_mut() {
            rec.take_changed();
        }
        for rec in &mut self.incidences {
            rec.take_changed();
        }
    }

    // --- incidences ---------------------------------------------------------

    /// Register an unsequenced incidence and return its index.
    pub fn add_incidence(&mut self, record: AttachmentTimes) -> usize {
        self.incidences.push(record);
        self.incidences.len() - 1
    }

    pub fn incidences(&self) -> &[AttachmentTimes] {
        &self.incidences
    }

    pub fn incidences_mut(&mut self) -> &mut [AttachmentTimes] {
        &mut self.incidences
    }

    /// Fill every incidence up to its count with times bounded by `lower_bound`.
    pub fn generate_incidence_times(&mut self, lower_bound: f64) -> Result<()> {
        for rec in &mut self.incidences {
            rec.generate_attachment_times(lower_bound)?;
        }
        Ok(())
    }

    /// Parse a Newick format string into a tree.
    pub fn from_newick(input: &str) -> Result<Self> {
        crate::newick::parse(input)
    }

    /// Serialize the tree to a Newick format string.
    pub fn to_newick(&self) -> String {
        crate::newick::write(self)
    }
}

impl Revertible for QsTree {
    fn store(&mut self) {
        self.stored_nodes.clone_from(&self.nodes);
        self.stored_root = self.root;
        for rec in self.haplotypes.values_mut() {
            rec.store();
        }
        for rec in &mut self.incidences {
            rec.store();
        }
    }

    fn restore(&mut self) {
        std::mem::swap(&mut self.nodes, &mut self.stored_nodes);
        std::mem::swap(&mut self.root, &mut self.stored_root);
        for rec in self.haplotypes.values_mut() {
            rec.restore();
        }
        for rec in &mut self.incidences {
            rec.restore();
        }
        for node in &mut self.nodes {
            node.status = UpdateStatus::Clean;
        }
    }
}

impl Summarizable for QsTree {
    fn summary(&self) -> String {
        let leaves = self.leaf_count();
        format!(
            "QsTree: {} nodes ({} leaves), {} haplotype records, {} incidences",
            self.node_count(),
            leaves,
            self.haplotypes.len(),
            self.incidences.len()
        )
    }
}

/// Pre-order iterator over node ids.
pub struct PreorderIter<'a> {
    tree: &'a QsTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        // Push children in reverse order so leftmost is visited first.
        for &child in self.tree.nodes[id].children.iter().rev() {
            self.stack.push(child);
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ((A:1,B:1)AB:1,C:2)root; with A carrying [0.3, 0.5] and C [0.7].
    fn sample_tree() -> QsTree {
        let mut tree = QsTree::new(2.0);
        tree.get_node_mut(0).unwrap().name = Some("root".into());
        let ab = tree.add_child(0, Some("AB".into()), 1.0).unwrap();
        let a = tree.add_child(ab, Some("A".into()), 0.0).unwrap();
        tree.add_child(ab, Some("B".into()), 0.0).unwrap();
        let c = tree.add_child(0, Some("C".into()), 0.0).unwrap();
        tree.set_haplotype(a, AttachmentTimes::with_times(0.0, vec![0.3, 0.5]).unwrap())
            .unwrap();
        tree.set_haplotype(c, AttachmentTimes::with_times(0.0, vec![0.7]).unwrap())
            .unwrap();
        tree.assign_haplotype_branches().unwrap();
        tree
    }

    #[test]
    fn status_combines_to_stalest() {
        use UpdateStatus::*;
        assert_eq!(Clean | Dirty, Dirty);
        assert_eq!(Filthy | Dirty, Filthy);
        assert_eq!(Clean | Clean, Clean);
        let mut s = Dirty;
        s |= Clean;
        assert_eq!(s, Dirty);
        assert!(Clean < Dirty && Dirty < Filthy);
    }

    #[test]
    fn add_child_rejects_bad_input() {
        let mut tree = QsTree::new(1.0);
        assert!(tree.add_child(99, None, 0.0).is_err());
        assert!(tree.add_child(0, None, 2.0).is_err());
    }

    #[test]
    fn leaf_and_internal_counts() {
        let tree = sample_tree();
        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.leaf_count(), 3);
        assert_eq!(tree.internal_nodes(), vec![1]);
        assert_eq!(tree.leaf_names(), vec!["A", "B", "C"]);
        assert_eq!(tree.node_by_name("C"), Some(4));
    }

    #[test]
    fn traversal_orders() {
        let tree = sample_tree();
        let pre: Vec<NodeId> = tree.iter_preorder().collect();
        assert_eq!(pre, vec![0, 1, 2, 3, 4]);
        let post: Vec<NodeId> = tree.iter_postorder().collect();
        assert_eq!(post, vec![2, 3, 1, 4, 0]);
    }

    #[test]
    fn haplotype_starts_directly_above_leaves() {
        let tree = sample_tree();
        for leaf in tree.leaves() {
            let node = tree.get_node(leaf).unwrap();
            assert_eq!(node.haplo_above, Some(leaf), "leaf {}", leaf);
            assert_eq!(node.continuing, Some(leaf), "leaf {}", leaf);
        }
        assert_eq!(tree.get_node(1).unwrap().continuing, None);
        assert_eq!(tree.haplotype_start(2), 0.5);
        assert_eq!(tree.haplotype_start(3), 0.0);
        assert_eq!(tree.haplotype(2).unwrap().ancestor_bound(), 1.0);
        assert_eq!(tree.haplotype(4).unwrap().ancestor_bound(), 2.0);
    }

    #[test]
    fn haplotype_passing_through_internal_node() {
        // A's copies go back to 1.5, above AB at 1.0
        let mut tree = sample_tree();
        tree.haplotype_mut(2)
            .unwrap()
            .set_times(vec![0.3, 1.5])
            .unwrap_err();
        tree.haplotype_mut(2).unwrap().set_ancestor_bound(2.0).unwrap();
        tree.haplotype_mut(2).unwrap().set_times(vec![0.3, 1.5]).unwrap();
        tree.assign_haplotype_branches().unwrap();

        let a = tree.get_node(2).unwrap();
        assert_eq!(a.haplo_above, None);
        assert_eq!(a.continuing, Some(2));
        let ab = tree.get_node(1).unwrap();
        assert_eq!(ab.haplo_above, Some(2));
        assert_eq!(ab.continuing, Some(2));
        assert_eq!(tree.length_without_haplo(1), 0.0);
        for id in 0..tree.node_count() {
            tree.validate_junction(id).unwrap();
        }
    }

    #[test]
    fn conflicting_haplotypes_are_rejected() {
        // A and B both claim AB
        let mut tree = sample_tree();
        let a = tree.haplotype_mut(2).unwrap();
        a.set_ancestor_bound(f64::INFINITY).unwrap();
        a.set_times(vec![1.5]).unwrap();
        tree.set_haplotype(3, AttachmentTimes::with_times(0.0, vec![1.5]).unwrap())
            .unwrap();
        let err = tree.assign_haplotype_branches().unwrap_err();
        assert!(matches!(err, CyaneaError::InvalidTree(_)), "{}", err);
    }

    #[test]
    fn durations() {
        let tree = sample_tree();
        assert!((tree.total_branch_duration(2) - 0.8).abs() < 1e-12);
        assert_eq!(tree.total_branch_duration(3), 0.0);
        assert!((tree.total_branch_duration(4) - 0.7).abs() < 1e-12);
        assert_eq!(tree.length_without_haplo(0), 0.0);
        assert_eq!(tree.length_without_haplo(1), 1.0);
        assert_eq!(tree.length_without_haplo(2), 0.0);
    }

    #[test]
    fn junction_checks() {
        let mut tree = sample_tree();
        for id in 0..tree.node_count() {
            tree.validate_junction(id).unwrap();
        }

        tree.get_node_mut(1).unwrap().continuing = Some(4);
        let err = tree.validate_junction(1).unwrap_err();
        assert!(matches!(err, CyaneaError::InvalidTree(_)));

        let mut tree = sample_tree();
        tree.get_node_mut(3).unwrap().continuing = None;
        assert!(tree.validate_junction(3).is_err());

        let mut tree = sample_tree();
        tree.get_node_mut(3).unwrap().continuing = Some(2);
        assert!(tree.validate_junction(1).is_err());
    }

    #[test]
    fn set_height_flags_children() {
        let mut tree = sample_tree();
        tree.mark_clean();
        assert!(!tree.something_is_dirty());
        tree.set_height(1, 1.2).unwrap();
        assert_eq!(tree.status(1), UpdateStatus::Dirty);
        assert_eq!(tree.status(2), UpdateStatus::Dirty);
        assert_eq!(tree.status(3), UpdateStatus::Dirty);
        assert_eq!(tree.status(4), UpdateStatus::Clean);
        assert!(tree.set_height(1, 2.5).is_err());
    }

    #[test]
    fn haplotype_mut_flags_leaf_and_start() {
        let mut tree = sample_tree();
        tree.mark_clean();
        tree.haplotype_mut(4).unwrap();
        assert_eq!(tree.status(4), UpdateStatus::Dirty);
        assert_eq!(tree.status(2), UpdateStatus::Clean);
    }

    #[test]
    fn store_restore_round_trip() {
        let mut tree = sample_tree();
        tree.add_incidence(AttachmentTimes::with_times(4.0, vec![5.0]).unwrap());
        tree.mark_clean();
        tree.store();
        let heights: Vec<f64> = (0..5).map(|i| tree.get_node(i).unwrap().height).collect();

        tree.set_height(1, 1.5).unwrap();
        tree.haplotype_mut(2).unwrap().set_times(vec![0.1]).unwrap();
        tree.incidences_mut()[0].set_times(vec![6.0]).unwrap();
        tree.restore();

        let after: Vec<f64> = (0..5).map(|i| tree.get_node(i).unwrap().height).collect();
        assert_eq!(heights, after);
        assert_eq!(tree.haplotype(2).unwrap().times(), &[0.3, 0.5]);
        assert_eq!(tree.incidences()[0].times(), &[5.0]);
        assert!(!tree.something_is_dirty());
    }

    #[test]
    fn incidence_generation() {
        let mut tree = sample_tree();
        tree.add_incidence(AttachmentTimes::new(4.0, 3).unwrap());
        tree.generate_incidence_times(7.0).unwrap();
        let times = tree.incidences()[0].times();
        assert_eq!(times.len(), 3);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert!(times.iter().all(|&t| t > 4.0 && t < 7.0));
    }

    #[test]
    fn from_nodes_validates_links() {
        let mut nodes = vec![QsNode::new(0, None, 1.0, None), QsNode::new(1, Some(0), 0.0, None)];
        nodes[0].children.push(1);
        assert!(QsTree::from_nodes(nodes.clone(), 0).is_ok());
        nodes[1].parent = None;
        assert!(QsTree::from_nodes(nodes, 0).is_err());
        assert!(QsTree::from_nodes(Vec::new(), 0).is_err());
    }

    #[test]
    fn summary_format() {
        let tree = sample_tree();
        assert_eq!(
            tree.summary(),
            "QsTree: 5 nodes (3 leaves), 2 haplotype records, 0 incidences"
        );
    }
}
