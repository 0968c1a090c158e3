//! Quasi-species phylogenetics for the Cyanea bioinformatics ecosystem.
//!
//! Computes the likelihood of an alignment on a tree where identical
//! sequences are collapsed into one haplotype leaf plus a list of attachment
//! times, and provides the MCMC moves that perturb those times.
//!
//! # Quick start
//!
//! ```
//! use cyanea_quasispecies::{
//!     AttachmentTimes, GammaSiteModel, Jc69Model, LikelihoodConfig, Patterns, QsTree,
//!     QsTreeLikelihood, StrictClock,
//! };
//!
//! let mut tree = QsTree::from_newick("((A:1,B:1):1,C:2);").unwrap();
//! let a = tree.node_by_name("A").unwrap();
//! tree.set_haplotype(a, AttachmentTimes::with_times(0.0, vec![0.5]).unwrap())
//!     .unwrap();
//! tree.assign_haplotype_branches().unwrap();
//!
//! let patterns =
//!     Patterns::from_nucleotides(&["A", "B", "C"], &[b"ACGT", b"ACGA", b"TCGA"]).unwrap();
//! let mut lik = QsTreeLikelihood::new(
//!     &tree,
//!     patterns,
//!     Box::new(Jc69Model::new()),
//!     Box::new(GammaSiteModel::uniform()),
//!     Box::new(StrictClock::default()),
//!     LikelihoodConfig::default(),
//! )
//! .unwrap();
//! let log_p = lik.evaluate(&tree).unwrap();
//! assert!(log_p < 0.0);
//! ```

pub mod attachment;
pub mod leaf_scale;
pub mod likelihood;
pub mod newick;
pub mod operators;
pub mod partials;
pub mod patterns;
pub mod site_model;
pub mod subst_model;
pub mod tree;

pub use attachment::AttachmentTimes;
pub use likelihood::{LikelihoodConfig, QsTreeLikelihood, Scaling};
pub use operators::{AffineScale, AttachmentOperator, LocalUniform, RandomReattach};
pub use patterns::Patterns;
pub use site_model::{
    BranchId, BranchRateModel, GammaSiteModel, PerBranchRates, SiteModel, StrictClock,
};
pub use subst_model::{GtrModel, Jc69Model, SubstitutionModel};
pub use tree::{HaploId, NodeId, QsNode, QsTree, UpdateStatus};
