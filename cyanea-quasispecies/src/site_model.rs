//! Rate heterogeneity across sites and across branches.
//!
//! A [`SiteModel`] splits sites into rate categories with mixing
//! proportions and an optional invariant fraction. A [`BranchRateModel`]
//! scales time on each branch (a clock). The engine multiplies the two to get
//! the joint rate of a category on a branch.

use statrs::distribution::{ContinuousCDF, Gamma};

use crate::tree::{HaploId, NodeId};
use cyanea_core::{CyaneaError, Result};

/// A branch the engine asks rates for.
///
/// The branch above a node is split when a haplotype starts on it; the part
/// above the start is addressed separately so relaxed clocks can give it its
/// own rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BranchId {
    /// The freely evolving branch above a node.
    Node(NodeId),
    /// The segment between a haplotype's start and the node above it.
    HaploStart(HaploId),
}

/// Per-site rate categories.
pub trait SiteModel {
    /// Number of rate categories.
    fn category_count(&self) -> usize;

    /// Relative rate of `category` on `branch`.
    fn rate_for_category(&self, category: usize, branch: BranchId) -> f64;

    /// Mixing proportions of the categories; with invariant sites they sum
    /// to `1 - proportion_invariant()`.
    fn category_proportions(&self, branch: BranchId) -> &[f64];

    /// Fraction of sites that never change.
    fn proportion_invariant(&self) -> f64;

    /// Whether site likelihoods are integrated over categories. Per-site
    /// category assignment is not supported by the engine.
    fn integrate_across_categories(&self) -> bool {
        true
    }
}

/// Discrete-gamma rate heterogeneity with an optional invariant fraction.
///
/// Category rates are the medians of `k` equal-probability slices of a
/// mean-one gamma distribution, rescaled so the mean rate over all sites,
/// invariant ones included, is one.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GammaSiteModel {
    shape: Option<f64>,
    proportion_invariant: f64,
    rates: Vec<f64>,
    proportions: Vec<f64>,
}

impl GammaSiteModel {
    /// A single category at rate one and no invariant sites.
    pub fn uniform() -> Self {
        Self {
            shape: None,
            proportion_invariant: 0.0,
            rates: vec![1.0],
            proportions: vec![1.0],
        }
    }

    /// `categories` gamma categories with shape `shape`.
    pub fn gamma(categories: usize, shape: f64) -> Result<Self> {
        Self::new(categories, Some(shape), 0.0)
    }

    /// General constructor. `shape = None` gives a single category.
    pub fn new(categories: usize, shape: Option<f64>, proportion_invariant: f64) -> Result<Self> {
        if categories == 0 {
            return Err(CyaneaError::InvalidInput(
                "at least one rate category is required".into(),
            ));
        }
        if !(0.0..1.0).contains(&proportion_invariant) {
            return Err(CyaneaError::InvalidInput(format!(
                "proportion invariant must lie in [0, 1), got {}",
                proportion_invariant
            )));
        }
        let raw = match shape {
            Some(alpha) if categories > 1 => gamma_category_rates(alpha, categories)?,
            Some(alpha) if !(alpha.is_finite() && alpha > 0.0) => {
                return Err(CyaneaError::InvalidInput(format!(
                    "gamma shape must be positive, got {}",
                    alpha
                )))
            }
            _ => vec![1.0],
        };
        let k = raw.len();
        let keep = 1.0 - proportion_invariant;
        Ok(Self {
            shape,
            proportion_invariant,
            rates: raw.iter().map(|r| r / keep).collect(),
            proportions: vec![keep / k as f64; k],
        })
    }

    pub fn shape(&self) -> Option<f64> {
        self.shape
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }
}

impl Default for GammaSiteModel {
    fn default() -> Self {
        Self::uniform()
    }
}

impl SiteModel for GammaSiteModel {
    fn category_count(&self) -> usize {
        self.rates.len()
    }

    fn rate_for_category(&self, category: usize, _branch: BranchId) -> f64 {
        self.rates.get(category).copied().unwrap_or(0.0)
    }

    fn category_proportions(&self, _branch: BranchId) -> &[f64] {
        &self.proportions
    }

    fn proportion_invariant(&self) -> f64 {
        self.proportion_invariant
    }
}

/// Median rates of `k` equal-probability gamma categories, mean one.
fn gamma_category_rates(alpha: f64, k: usize) -> Result<Vec<f64>> {
    let dist = Gamma::new(alpha, alpha).map_err(|e| {
        CyaneaError::InvalidInput(format!("gamma shape must be positive, got {}: {}", alpha, e))
    })?;
    let mut rates: Vec<f64> = (0..k)
        .map(|i| gamma_quantile(&dist, (2 * i + 1) as f64 / (2 * k) as f64))
        .collect();
    let mean = rates.iter().sum::<f64>() / k as f64;
    if !(mean.is_finite() && mean > 0.0) {
        return Err(CyaneaError::InvalidInput(format!(
            "gamma shape {} gives degenerate category rates",
            alpha
        )));
    }
    for r in &mut rates {
        *r /= mean;
    }
    Ok(rates)
}

/// Bisection on the CDF. statrs 0.16's default `inverse_cdf` stops after
/// 16 halvings of a fixed bracket, too coarse for small shapes.
fn gamma_quantile(dist: &Gamma, p: f64) -> f64 {
    let mut hi = 1.0;
    while dist.cdf(hi) < p && hi < 1e300 {
        hi *= 2.0;
    }
    let mut lo = 0.0;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if dist.cdf(mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-15 * hi {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Rate of evolution along a branch.
pub trait BranchRateModel {
    fn rate_for_branch(&self, branch: BranchId) -> f64;
}

/// One rate for every branch.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StrictClock {
    rate: f64,
}

impl StrictClock {
    pub fn new(rate: f64) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(CyaneaError::InvalidInput(format!(
                "clock rate must be positive, got {}",
                rate
            )));
        }
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for StrictClock {
    fn default() -> Self {
        Self { rate: 1.0 }
    }
}

impl BranchRateModel for StrictClock {
    fn rate_for_branch(&self, _branch: BranchId) -> f64 {
        self.rate
    }
}

/// Independent rates per branch; unset branches use a default rate.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PerBranchRates {
    default_rate: f64,
    node_rates: Vec<Option<f64>>,
    haplo_rates: Vec<Option<f64>>,
}

impl PerBranchRates {
    pub fn new(default_rate: f64) -> Self {
        Self {
            default_rate,
            node_rates: Vec::new(),
            haplo_rates: Vec::new(),
        }
    }

    pub fn set_rate(&mut self, branch: BranchId, rate: f64) -> Result<()> {
        if !(rate.is_finite() && rate >= 0.0) {
            return Err(CyaneaError::InvalidInput(format!(
                "branch rate must be non-negative, got {}",
                rate
            )));
        }
        let (slots, idx) = match branch {
            BranchId::Node(id) => (&mut self.node_rates, id),
            BranchId::HaploStart(h) => (&mut self.haplo_rates, h),
        };
        if slots.len() <= idx {
            slots.resize(idx + 1, None);
        }
        slots[idx] = Some(rate);
        Ok(())
    }
}

impl BranchRateModel for PerBranchRates {
    fn rate_for_branch(&self, branch: BranchId) -> f64 {
        let slot = match branch {
            BranchId::Node(id) => self.node_rates.get(id),
            BranchId::HaploStart(h) => self.haplo_rates.get(h),
        };
        slot.copied().flatten().unwrap_or(self.default_rate)
    }
}
