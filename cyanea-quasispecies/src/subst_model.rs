//! Substitution models consumed by the likelihood engine.
//!
//! A model supplies transition probability matrices for an elapsed
//! (rate-scaled) time, its equilibrium frequencies, and the diagonal of its
//! rate matrix. The diagonal gives the instantaneous rate of leaving each
//! state, which the engine uses to score lineages that never change.

use cyanea_core::{ArithmeticFailure, CyaneaError, Result};

/// Trait for substitution models of any state count.
pub trait SubstitutionModel {
    /// Number of character states (4 for DNA).
    fn n_states(&self) -> usize;

    /// Equilibrium frequencies, one per state.
    fn frequencies(&self) -> &[f64];

    /// Instantaneous rate matrix Q (N x N).
    fn rate_matrix(&self) -> Vec<Vec<f64>>;

    /// Transition probability matrix P(t) = exp(Qt) for branch length t.
    fn transition_probs(&self, t: f64) -> Vec<Vec<f64>>;

    /// Number of free parameters in the model (excludes branch lengths).
    fn n_free_params(&self) -> usize;

    /// `P(t)` with the arithmetic checked.
    ///
    /// Fails when `t` is negative or not finite, or when any entry of the
    /// result is not finite.
    fn checked_transition_probs(&self, t: f64) -> std::result::Result<Vec<Vec<f64>>, ArithmeticFailure> {
        if !t.is_finite() || t < 0.0 {
            return Err(ArithmeticFailure::new(format!(
                "transition probabilities requested for time {}",
                t
            )));
        }
        let p = self.transition_probs(t);
        if p.iter().flatten().any(|x| !x.is_finite()) {
            return Err(ArithmeticFailure::new(format!(
                "non-finite transition probability at time {}",
                t
            )));
        }
        Ok(p)
    }

    /// Diagonal of Q: the (negative) rate of leaving each state.
    fn no_change_rates(&self) -> Vec<f64> {
        self.rate_matrix()
            .iter()
            .enumerate()
            .map(|(i, row)| row[i])
            .collect()
    }
}

/// JC69 transition probability matrix for a given branch length `t`.
///
/// - P(same) = 1/4 + 3/4 * e^{-4t/3}
/// - P(diff) = 1/4 - 1/4 * e^{-4t/3}
pub fn jc69_probability(t: f64) -> [[f64; 4]; 4] {
    let e = (-4.0 * t / 3.0).exp();
    let p_same = 0.25 + 0.75 * e;
    let p_diff = 0.25 - 0.25 * e;

    [
        [p_same, p_diff, p_diff, p_diff],
        [p_diff, p_same, p_diff, p_diff],
        [p_diff, p_diff, p_same, p_diff],
        [p_diff, p_diff, p_diff, p_same],
    ]
}

/// Jukes-Cantor model: equal frequencies, one rate, normalised to mean rate 1.
#[derive(Debug, Clone)]
pub struct Jc69Model {
    freqs: [f64; 4],
}

impl Jc69Model {
    pub fn new() -> Self {
        Self { freqs: [0.25; 4] }
    }
}

impl Default for Jc69Model {
    fn default() -> Self {
        Self::new()
    }
}

impl SubstitutionModel for Jc69Model {
    fn n_states(&self) -> usize {
        4
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn rate_matrix(&self) -> Vec<Vec<f64>> {
        (0..4)
            .map(|i| {
                (0..4)
                    .map(|j| if i == j { -1.0 } else { 1.0 / 3.0 })
                    .collect()
            })
            .collect()
    }

    fn transition_probs(&self, t: f64) -> Vec<Vec<f64>> {
        jc69_probability(t).iter().map(|row| row.to_vec()).collect()
    }

    fn n_free_params(&self) -> usize {
        0
    }

    fn no_change_rates(&self) -> Vec<f64> {
        vec![-1.0; 4]
    }
}

/// General time-reversible nucleotide model.
///
/// Exchangeabilities are given in the order AC, AG, AT, CG, CT, GT. The rate
/// matrix is normalised to one expected substitution per unit time and its
/// eigensystem is cached until a parameter changes.
#[derive(Debug, Clone)]
pub struct GtrModel {
    rates: [f64; 6],
    freqs: [f64; 4],
    q: Vec<Vec<f64>>,
    eigenvalues: Vec<f64>,
    eigenvectors: Vec<Vec<f64>>,
    sqrt_pi: Vec<f64>,
}

impl GtrModel {
    pub fn new(rates: [f64; 6], freqs: [f64; 4]) -> Result<Self> {
        validate_rates(&rates)?;
        validate_frequencies(&freqs)?;
        let mut model = Self {
            rates,
            freqs,
            q: Vec::new(),
            eigenvalues: Vec::new(),
            eigenvectors: Vec::new(),
            sqrt_pi: Vec::new(),
        };
        model.update();
        Ok(model)
    }

    /// HKY85: transitions (AG, CT) at rate `kappa`, transversions at 1.
    pub fn hky85(kappa: f64, freqs: [f64; 4]) -> Result<Self> {
        Self::new([1.0, kappa, 1.0, 1.0, kappa, 1.0], freqs)
    }

    pub fn rates(&self) -> &[f64; 6] {
        &self.rates
    }

    pub fn set_rates(&mut self, rates: [f64; 6]) -> Result<()> {
        validate_rates(&rates)?;
        self.rates = rates;
        self.update();
        Ok(())
    }

    pub fn set_frequencies(&mut self, freqs: [f64; 4]) -> Result<()> {
        validate_frequencies(&freqs)?;
        self.freqs = freqs;
        self.update();
        Ok(())
    }

    fn update(&mut self) {
        let [ac, ag, at, cg, ct, gt] = self.rates;
        let s = vec![
            vec![0.0, ac, ag, at],
            vec![ac, 0.0, cg, ct],
            vec![ag, cg, 0.0, gt],
            vec![at, ct, gt, 0.0],
        ];
        self.q = build_rate_matrix(&s, &self.freqs);
        self.sqrt_pi = self.freqs.iter().map(|f| f.sqrt()).collect();

        // B = diag(sqrt(pi)) * Q * diag(1/sqrt(pi)) is symmetric
        let n = self.freqs.len();
        let mut b = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                b[i][j] = self.sqrt_pi[i] * self.q[i][j] / self.sqrt_pi[j];
            }
        }
        let (values, vectors) = eigen_decompose(&b);
        self.eigenvalues = values;
        self.eigenvectors = vectors;
    }
}

impl SubstitutionModel for GtrModel {
    fn n_states(&self) -> usize {
        4
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn rate_matrix(&self) -> Vec<Vec<f64>> {
        self.q.clone()
    }

    /// P(t) = diag(1/sqrt(pi)) * U * exp(Lambda*t) * U^T * diag(sqrt(pi))
    fn transition_probs(&self, t: f64) -> Vec<Vec<f64>> {
        let n = self.eigenvalues.len();
        let exp_lt: Vec<f64> = self.eigenvalues.iter().map(|l| (l * t).exp()).collect();
        let u = &self.eigenvectors;
        let mut p = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                let sum: f64 = (0..n).map(|k| u[i][k] * exp_lt[k] * u[j][k]).sum();
                p[i][j] = (sum * self.sqrt_pi[j] / self.sqrt_pi[i]).max(0.0);
            }
        }
        p
    }

    fn n_free_params(&self) -> usize {
        // 5 rate ratios (6 rates, 1 fixed) + 3 free frequencies
        8
    }
}

fn validate_rates(rates: &[f64; 6]) -> Result<()> {
    if rates.iter().any(|&r| !(r.is_finite() && r > 0.0)) {
        return Err(CyaneaError::InvalidInput(format!(
            "exchangeabilities must be positive, got {:?}",
            rates
        )));
    }
    Ok(())
}

fn validate_frequencies(freqs: &[f64; 4]) -> Result<()> {
    let sum: f64 = freqs.iter().sum();
    if freqs.iter().any(|&f| !(f > 0.0)) || (sum - 1.0).abs() > 1e-6 {
        return Err(CyaneaError::InvalidInput(format!(
            "frequencies must be positive and sum to 1, got {:?}",
            freqs
        )));
    }
    Ok(())
}

/// Jacobi eigendecomposition of a real symmetric matrix.
///
/// Returns (eigenvalues, eigenvectors) where eigenvectors\[i\]\[k\] is the
/// i-th component of the k-th eigenvector.
fn eigen_decompose(matrix: &[Vec<f64>]) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = matrix.len();
    let mut a: Vec<Vec<f64>> = matrix.to_vec();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for _ in 0..200 {
        let mut max_val = 0.0f64;
        let (mut p, mut q) = (0, 1);
        for i in 0..n {
            for j in (i + 1)..n {
                if a[i][j].abs() > max_val {
                    max_val = a[i][j].abs();
                    p = i;
                    q = j;
                }
            }
        }
        if max_val < 1e-15 {
            break;
        }

        let theta = if (a[p][p] - a[q][q]).abs() < 1e-30 {
            std::f64::consts::FRAC_PI_4
        } else {
            0.5 * (2.0 * a[p][q] / (a[p][p] - a[q][q])).atan()
        };
        let (s, c) = theta.sin_cos();

        // A <- R^T A R, columns then rows
        for row in a.iter_mut() {
            let (xp, xq) = (row[p], row[q]);
            row[p] = c * xp + s * xq;
            row[q] = -s * xp + c * xq;
        }
        for j in 0..n {
            let (xp, xq) = (a[p][j], a[q][j]);
            a[p][j] = c * xp + s * xq;
            a[q][j] = -s * xp + c * xq;
        }
        a[p][q] = 0.0;
        a[q][p] = 0.0;

        for row in v.iter_mut() {
            let (xp, xq) = (row[p], row[q]);
            row[p] = c * xp + s * xq;
            row[q] = -s * xp + c * xq;
        }
    }

    let eigenvalues = (0..n).map(|i| a[i][i]).collect();
    (eigenvalues, v)
}

/// Q\[i\]\[j\] = S\[i\]\[j\] * pi\[j\] for i != j, rows sum to 0,
/// normalized so -sum(pi_i * Q_ii) = 1.
fn build_rate_matrix(exchangeabilities: &[Vec<f64>], freqs: &[f64]) -> Vec<Vec<f64>> {
    let n = freqs.len();
    let mut q = vec![vec![0.0; n]; n];

    for i in 0..n {
        for j in 0..n {
            if i != j {
                q[i][j] = exchangeabilities[i][j] * freqs[j];
            }
        }
        let off_diag: f64 = (0..n).filter(|&j| j != i).map(|j| q[i][j]).sum();
        q[i][i] = -off_diag;
    }

    let mu: f64 = (0..n).map(|i| -freqs[i] * q[i][i]).sum();
    if mu > 0.0 {
        for row in q.iter_mut() {
            for x in row.iter_mut() {
                *x /= mu;
            }
        }
    }
    q
}
