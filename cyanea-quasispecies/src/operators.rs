//! Metropolis-Hastings moves on attachment-time records.
//!
//! Each operator picks one record uniformly from the slice it is handed,
//! perturbs it in place and returns the log Hastings ratio. `-inf` asks the
//! driver to reject; an empty slice is a no-op with ratio `0.0`. Callers
//! checkpoint the records with [`Revertible::store`](cyanea_core::Revertible)
//! before proposing and restore them on rejection.

use rand::{Rng, RngCore};
use tracing::trace;

use crate::attachment::AttachmentTimes;
use cyanea_core::{CyaneaError, Result};

/// Upper limit on redraws when a uniform draw hits an existing time.
const MAX_REDRAWS: usize = 64;

/// A randomized move on attachment-time records.
pub trait AttachmentOperator {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Perturb one record and return the log Hastings ratio.
    fn propose(&self, records: &mut [AttachmentTimes], rng: &mut dyn RngCore) -> f64;
}

fn pick_record<'a>(
    records: &'a mut [AttachmentTimes],
    rng: &mut dyn RngCore,
) -> Option<&'a mut AttachmentTimes> {
    if records.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..records.len());
    records.get_mut(idx)
}

/// Neighbours of `index`, clamped at the list ends.
fn neighbour_interval(times: &[f64], index: usize) -> (f64, f64) {
    let lo = if index == 0 { 0 } else { index - 1 };
    let hi = if index + 1 == times.len() { index } else { index + 1 };
    (times[lo], times[hi])
}

/// Move one time into the gap between two other consecutive times.
///
/// The gap's lower end is drawn uniformly among all times except the moved
/// one; a draw that lands on an existing time is recentred on the gap's
/// midpoint. The ratio compares the new gap width with the width between the
/// moved time's old neighbours.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomReattach;

impl AttachmentOperator for RandomReattach {
    fn name(&self) -> &'static str {
        "random-reattach"
    }

    fn propose(&self, records: &mut [AttachmentTimes], rng: &mut dyn RngCore) -> f64 {
        let Some(rec) = pick_record(records, rng) else {
            return 0.0;
        };
        let n = rec.len();
        if n < 2 {
            trace!(times = n, "random-reattach: no interval to draw from");
            return f64::NEG_INFINITY;
        }
        let picked = rng.gen_range(0..n);

        // lower-bound candidates are 0..n-1 minus the picked index
        let candidates = n - 1 - usize::from(picked < n - 1);
        if candidates == 0 {
            trace!(picked, "random-reattach: no lower-bound candidate");
            return f64::NEG_INFINITY;
        }
        let mut m = rng.gen_range(0..candidates);
        if m >= picked {
            m += 1;
        }

        let times = rec.times();
        let (t_min, t_max) = (times[m], times[m + 1]);
        let (old_min, old_max) = neighbour_interval(times, picked);

        let mut new_time = rng.gen_range(t_min..t_max);
        if times.contains(&new_time) {
            new_time = 0.5 * (t_min + t_max);
        }

        rec.move_time(picked, new_time);
        (t_max - t_min).ln() - (old_max - old_min).ln()
    }
}

/// Redraw one time uniformly between its sorted neighbours.
///
/// The interval is fixed by the neighbours, which the move does not touch, so
/// the proposal is symmetric and the ratio is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalUniform;

impl AttachmentOperator for LocalUniform {
    fn name(&self) -> &'static str {
        "local-uniform"
    }

    fn propose(&self, records: &mut [AttachmentTimes], rng: &mut dyn RngCore) -> f64 {
        let Some(rec) = pick_record(records, rng) else {
            return 0.0;
        };
        let n = rec.len();
        if n < 2 {
            trace!(times = n, "local-uniform: no neighbour interval");
            return f64::NEG_INFINITY;
        }
        let picked = rng.gen_range(0..n);
        let (lo, hi) = neighbour_interval(rec.times(), picked);

        for _ in 0..MAX_REDRAWS {
            let candidate = rng.gen_range(lo..hi);
            if !rec.times().contains(&candidate) {
                rec.move_time(picked, candidate);
                return 0.0;
            }
        }
        trace!(lo, hi, "local-uniform: every redraw collided");
        f64::NEG_INFINITY
    }
}

/// Scale every time of one record by a common factor.
#[derive(Debug, Clone, Copy)]
pub struct AffineScale {
    scale_factor: f64,
}

impl AffineScale {
    /// `scale_factor` bounds the draw: `f = u·s + (1 − u)/s`, `u ~ U[0, 1)`.
    pub fn new(scale_factor: f64) -> Result<Self> {
        if !(scale_factor.is_finite() && scale_factor > 0.0) {
            return Err(CyaneaError::InvalidInput(format!(
                "scale factor must be positive and finite, got {}",
                scale_factor
            )));
        }
        Ok(Self { scale_factor })
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Apply a given factor to one record.
    ///
    /// Returns `-inf` without touching the record when the scaled times would
    /// leave the record's open window, otherwise `n · ln f`.
    pub fn propose_with_factor(&self, rec: &mut AttachmentTimes, factor: f64) -> f64 {
        let (Some(first), Some(last)) = (rec.first(), rec.last()) else {
            trace!("affine-scale: record has no times");
            return f64::NEG_INFINITY;
        };
        let (lo, hi) = rec.window();
        if first * factor <= lo || last * factor >= hi {
            return f64::NEG_INFINITY;
        }
        rec.scale_times(factor);
        rec.len() as f64 * factor.ln()
    }
}

impl AttachmentOperator for AffineScale {
    fn name(&self) -> &'static str {
        "affine-scale"
    }

    fn propose(&self, records: &mut [AttachmentTimes], rng: &mut dyn RngCore) -> f64 {
        let Some(rec) = pick_record(records, rng) else {
            return 0.0;
        };
        let u: f64 = rng.gen();
        let s = self.scale_factor;
        let factor = u * s + (1.0 - u) / s;
        self.propose_with_factor(rec, factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn record(sampling: f64, bound: f64, times: &[f64]) -> AttachmentTimes {
        let mut rec = AttachmentTimes::new(sampling, times.len()).unwrap();
        rec.set_ancestor_bound(bound).unwrap();
        rec.set_times(times.to_vec()).unwrap();
        rec
    }

    fn strictly_ascending(times: &[f64]) -> bool {
        times.windows(2).all(|w| w[0] < w[1])
    }

    #[test]
    fn empty_slice_is_neutral() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut records: Vec<AttachmentTimes> = Vec::new();
        assert_eq!(RandomReattach.propose(&mut records, &mut rng), 0.0);
        assert_eq!(LocalUniform.propose(&mut records, &mut rng), 0.0);
        let scale = AffineScale::new(0.8).unwrap();
        assert_eq!(scale.propose(&mut records, &mut rng), 0.0);
    }

    #[test]
    fn single_time_record_rejects() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut records = vec![record(0.0, 10.0, &[3.0])];
        let r = RandomReattach.propose(&mut records, &mut rng);
        assert!(r == f64::NEG_INFINITY || r == 0.0, "ratio {}", r);
        let r = LocalUniform.propose(&mut records, &mut rng);
        assert!(r == f64::NEG_INFINITY || r == 0.0, "ratio {}", r);
        assert_eq!(records[0].times(), &[3.0]);
    }

    #[test]
    fn two_time_record_last_picked_moves_into_gap() {
        // whatever is picked, the only lower bound candidate is index 0
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let mut records = vec![record(0.0, 10.0, &[2.0, 6.0])];
            let r = RandomReattach.propose(&mut records, &mut rng);
            let times = records[0].times();
            if r.is_finite() {
                assert!(strictly_ascending(times));
                assert!(times.iter().all(|&t| (2.0..=6.0).contains(&t)));
                assert!(r.abs() < 1e-12, "same gap both ways, ratio {}", r);
            } else {
                assert_eq!(times, &[2.0, 6.0]);
            }
        }
    }

    #[test]
    fn random_reattach_ratio_uses_both_intervals() {
        let mut rng = StdRng::seed_from_u64(4);
        let original = [1.0, 2.0, 4.0, 8.0];
        for _ in 0..50 {
            let mut records = vec![record(0.0, 10.0, &original)];
            let r = RandomReattach.propose(&mut records, &mut rng);
            assert!(r.is_finite());
            let (old, new) = records[0].last_change().unwrap();
            let idx = original.iter().position(|&t| t == old).unwrap();
            let (olo, ohi) = neighbour_interval(&original, idx);
            let gap = original
                .windows(2)
                .find(|w| w[0] <= new && new <= w[1])
                .unwrap();
            let expected = (gap[1] - gap[0]).ln() - (ohi - olo).ln();
            assert!((r - expected).abs() < 1e-12, "ratio {} vs {}", r, expected);
            assert!(strictly_ascending(records[0].times()));
        }
    }

    #[test]
    fn local_uniform_stays_between_neighbours() {
        let mut rng = StdRng::seed_from_u64(5);
        let original = [1.0, 3.0, 5.0];
        for _ in 0..50 {
            let mut records = vec![record(0.0, 10.0, &original)];
            let r = LocalUniform.propose(&mut records, &mut rng);
            assert_eq!(r, 0.0);
            let (old, new) = records[0].last_change().unwrap();
            let idx = original.iter().position(|&t| t == old).unwrap();
            let (lo, hi) = neighbour_interval(&original, idx);
            assert!(new >= lo && new < hi, "{} not in [{}, {})", new, lo, hi);
            assert!(strictly_ascending(records[0].times()));
        }
    }

    #[test]
    fn affine_scale_boundary() {
        let scale = AffineScale::new(0.8).unwrap();

        let mut rec = record(10.0, 0.0, &[2.0, 5.0, 8.0]);
        assert_eq!(scale.propose_with_factor(&mut rec, 1.25), f64::NEG_INFINITY);
        assert_eq!(rec.times(), &[2.0, 5.0, 8.0]);

        let r = scale.propose_with_factor(&mut rec, 1.2);
        assert!((r - 3.0 * 1.2f64.ln()).abs() < 1e-12, "ratio {}", r);
        assert!((rec.times()[2] - 9.6).abs() < 1e-12);
    }

    #[test]
    fn affine_scale_rejects_below_lower_edge() {
        let scale = AffineScale::new(0.5).unwrap();
        let mut rec = record(1.0, 20.0, &[2.0, 5.0]);
        assert_eq!(scale.propose_with_factor(&mut rec, 0.5), f64::NEG_INFINITY);
        let r = scale.propose_with_factor(&mut rec, 0.75);
        assert!((r - 2.0 * 0.75f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn affine_scale_factor_validation() {
        assert!(AffineScale::new(0.0).is_err());
        assert!(AffineScale::new(-1.0).is_err());
        assert!(AffineScale::new(f64::NAN).is_err());
        assert_eq!(AffineScale::new(0.75).unwrap().scale_factor(), 0.75);
    }

    #[test]
    fn operator_names() {
        assert_eq!(RandomReattach.name(), "random-reattach");
        assert_eq!(LocalUniform.name(), "local-uniform");
        assert_eq!(AffineScale::new(0.9).unwrap().name(), "affine-scale");
    }
}
