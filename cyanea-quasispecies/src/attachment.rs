//! Attachment-time records for haplotypes and unsequenced incidences.
//!
//! A record owns a strictly ascending list of continuous times lying inside
//! the open window spanned by its sampling time and its ancestor bound. The
//! window is orientation-agnostic: heights (sampling time below the bound) and
//! forward times (sampling time above the bound) are both accepted.

use cyanea_core::{CyaneaError, Result, Revertible, Summarizable};

/// The sorted attachment times of one haplotype or incidence.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttachmentTimes {
    sampling_time: f64,
    ancestor_bound: f64,
    times: Vec<f64>,
    count: usize,
    last_change: Option<(f64, f64)>,
    changed: bool,
    stored_times: Vec<f64>,
    stored_count: usize,
    stored_ancestor_bound: f64,
    stored_last_change: Option<(f64, f64)>,
}

impl AttachmentTimes {
    /// A record with no attachment times yet and an unbounded ancestor side.
    ///
    /// `count` is the number of times the record is expected to carry once
    /// resolved; see [`generate_attachment_times`](Self::generate_attachment_times).
    pub fn new(sampling_time: f64, count: usize) -> Result<Self> {
        if !sampling_time.is_finite() {
            return Err(CyaneaError::InvalidInput(format!(
                "sampling time must be finite, got {}",
                sampling_time
            )));
        }
        Ok(Self {
            sampling_time,
            ancestor_bound: f64::INFINITY,
            times: Vec::new(),
            count,
            last_change: None,
            changed: false,
            stored_times: Vec::new(),
            stored_count: count,
            stored_ancestor_bound: f64::INFINITY,
            stored_last_change: None,
        })
    }

    /// A fully resolved record; `count` becomes the number of times given.
    pub fn with_times(sampling_time: f64, times: Vec<f64>) -> Result<Self> {
        let mut rec = Self::new(sampling_time, times.len())?;
        rec.set_times(times)?;
        rec.stored_times = rec.times.clone();
        Ok(rec)
    }

    pub fn sampling_time(&self) -> f64 {
        self.sampling_time
    }

    /// The ancestral side of the window (`f64::INFINITY` when unbounded).
    pub fn ancestor_bound(&self) -> f64 {
        self.ancestor_bound
    }

    /// Set the ancestral side of the window.
    ///
    /// Fails if an existing time would fall outside the new window.
    pub fn set_ancestor_bound(&mut self, bound: f64) -> Result<()> {
        if bound.is_nan() || bound == self.sampling_time {
            return Err(CyaneaError::InvalidInput(format!(
                "ancestor bound {} does not open a window at sampling time {}",
                bound, self.sampling_time
            )));
        }
        let (lo, hi) = window(self.sampling_time, bound);
        if let Some(&t) = self.times.iter().find(|&&t| t <= lo || t >= hi) {
            return Err(CyaneaError::InvalidInput(format!(
                "attachment time {} falls outside ({}, {})",
                t, lo, hi
            )));
        }
        self.ancestor_bound = bound;
        Ok(())
    }

    /// The open window `(lo, hi)` every attachment time must lie in.
    pub fn window(&self) -> (f64, f64) {
        window(self.sampling_time, self.ancestor_bound)
    }

    /// Attachment times in ascending order.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn first(&self) -> Option<f64> {
        self.times.first().copied()
    }

    pub fn last(&self) -> Option<f64> {
        self.times.last().copied()
    }

    /// Replace the whole time list. The input is sorted; duplicates and
    /// values outside the window are rejected.
    pub fn set_times(&mut self, mut times: Vec<f64>) -> Result<()> {
        if times.iter().any(|t| !t.is_finite()) {
            return Err(CyaneaError::InvalidInput(
                "attachment times must be finite".into(),
            ));
        }
        times.sort_by(f64::total_cmp);
        if times.windows(2).any(|w| w[0] == w[1]) {
            return Err(CyaneaError::InvalidInput(
                "attachment times must be distinct".into(),
            ));
        }
        let (lo, hi) = self.window();
        if let Some(&t) = times.iter().find(|&&t| t <= lo || t >= hi) {
            return Err(CyaneaError::InvalidInput(format!(
                "attachment time {} falls outside ({}, {})",
                t, lo, hi
            )));
        }
        self.times = times;
        self.changed = true;
        Ok(())
    }

    /// Number of copies this record stands for.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn set_count(&mut self, count: usize) {
        self.count = count;
    }

    pub fn add_count(&mut self, extra: usize) {
        self.count += extra;
    }

    /// The `(old, new)` value of the most recently moved time.
    pub fn last_change(&self) -> Option<(f64, f64)> {
        self.last_change
    }

    /// True when the list changed since the flag was last taken.
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Read and clear the changed flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::replace(&mut self.changed, false)
    }

    /// Move the time at `index` to `new_time`, keeping the list sorted.
    ///
    /// Returns the index the value landed at. The caller guarantees that
    /// `new_time` lies inside the window and collides with no other time.
    pub(crate) fn move_time(&mut self, index: usize, new_time: f64) -> usize {
        let old = self.times.remove(index);
        let at = self.times.partition_point(|&t| t < new_time);
        self.times.insert(at, new_time);
        self.last_change = Some((old, new_time));
        self.changed = true;
        at
    }

    /// Multiply every time by `factor` (`factor > 0` keeps the order).
    pub(crate) fn scale_times(&mut self, factor: f64) {
        for t in &mut self.times {
            *t *= factor;
        }
        self.changed = true;
    }

    /// Fill the record up to [`count`](Self::count) times.
    ///
    /// `lower_bound` becomes the ancestor bound. The missing times are spread
    /// evenly across the widest free gap of the window, so the list stays
    /// strictly ascending and strictly inside the window.
    pub fn generate_attachment_times(&mut self, lower_bound: f64) -> Result<()> {
        if self.times.len() > self.count {
            return Err(CyaneaError::InvalidInput(format!(
                "record already holds {} times but expects only {}",
                self.times.len(),
                self.count
            )));
        }
        self.set_ancestor_bound(lower_bound)?;
        let missing = self.count - self.times.len();
        if missing == 0 {
            return Ok(());
        }
        let (lo, hi) = self.window();
        if !hi.is_finite() {
            return Err(CyaneaError::InvalidInput(
                "cannot generate attachment times in an unbounded window".into(),
            ));
        }

        let mut points = Vec::with_capacity(self.times.len() + 2);
        points.push(lo);
        points.extend_from_slice(&self.times);
        points.push(hi);
        let (a, b) = points
            .windows(2)
            .map(|w| (w[0], w[1]))
            .fold((lo, lo), |best, gap| {
                if gap.1 - gap.0 > best.1 - best.0 {
                    gap
                } else {
                    best
                }
            });

        let step = (b - a) / (missing + 1) as f64;
        let mut times = self.times.clone();
        times.extend((1..=missing).map(|j| a + j as f64 * step));
        times.sort_by(f64::total_cmp);
        if times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CyaneaError::InvalidInput(format!(
                "free gap ({}, {}) is too narrow for {} more times",
                a, b, missing
            )));
        }
        self.times = times;
        self.changed = true;
        Ok(())
    }
}

fn window(sampling_time: f64, bound: f64) -> (f64, f64) {
    if sampling_time <= bound {
        (sampling_time, bound)
    } else {
        (bound, sampling_time)
    }
}

impl Revertible for AttachmentTimes {
    fn store(&mut self) {
        self.stored_times.clone_from(&self.times);
        self.stored_count = self.count;
        self.stored_ancestor_bound = self.ancestor_bound;
        self.stored_last_change = self.last_change;
    }

    fn restore(&mut self) {
        std::mem::swap(&mut self.times, &mut self.stored_times);
        std::mem::swap(&mut self.count, &mut self.stored_count);
        std::mem::swap(&mut self.ancestor_bound, &mut self.stored_ancestor_bound);
        std::mem::swap(&mut self.last_change, &mut self.stored_last_change);
        self.changed = false;
    }
}

impl Summarizable for AttachmentTimes {
    fn summary(&self) -> String {
        format!(
            "AttachmentTimes: {} of {} times, sampled at {}",
            self.times.len(),
            self.count,
            self.sampling_time
        )
    }
}
