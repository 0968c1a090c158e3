//! Compressed site patterns.
//!
//! Alignment columns that are identical across all taxa are merged into one
//! pattern carrying a weight. Tip states are fixed: every taxon has exactly
//! one state per pattern.

use std::collections::HashMap;

use cyanea_core::{CyaneaError, Result, Summarizable};

/// Map a nucleotide byte to an index (A=0, C=1, G=2, T=3).
///
/// Accepts both upper and lower case. Returns `None` for non-standard bases.
pub fn nucleotide_index(b: u8) -> Option<usize> {
    match b.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' | b'U' => Some(3),
        _ => None,
    }
}

/// Weighted site patterns for a set of named taxa.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Patterns {
    taxa: Vec<String>,
    n_states: usize,
    /// `states[taxon][pattern]`
    states: Vec<Vec<usize>>,
    weights: Vec<f64>,
    excluded: Vec<usize>,
}

impl Patterns {
    /// Build patterns from per-taxon state rows and per-pattern weights.
    pub fn new(
        taxa: Vec<String>,
        n_states: usize,
        states: Vec<Vec<usize>>,
        weights: Vec<f64>,
    ) -> Result<Self> {
        if taxa.is_empty() {
            return Err(CyaneaError::InvalidInput("no taxa provided".into()));
        }
        if n_states < 2 {
            return Err(CyaneaError::InvalidInput(format!(
                "need at least 2 states, got {}",
                n_states
            )));
        }
        if states.len() != taxa.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "expected {} state rows for {} taxa, got {}",
                taxa.len(),
                taxa.len(),
                states.len()
            )));
        }
        let n_patterns = weights.len();
        if n_patterns == 0 {
            return Err(CyaneaError::InvalidInput("no site patterns".into()));
        }
        for (i, row) in states.iter().enumerate() {
            if row.len() != n_patterns {
                return Err(CyaneaError::InvalidInput(format!(
                    "taxon {} has {} states, expected {}",
                    taxa[i],
                    row.len(),
                    n_patterns
                )));
            }
            if let Some(&s) = row.iter().find(|&&s| s >= n_states) {
                return Err(CyaneaError::InvalidInput(format!(
                    "taxon {} has state {} outside 0..{}",
                    taxa[i], s, n_states
                )));
            }
        }
        if weights.iter().any(|&w| !(w.is_finite() && w >= 0.0)) {
            return Err(CyaneaError::InvalidInput(
                "pattern weights must be non-negative".into(),
            ));
        }
        Ok(Self {
            taxa,
            n_states,
            states,
            weights,
            excluded: Vec::new(),
        })
    }

    /// Compress aligned nucleotide sequences into weighted patterns.
    ///
    /// Patterns keep the order of their first column. Ambiguous characters
    /// and gaps are rejected.
    pub fn from_nucleotides<S: AsRef<[u8]>>(names: &[&str], sequences: &[S]) -> Result<Self> {
        if names.len() != sequences.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "expected {} sequences for {} names, got {}",
                names.len(),
                names.len(),
                sequences.len()
            )));
        }
        let Some(first) = sequences.first() else {
            return Err(CyaneaError::InvalidInput("no sequences provided".into()));
        };
        let seq_len = first.as_ref().len();
        if seq_len == 0 {
            return Err(CyaneaError::InvalidInput("empty sequences".into()));
        }
        for (i, seq) in sequences.iter().map(AsRef::<[u8]>::as_ref).enumerate() {
            if seq.len() != seq_len {
                return Err(CyaneaError::InvalidInput(format!(
                    "sequence {} has length {}, expected {}",
                    i,
                    seq.len(),
                    seq_len
                )));
            }
        }

        let mut index: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut columns: Vec<Vec<usize>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for site in 0..seq_len {
            let column = sequences
                .iter()
                .map(AsRef::<[u8]>::as_ref)
                .zip(names)
                .map(|(seq, name)| {
                    nucleotide_index(seq[site]).ok_or_else(|| {
                        CyaneaError::InvalidInput(format!(
                            "ambiguous character '{}' for {} at site {}",
                            seq[site] as char, name, site
                        ))
                    })
                })
                .collect::<Result<Vec<usize>>>()?;
            match index.get(&column) {
                Some(&p) => weights[p] += 1.0,
                None => {
                    index.insert(column.clone(), columns.len());
                    columns.push(column);
                    weights.push(1.0);
                }
            }
        }

        let states = (0..names.len())
            .map(|t| columns.iter().map(|col| col[t]).collect())
            .collect();
        Self::new(
            names.iter().map(|n| n.to_string()).collect(),
            4,
            states,
            weights,
        )
    }

    /// Declare the given patterns as excluded by the sampling scheme.
    ///
    /// Their weights drop to zero and the likelihood is conditioned on not
    /// observing them.
    pub fn with_ascertainment(mut self, excluded: Vec<usize>) -> Result<Self> {
        if let Some(&p) = excluded.iter().find(|&&p| p >= self.weights.len()) {
            return Err(CyaneaError::InvalidInput(format!(
                "excluded pattern {} out of range ({})",
                p,
                self.weights.len()
            )));
        }
        for &p in &excluded {
            self.weights[p] = 0.0;
        }
        self.excluded = excluded;
        Ok(self)
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// States of one taxon, one per pattern.
    pub fn taxon_states(&self, taxon: usize) -> &[usize] {
        &self.states[taxon]
    }

    /// Index of a taxon by name. A name wrapped in single or double quotes
    /// also matches its unquoted form.
    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        let find = |n: &str| self.taxa.iter().position(|t| t == n);
        find(name).or_else(|| {
            let unquoted = name
                .strip_prefix('\'')
                .and_then(|n| n.strip_suffix('\''))
                .or_else(|| name.strip_prefix('"').and_then(|n| n.strip_suffix('"')))?;
            find(unquoted)
        })
    }

    pub fn is_ascertained(&self) -> bool {
        !self.excluded.is_empty()
    }

    /// Flat `pattern * n_states + state` indices of patterns where all of
    /// `taxa` share one state.
    pub fn constant_pattern_indices(&self, taxa: &[usize]) -> Vec<usize> {
        let Some((&first, rest)) = taxa.split_first() else {
            return Vec::new();
        };
        (0..self.pattern_count())
            .filter_map(|p| {
                let s = self.states[first][p];
                rest.iter()
                    .all(|&t| self.states[t][p] == s)
                    .then_some(p * self.n_states + s)
            })
            .collect()
    }

    /// `ln(1 - sum of excluded pattern likelihoods)`, zero without
    /// ascertainment.
    pub fn ascertainment_correction(&self, pattern_log_likelihoods: &[f64]) -> f64 {
        if self.excluded.is_empty() {
            return 0.0;
        }
        let excluded: f64 = self
            .excluded
            .iter()
            .map(|&p| pattern_log_likelihoods[p].exp())
            .sum();
        (1.0 - excluded).ln()
    }
}

impl Summarizable for Patterns {
    fn summary(&self) -> String {
        format!(
            "Patterns: {} taxa, {} patterns over {} sites",
            self.taxon_count(),
            self.pattern_count(),
            self.weights.iter().sum::<f64>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Patterns {
        Patterns::from_nucleotides(
            &["A", "B", "C"],
            &[b"ACGTA", b"ACGTT", b"ACCTA"],
        )
        .unwrap()
    }

    #[test]
    fn nucleotide_index_standard() {
        assert_eq!(nucleotide_index(b'A'), Some(0));
        assert_eq!(nucleotide_index(b'c'), Some(1));
        assert_eq!(nucleotide_index(b'G'), Some(2));
        assert_eq!(nucleotide_index(b'u'), Some(3));
        assert_eq!(nucleotide_index(b'N'), None);
        assert_eq!(nucleotide_index(b'-'), None);
    }

    #[test]
    fn columns_are_compressed() {
        let p = sample();
        // A-A-A, C-C-C, G-G-C, T-T-T, A-T-A
        assert_eq!(p.pattern_count(), 5);
        let p = Patterns::from_nucleotides(&["x", "y"], &[b"AAAC", b"AAAC"]).unwrap();
        assert_eq!(p.pattern_count(), 2);
        assert_eq!(p.weights(), &[3.0, 1.0]);
        assert_eq!(p.taxon_states(0), &[0, 1]);
    }

    #[test]
    fn ambiguous_characters_rejected() {
        let err = Patterns::from_nucleotides(&["x", "y"], &[b"AN", b"AA"]).unwrap_err();
        assert!(err.to_string().contains("ambiguous character 'N' for x at site 1"), "{}", err);
    }

    #[test]
    fn mismatched_input_rejected() {
        assert!(Patterns::from_nucleotides(&["x"], &[b"A", b"C"]).is_err());
        assert!(Patterns::from_nucleotides(&["x", "y"], &[b"AC".to_vec(), b"C".to_vec()]).is_err());
        assert!(Patterns::from_nucleotides::<&[u8]>(&[], &[]).is_err());
        assert!(Patterns::new(vec!["x".into()], 4, vec![vec![5]], vec![1.0]).is_err());
    }

    #[test]
    fn taxon_lookup_strips_quotes() {
        let p = sample();
        assert_eq!(p.taxon_index("B"), Some(1));
        assert_eq!(p.taxon_index("'B'"), Some(1));
        assert_eq!(p.taxon_index("\"C\""), Some(2));
        assert_eq!(p.taxon_index("D"), None);
    }

    #[test]
    fn constant_patterns_over_subset() {
        let p = sample();
        assert_eq!(p.constant_pattern_indices(&[0, 1, 2]), vec![0, 4 + 1, 3 * 4 + 3]);
        // without B, the last column is constant too
        assert_eq!(
            p.constant_pattern_indices(&[0, 2]),
            vec![0, 4 + 1, 3 * 4 + 3, 4 * 4]
        );
        assert!(p.constant_pattern_indices(&[]).is_empty());
    }

    #[test]
    fn ascertainment_zeroes_weights() {
        let p = sample().with_ascertainment(vec![0, 1]).unwrap();
        assert!(p.is_ascertained());
        assert_eq!(p.weights()[0], 0.0);
        assert_eq!(p.weights()[1], 0.0);
        let lls = vec![(0.1f64).ln(), (0.2f64).ln(), -3.0, -3.0, -3.0];
        let c = p.ascertainment_correction(&lls);
        assert!((c - (0.7f64).ln()).abs() < 1e-12);
        assert!(sample().with_ascertainment(vec![9]).is_err());
        assert_eq!(sample().ascertainment_correction(&lls), 0.0);
    }

    #[test]
    fn summary_format() {
        assert_eq!(sample().summary(), "Patterns: 3 taxa, 5 patterns over 5 sites");
    }
}
