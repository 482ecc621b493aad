//! Sparsity check for count data
//!
//! rlog assumes counts that are roughly negative binomial. Matrices where a few
//! samples carry nearly all of a gene's reads violate that, and the transform can
//! distort them. This check only reports; it never changes the data.

use ndarray::ArrayView2;

use crate::error::{Result, RlogError};

/// Thresholds of the sparsity check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparsityThresholds {
    /// A gene is flagged when its largest sample holds more than this share of its total
    pub p: f64,
    /// Only genes whose row sum exceeds this are considered
    pub t1: f64,
    /// Advise when the flagged fraction of considered genes exceeds this
    pub t2: f64,
}

impl Default for SparsityThresholds {
    fn default() -> Self {
        Self {
            p: 0.9,
            t1: 100.0,
            t2: 0.1,
        }
    }
}

impl SparsityThresholds {
    pub fn validate(&self) -> Result<()> {
        if !(self.p > 0.0 && self.p <= 1.0) {
            return Err(RlogError::InvalidInput {
                reason: format!("sparsity threshold p must lie in (0, 1], got {}", self.p),
            });
        }
        if !(self.t1 >= 0.0 && self.t1.is_finite()) {
            return Err(RlogError::InvalidInput {
                reason: format!("sparsity threshold t1 must be finite and non-negative, got {}", self.t1),
            });
        }
        if !(0.0..=1.0).contains(&self.t2) {
            return Err(RlogError::InvalidInput {
                reason: format!("sparsity threshold t2 must lie in [0, 1], got {}", self.t2),
            });
        }
        Ok(())
    }
}

/// Outcome of a sparsity check that tripped
#[derive(Debug, Clone, PartialEq)]
pub struct SparsityAdvisory {
    /// Flagged genes over considered genes
    pub fraction: f64,
    pub genes_considered: usize,
    pub genes_flagged: usize,
}

impl SparsityAdvisory {
    /// Human readable advice for logs and the CLI
    pub fn message(&self) -> String {
        format!(
            "{} of {} genes with large counts ({:.1}%) have most of their reads in a single sample; \
             the data may not be close to negative binomial and the rlog can be distorted by such \
             genes. Consider the shifted log2(count + 1) transform instead.",
            self.genes_flagged,
            self.genes_considered,
            100.0 * self.fraction
        )
    }
}

/// Look for genes dominated by a single sample in a normalized count matrix.
///
/// Genes with row sum `> t1` are considered. A considered gene is flagged when
/// `max / sum > p`. An advisory is returned when the flagged fraction exceeds `t2`.
pub fn sparse_test(normalized: ArrayView2<f64>, thresholds: &SparsityThresholds) -> Option<SparsityAdvisory> {
    let mut considered = 0usize;
    let mut flagged = 0usize;

    for row in normalized.rows() {
        let sum = row.sum();
        if !(sum > thresholds.t1) {
            continue;
        }
        considered += 1;
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max / sum > thresholds.p {
            flagged += 1;
        }
    }

    if considered == 0 {
        return None;
    }

    let fraction = flagged as f64 / considered as f64;
    log::debug!(
        "sparsity check: {} of {} considered genes flagged ({:.4})",
        flagged,
        considered,
        fraction
    );

    (fraction > thresholds.t2).then_some(SparsityAdvisory {
        fraction,
        genes_considered: considered,
        genes_flagged: flagged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_concentrated_matrix_is_sparse() {
        // Every gene has 99% of its reads in the first sample
        let m = Array2::from_shape_fn((50, 6), |(i, j)| {
            let total = 1000.0 + i as f64;
            if j == 0 {
                0.99 * total
            } else {
                0.01 * total / 5.0
            }
        });
        let advisory = sparse_test(m.view(), &SparsityThresholds::default()).unwrap();
        assert_eq!(advisory.genes_considered, 50);
        assert_eq!(advisory.genes_flagged, 50);
        assert!((advisory.fraction - 1.0).abs() < 1e-12);
        assert!(advisory.message().contains("50 of 50"));
    }

    #[test]
    fn test_uniform_matrix_is_not_sparse() {
        let m = Array2::from_elem((50, 6), 200.0);
        assert!(sparse_test(m.view(), &SparsityThresholds::default()).is_none());
    }

    #[test]
    fn test_only_large_genes_are_considered() {
        // Low-count genes are dominated by one sample but stay under t1
        let mut m = Array2::from_elem((20, 4), 100.0);
        for i in 0..10 {
            m.row_mut(i).fill(0.0);
            m[[i, 0]] = 50.0;
        }
        let t = SparsityThresholds::default();
        assert!(sparse_test(m.view(), &t).is_none());

        let empty = Array2::<f64>::zeros((5, 3));
        assert!(sparse_test(empty.view(), &t).is_none());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(SparsityThresholds::default().validate().is_ok());
        let bad = SparsityThresholds {
            p: 1.5,
            ..SparsityThresholds::default()
        };
        assert!(matches!(bad.validate(), Err(RlogError::InvalidInput { .. })));
        let bad = SparsityThresholds {
            t2: -0.1,
            ..SparsityThresholds::default()
        };
        assert!(bad.validate().is_err());
    }
}
