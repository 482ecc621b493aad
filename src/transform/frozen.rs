//! Parameters captured from one rlog run and reapplied to new samples
//!
//! Intercepts are kept on the log2 scale. Genes that were all zero when the parameters
//! were captured have an infinite intercept, which JSON cannot hold, so those entries
//! are serialized as `null`.

use serde::{Deserialize, Serialize};

use crate::dispersion::DispersionFunction;
use crate::error::{Result, RlogError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenRlogParams {
    pub gene_ids: Vec<String>,
    /// Per-gene intercept; `None` for a non-finite value
    pub intercepts: Vec<Option<f64>>,
    pub beta_prior_var: f64,
    pub dispersion_function: DispersionFunction,
}

impl FrozenRlogParams {
    pub fn new(
        gene_ids: Vec<String>,
        intercepts: &[f64],
        beta_prior_var: f64,
        dispersion_function: DispersionFunction,
    ) -> Result<Self> {
        if gene_ids.len() != intercepts.len() {
            return Err(RlogError::DimensionMismatch {
                expected: format!("{} intercepts", gene_ids.len()),
                got: format!("{}", intercepts.len()),
            });
        }
        if !(beta_prior_var > 0.0 && beta_prior_var.is_finite()) {
            return Err(RlogError::InvalidInput {
                reason: format!("beta_prior_var must be positive and finite, got {}", beta_prior_var),
            });
        }
        Ok(Self {
            gene_ids,
            intercepts: intercepts.iter().map(|&b| b.is_finite().then_some(b)).collect(),
            beta_prior_var,
            dispersion_function,
        })
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    /// Intercepts with missing entries restored as `-inf`
    pub fn intercept_values(&self) -> Vec<f64> {
        self.intercepts
            .iter()
            .map(|b| b.unwrap_or(f64::NEG_INFINITY))
            .collect()
    }

    /// The new data must list the same genes in the same order
    pub fn check_genes(&self, gene_ids: &[String]) -> Result<()> {
        if gene_ids.len() != self.gene_ids.len() {
            return Err(RlogError::DimensionMismatch {
                expected: format!("{} genes from the frozen parameters", self.gene_ids.len()),
                got: format!("{} genes", gene_ids.len()),
            });
        }
        if let Some(i) = gene_ids.iter().zip(self.gene_ids.iter()).position(|(a, b)| a != b) {
            return Err(RlogError::InvalidInput {
                reason: format!(
                    "gene {} is '{}' but the frozen parameters expect '{}'",
                    i + 1,
                    gene_ids[i],
                    self.gene_ids[i]
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> FrozenRlogParams {
        FrozenRlogParams::new(
            vec!["a".to_string(), "b".to_string()],
            &[3.5, f64::NEG_INFINITY],
            0.8,
            DispersionFunction::Mean { value: 0.1 },
        )
        .unwrap()
    }

    #[test]
    fn test_infinite_intercept_survives_json() {
        let p = params();
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("null"));
        let back: FrozenRlogParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.intercept_values(), vec![3.5, f64::NEG_INFINITY]);
    }

    #[test]
    fn test_gene_order_checked() {
        let p = params();
        assert!(p.check_genes(&["a".to_string(), "b".to_string()]).is_ok());
        assert!(p.check_genes(&["b".to_string(), "a".to_string()]).is_err());
        assert!(matches!(
            p.check_genes(&["a".to_string()]),
            Err(RlogError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_prior_variance() {
        let err = FrozenRlogParams::new(vec!["a".to_string()], &[1.0], 0.0, DispersionFunction::Mean { value: 0.1 })
            .unwrap_err();
        assert!(matches!(err, RlogError::InvalidInput { .. }));
    }
}
