//! rust_rlog: regularized log transformation of RNA-seq counts
//!
//! Each gene is fit with a negative binomial GLM carrying one coefficient per sample
//! and a ridge penalty on those coefficients. The fitted values on the log2 scale
//! are the transformed data: low counts are shrunk toward the gene mean, high counts
//! stay close to `log2(normalized count)`.
//!
//! # Example
//!
//! ```ignore
//! use rust_rlog::prelude::*;
//!
//! let counts = read_count_matrix("counts.csv")?;
//! let mut dds = RlogDataSet::new(counts);
//!
//! // Blind transform with an estimated prior variance
//! let result = rlog(&mut dds, &RlogConfig::default())?;
//!
//! // Transform new samples on the same scale
//! let frozen = result.frozen_params()?;
//! let mut new_dds = RlogDataSet::new(read_count_matrix("new_counts.csv")?);
//! let config = RlogConfig::from_frozen(&frozen, new_dds.counts().gene_ids())?;
//! let new_result = rlog(&mut new_dds, &config)?;
//! ```

pub mod cli;
pub mod data;
pub mod dispersion;
pub mod error;
pub mod glm;
pub mod io;
pub mod normalization;
pub mod stats;
pub mod transform;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::data::{CountMatrix, RlogDataSet};
    pub use crate::dispersion::{
        DispersionEstimator, DispersionFunction, DispersionParams, TrendDispersionEstimator, TrendFitMethod,
    };
    pub use crate::error::{Result, RlogError};
    pub use crate::glm::{PenalizedFitParams, RlogDesign};
    pub use crate::io::{read_count_matrix, write_matrix};
    pub use crate::normalization::{estimate_size_factors, Normalization, SizeFactorMethod};
    pub use crate::stats::estimate_prior_variance;
    pub use crate::transform::{
        rlog, rlog_data, sparse_test, FrozenRlogParams, RlogConfig, RlogInput, RlogResult, SparsityThresholds,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Gamma, Poisson};

    fn simulated_counts(n_genes: usize, n_samples: usize, seed: u64) -> CountMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let alpha = 0.1_f64;
        let mut counts = Array2::<f64>::zeros((n_genes, n_samples));
        for i in 0..n_genes {
            let mu = 5.0 * 1.1_f64.powi((i % 50) as i32);
            let gamma = Gamma::new(1.0 / alpha, mu * alpha).unwrap();
            for j in 0..n_samples {
                let lambda: f64 = gamma.sample(&mut rng);
                counts[[i, j]] = Poisson::new(lambda.max(1e-3)).unwrap().sample(&mut rng);
            }
        }
        let gene_ids = (0..n_genes).map(|i| format!("gene{}", i)).collect();
        let sample_ids = (0..n_samples).map(|j| format!("s{}", j)).collect();
        CountMatrix::new(counts, gene_ids, sample_ids).unwrap()
    }

    #[test]
    fn test_blind_then_frozen_pipeline() {
        let mut dds = RlogDataSet::new(simulated_counts(200, 6, 7));
        let result = rlog(&mut dds, &RlogConfig::default()).unwrap();

        assert_eq!(result.data.dim(), (200, 6));
        assert!(result.data.iter().all(|v| v.is_finite()));
        assert!(result.beta_prior_var > 0.0);
        assert!(dds.dispersion_function().is_some());

        // Frozen parameters survive serialization and reproduce the scale
        let frozen = result.frozen_params().unwrap();
        let json = serde_json::to_string(&frozen).unwrap();
        let frozen: FrozenRlogParams = serde_json::from_str(&json).unwrap();

        let mut again = RlogDataSet::new(simulated_counts(200, 6, 7));
        let config = RlogConfig::from_frozen(&frozen, again.counts().gene_ids()).unwrap();
        let frozen_result = rlog(&mut again, &config).unwrap();

        assert!(frozen_result.intercepts.is_none());
        assert_eq!(frozen_result.beta_prior_var, result.beta_prior_var);
        let max_diff = result
            .data
            .iter()
            .zip(frozen_result.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        assert!(max_diff < 1.0, "frozen rerun should stay close to the blind fit, max diff {}", max_diff);
    }
}
