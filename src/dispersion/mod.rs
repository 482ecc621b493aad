//! Dispersion estimation for the negative binomial model
//!
//! rlog only consumes a fitted (trend) dispersion per gene. The
//! [`DispersionEstimator`] trait is the seam through which the transform obtains one
//! when the caller has not supplied it.

mod gene_wise;
mod trend;

pub use gene_wise::{estimate_dispersion_gene, estimate_gene_dispersions};
pub use trend::{fit_dispersion_trend, DispersionFunction, LocalTrendPoint, TrendFitMethod};

use ndarray::{Array1, ArrayView2};

use crate::error::Result;
use crate::normalization::Normalization;

/// Configurable parameters for gene-wise dispersion estimation
#[derive(Debug, Clone, PartialEq)]
pub struct DispersionParams {
    /// Lower bound on every estimate
    pub min_disp: f64,
    /// Log-likelihood change at which the line search stops
    pub disp_tol: f64,
    /// Initial step size of the line search
    pub kappa_0: f64,
    /// Line search iteration cap
    pub maxit: usize,
}

impl Default for DispersionParams {
    fn default() -> Self {
        Self {
            min_disp: 1e-8,
            disp_tol: 1e-6,
            kappa_0: 1.0,
            maxit: 100,
        }
    }
}

/// Fitted dispersion per gene plus the function that produced it, if any
#[derive(Debug, Clone)]
pub struct DispersionTrend {
    /// One value per gene; NaN for all-zero genes
    pub fitted: Array1<f64>,
    pub function: Option<DispersionFunction>,
}

/// Source of per-gene trend dispersions
pub trait DispersionEstimator: Sync {
    fn estimate(&self, counts: ArrayView2<f64>, normalization: &Normalization) -> Result<DispersionTrend>;
}

/// Gene-wise estimates under the intercept-only model followed by a trend fit
#[derive(Debug, Clone, Default)]
pub struct TrendDispersionEstimator {
    pub method: TrendFitMethod,
    pub params: DispersionParams,
}

impl TrendDispersionEstimator {
    pub fn new(method: TrendFitMethod) -> Self {
        Self {
            method,
            params: DispersionParams::default(),
        }
    }
}

impl DispersionEstimator for TrendDispersionEstimator {
    fn estimate(&self, counts: ArrayView2<f64>, normalization: &Normalization) -> Result<DispersionTrend> {
        log::info!("Estimating dispersions ({} trend)", self.method);
        let gene_disps = estimate_gene_dispersions(counts, normalization, &self.params)?;

        let base_means: Vec<f64> = normalization
            .normalize(counts)
            .rows()
            .into_iter()
            .map(|row| row.mean().unwrap_or(0.0))
            .collect();

        let function = fit_dispersion_trend(
            &base_means,
            &gene_disps.to_vec(),
            self.method,
            self.params.min_disp,
        )?;
        log::debug!("dispersion trend: {:?}", function);

        let fitted: Array1<f64> = base_means
            .iter()
            .zip(gene_disps.iter())
            .map(|(&m, d)| if d.is_nan() { f64::NAN } else { function.predict(m) })
            .collect();

        Ok(DispersionTrend {
            fitted,
            function: Some(function),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Gamma, Poisson};

    #[test]
    fn test_trend_estimator_leaves_zero_genes_nan() {
        let mut rng = StdRng::seed_from_u64(11);
        let n_samples = 6;
        let mut counts = Array2::<f64>::zeros((120, n_samples));
        for i in 1..120 {
            let mean = 5.0 + 10.0 * i as f64;
            let alpha = 0.05 + 1.0 / mean;
            let gamma = Gamma::new(1.0 / alpha, mean * alpha).unwrap();
            for j in 0..n_samples {
                let lambda: f64 = gamma.sample(&mut rng);
                counts[[i, j]] = Poisson::new(lambda.max(1e-8)).unwrap().sample(&mut rng);
            }
        }
        let norm = Normalization::SizeFactors(Array1::from_elem(n_samples, 1.0));

        let trend = TrendDispersionEstimator::new(TrendFitMethod::Parametric)
            .estimate(counts.view(), &norm)
            .unwrap();
        assert_eq!(trend.fitted.len(), 120);
        assert!(trend.fitted[0].is_nan());
        assert!(trend.fitted.iter().skip(1).all(|&d| d > 0.0 && d.is_finite()));
        assert!(trend.function.is_some());
    }
}
