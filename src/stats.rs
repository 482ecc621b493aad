//! Weighted quantiles and the quantile-matched prior variance estimator
//!
//! The rlog ridge penalty is `1 / beta_prior_var`. When the caller does not supply
//! the prior variance, it is estimated by matching an upper weighted quantile of the
//! absolute log fold changes to the same quantile of a zero-mean normal.

use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{Result, RlogError};

/// Smallest prior variance returned by the estimator
pub const MIN_PRIOR_VAR: f64 = 1e-6;

/// Default upper tail used for prior variance matching (95th percentile of |x|)
pub const DEFAULT_UPPER_QUANTILE: f64 = 0.05;

/// Weighted quantile with normalized weights.
///
/// Algorithm:
/// 1. Drop entries with non-positive weight or NaN value
/// 2. Sort by value and aggregate the weights of tied values
/// 3. Rescale weights so they sum to the number of retained entries
/// 4. order = 1 + (n - 1) * prob
/// 5. Read the sorted values at floor(order) and floor(order) + 1 from the
///    cumulative weights with a right-continuous step function
/// 6. Interpolate linearly by the fractional part of order
///
/// Returns 0.0 when nothing survives step 1.
pub fn weighted_quantile(x: &[f64], weights: &[f64], prob: f64) -> f64 {
    let mut pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(weights.iter())
        .filter(|(&xi, &wi)| wi > 0.0 && !xi.is_nan() && !wi.is_nan())
        .map(|(&xi, &wi)| (xi, wi))
        .collect();

    if pairs.is_empty() {
        return 0.0;
    }

    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let n_raw = pairs.len() as f64;
    let weight_sum: f64 = pairs.iter().map(|&(_, w)| w).sum();
    let scale = n_raw / weight_sum;

    // Tied values share one step in the cumulative weight function
    let mut values: Vec<f64> = Vec::with_capacity(pairs.len());
    let mut cum_weights: Vec<f64> = Vec::with_capacity(pairs.len());
    let mut running = 0.0_f64;
    for &(xi, wi) in &pairs {
        running += wi * scale;
        match values.last() {
            Some(&last) if last == xi => {
                if let Some(cw) = cum_weights.last_mut() {
                    *cw = running;
                }
            }
            _ => {
                values.push(xi);
                cum_weights.push(running);
            }
        }
    }

    let n = running;
    let order = 1.0 + (n - 1.0) * prob;
    let low = order.floor().max(1.0);
    let high = (low + 1.0).min(n);
    let frac = order - order.floor();

    let q_low = step_right(&cum_weights, &values, low);
    let q_high = step_right(&cum_weights, &values, high);

    (1.0 - frac) * q_low + frac * q_high
}

/// Right-continuous step lookup: the first `ys[i]` whose cumulative weight reaches
/// `target`, clamped to the ends of the table.
fn step_right(cum: &[f64], ys: &[f64], target: f64) -> f64 {
    match cum.iter().position(|&c| c >= target) {
        Some(i) => ys[i],
        None => ys[ys.len() - 1],
    }
}

/// Estimate the prior variance of log fold changes by quantile matching.
///
/// `sd = wq(|x|, 1 - upper_quantile) / z(1 - upper_quantile / 2)` and the
/// returned variance is `sd^2`, floored at [`MIN_PRIOR_VAR`].
///
/// # Errors
/// `InvalidInput` when `residuals` and `weights` differ in length, are empty,
/// contain a non-finite residual, a non-positive or non-finite weight, or when
/// `upper_quantile` is outside (0, 1).
pub fn estimate_prior_variance(residuals: &[f64], weights: &[f64], upper_quantile: f64) -> Result<f64> {
    if residuals.len() != weights.len() {
        return Err(RlogError::InvalidInput {
            reason: format!(
                "residuals ({}) and weights ({}) must have the same length",
                residuals.len(),
                weights.len()
            ),
        });
    }
    if residuals.is_empty() {
        return Err(RlogError::InvalidInput {
            reason: "residuals must not be empty".to_string(),
        });
    }
    if !(upper_quantile > 0.0 && upper_quantile < 1.0) {
        return Err(RlogError::InvalidInput {
            reason: format!("upper_quantile must lie in (0, 1), got {}", upper_quantile),
        });
    }
    if let Some(i) = weights.iter().position(|&w| !(w > 0.0 && w.is_finite())) {
        return Err(RlogError::InvalidInput {
            reason: format!("weights must be positive and finite (weights[{}] = {})", i, weights[i]),
        });
    }
    if let Some(i) = residuals.iter().position(|r| !r.is_finite()) {
        return Err(RlogError::InvalidInput {
            reason: format!("residuals must be finite (residuals[{}] = {})", i, residuals[i]),
        });
    }

    let abs_x: Vec<f64> = residuals.iter().map(|v| v.abs()).collect();
    let observed = weighted_quantile(&abs_x, weights, 1.0 - upper_quantile);

    let z = standard_normal_quantile(1.0 - upper_quantile / 2.0)?;
    let sd_est = observed / z;
    log::debug!("prior variance: |x| quantile={:.15} z={:.15} sd={:.15}", observed, z, sd_est);

    let var_est = sd_est * sd_est;
    if var_est.is_finite() {
        Ok(var_est.max(MIN_PRIOR_VAR))
    } else {
        Ok(MIN_PRIOR_VAR)
    }
}

/// Quantile of the standard normal distribution
pub fn standard_normal_quantile(p: f64) -> Result<f64> {
    let normal = Normal::new(0.0, 1.0).map_err(|e| RlogError::InvalidInput {
        reason: format!("standard normal: {}", e),
    })?;
    Ok(normal.inverse_cdf(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal as NormalDist};

    #[test]
    fn test_weighted_quantile_simple() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let w = vec![1.0; 5];
        let q50 = weighted_quantile(&x, &w, 0.5);
        assert!((q50 - 3.0).abs() < 1e-10, "median of 1..5 should be 3.0, got {}", q50);
    }

    #[test]
    fn test_weighted_quantile_skewed() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let w = vec![1.0, 1.0, 1.0, 1.0, 100.0];
        let q50 = weighted_quantile(&x, &w, 0.5);
        assert!(q50 >= 4.0, "weighted median should be >= 4.0, got {}", q50);
    }

    #[test]
    fn test_weighted_quantile_ties() {
        let x = vec![2.0, 2.0, 2.0, 7.0];
        let w = vec![1.0; 4];
        assert_eq!(weighted_quantile(&x, &w, 0.5), 2.0);
        assert_eq!(weighted_quantile(&x, &w, 1.0), 7.0);
    }

    #[test]
    fn test_step_right() {
        let cum = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let x = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(step_right(&cum, &x, 2.5), 30.0);
        assert_eq!(step_right(&cum, &x, 1.0), 10.0);
        assert_eq!(step_right(&cum, &x, 0.5), 10.0);
        assert_eq!(step_right(&cum, &x, 6.0), 50.0);
    }

    #[test]
    fn test_prior_variance_positive() {
        let x = vec![0.1, -0.2, 0.3, -0.1, 0.5, -0.3, 0.2, -0.4, 0.15, -0.25];
        let w = vec![1.0; 10];
        let var = estimate_prior_variance(&x, &w, DEFAULT_UPPER_QUANTILE).unwrap();
        assert!(var > 0.0 && var.is_finite(), "variance should be positive, got {}", var);
    }

    #[test]
    fn test_prior_variance_degenerate_input_is_floored() {
        let x = vec![0.0; 50];
        let w = vec![2.0; 50];
        let var = estimate_prior_variance(&x, &w, DEFAULT_UPPER_QUANTILE).unwrap();
        assert_eq!(var, MIN_PRIOR_VAR);
    }

    #[test]
    fn test_prior_variance_rejects_bad_input() {
        let err = estimate_prior_variance(&[0.1, 0.2], &[1.0], 0.05).unwrap_err();
        assert!(matches!(err, RlogError::InvalidInput { .. }));

        let err = estimate_prior_variance(&[0.1, 0.2], &[1.0, 0.0], 0.05).unwrap_err();
        assert!(matches!(err, RlogError::InvalidInput { ref reason } if reason.contains("weights")));

        let err = estimate_prior_variance(&[0.1, 0.2], &[1.0, -3.0], 0.05).unwrap_err();
        assert!(matches!(err, RlogError::InvalidInput { .. }));

        let err = estimate_prior_variance(&[], &[], 0.05).unwrap_err();
        assert!(matches!(err, RlogError::InvalidInput { .. }));
    }

    #[test]
    fn test_prior_variance_recovers_normal_variance() {
        let sigma2 = 0.5_f64;
        let normal = NormalDist::new(0.0, sigma2.sqrt()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        let mut last_err = f64::INFINITY;
        for &n in &[500usize, 50_000] {
            let x: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
            let w = vec![1.0; n];
            let est = estimate_prior_variance(&x, &w, DEFAULT_UPPER_QUANTILE).unwrap();
            last_err = (est - sigma2).abs() / sigma2;
        }
        assert!(last_err < 0.05, "relative error at n=50000 should be < 5%, got {}", last_err);
    }

    #[test]
    fn test_standard_normal_quantile() {
        let z = standard_normal_quantile(0.975).unwrap();
        assert!((z - 1.959963984540054).abs() < 1e-8, "z(0.975) = {}", z);
    }
}
