//! Gene-wise dispersion estimates for the intercept-only model
//!
//! rlog estimates dispersion blind to any experimental design, so the model for every
//! gene is `log(mu_j) = log(nf_j) + b`. The fitted mean is then closed-form and only the
//! dispersion is optimized, by an Armijo line search on the Cox-Reid adjusted profile
//! log-likelihood in `log(alpha)`.

use ndarray::{Array1, ArrayView2};
use rayon::prelude::*;
use statrs::function::gamma::{digamma, ln_gamma};

use super::DispersionParams;
use crate::error::{Result, RlogError};
use crate::normalization::Normalization;

/// Floor on the fitted means inside the likelihood
const MIN_MEAN: f64 = 1e-10;

/// Hard lower bound on `log(alpha)` proposals during the line search
const MIN_LOG_ALPHA_PROPOSAL: f64 = -30.0;

/// Hard upper bound on `log(alpha)` proposals during the line search
const MAX_LOG_ALPHA_PROPOSAL: f64 = 10.0;

/// Estimate one dispersion per gene.
///
/// All-zero genes get NaN. Estimates are clamped to `[min_disp, max(n_samples, 10)]`.
pub fn estimate_gene_dispersions(
    counts: ArrayView2<f64>,
    normalization: &Normalization,
    params: &DispersionParams,
) -> Result<Array1<f64>> {
    let (n_genes, n_samples) = counts.dim();
    normalization.validate(n_genes, n_samples)?;
    if n_samples < 2 {
        return Err(RlogError::InvalidInput {
            reason: format!(
                "dispersion estimation needs at least two samples, got {}",
                n_samples
            ),
        });
    }

    let estimates: Vec<f64> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let y: Vec<f64> = counts.row(i).to_vec();
            let nf: Vec<f64> = (0..n_samples).map(|j| normalization.factor(i, j)).collect();
            estimate_dispersion_gene(&y, &nf, params)
        })
        .collect();

    let n_valid = estimates.iter().filter(|d| d.is_finite()).count();
    log::debug!("gene-wise dispersions: {} of {} genes estimated", n_valid, n_genes);

    Ok(Array1::from_vec(estimates))
}

/// Dispersion of a single gene under the intercept-only model.
///
/// 1. Starting value: the smaller of the rough and the moments estimates
/// 2. Line search on the adjusted log-likelihood with fixed means
/// 3. If the line search did not improve on the start, keep the start
/// 4. If it did not converge, maximize over a coarse-then-fine grid instead
pub fn estimate_dispersion_gene(counts: &[f64], norm_factors: &[f64], params: &DispersionParams) -> f64 {
    if counts.iter().all(|&c| c == 0.0) {
        return f64::NAN;
    }

    let n = counts.len() as f64;
    let max_disp = n.max(10.0);

    let normalized: Vec<f64> = counts
        .iter()
        .zip(norm_factors.iter())
        .map(|(&y, &nf)| y / nf)
        .collect();
    let base_mean = normalized.iter().sum::<f64>() / n;
    let mu: Vec<f64> = norm_factors.iter().map(|&nf| nf * base_mean).collect();

    let xim = norm_factors.iter().map(|&nf| 1.0 / nf).sum::<f64>() / n;
    let alpha_init = rough_disp_estimate(&normalized)
        .min(moments_disp_estimate(&normalized, xim))
        .max(params.min_disp)
        .min(max_disp);

    let search = line_search(counts, &mu, alpha_init, max_disp, params);
    let no_increase = search.final_lp < search.initial_lp + search.initial_lp.abs() / 1e6;
    let mut alpha = if no_increase { alpha_init } else { search.alpha };

    let converged = search.iterations < params.maxit && search.iterations != 1;
    if !converged && alpha > params.min_disp * 10.0 {
        alpha = grid_search(counts, &mu, params.min_disp, max_disp);
    }

    alpha.max(params.min_disp).min(max_disp)
}

/// `sum(((y - m)^2 - m) / m^2) / (n - 1)` with `m = max(mean, 1)`, floored at zero
fn rough_disp_estimate(normalized: &[f64]) -> f64 {
    let n = normalized.len() as f64;
    let mean = (normalized.iter().sum::<f64>() / n).max(1.0);
    let sum: f64 = normalized
        .iter()
        .map(|&y| ((y - mean).powi(2) - mean) / (mean * mean))
        .sum();
    (sum / (n - 1.0)).max(0.0)
}

/// `(var - xim * mean) / mean^2` where `xim` is the mean inverse normalization factor
fn moments_disp_estimate(normalized: &[f64], xim: f64) -> f64 {
    let n = normalized.len() as f64;
    let mean = normalized.iter().sum::<f64>() / n;
    if mean <= MIN_MEAN {
        return f64::INFINITY;
    }
    let var = normalized.iter().map(|&y| (y - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (var - xim * mean) / (mean * mean)
}

struct LineSearch {
    alpha: f64,
    initial_lp: f64,
    final_lp: f64,
    iterations: usize,
}

/// Armijo backtracking on `log(alpha)` with an adaptive step `kappa`
fn line_search(counts: &[f64], mu: &[f64], alpha_init: f64, max_disp: f64, params: &DispersionParams) -> LineSearch {
    let min_log_alpha = (params.min_disp / 10.0).ln();
    let epsilon = 1e-4;

    let mut log_alpha = alpha_init
        .max(MIN_MEAN)
        .ln()
        .max(MIN_LOG_ALPHA_PROPOSAL)
        .min(max_disp.ln());
    let initial_lp = adjusted_log_likelihood(counts, mu, log_alpha);
    let mut lp = initial_lp;
    let mut dlp = d_adjusted_log_likelihood(counts, mu, log_alpha);
    let mut kappa = params.kappa_0;
    let mut accepted = 0;
    let mut iterations = params.maxit;

    for iter in 0..params.maxit {
        let raw = log_alpha + kappa * dlp;
        if raw < MIN_LOG_ALPHA_PROPOSAL {
            kappa = (MIN_LOG_ALPHA_PROPOSAL - log_alpha) / dlp;
        }
        if raw > MAX_LOG_ALPHA_PROPOSAL {
            kappa = (MAX_LOG_ALPHA_PROPOSAL - log_alpha) / dlp;
        }

        let proposal = log_alpha + kappa * dlp;
        let lp_proposal = adjusted_log_likelihood(counts, mu, proposal);

        if -lp_proposal <= -lp - kappa * epsilon * dlp * dlp {
            accepted += 1;
            log_alpha = proposal;
            let change = lp_proposal - lp;
            lp = lp_proposal;

            if change < params.disp_tol || log_alpha < min_log_alpha {
                iterations = iter + 1;
                break;
            }

            dlp = d_adjusted_log_likelihood(counts, mu, log_alpha);
            kappa = (kappa * 1.1).min(params.kappa_0);
            if accepted % 5 == 0 {
                kappa /= 2.0;
            }
        } else {
            kappa /= 2.0;
        }
    }

    LineSearch {
        alpha: log_alpha.exp().max(params.min_disp),
        initial_lp,
        final_lp: lp,
        iterations,
    }
}

/// Coarse grid of 20 points over `[log(min_disp), log(max_disp)]`, then a fine grid
/// of 20 points around the best coarse value
fn grid_search(counts: &[f64], mu: &[f64], min_disp: f64, max_disp: f64) -> f64 {
    let n_grid = 20;
    let lo = min_disp.ln();
    let hi = max_disp.ln();
    let delta = (hi - lo) / (n_grid - 1) as f64;

    let argmax = |start: f64, step: f64| -> f64 {
        (0..n_grid)
            .map(|i| start + i as f64 * step)
            .map(|a| (a, adjusted_log_likelihood(counts, mu, a)))
            .fold((start, f64::NEG_INFINITY), |best, (a, lp)| {
                if lp > best.1 {
                    (a, lp)
                } else {
                    best
                }
            })
            .0
    };

    let coarse = argmax(lo, delta);
    let fine_step = 2.0 * delta / (n_grid - 1) as f64;
    argmax(coarse - delta, fine_step).exp()
}

/// NB log-likelihood plus the Cox-Reid term `-0.5 * log(sum w)`, `w = 1 / (1/mu + alpha)`
fn adjusted_log_likelihood(counts: &[f64], mu: &[f64], log_alpha: f64) -> f64 {
    let alpha = log_alpha.exp();
    let size = 1.0 / alpha;

    let mut ll = 0.0;
    let mut info = 0.0;
    for (&y, &m) in counts.iter().zip(mu.iter()) {
        let m = m.max(MIN_MEAN);
        ll += ln_gamma(y + size) - ln_gamma(size) - y * (m + size).ln() - size * (1.0 + m * alpha).ln();
        info += 1.0 / (1.0 / m + alpha);
    }

    let cox_reid = if info > 1e-10 { -0.5 * info.ln() } else { 0.0 };
    ll + cox_reid
}

/// Derivative of [`adjusted_log_likelihood`] with respect to `log(alpha)`
fn d_adjusted_log_likelihood(counts: &[f64], mu: &[f64], log_alpha: f64) -> f64 {
    let alpha = log_alpha.exp();
    let alpha_sq = alpha * alpha;
    let size = 1.0 / alpha;

    let mut dll = 0.0;
    let mut info = 0.0;
    let mut d_info = 0.0;
    for (&y, &m) in counts.iter().zip(mu.iter()) {
        let m = m.max(MIN_MEAN);
        dll += (digamma(size) - digamma(y + size)) / alpha_sq
            + y / (alpha_sq * (m + size))
            + (1.0 + m * alpha).ln() / alpha_sq
            - m / (alpha * (1.0 + m * alpha));

        let w = 1.0 / (1.0 / m + alpha);
        info += w;
        d_info -= w * w;
    }

    let d_cox_reid = if info > 1e-10 { -0.5 * d_info / info } else { 0.0 };
    (dll + d_cox_reid) * alpha
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Gamma, Poisson};

    #[test]
    fn test_all_zero_gene_is_nan() {
        let d = estimate_dispersion_gene(&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0], &DispersionParams::default());
        assert!(d.is_nan());
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let counts = [12.0, 40.0, 7.0, 25.0];
        let mu = [20.0, 21.0, 19.0, 24.0];
        let a = (0.3_f64).ln();
        let h = 1e-5;
        let numeric = (adjusted_log_likelihood(&counts, &mu, a + h) - adjusted_log_likelihood(&counts, &mu, a - h)) / (2.0 * h);
        let analytic = d_adjusted_log_likelihood(&counts, &mu, a);
        assert!(
            (numeric - analytic).abs() < 1e-4 * numeric.abs().max(1.0),
            "numeric {} vs analytic {}",
            numeric,
            analytic
        );
    }

    #[test]
    fn test_recovers_simulated_dispersion() {
        // NB as a Gamma-Poisson mixture with alpha = 0.2
        let alpha = 0.2_f64;
        let mean = 200.0_f64;
        let mut rng = StdRng::seed_from_u64(7);
        let gamma = Gamma::new(1.0 / alpha, mean * alpha).unwrap();

        let n_genes = 200;
        let n_samples = 12;
        let counts = Array2::from_shape_fn((n_genes, n_samples), |_| {
            let lambda: f64 = gamma.sample(&mut rng);
            Poisson::new(lambda.max(1e-8)).unwrap().sample(&mut rng)
        });
        let norm = Normalization::SizeFactors(Array1::from_elem(n_samples, 1.0));

        let disps = estimate_gene_dispersions(counts.view(), &norm, &DispersionParams::default()).unwrap();
        let mut sorted: Vec<f64> = disps.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[n_genes / 2];
        assert!(
            (median - alpha).abs() < 0.06,
            "median gene-wise dispersion {} should be near {}",
            median,
            alpha
        );
    }

    #[test]
    fn test_single_sample_rejected() {
        let counts = Array2::from_elem((3, 1), 5.0);
        let norm = Normalization::SizeFactors(Array1::from_elem(1, 1.0));
        let err = estimate_gene_dispersions(counts.view(), &norm, &DispersionParams::default()).unwrap_err();
        assert!(matches!(err, RlogError::InvalidInput { .. }));
    }
}
