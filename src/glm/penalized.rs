//! Ridge-penalized negative binomial GLM fitting for rlog
//!
//! Each gene is fit independently by IRLS. Every iteration solves the augmented
//! least squares system
//!
//! ```text
//!   [ diag(sqrt(w)) X ]          [ sqrt(w) z ]
//!   [ diag(sqrt(l))   ] beta  =  [     0     ]
//! ```
//!
//! by Householder QR. The penalty rows make the system full column rank even though
//! the blind design has more columns than samples.

use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use super::design::RlogDesign;
use super::negative_binomial::{nb_log_likelihood, nb_mean, nb_weight, MAX_BETA};
use crate::error::{Result, RlogError};

/// Penalty on the intercept column, on the log2 scale (effectively unpenalized)
pub const INTERCEPT_PENALTY: f64 = 1e-6;

/// Pivot magnitude under which the augmented system is considered singular
const SINGULAR_PIVOT: f64 = 1e-30;

/// IRLS settings for the penalized fit
#[derive(Debug, Clone, PartialEq)]
pub struct PenalizedFitParams {
    /// Relative deviance change at which a gene is considered converged
    pub beta_tol: f64,
    /// Iteration cap per gene
    pub max_iter: usize,
    /// Size of a dedicated worker pool; `None` runs on the global rayon pool
    pub threads: Option<usize>,
}

impl Default for PenalizedFitParams {
    fn default() -> Self {
        Self {
            beta_tol: 1e-4,
            max_iter: 100,
            threads: None,
        }
    }
}

/// Fit of a single gene
#[derive(Debug, Clone)]
pub struct GeneFit {
    /// Coefficients on the natural log scale
    pub beta: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    /// The IRLS iterate was unstable and the coordinate-wise optimizer was used
    pub used_fallback: bool,
}

/// Batch result, rows in the same order as the input genes
#[derive(Debug, Clone)]
pub struct PenalizedFit {
    /// Genes x design columns, on the log2 scale
    pub coefficients: Array2<f64>,
    pub converged: Vec<bool>,
    pub iterations: Vec<usize>,
    pub used_fallback: Vec<bool>,
}

impl PenalizedFit {
    /// Row indices (into the fitted rows) that hit the iteration cap or diverged
    pub fn non_converged(&self) -> Vec<usize> {
        self.converged
            .iter()
            .enumerate()
            .filter(|(_, &c)| !c)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Per-column ridge penalty on the natural log scale.
///
/// Every column gets `1 / beta_prior_var` except the intercept, which gets
/// [`INTERCEPT_PENALTY`]. Both are given on the log2 scale and divided by `ln(2)^2`.
pub fn ridge_penalty(design: &RlogDesign, beta_prior_var: f64) -> Vec<f64> {
    let ln2_sq = std::f64::consts::LN_2.powi(2);
    let mut lambda = vec![1.0 / beta_prior_var; design.n_coefs()];
    if let Some(k) = design.intercept_index() {
        lambda[k] = INTERCEPT_PENALTY;
    }
    lambda.iter().map(|l| l / ln2_sq).collect()
}

/// Fit the penalized NB GLM for every row of `counts`.
///
/// `norm_factors` has the same shape as `counts`; `lambda` is on the natural log
/// scale (see [`ridge_penalty`]); `dispersions` holds one value per row.
///
/// Genes that fail to converge keep their last iterate and are flagged. A singular
/// augmented system aborts the whole batch with `FatalNumerical`.
pub fn fit_penalized_glms(
    counts: ArrayView2<f64>,
    norm_factors: ArrayView2<f64>,
    design: &RlogDesign,
    lambda: &[f64],
    dispersions: &[f64],
    params: &PenalizedFitParams,
) -> Result<PenalizedFit> {
    let (n_genes, n_samples) = counts.dim();

    if norm_factors.dim() != counts.dim() {
        return Err(RlogError::DimensionMismatch {
            expected: format!("{} x {} normalization factors", n_genes, n_samples),
            got: format!("{} x {}", norm_factors.nrows(), norm_factors.ncols()),
        });
    }
    if design.n_samples() != n_samples {
        return Err(RlogError::DimensionMismatch {
            expected: format!("design with {} rows", n_samples),
            got: format!("{} rows", design.n_samples()),
        });
    }
    if lambda.len() != design.n_coefs() {
        return Err(RlogError::InvalidInput {
            reason: format!(
                "lambda has {} entries but the design has {} columns",
                lambda.len(),
                design.n_coefs()
            ),
        });
    }
    if lambda.iter().any(|&l| !(l > 0.0 && l.is_finite())) {
        return Err(RlogError::InvalidInput {
            reason: "lambda entries must be positive and finite".to_string(),
        });
    }
    if dispersions.len() != n_genes {
        return Err(RlogError::InvalidInput {
            reason: format!(
                "dispersions has {} entries for {} genes",
                dispersions.len(),
                n_genes
            ),
        });
    }
    if let Some(i) = dispersions.iter().position(|&a| !(a.is_finite() && a >= 0.0)) {
        return Err(RlogError::InvalidInput {
            reason: format!(
                "dispersions must be finite and non-negative (dispersions[{}] = {})",
                i, dispersions[i]
            ),
        });
    }

    let fit_all = || -> Result<Vec<GeneFit>> {
        (0..n_genes)
            .into_par_iter()
            .map(|i| {
                fit_penalized_gene(
                    counts.row(i),
                    norm_factors.row(i),
                    dispersions[i],
                    design,
                    lambda,
                    params,
                )
            })
            .collect()
    };

    let gene_fits = match params.threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
            pool.install(fit_all)?
        }
        None => fit_all()?,
    };

    let n_coefs = design.n_coefs();
    let mut coefficients = Array2::<f64>::zeros((n_genes, n_coefs));
    let mut converged = Vec::with_capacity(n_genes);
    let mut iterations = Vec::with_capacity(n_genes);
    let mut used_fallback = Vec::with_capacity(n_genes);

    for (i, fit) in gene_fits.into_iter().enumerate() {
        for (k, &b) in fit.beta.iter().enumerate() {
            coefficients[[i, k]] = b * std::f64::consts::LOG2_E;
        }
        converged.push(fit.converged);
        iterations.push(fit.iterations);
        used_fallback.push(fit.used_fallback);
    }

    Ok(PenalizedFit {
        coefficients,
        converged,
        iterations,
        used_fallback,
    })
}

/// Fit one gene by QR-augmented IRLS with a ridge penalty.
///
/// Each iteration:
///   1. `mu = nf * exp(X beta)`, floored at the minimum mean
///   2. `w = mu / (1 + alpha mu)`, `z = log(mu / nf) + (y - mu) / mu`
///   3. solve the augmented system by QR
///   4. stop when `|dev - dev_old| / (|dev| + 0.1) < beta_tol`
///
/// An iterate with `|beta| > 30` or non-finite values ends the loop. The gene is then
/// refit by [`optim_fallback`] from the last accepted iterate and is reported as not
/// converged.
pub fn fit_penalized_gene(
    counts: ArrayView1<f64>,
    norm_factors: ArrayView1<f64>,
    alpha: f64,
    design: &RlogDesign,
    lambda: &[f64],
    params: &PenalizedFitParams,
) -> Result<GeneFit> {
    let n_samples = counts.len();
    let n_coefs = design.n_coefs();
    let x = design.matrix();

    let initial = initial_beta(counts, norm_factors, design);
    let mut beta = initial.clone();

    let n_aug = n_samples + n_coefs;
    let mut mu = vec![0.0_f64; n_samples];
    let mut a_mat = vec![0.0_f64; n_aug * n_coefs];
    let mut big_z = vec![0.0_f64; n_aug];

    let mut dev_old = 0.0_f64;
    let mut converged = false;
    let mut diverged = false;
    let mut iterations = 0;

    for t in 0..params.max_iter {
        iterations = t + 1;

        for s in 0..n_samples {
            mu[s] = nb_mean(design.eta(s, &beta), norm_factors[s]);
        }

        for s in 0..n_samples {
            let w = nb_weight(mu[s], alpha);
            let z = (mu[s] / norm_factors[s]).ln() + (counts[s] - mu[s]) / mu[s];
            let sw = w.sqrt();
            for k in 0..n_coefs {
                a_mat[s * n_coefs + k] = sw * x[[s, k]];
            }
            big_z[s] = sw * z;
        }
        for k in 0..n_coefs {
            a_mat[(n_samples + k) * n_coefs + k] = lambda[k].sqrt();
            big_z[n_samples + k] = 0.0;
        }

        let new_beta = qr_solve_augmented(&a_mat, &big_z, n_aug, n_coefs)?;

        if new_beta.iter().any(|b| !b.is_finite() || b.abs() > MAX_BETA) {
            diverged = true;
            break;
        }
        beta = new_beta;

        let dev: f64 = (0..n_samples)
            .map(|s| {
                let m = nb_mean(design.eta(s, &beta), norm_factors[s]);
                -2.0 * nb_log_likelihood(counts[s], m, alpha)
            })
            .sum();

        if t > 0 {
            let conv_test = (dev - dev_old).abs() / (dev.abs() + 0.1);
            if conv_test.is_nan() {
                break;
            }
            if conv_test < params.beta_tol {
                converged = true;
                break;
            }
        }

        dev_old = dev;
    }

    let stable = !diverged
        && beta.iter().all(|b| b.is_finite() && b.abs() <= MAX_BETA)
        && (0..n_samples).all(|s| {
            let w = nb_weight(nb_mean(design.eta(s, &beta), norm_factors[s]), alpha);
            w > 0.0 && w.is_finite()
        });

    if !stable {
        let start = if diverged { &beta } else { &initial };
        let beta = optim_fallback(counts, norm_factors, alpha, design, lambda, start);
        return Ok(GeneFit {
            beta,
            converged: false,
            iterations,
            used_fallback: true,
        });
    }

    Ok(GeneFit {
        beta,
        converged,
        iterations,
        used_fallback: false,
    })
}

/// Starting coefficients.
///
/// With an intercept the design is rank deficient: the intercept starts at the log
/// of the mean normalized count and every sample column at zero. Without one the
/// design is the identity and each coefficient starts at `log(y / nf + 0.1)`.
fn initial_beta(counts: ArrayView1<f64>, norm_factors: ArrayView1<f64>, design: &RlogDesign) -> Vec<f64> {
    let n_samples = counts.len();
    let normalized: Vec<f64> = counts
        .iter()
        .zip(norm_factors.iter())
        .map(|(&y, &nf)| y / nf)
        .collect();

    let mut beta = vec![0.0_f64; design.n_coefs()];
    match design.intercept_index() {
        Some(k) => {
            let mean_nc = normalized.iter().sum::<f64>() / n_samples as f64;
            beta[k] = mean_nc.max(0.1).ln();
        }
        None => {
            for (s, nc) in normalized.iter().enumerate() {
                beta[s] = (nc + 0.1).ln();
            }
        }
    }
    beta
}

/// Solve `A x = b` in the least squares sense via Householder QR.
///
/// `a` is `m x n` row-major with `m >= n`. A vanishing pivot means the penalty
/// failed to regularize the system and is reported as `FatalNumerical`.
fn qr_solve_augmented(a: &[f64], b: &[f64], m: usize, n: usize) -> Result<Vec<f64>> {
    let mut r = a[..m * n].to_vec();
    let mut qt_b = b.to_vec();
    let mut v = vec![0.0_f64; m];

    for j in 0..n {
        let norm_sq: f64 = (j..m).map(|i| r[i * n + j] * r[i * n + j]).sum();
        if norm_sq < SINGULAR_PIVOT {
            return Err(singular_column(j));
        }

        let norm = norm_sq.sqrt();
        let r_jj = r[j * n + j];
        let sign = if r_jj >= 0.0 { 1.0 } else { -1.0 };
        let u0 = r_jj + sign * norm;

        let len = m - j;
        v[0] = 1.0;
        for i in 1..len {
            v[i] = r[(j + i) * n + j] / u0;
        }
        let tau = 2.0 / v[..len].iter().map(|vi| vi * vi).sum::<f64>();

        for k in j..n {
            let dot: f64 = (0..len).map(|i| v[i] * r[(j + i) * n + k]).sum();
            for i in 0..len {
                r[(j + i) * n + k] -= tau * v[i] * dot;
            }
        }

        let dot_b: f64 = (0..len).map(|i| v[i] * qt_b[j + i]).sum();
        for i in 0..len {
            qt_b[j + i] -= tau * v[i] * dot_b;
        }
    }

    let mut x = vec![0.0_f64; n];
    for i in (0..n).rev() {
        let mut sum = qt_b[i];
        for j in (i + 1)..n {
            sum -= r[i * n + j] * x[j];
        }
        let r_ii = r[i * n + i];
        if r_ii.abs() < SINGULAR_PIVOT {
            return Err(singular_column(i));
        }
        x[i] = sum / r_ii;
    }

    Ok(x)
}

fn singular_column(j: usize) -> RlogError {
    RlogError::FatalNumerical {
        operation: "penalized IRLS".to_string(),
        details: format!("augmented design is singular at column {} after penalization", j),
    }
}

/// Coordinate-wise Newton optimizer with Armijo backtracking.
///
/// Maximizes `logLik - 0.5 * sum(lambda_k * beta_k^2)` one coefficient at a time,
/// with every coefficient kept within `[-MAX_BETA, MAX_BETA]`.
fn optim_fallback(
    counts: ArrayView1<f64>,
    norm_factors: ArrayView1<f64>,
    alpha: f64,
    design: &RlogDesign,
    lambda: &[f64],
    initial_beta: &[f64],
) -> Vec<f64> {
    let n_samples = counts.len();
    let n_coefs = design.n_coefs();
    let x = design.matrix();
    let max_iter = 5000;
    let tol = 1e-8;

    let mut beta: Vec<f64> = initial_beta.iter().map(|b| b.clamp(-MAX_BETA, MAX_BETA)).collect();
    let mut mu = vec![0.0_f64; n_samples];

    let compute_mu = |beta: &[f64], mu: &mut [f64]| {
        for s in 0..n_samples {
            mu[s] = nb_mean(design.eta(s, beta), norm_factors[s]);
        }
    };

    let penalized_ll = |beta: &[f64], mu: &mut [f64]| -> f64 {
        compute_mu(beta, mu);
        let ll: f64 = (0..n_samples)
            .map(|s| nb_log_likelihood(counts[s], mu[s], alpha))
            .sum();
        let penalty: f64 = (0..n_coefs).map(|k| 0.5 * lambda[k] * beta[k] * beta[k]).sum();
        ll - penalty
    };

    let mut ll_old = penalized_ll(&beta, &mut mu);

    for _ in 0..max_iter {
        let ll_start = ll_old;
        compute_mu(&beta, &mut mu);

        for j in 0..n_coefs {
            let mut grad = -lambda[j] * beta[j];
            let mut hess = -lambda[j];
            for s in 0..n_samples {
                let xsj = x[[s, j]];
                grad += (counts[s] - mu[s]) / (1.0 + alpha * mu[s]) * xsj;
                hess -= nb_weight(mu[s], alpha) * xsj * xsj;
            }

            if hess.abs() < 1e-20 {
                continue;
            }
            let delta = -grad / hess;
            if delta.abs() < 1e-14 {
                continue;
            }

            let beta_j_old = beta[j];
            let mut step = 1.0;
            let mut improved = false;
            for _ in 0..30 {
                beta[j] = (beta_j_old + step * delta).clamp(-MAX_BETA, MAX_BETA);
                let ll_new = penalized_ll(&beta, &mut mu);
                if ll_new >= ll_old + 1e-4 * step * grad * delta {
                    ll_old = ll_new;
                    improved = true;
                    break;
                }
                step *= 0.5;
            }

            if !improved {
                beta[j] = beta_j_old;
            }
            compute_mu(&beta, &mut mu);
        }

        if (ll_old - ll_start).abs() / (ll_old.abs() + 0.1) < tol {
            break;
        }
    }

    beta
}
