//! Dispersion-mean trend fitting
//!
//! The fitted trend is returned as a [`DispersionFunction`], which can be stored with
//! frozen rlog parameters and evaluated later on new base means.

use std::fmt;
use std::str::FromStr;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RlogError};

/// Method for fitting the dispersion-mean trend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendFitMethod {
    /// `dispersion = asympt_disp + extra_pois / mean`
    #[default]
    Parametric,
    /// Local quadratic regression of log dispersion on log mean
    Local,
    /// Trimmed mean of the gene-wise estimates
    Mean,
}

impl FromStr for TrendFitMethod {
    type Err = RlogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "parametric" => Ok(TrendFitMethod::Parametric),
            "local" => Ok(TrendFitMethod::Local),
            "mean" => Ok(TrendFitMethod::Mean),
            other => Err(RlogError::InvalidInput {
                reason: format!("unknown fit type '{}' (expected parametric, local or mean)", other),
            }),
        }
    }
}

impl fmt::Display for TrendFitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrendFitMethod::Parametric => "parametric",
            TrendFitMethod::Local => "local",
            TrendFitMethod::Mean => "mean",
        };
        f.write_str(name)
    }
}

/// Evaluation point of a local trend: fitted log dispersion and slope at `log_mean`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalTrendPoint {
    pub log_mean: f64,
    pub value: f64,
    pub slope: f64,
}

/// A fitted dispersion-mean relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DispersionFunction {
    Parametric { asympt_disp: f64, extra_pois: f64 },
    Local { points: Vec<LocalTrendPoint> },
    Mean { value: f64 },
}

impl DispersionFunction {
    /// Trend dispersion at a base mean; NaN for non-positive or non-finite means
    pub fn predict(&self, mean: f64) -> f64 {
        if !(mean > 0.0 && mean.is_finite()) {
            return f64::NAN;
        }
        match self {
            DispersionFunction::Parametric { asympt_disp, extra_pois } => asympt_disp + extra_pois / mean,
            DispersionFunction::Local { points } => hermite_interpolate(points, mean.ln()).exp().max(1e-8),
            DispersionFunction::Mean { value } => *value,
        }
    }

    /// [`predict`](Self::predict) over a vector of base means
    pub fn predict_all(&self, means: &[f64]) -> Array1<f64> {
        means.iter().map(|&m| self.predict(m)).collect()
    }
}

/// Fit the trend of gene-wise dispersions against base means.
///
/// Only genes with a positive mean and a dispersion above `100 * min_disp` take part.
/// A failed parametric fit falls back to the local fit.
pub fn fit_dispersion_trend(
    base_means: &[f64],
    gene_dispersions: &[f64],
    method: TrendFitMethod,
    min_disp: f64,
) -> Result<DispersionFunction> {
    if base_means.len() != gene_dispersions.len() {
        return Err(RlogError::DimensionMismatch {
            expected: format!("{} gene-wise dispersions", base_means.len()),
            got: format!("{}", gene_dispersions.len()),
        });
    }

    let usable: Vec<(f64, f64)> = base_means
        .iter()
        .zip(gene_dispersions.iter())
        .filter(|(&m, &d)| m > 0.0 && m.is_finite() && d.is_finite() && d > 100.0 * min_disp)
        .map(|(&m, &d)| (m, d))
        .collect();

    if usable.is_empty() {
        return Err(RlogError::TrendFittingFailed {
            reason: "all gene-wise dispersion estimates are within 2 orders of magnitude \
                     of the minimum value, so the trend cannot be fit"
                .to_string(),
        });
    }

    match method {
        TrendFitMethod::Parametric => match fit_parametric(&usable) {
            Ok(function) => Ok(function),
            Err(e) => {
                log::warn!("parametric dispersion trend failed ({}), using local regression", e);
                fit_local(&usable)
            }
        },
        TrendFitMethod::Local => fit_local(&usable),
        TrendFitMethod::Mean => Ok(DispersionFunction::Mean {
            value: trimmed_mean(usable.iter().map(|&(_, d)| d).collect(), 0.001),
        }),
    }
}

/// Iterated Gamma GLM (identity link) of dispersion on `1 / mean`.
///
/// Each round drops genes whose residual `disp / fitted` lies outside `(1e-4, 15)`,
/// refits from the current coefficients, and stops once
/// `sum(log(coef / coef_old)^2) < 1e-6` with a converged inner fit.
fn fit_parametric(data: &[(f64, f64)]) -> Result<DispersionFunction> {
    let mut coefs = (0.1_f64, 1.0_f64);

    for round in 0..11 {
        let old = coefs;
        let kept: Vec<(f64, f64)> = data
            .iter()
            .copied()
            .filter(|&(mean, disp)| {
                let fitted = coefs.0 + coefs.1 / mean;
                fitted > 0.0 && {
                    let residual = disp / fitted;
                    residual > 1e-4 && residual < 15.0
                }
            })
            .collect();

        if kept.len() < 3 {
            return Err(RlogError::TrendFittingFailed {
                reason: format!("only {} genes left after residual filtering", kept.len()),
            });
        }

        let (next, converged) = gamma_identity_glm(&kept, coefs);
        coefs = next;
        log::debug!(
            "parametric trend round {}: {} genes, asympt_disp={:.6}, extra_pois={:.6}",
            round + 1,
            kept.len(),
            coefs.0,
            coefs.1
        );

        if !(coefs.0 > 0.0 && coefs.1 > 0.0) {
            return Err(RlogError::TrendFittingFailed {
                reason: format!(
                    "coefficients not positive (asympt_disp={:.4}, extra_pois={:.4})",
                    coefs.0, coefs.1
                ),
            });
        }

        let change = (coefs.0 / old.0).ln().powi(2) + (coefs.1 / old.1).ln().powi(2);
        if change < 1e-6 && converged {
            return Ok(DispersionFunction::Parametric {
                asympt_disp: coefs.0,
                extra_pois: coefs.1,
            });
        }
    }

    Err(RlogError::TrendFittingFailed {
        reason: "parametric dispersion fit did not converge".to_string(),
    })
}

/// IRLS for `disp ~ a0 + a1 / mean` with Gamma variance; returns the coefficients and
/// whether the relative deviance change fell below `1e-8`
fn gamma_identity_glm(data: &[(f64, f64)], start: (f64, f64)) -> ((f64, f64), bool) {
    let deviance = |a0: f64, a1: f64| -> f64 {
        data.iter()
            .map(|&(mean, disp)| {
                let mu = (a0 + a1 / mean).max(1e-8);
                2.0 * (-(disp / mu).ln() + (disp - mu) / mu)
            })
            .sum()
    };

    let (mut a0, mut a1) = start;
    let mut dev_old = deviance(a0, a1);

    for _ in 0..25 {
        let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for &(mean, disp) in data {
            let x = 1.0 / mean;
            let mu = (a0 + a1 * x).max(1e-8);
            let w = 1.0 / (mu * mu);
            sw += w;
            swx += w * x;
            swy += w * disp;
            swxx += w * x * x;
            swxy += w * x * disp;
        }

        let det = sw * swxx - swx * swx;
        if det.abs() < 1e-10 {
            return ((a0, a1), false);
        }
        a0 = (swxx * swy - swx * swxy) / det;
        a1 = (sw * swxy - swx * swy) / det;

        let dev = deviance(a0, a1);
        if (dev_old - dev).abs() / (0.1 + dev.abs()) < 1e-8 {
            return ((a0, a1), true);
        }
        dev_old = dev;
    }

    ((a0, a1), false)
}

/// Local quadratic fit of log dispersion on log mean, weighted by mean.
///
/// Falls back to the mean trend when fewer than five genes are usable.
fn fit_local(data: &[(f64, f64)]) -> Result<DispersionFunction> {
    if data.len() < 5 {
        log::warn!(
            "only {} genes usable for the local dispersion trend, using the mean",
            data.len()
        );
        return Ok(DispersionFunction::Mean {
            value: trimmed_mean(data.iter().map(|&(_, d)| d).collect(), 0.001),
        });
    }

    let mut logged: Vec<(f64, f64, f64)> = data.iter().map(|&(m, d)| (m.ln(), d.ln(), m)).collect();
    logged.sort_by(|a, b| a.0.total_cmp(&b.0));

    let fitter = LocalFitter {
        x: logged.iter().map(|p| p.0).collect(),
        y: logged.iter().map(|p| p.1).collect(),
        weights: logged.iter().map(|p| p.2).collect(),
        k: ((logged.len() as f64 * 0.7) as usize).clamp(3, logged.len()),
    };

    Ok(DispersionFunction::Local {
        points: fitter.evaluation_points(0.8),
    })
}

/// Nearest-neighbour bandwidth local regression on sorted data
struct LocalFitter {
    x: Vec<f64>,
    y: Vec<f64>,
    weights: Vec<f64>,
    /// Neighbours inside each bandwidth
    k: usize,
}

impl LocalFitter {
    /// Fit at both ends of the data, then bisect every cell wider than `cut` times
    /// the smaller bandwidth of its endpoints
    fn evaluation_points(&self, cut: f64) -> Vec<LocalTrendPoint> {
        let (lo, hi) = (self.x[0], self.x[self.x.len() - 1]);
        let mut points = Vec::new();
        let left = self.fit_at(lo);
        let right = self.fit_at(hi);
        points.push(left.0);
        self.split(left, right, cut, &mut points);
        points.push(right.0);
        points
    }

    fn split(
        &self,
        left: (LocalTrendPoint, f64),
        right: (LocalTrendPoint, f64),
        cut: f64,
        points: &mut Vec<LocalTrendPoint>,
    ) {
        let width = right.0.log_mean - left.0.log_mean;
        if width < 1e-10 || width / left.1.min(right.1) <= cut {
            return;
        }
        let mid = self.fit_at(0.5 * (left.0.log_mean + right.0.log_mean));
        self.split(left, mid, cut, points);
        points.push(mid.0);
        self.split(mid, right, cut, points);
    }

    /// Tricube-weighted quadratic fit at `x0` over its `k` nearest neighbours.
    /// Returns the evaluation point and its bandwidth.
    fn fit_at(&self, x0: f64) -> (LocalTrendPoint, f64) {
        let h = self.bandwidth(x0);

        // Normal equations for the basis [1, dx, dx^2 / 2]
        let mut m = [[0.0_f64; 3]; 3];
        let mut b = [0.0_f64; 3];
        for ((&xi, &yi), &wi) in self.x.iter().zip(self.y.iter()).zip(self.weights.iter()) {
            let dx = xi - x0;
            let u = dx.abs() / h;
            if u >= 1.0 {
                continue;
            }
            let w = (1.0 - u.powi(3)).powi(3) * wi;
            let f = [1.0, dx, 0.5 * dx * dx];
            for r in 0..3 {
                b[r] += w * f[r] * yi;
                for c in 0..3 {
                    m[r][c] += w * f[r] * f[c];
                }
            }
        }

        let (value, slope) = solve_value_and_slope(&m, &b);
        (
            LocalTrendPoint {
                log_mean: x0,
                value,
                slope,
            },
            h,
        )
    }

    /// Distance from `x0` to the farthest of its `k` nearest neighbours
    fn bandwidth(&self, x0: f64) -> f64 {
        let n = self.x.len();
        let centre = self.x.partition_point(|&v| v < x0).min(n - 1);
        let (mut l, mut r) = (centre, centre);
        while r - l + 1 < self.k {
            let grow_left = match (l > 0, r + 1 < n) {
                (true, true) => (x0 - self.x[l - 1]).abs() < (self.x[r + 1] - x0).abs(),
                (true, false) => true,
                (false, true) => false,
                (false, false) => break,
            };
            if grow_left {
                l -= 1;
            } else {
                r += 1;
            }
        }
        (x0 - self.x[l]).abs().max((self.x[r] - x0).abs()).max(1e-10)
    }
}

/// Intercept and slope of the 3x3 normal equations by Cramer's rule; the weighted mean
/// with zero slope when the system is singular
fn solve_value_and_slope(m: &[[f64; 3]; 3], b: &[f64; 3]) -> (f64, f64) {
    let det3 = |a: [[f64; 3]; 3]| -> f64 {
        a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1]) - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
            + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0])
    };

    let det = det3(*m);
    let scale = m[0][0].max(1.0) * m[1][1].max(1.0) * m[2][2].max(1.0);
    if det.abs() < 1e-15 * scale {
        let value = if m[0][0] > 1e-10 { b[0] / m[0][0] } else { 0.0 };
        return (value, 0.0);
    }

    let with_column = |col: usize| {
        let mut a = *m;
        for r in 0..3 {
            a[r][col] = b[r];
        }
        det3(a)
    };
    (with_column(0) / det, with_column(1) / det)
}

/// Cubic Hermite interpolation between evaluation points, linear extrapolation outside
fn hermite_interpolate(points: &[LocalTrendPoint], x: f64) -> f64 {
    let (first, last) = match (points.first(), points.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return f64::NAN,
    };
    if x <= first.log_mean {
        return first.value + first.slope * (x - first.log_mean);
    }
    if x >= last.log_mean {
        return last.value + last.slope * (x - last.log_mean);
    }

    let right_idx = points.partition_point(|p| p.log_mean <= x).min(points.len() - 1);
    let left = &points[right_idx - 1];
    let right = &points[right_idx];

    let d = right.log_mean - left.log_mean;
    if d.abs() < 1e-15 {
        return left.value;
    }
    let t = (x - left.log_mean) / d;
    let h_right = t * t * (3.0 - 2.0 * t);
    let h_left = 1.0 - h_right;
    let s_left = t * (1.0 - t) * (1.0 - t);
    let s_right = t * t * (t - 1.0);

    h_left * left.value + h_right * right.value + d * (s_left * left.slope + s_right * right.slope)
}

/// Mean after dropping `floor(n * trim)` values from each end
fn trimmed_mean(mut values: Vec<f64>, trim: f64) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    let cut = ((n as f64) * trim).floor() as usize;
    let kept = if 2 * cut < n { &values[cut..n - cut] } else { &values[..] };
    kept.iter().sum::<f64>() / kept.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend_data(n: usize) -> (Vec<f64>, Vec<f64>) {
        let means: Vec<f64> = (1..=n).map(|i| (i as f64) * 15.0).collect();
        let disps: Vec<f64> = means
            .iter()
            .enumerate()
            .map(|(i, &m)| (0.05 + 2.0 / m) * if i % 2 == 0 { 1.2 } else { 0.85 })
            .collect();
        (means, disps)
    }

    #[test]
    fn test_gamma_glm_recovers_coefficients() {
        let data: Vec<(f64, f64)> = (1..50)
            .map(|i| {
                let mean = i as f64 * 20.0 + 100.0;
                (mean, 0.1 + 10.0 / mean)
            })
            .collect();
        let ((a0, a1), converged) = gamma_identity_glm(&data, (0.1, 1.0));
        assert!(converged);
        assert!((a0 - 0.1).abs() < 1e-6, "a0 = {}", a0);
        assert!((a1 - 10.0).abs() < 1e-4, "a1 = {}", a1);
    }

    #[test]
    fn test_parametric_trend() {
        let (means, disps) = trend_data(200);
        let f = fit_dispersion_trend(&means, &disps, TrendFitMethod::Parametric, 1e-8).unwrap();
        match f {
            DispersionFunction::Parametric { asympt_disp, extra_pois } => {
                assert!(asympt_disp > 0.0 && extra_pois > 0.0);
            }
            other => panic!("expected a parametric fit, got {:?}", other),
        }
        assert!(f.predict(10.0) > f.predict(1000.0), "trend should decrease with the mean");
        assert!(f.predict(0.0).is_nan());
    }

    #[test]
    fn test_local_trend_is_positive_and_decreasing() {
        let (means, disps) = trend_data(150);
        let f = fit_dispersion_trend(&means, &disps, TrendFitMethod::Local, 1e-8).unwrap();
        let fitted = f.predict_all(&means);
        assert!(fitted.iter().all(|&v| v > 0.0 && v.is_finite()));
        assert!(fitted[0] > fitted[149]);
    }

    #[test]
    fn test_hermite_interpolation_hits_evaluation_points() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let fitter = LocalFitter {
            y: xs.iter().map(|x| x.sin()).collect(),
            weights: vec![1.0; 10],
            k: 7,
            x: xs,
        };
        let points = fitter.evaluation_points(0.8);
        assert!(points.windows(2).all(|w| w[0].log_mean < w[1].log_mean));
        for p in &points {
            let pred = hermite_interpolate(&points, p.log_mean);
            assert!((pred - p.value).abs() < 1e-9, "{} vs {}", pred, p.value);
        }
    }

    #[test]
    fn test_mean_trend() {
        let f = fit_dispersion_trend(&[10.0, 20.0, 30.0], &[0.1, 0.2, 0.3], TrendFitMethod::Mean, 1e-8).unwrap();
        match f {
            DispersionFunction::Mean { value } => assert!((value - 0.2).abs() < 1e-12),
            other => panic!("expected a mean fit, got {:?}", other),
        }
    }

    #[test]
    fn test_all_estimates_near_minimum_fail() {
        let err = fit_dispersion_trend(&[10.0, 20.0], &[1e-8, 5e-7], TrendFitMethod::Parametric, 1e-8).unwrap_err();
        assert!(matches!(err, RlogError::TrendFittingFailed { .. }));
    }

    #[test]
    fn test_function_serde() {
        let f = DispersionFunction::Parametric {
            asympt_disp: 0.05,
            extra_pois: 2.0,
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"type\":\"parametric\""));
        let back: DispersionFunction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
        assert_eq!("Local".parse::<TrendFitMethod>().unwrap(), TrendFitMethod::Local);
    }
}
