//! Size factor estimation by the median of ratios

use ndarray::{Array1, ArrayView2, Axis};

use crate::error::{Result, RlogError};

/// Method for size factor estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeFactorMethod {
    /// Median of ratios against genes with no zero count
    Ratio,
    /// Geometric means over positive counts only; tolerates genes with zeros
    PosCounts,
}

/// Estimate one size factor per sample.
///
/// Each sample's factor is the median, over reference genes, of
/// `count / geometric_mean(gene)`.
pub fn estimate_size_factors(counts: ArrayView2<f64>, method: SizeFactorMethod) -> Result<Array1<f64>> {
    let (n_genes, n_samples) = counts.dim();
    if n_genes == 0 || n_samples == 0 {
        return Err(RlogError::EmptyData {
            reason: "Count matrix is empty".to_string(),
        });
    }

    let geo_means: Vec<(usize, f64)> = counts
        .axis_iter(Axis(0))
        .enumerate()
        .filter_map(|(i, row)| {
            let usable = match method {
                SizeFactorMethod::Ratio => row.iter().all(|&x| x > 0.0),
                SizeFactorMethod::PosCounts => row.iter().any(|&x| x > 0.0),
            };
            if !usable {
                return None;
            }
            // Zeros contribute nothing to the log sum but still count in the denominator
            let log_sum: f64 = row.iter().filter(|&&x| x > 0.0).map(|x| x.ln()).sum();
            Some((i, (log_sum / n_samples as f64).exp()))
        })
        .collect();

    if geo_means.is_empty() {
        return Err(RlogError::SizeFactorFailed {
            reason: match method {
                SizeFactorMethod::Ratio => {
                    "every gene contains at least one zero; try the poscounts method".to_string()
                }
                SizeFactorMethod::PosCounts => "No genes with positive counts found".to_string(),
            },
        });
    }

    let mut size_factors = Array1::zeros(n_samples);
    for j in 0..n_samples {
        let mut ratios: Vec<f64> = geo_means
            .iter()
            .filter_map(|&(i, gm)| {
                let c = counts[[i, j]];
                (c > 0.0 && gm > 0.0).then(|| c / gm)
            })
            .collect();

        size_factors[j] = match median(&mut ratios) {
            Some(m) => m,
            None if method == SizeFactorMethod::PosCounts => 1.0,
            None => {
                return Err(RlogError::SizeFactorFailed {
                    reason: format!("No valid ratios for sample {}", j),
                })
            }
        };
    }

    if method == SizeFactorMethod::PosCounts {
        // Center so the geometric mean of the factors is one
        let log_mean = size_factors.iter().map(|x| x.ln()).sum::<f64>() / n_samples as f64;
        let center = log_mean.exp();
        size_factors.mapv_inplace(|x| x / center);
    }

    if size_factors.iter().any(|&x| x <= 0.0 || !x.is_finite()) {
        return Err(RlogError::SizeFactorFailed {
            reason: "Invalid size factors computed".to_string(),
        });
    }

    Ok(size_factors)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    Some(if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_ratio_size_factors_track_depth() {
        let counts = array![
            [100.0, 200.0, 80.0, 160.0],
            [500.0, 1000.0, 400.0, 800.0],
            [50.0, 100.0, 40.0, 80.0],
            [200.0, 400.0, 160.0, 320.0]
        ];
        let sf = estimate_size_factors(counts.view(), SizeFactorMethod::Ratio).unwrap();
        assert_eq!(sf.len(), 4);
        assert!(sf.iter().all(|&x| x > 0.0));
        assert!((sf[1] / sf[0] - 2.0).abs() < 1e-10);
        assert!((sf[3] / sf[2] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_ratio_fails_when_every_gene_has_zero() {
        let counts = array![[0.0, 10.0], [5.0, 0.0]];
        let err = estimate_size_factors(counts.view(), SizeFactorMethod::Ratio).unwrap_err();
        assert!(matches!(err, RlogError::SizeFactorFailed { .. }));
    }

    #[test]
    fn test_poscounts_handles_zeros() {
        let counts = array![[0.0, 10.0, 20.0], [5.0, 0.0, 10.0], [8.0, 16.0, 0.0]];
        let sf = estimate_size_factors(counts.view(), SizeFactorMethod::PosCounts).unwrap();
        let log_mean = sf.iter().map(|x| x.ln()).sum::<f64>() / 3.0;
        assert!(log_mean.abs() < 1e-10, "poscounts factors should be centered");
    }
}
