//! Per-sample design matrices for the rlog fit
//!
//! Every sample receives its own coefficient. In blind mode an intercept column is
//! added, so the model has one more column than rows; the ridge penalty on the
//! sample columns is what makes it identifiable. In frozen mode the intercept comes
//! from a previous fit and the design is the identity.

use ndarray::{Array1, Array2, ArrayView1};

/// Name of the intercept column
pub const INTERCEPT_NAME: &str = "Intercept";

/// Samples x coefficients indicator matrix with column names
#[derive(Debug, Clone, PartialEq)]
pub struct RlogDesign {
    matrix: Array2<f64>,
    column_names: Vec<String>,
    intercept_index: Option<usize>,
}

impl RlogDesign {
    /// Intercept plus one deviation column per sample: `n x (n + 1)`.
    ///
    /// Row `j` has a 1 in the intercept column and in column `j + 1`.
    pub fn blind(n_samples: usize) -> Self {
        let mut matrix = Array2::<f64>::zeros((n_samples, n_samples + 1));
        for j in 0..n_samples {
            matrix[[j, 0]] = 1.0;
            matrix[[j, j + 1]] = 1.0;
        }

        let mut column_names = Vec::with_capacity(n_samples + 1);
        column_names.push(INTERCEPT_NAME.to_string());
        column_names.extend((1..=n_samples).map(sample_column_name));

        Self {
            matrix,
            column_names,
            intercept_index: Some(0),
        }
    }

    /// One column per sample and no intercept: the `n x n` identity
    pub fn frozen(n_samples: usize) -> Self {
        Self {
            matrix: Array2::eye(n_samples),
            column_names: (1..=n_samples).map(sample_column_name).collect(),
            intercept_index: None,
        }
    }

    /// Frozen design when an external intercept is supplied, blind otherwise
    pub fn for_samples(n_samples: usize, frozen_intercept: bool) -> Self {
        if frozen_intercept {
            Self::frozen(n_samples)
        } else {
            Self::blind(n_samples)
        }
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_coefs(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn intercept_index(&self) -> Option<usize> {
        self.intercept_index
    }

    pub fn has_intercept(&self) -> bool {
        self.intercept_index.is_some()
    }

    /// Linear predictor for one sample
    pub fn eta(&self, sample: usize, beta: &[f64]) -> f64 {
        self.matrix
            .row(sample)
            .iter()
            .zip(beta.iter())
            .map(|(x, b)| x * b)
            .sum()
    }

    /// Fitted values `X * beta` across all samples
    pub fn fitted_values(&self, beta: ArrayView1<f64>) -> Array1<f64> {
        self.matrix.dot(&beta)
    }
}

fn sample_column_name(j: usize) -> String {
    format!("samples{}", j)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_blind_design_layout() {
        let d = RlogDesign::blind(3);
        assert_eq!(d.matrix().dim(), (3, 4));
        assert_eq!(d.intercept_index(), Some(0));
        assert_eq!(d.column_names(), &["Intercept", "samples1", "samples2", "samples3"]);
        for j in 0..3 {
            assert_eq!(d.matrix()[[j, 0]], 1.0);
            assert_eq!(d.matrix().row(j).sum(), 2.0);
            assert_eq!(d.matrix()[[j, j + 1]], 1.0);
        }
    }

    #[test]
    fn test_frozen_design_is_identity() {
        let d = RlogDesign::frozen(4);
        assert_eq!(d.matrix(), &Array2::<f64>::eye(4));
        assert!(!d.has_intercept());
        assert_eq!(d.column_names()[3], "samples4");
    }

    #[test]
    fn test_single_sample_frozen_design() {
        let d = RlogDesign::for_samples(1, true);
        assert_eq!(d.matrix().dim(), (1, 1));
        assert_eq!(d.matrix()[[0, 0]], 1.0);
        assert_eq!(d.column_names(), &["samples1"]);
    }

    #[test]
    fn test_for_samples_selects_mode() {
        assert_eq!(RlogDesign::for_samples(3, false), RlogDesign::blind(3));
        assert_eq!(RlogDesign::for_samples(3, true), RlogDesign::frozen(3));
    }

    #[test]
    fn test_fitted_values() {
        let d = RlogDesign::blind(2);
        let beta = array![5.0, -1.0, 1.0];
        let fitted = d.fitted_values(beta.view());
        assert_eq!(fitted, array![4.0, 6.0]);
        assert_eq!(d.eta(1, beta.as_slice().unwrap()), 6.0);
    }
}
