//! RlogDataSet - count matrix plus the normalization and dispersion state rlog needs

use ndarray::{Array1, Array2};

use super::CountMatrix;
use crate::dispersion::DispersionFunction;
use crate::error::{Result, RlogError};
use crate::normalization::Normalization;

/// Counts together with everything estimated or supplied upstream of the transform
#[derive(Debug, Clone)]
pub struct RlogDataSet {
    counts: CountMatrix,
    size_factors: Option<Array1<f64>>,
    /// Gene x sample factors; used instead of size factors when present
    normalization_factors: Option<Array2<f64>>,
    /// Trend dispersion per gene
    dispersion_fit: Option<Array1<f64>>,
    dispersion_function: Option<DispersionFunction>,
}

impl RlogDataSet {
    pub fn new(counts: CountMatrix) -> Self {
        Self {
            counts,
            size_factors: None,
            normalization_factors: None,
            dispersion_fit: None,
            dispersion_function: None,
        }
    }

    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }

    pub fn n_samples(&self) -> usize {
        self.counts.n_samples()
    }

    pub fn size_factors(&self) -> Option<&Array1<f64>> {
        self.size_factors.as_ref()
    }

    pub fn normalization_factors(&self) -> Option<&Array2<f64>> {
        self.normalization_factors.as_ref()
    }

    pub fn dispersion_fit(&self) -> Option<&Array1<f64>> {
        self.dispersion_fit.as_ref()
    }

    pub fn dispersion_function(&self) -> Option<&DispersionFunction> {
        self.dispersion_function.as_ref()
    }

    pub fn has_normalization(&self) -> bool {
        self.size_factors.is_some() || self.normalization_factors.is_some()
    }

    /// Normalization in effect: the factor matrix if set, else the size factors
    pub fn normalization(&self) -> Option<Normalization> {
        match (&self.normalization_factors, &self.size_factors) {
            (Some(nf), _) => Some(Normalization::Factors(nf.clone())),
            (None, Some(sf)) => Some(Normalization::SizeFactors(sf.clone())),
            (None, None) => None,
        }
    }

    pub fn set_size_factors(&mut self, size_factors: Array1<f64>) -> Result<()> {
        Normalization::SizeFactors(size_factors.clone()).validate(self.n_genes(), self.n_samples())?;
        self.size_factors = Some(size_factors);
        Ok(())
    }

    pub fn set_normalization_factors(&mut self, factors: Array2<f64>) -> Result<()> {
        Normalization::Factors(factors.clone()).validate(self.n_genes(), self.n_samples())?;
        self.normalization_factors = Some(factors);
        Ok(())
    }

    /// Store a per-gene dispersion fit. Entries may be NaN for all-zero genes.
    pub fn set_dispersion_fit(&mut self, dispersions: Array1<f64>) -> Result<()> {
        if dispersions.len() != self.n_genes() {
            return Err(RlogError::DimensionMismatch {
                expected: format!("{} dispersions", self.n_genes()),
                got: format!("{}", dispersions.len()),
            });
        }
        self.dispersion_fit = Some(dispersions);
        Ok(())
    }

    pub fn set_dispersion_function(&mut self, function: DispersionFunction) {
        self.dispersion_function = Some(function);
    }

    /// Counts divided by the normalization in effect
    pub fn normalized_counts(&self) -> Option<Array2<f64>> {
        self.normalization()
            .map(|norm| norm.normalize(self.counts.counts().view()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn dataset() -> RlogDataSet {
        let counts = CountMatrix::new(
            array![[10.0, 20.0], [4.0, 8.0]],
            vec!["g1".to_string(), "g2".to_string()],
            vec!["a".to_string(), "b".to_string()],
        )
        .unwrap();
        RlogDataSet::new(counts)
    }

    #[test]
    fn test_factor_matrix_takes_precedence() {
        let mut dds = dataset();
        assert!(dds.normalization().is_none());

        dds.set_size_factors(array![1.0, 2.0]).unwrap();
        assert_eq!(dds.normalization(), Some(Normalization::SizeFactors(array![1.0, 2.0])));

        dds.set_normalization_factors(array![[2.0, 2.0], [4.0, 4.0]]).unwrap();
        assert_eq!(dds.normalized_counts().unwrap(), array![[5.0, 10.0], [1.0, 2.0]]);
    }

    #[test]
    fn test_setters_validate_shape() {
        let mut dds = dataset();
        assert!(dds.set_size_factors(array![1.0]).is_err());
        assert!(dds.set_size_factors(array![1.0, -1.0]).is_err());
        assert!(dds.set_dispersion_fit(array![0.1, 0.2, 0.3]).is_err());
        assert!(dds.set_dispersion_fit(array![0.1, f64::NAN]).is_ok());
    }
}
