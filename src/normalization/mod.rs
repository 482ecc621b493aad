//! Normalization of count data by size factors or gene-specific factors

mod size_factors;

pub use size_factors::{estimate_size_factors, SizeFactorMethod};

use ndarray::{Array1, Array2, ArrayView2};

use crate::error::{Result, RlogError};

/// Per-sample size factors or a full gene x sample normalization-factor matrix
#[derive(Debug, Clone, PartialEq)]
pub enum Normalization {
    SizeFactors(Array1<f64>),
    Factors(Array2<f64>),
}

impl Normalization {
    /// Factor applied to `counts[[gene, sample]]`
    pub fn factor(&self, gene: usize, sample: usize) -> f64 {
        match self {
            Normalization::SizeFactors(sf) => sf[sample],
            Normalization::Factors(nf) => nf[[gene, sample]],
        }
    }

    /// Check the factors against a `n_genes x n_samples` count matrix
    pub fn validate(&self, n_genes: usize, n_samples: usize) -> Result<()> {
        let (values, expected, got): (Vec<f64>, String, String) = match self {
            Normalization::SizeFactors(sf) => (
                sf.to_vec(),
                format!("{} size factors", n_samples),
                format!("{} size factors", sf.len()),
            ),
            Normalization::Factors(nf) => (
                nf.iter().copied().collect(),
                format!("{} x {} normalization factors", n_genes, n_samples),
                format!("{} x {} normalization factors", nf.nrows(), nf.ncols()),
            ),
        };
        let shape_ok = match self {
            Normalization::SizeFactors(sf) => sf.len() == n_samples,
            Normalization::Factors(nf) => nf.dim() == (n_genes, n_samples),
        };
        if !shape_ok {
            return Err(RlogError::DimensionMismatch { expected, got });
        }
        if values.iter().any(|&v| !(v > 0.0 && v.is_finite())) {
            return Err(RlogError::InvalidInput {
                reason: "normalization factors must be positive and finite".to_string(),
            });
        }
        Ok(())
    }

    /// Expand to a full gene x sample factor matrix
    pub fn to_matrix(&self, n_genes: usize, n_samples: usize) -> Array2<f64> {
        match self {
            Normalization::SizeFactors(sf) => Array2::from_shape_fn((n_genes, n_samples), |(_, j)| sf[j]),
            Normalization::Factors(nf) => nf.clone(),
        }
    }

    /// `counts / factor`, element-wise
    pub fn normalize(&self, counts: ArrayView2<f64>) -> Array2<f64> {
        let mut out = counts.to_owned();
        for ((i, j), v) in out.indexed_iter_mut() {
            *v /= self.factor(i, j);
        }
        out
    }

    /// Factors scaled by `2^offset[gene]` for each gene; always a matrix
    pub fn with_log2_offset(&self, offset: &[f64], n_samples: usize) -> Normalization {
        let n_genes = offset.len();
        let mut nf = self.to_matrix(n_genes, n_samples);
        for (mut row, &o) in nf.rows_mut().into_iter().zip(offset.iter()) {
            let scale = o.exp2();
            row.mapv_inplace(|v| v * scale);
        }
        Normalization::Factors(nf)
    }
}
