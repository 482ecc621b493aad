//! Gene x sample count matrix with labels

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{Result, RlogError};

/// Make gene names unique by appending _1, _2, ... to repeats
fn make_unique(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let n = seen.entry(name.clone()).or_insert(0);
            *n += 1;
            if *n == 1 {
                name
            } else {
                let renamed = format!("{}_{}", name, *n - 1);
                log::warn!("Duplicate gene name '{}' renamed to '{}'", name, renamed);
                renamed
            }
        })
        .collect()
}

/// RNA-seq read counts; rows are genes, columns are samples
#[derive(Debug, Clone)]
pub struct CountMatrix {
    counts: Array2<f64>,
    gene_ids: Vec<String>,
    sample_ids: Vec<String>,
}

impl CountMatrix {
    /// Create a new count matrix from raw data
    pub fn new(
        counts: Array2<f64>,
        gene_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        let (n_genes, n_samples) = counts.dim();

        if gene_ids.len() != n_genes {
            return Err(RlogError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{} gene IDs", gene_ids.len()),
            });
        }

        if sample_ids.len() != n_samples {
            return Err(RlogError::DimensionMismatch {
                expected: format!("{} sample IDs", n_samples),
                got: format!("{} sample IDs", sample_ids.len()),
            });
        }

        if counts.iter().any(|&x| !(x >= 0.0 && x.is_finite())) {
            return Err(RlogError::InvalidCountMatrix {
                reason: "Counts must be non-negative finite values".to_string(),
            });
        }

        if !counts.is_empty() && counts.iter().all(|&x| x == 0.0) {
            return Err(RlogError::InvalidCountMatrix {
                reason: "All samples have 0 counts for all genes".to_string(),
            });
        }

        if counts.iter().any(|&x| x != x.round()) {
            log::warn!(
                "Some count values are not integers; the negative binomial model \
                 assumes integer counts."
            );
        }

        let gene_ids = make_unique(gene_ids);

        Ok(Self {
            counts,
            gene_ids,
            sample_ids,
        })
    }

    /// Create from integer counts
    pub fn from_integers(
        counts: Array2<u32>,
        gene_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        Self::new(counts.mapv(f64::from), gene_ids, sample_ids)
    }

    /// Get the number of genes
    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    /// Get the number of samples
    pub fn n_samples(&self) -> usize {
        self.counts.ncols()
    }

    /// Get the raw counts as a view
    pub fn counts(&self) -> ArrayView2<'_, f64> {
        self.counts.view()
    }

    /// Get gene IDs
    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    /// Get sample IDs
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Get counts for a specific gene
    pub fn gene_counts(&self, gene_idx: usize) -> ArrayView1<'_, f64> {
        self.counts.row(gene_idx)
    }

    /// Get gene index by ID
    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|id| id == gene_id)
    }

    /// Get sample index by ID
    pub fn sample_index(&self, sample_id: &str) -> Option<usize> {
        self.sample_ids.iter().position(|id| id == sample_id)
    }

    /// Flag genes whose counts sum to zero across all samples
    pub fn all_zero_genes(&self) -> Vec<bool> {
        self.counts
            .axis_iter(Axis(0))
            .map(|row| row.sum() == 0.0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_count_matrix_creation() {
        let counts = array![[10.0, 20.0, 30.0], [5.0, 15.0, 25.0]];
        let gene_ids = vec!["gene1".to_string(), "gene2".to_string()];
        let sample_ids = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];

        let matrix = CountMatrix::new(counts, gene_ids, sample_ids).unwrap();
        assert_eq!(matrix.n_genes(), 2);
        assert_eq!(matrix.n_samples(), 3);
    }

    #[test]
    fn test_negative_counts_rejected() {
        let counts = array![[10.0, -5.0], [5.0, 15.0]];
        let gene_ids = vec!["gene1".to_string(), "gene2".to_string()];
        let sample_ids = vec!["s1".to_string(), "s2".to_string()];

        let result = CountMatrix::new(counts, gene_ids, sample_ids);
        assert!(result.is_err());
    }

    #[test]
    fn test_all_zero_genes() {
        let counts = array![[0.0, 0.0], [5.0, 0.0], [0.0, 0.0]];
        let gene_ids = vec!["g1".to_string(), "g2".to_string(), "g3".to_string()];
        let sample_ids = vec!["s1".to_string(), "s2".to_string()];

        let matrix = CountMatrix::new(counts, gene_ids, sample_ids).unwrap();
        assert_eq!(matrix.all_zero_genes(), vec![true, false, true]);
    }

    #[test]
    fn test_duplicate_gene_ids_renamed() {
        let counts = array![[1.0], [2.0], [3.0]];
        let gene_ids = vec!["a".to_string(), "a".to_string(), "b".to_string()];
        let matrix = CountMatrix::new(counts, gene_ids, vec!["s1".to_string()]).unwrap();
        assert_eq!(matrix.gene_ids(), &["a", "a_1", "b"]);
        assert_eq!(matrix.gene_index("a_1"), Some(1));
    }
}
