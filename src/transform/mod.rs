//! Regularized log transformation of RNA-seq counts
//!
//! Produces log2-scale values suitable for visualization and clustering, along with
//! the parameters needed to apply the same transform to new samples.

mod frozen;
mod rlog;
mod sparsity;

pub use frozen::FrozenRlogParams;
pub use rlog::{
    rlog, rlog_data, rlog_with_estimator, RlogConfig, RlogDiagnostics, RlogInput, RlogOutput, RlogResult,
};
pub use sparsity::{sparse_test, SparsityAdvisory, SparsityThresholds};
