//! Count data containers

mod count_matrix;
mod dataset;

pub use count_matrix::CountMatrix;
pub use dataset::RlogDataSet;
