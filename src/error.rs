//! Error types for rust_rlog

use thiserror::Error;

/// Main error type for rlog operations
#[derive(Error, Debug)]
pub enum RlogError {
    #[error("Invalid count matrix: {reason}")]
    InvalidCountMatrix { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    /// A required upstream quantity (typically the dispersion trend) is missing
    #[error("Precondition failed: {reason}")]
    Precondition { reason: String },

    /// Batch-level numerical failure; indicates a construction bug rather than bad data
    #[error("Fatal numerical error in {operation}: {details}")]
    FatalNumerical { operation: String, details: String },

    #[error("Empty data: {reason}")]
    EmptyData { reason: String },

    #[error("Size factor estimation failed: {reason}")]
    SizeFactorFailed { reason: String },

    #[error("Trend fitting failed: {reason}")]
    TrendFittingFailed { reason: String },

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for rlog operations
pub type Result<T> = std::result::Result<T, RlogError>;
