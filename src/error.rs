//! Error types for zinbdiff

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum ZinbDiffError {
    #[error("Invalid count matrix: {reason}")]
    InvalidCountMatrix { reason: String },

    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Weight estimation failed: {reason}")]
    WeightEstimationFailed { reason: String },

    #[error("GLM setup failed: {reason}")]
    GlmSetupFailed { reason: String },

    #[error("Numerical instability in {operation}: {details}")]
    NumericalInstability { operation: String, details: String },

    #[error("Invalid design matrix: {reason}")]
    InvalidDesignMatrix { reason: String },

    #[error("Empty data: {reason}")]
    EmptyData { reason: String },

    #[error("Size factor estimation failed: {reason}")]
    SizeFactorFailed { reason: String },

    #[error("Trend fitting failed: {reason}")]
    TrendFittingFailed { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ZinbDiffError>;
