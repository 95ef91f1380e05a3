//! Error types for the revflow library.

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, FlowError>;

/// Main error type for the library
///
/// Both variants signal programming or configuration mistakes, never
/// transient conditions; nothing in this crate retries or falls back.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Invalid layer composition, rejected eagerly at construction
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Tensor shape disagreement at an operation boundary
    #[error("Dimension mismatch: {0}")]
    Dimension(String),
}
