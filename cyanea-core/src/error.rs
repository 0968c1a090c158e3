//! Structured error types for the Cyanea ecosystem.

use thiserror::Error;

/// Unified error type for all Cyanea operations.
#[derive(Debug, Error)]
pub enum CyaneaError {
    /// Parse error (malformed input data)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A tree violates a structural invariant the caller was expected to maintain.
    #[error("invalid tree: {0}")]
    InvalidTree(String),

    /// A model configuration that is recognised but not supported.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the Cyanea ecosystem.
pub type Result<T> = std::result::Result<T, CyaneaError>;

/// A numeric computation left the representable range.
///
/// Recoverable by design of the callers: a likelihood that hits this is an
/// impossible state, not a bug, and is reported as `-inf`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("arithmetic failure: {what}")]
pub struct ArithmeticFailure {
    what: String,
}

impl ArithmeticFailure {
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }

    /// Description of the failed computation.
    pub fn what(&self) -> &str {
        &self.what
    }
}
