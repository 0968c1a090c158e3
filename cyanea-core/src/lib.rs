//! Shared primitives and traits for the Cyanea bioinformatics ecosystem.
//!
//! `cyanea-core` provides the foundation that all other Cyanea crates build on:
//!
//! - **Error types** — [`CyaneaError`] and [`Result`] for structured error handling,
//!   [`ArithmeticFailure`] for recoverable numeric breakdowns
//! - **Traits** — [`Summarizable`] and [`Revertible`] (store/restore checkpoints)

pub mod error;
pub mod traits;

pub use error::{ArithmeticFailure, CyaneaError, Result};
pub use traits::*;
