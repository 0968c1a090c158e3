//! Core trait definitions for the Cyanea ecosystem.
//!
//! These traits define the contracts that domain types implement across crates.

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}

/// State that an MCMC driver can checkpoint and roll back.
///
/// The driver calls [`store`](Revertible::store) before proposing a move and
/// [`restore`](Revertible::restore) when the move is rejected. `store`
/// followed directly by `restore` must leave the observable state unchanged.
pub trait Revertible {
    /// Checkpoint the current state.
    fn store(&mut self);

    /// Roll back to the last checkpoint.
    fn restore(&mut self);
}
