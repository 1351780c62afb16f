//! Base trait for long-running gateway components.
//!
//! Source tasks, the state reconciler and the application itself implement it so
//! they can be spawned and awaited the same way.

/// Trait for executing a component until it finishes.
pub trait Runner {
    /// Error type for execution failures.
    type Error;

    /// Runs the component until completion or error.
    fn run(self) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send
    where
        Self: Sized;
}
