//! Client connection trait for external services.
//!
//! Implemented by the Kubernetes host and the NATS client so connection setup
//! reads the same everywhere: build first, then connect.

/// Trait for establishing connections to external services.
pub trait Client {
    /// Error type for connection operations.
    type Error;

    /// Establishes the connection and returns the connected client.
    fn connect(self) -> impl std::future::Future<Output = Result<Self, Self::Error>> + Send
    where
        Self: Sized;
}
