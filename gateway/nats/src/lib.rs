//! NATS transport for gateways.

/// NATS client with optional JetStream support.
pub mod client;
/// NATS dispatch configuration.
pub mod config;
/// Dispatcher publishing envelopes to NATS.
pub mod dispatcher;
