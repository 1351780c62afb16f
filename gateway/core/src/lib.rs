//! Gateway core library: the event-source lifecycle and dispatch engine.
//!
//! This crate contains the transport-neutral parts shared by every gateway:
//! source identities and diffing, the lifecycle state machine, the per-source
//! task and its manager, envelope transformation, the dispatcher and
//! notification bus seams and the state reconciler.

/// Source adapter contract and the built-in interval adapter.
pub mod adapter;
/// Client connection trait for external services.
pub mod client;
/// Dispatcher contract, watchers and delivery reports.
pub mod dispatch;
/// Envelope format and the transformer building it.
pub mod event;
/// Kubernetes resource, status store and event bus.
pub mod host;
/// Source phases and the transition table.
pub mod lifecycle;
/// Lifecycle notifications and the bus carrying them.
pub mod notification;
/// State reconciler applying notifications to durable status.
pub mod reconcile;
/// Retry configuration with exponential backoff.
pub mod retry;
/// Custom serialization and deserialization utilities.
pub mod serde;
/// Source identities, diffing and runtime contexts.
pub mod source;
/// Durable node status and its stores.
pub mod status;
/// Task execution framework with runner trait, context, and manager.
pub mod task {
    /// Gateway-wide context shared by every source task.
    pub mod context;
    /// Source manager starting and stopping source tasks.
    pub mod manager;
    /// Base runner trait for long-running components.
    pub mod runner;
    /// Per-source task driving the lifecycle.
    pub mod source;
}

#[cfg(test)]
pub(crate) mod testing;
