//! Gateway application: configuration, source providers and wiring.
//!
//! Builds the source manager, dispatcher, notification bus and state
//! reconciler from configuration and feeds the manager with source
//! configuration until shutdown.

/// Application wiring and lifecycle.
pub mod app;
/// Configuration structures and loading.
pub mod config;
/// Providers of source configuration maps.
pub mod source;
/// Watcher refresh from the gateway resource.
pub mod watchers;
