//! HTTP transport for gateways: webhook sources and watcher dispatch.

/// Dispatch and webhook configuration.
pub mod config;
/// Dispatcher posting envelopes to watchers.
pub mod dispatcher;
/// Shared listeners routing requests to webhook sources.
pub mod server;
/// Webhook source adapter.
pub mod webhook;
