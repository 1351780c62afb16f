//! Gateway execution context shared by every source task.
//!
//! Carries the owning gateway's identity, the event type it stamps on envelopes
//! and the timeouts applied around adapter connection and source shutdown.

use crate::event::EventTimeSource;
use std::time::Duration;

/// Default bound on adapter validation and connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time a source task gets to observe a stop request before it is aborted.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Default event type version.
pub const DEFAULT_EVENT_TYPE_VERSION: &str = "1.0";

/// Errors that can occur during GatewayContext operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Required builder attribute was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// Context information shared by all sources of one gateway.
#[derive(Clone, Debug)]
pub struct GatewayContext {
    /// Name of the owning gateway.
    pub gateway_name: String,
    /// Namespace of the owning gateway.
    pub namespace: String,
    /// Event type stamped on every envelope.
    pub event_type: String,
    /// Event type version stamped on every envelope.
    pub event_type_version: String,
    /// Which clock reading becomes the envelope's event time.
    pub event_time: EventTimeSource,
    /// Bound on adapter validation and connection.
    pub connect_timeout: Duration,
    /// Time a source gets to stop cooperatively.
    pub stop_timeout: Duration,
}

/// Builder for constructing GatewayContext instances.
#[derive(Default)]
pub struct GatewayContextBuilder {
    gateway_name: Option<String>,
    namespace: Option<String>,
    event_type: Option<String>,
    event_type_version: Option<String>,
    event_time: EventTimeSource,
    connect_timeout: Option<Duration>,
    stop_timeout: Option<Duration>,
}

impl GatewayContextBuilder {
    /// Creates a new GatewayContextBuilder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the gateway name.
    pub fn gateway_name(mut self, name: impl Into<String>) -> Self {
        self.gateway_name = Some(name.into());
        self
    }

    /// Sets the gateway namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the event type. Defaults to the gateway name.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event_type_version(mut self, version: impl Into<String>) -> Self {
        self.event_type_version = Some(version.into());
        self
    }

    pub fn event_time(mut self, event_time: EventTimeSource) -> Self {
        self.event_time = event_time;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Builds the GatewayContext instance.
    ///
    /// # Errors
    /// Returns `Error::MissingRequiredAttribute` if the gateway name or namespace is not set.
    pub fn build(self) -> Result<GatewayContext, Error> {
        let gateway_name = self
            .gateway_name
            .ok_or_else(|| Error::MissingRequiredAttribute("gateway_name".to_string()))?;
        Ok(GatewayContext {
            event_type: self.event_type.unwrap_or_else(|| gateway_name.clone()),
            gateway_name,
            namespace: self
                .namespace
                .ok_or_else(|| Error::MissingRequiredAttribute("namespace".to_string()))?,
            event_type_version: self
                .event_type_version
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE_VERSION.to_string()),
            event_time: self.event_time,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            stop_timeout: self.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT),
        })
    }
}
