//! Fan-out of envelopes to watchers.
//!
//! Transports implement [`Dispatcher`]. The watcher list is shared through a
//! [`WatcherSet`] so it can be refreshed while sources keep running.

use crate::event::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Port sensors listen on when a watcher does not name one.
pub const DEFAULT_WATCHER_PORT: u16 = 9300;
/// Endpoint envelopes are posted to when a watcher does not name one.
pub const DEFAULT_WATCHER_ENDPOINT: &str = "/";

/// Boxed transport error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by a dispatch call.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Error encoding envelope: {source}")]
    Encode {
        #[source]
        source: crate::event::Error,
    },
    #[error("Dispatch failed: {source}")]
    Transport {
        #[source]
        source: BoxError,
    },
    #[error("Dispatch transport is unusable: {source}")]
    Fatal {
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Whether the source that triggered the dispatch must move to `Error`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

/// Per-watcher delivery failure recorded in a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub watcher: String,
    pub reason: String,
}

/// Outcome of one dispatch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Number of deliveries attempted.
    pub attempted: usize,
    /// Number of deliveries that succeeded.
    pub delivered: usize,
    /// Deliveries that failed, with the reason.
    pub failed: Vec<DeliveryFailure>,
}

impl DispatchReport {
    /// Whether every attempted delivery succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sends envelopes to downstream watchers.
#[async_trait]
pub trait Dispatcher: Debug + Send + Sync + 'static {
    /// Dispatches one envelope.
    ///
    /// Returns `Ok` once delivery was attempted. Per-watcher failures are listed in
    /// the report; only transport-wide failures are errors.
    async fn dispatch(&self, envelope: &Envelope) -> Result<DispatchReport, Error>;
}

fn default_watcher_port() -> u16 {
    DEFAULT_WATCHER_PORT
}

fn default_watcher_endpoint() -> String {
    DEFAULT_WATCHER_ENDPOINT.to_string()
}

/// One downstream consumer of dispatched envelopes.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize)]
pub struct Watcher {
    /// Name of the sensor or gateway, also its service name.
    pub name: String,
    /// Namespace of the watcher, defaults to the gateway's own namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_watcher_port")]
    pub port: u16,
    #[serde(default = "default_watcher_endpoint")]
    pub endpoint: String,
    /// Full URL overriding the in-cluster service address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Watcher {
    /// Creates a watcher with default port and endpoint.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            port: DEFAULT_WATCHER_PORT,
            endpoint: DEFAULT_WATCHER_ENDPOINT.to_string(),
            url: None,
        }
    }

    /// In-cluster DNS name of the watcher's service.
    pub fn service_host(&self, default_namespace: &str) -> String {
        let namespace = self.namespace.as_deref().unwrap_or(default_namespace);
        format!("{}.{}.svc.cluster.local", self.name, namespace)
    }
}

/// Sensors and gateways registered to receive this gateway's events.
#[derive(PartialEq, Eq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Watchers {
    #[serde(default)]
    pub sensors: Vec<Watcher>,
    #[serde(default)]
    pub gateways: Vec<Watcher>,
}

impl Watchers {
    /// Iterates over all watchers, sensors first.
    pub fn iter(&self) -> impl Iterator<Item = &Watcher> {
        self.sensors.iter().chain(self.gateways.iter())
    }

    pub fn len(&self) -> usize {
        self.sensors.len() + self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared, replaceable watcher list.
#[derive(Debug, Clone, Default)]
pub struct WatcherSet {
    inner: Arc<RwLock<Watchers>>,
}

impl WatcherSet {
    pub fn new(watchers: Watchers) -> Self {
        Self {
            inner: Arc::new(RwLock::new(watchers)),
        }
    }

    /// Returns a copy of the current watchers.
    pub async fn snapshot(&self) -> Watchers {
        self.inner.read().await.clone()
    }

    /// Replaces the watchers, returning true if they changed.
    pub async fn replace(&self, watchers: Watchers) -> bool {
        let mut current = self.inner.write().await;
        if *current == watchers {
            return false;
        }
        *current = watchers;
        true
    }
}
