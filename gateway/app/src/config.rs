//! Configuration structures for the gateway application.
//!
//! Loaded from a YAML file with the `config` crate and overlaid with
//! `GATEWAY__`-prefixed environment variables, e.g.
//! `GATEWAY__GATEWAY__NAMESPACE=argo-events`.

use gateway_core::dispatch::Watchers;
use gateway_core::event::EventTimeSource;
use gateway_core::retry::RetryConfig;
use gateway_core::task::context::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_STOP_TIMEOUT};
use gateway_http::config::HttpDispatchOptions;
use gateway_nats::config::NatsDispatchOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables overriding file configuration.
pub const ENV_PREFIX: &str = "GATEWAY";
/// Separator between nested keys in environment variable names.
pub const ENV_SEPARATOR: &str = "__";
/// Default interval between reads of a file source provider.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Errors that can occur while loading configuration.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Error loading configuration from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
}

/// Main application configuration.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    /// Identity of the gateway and envelope metadata.
    pub gateway: GatewayOptions,
    /// Where source configuration comes from.
    pub sources: SourceOptions,
    /// How envelopes reach watchers.
    pub dispatch: DispatchOptions,
    /// Durable status backend.
    #[serde(default)]
    pub status: StatusOptions,
    /// Lifecycle notification backend.
    #[serde(default)]
    pub notifications: NotificationOptions,
    /// State reconciler settings.
    #[serde(default)]
    pub reconcile: ReconcileOptions,
    /// Source task timeouts.
    #[serde(default)]
    pub lifecycle: LifecycleOptions,
}

impl AppConfig {
    /// Loads the configuration file at `path` with environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let load_error = |source| Error::Load {
            path: path.to_path_buf(),
            source,
        };
        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR),
            )
            .build()
            .map_err(load_error)?
            .try_deserialize::<AppConfig>()
            .map_err(load_error)
    }

    /// Whether any component needs a Kubernetes connection.
    pub fn requires_kubernetes(&self) -> bool {
        self.status.backend == Backend::K8s
            || self.notifications.backend == Backend::K8s
            || matches!(self.sources, SourceOptions::ConfigMap { .. })
            || self.dispatch.watch_gateway
    }
}

/// Gateway identity options.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct GatewayOptions {
    /// Name of the gateway, also the name of its custom resource.
    pub name: String,
    /// Namespace of the gateway. Read from the service account when unset.
    pub namespace: Option<String>,
    /// Source type served by this gateway, e.g. `webhook` or `interval`.
    #[serde(rename = "type")]
    pub source_type: String,
    /// Event type stamped on envelopes, defaults to the gateway name.
    pub event_type: Option<String>,
    /// Event type version stamped on envelopes.
    pub event_type_version: Option<String>,
    /// Clock reading used as the envelope's event time.
    #[serde(default)]
    pub event_time: EventTimeSource,
}

/// Source configuration provider.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceOptions {
    /// YAML map of source name to configuration, re-read periodically.
    File {
        path: PathBuf,
        #[serde(with = "humantime_serde", default = "default_poll_interval")]
        poll_interval: Duration,
    },
    /// ConfigMap whose data entries are the sources.
    #[serde(rename = "configmap")]
    ConfigMap {
        name: String,
        namespace: Option<String>,
    },
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

/// Dispatch protocol.
#[derive(PartialEq, Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Nats,
}

/// Dispatch options.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct DispatchOptions {
    #[serde(default)]
    pub protocol: Protocol,
    /// Initial watchers.
    #[serde(default)]
    pub watchers: Watchers,
    /// Refresh watchers from the gateway resource whenever it changes.
    #[serde(default)]
    pub watch_gateway: bool,
    #[serde(default)]
    pub http: HttpDispatchOptions,
    /// Required when the protocol is NATS.
    pub nats: Option<NatsDispatchOptions>,
}

/// Backend of a durable component.
#[derive(PartialEq, Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process, lost on restart.
    #[default]
    Memory,
    /// Kubernetes API objects.
    K8s,
}

#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct StatusOptions {
    #[serde(default)]
    pub backend: Backend,
}

#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct NotificationOptions {
    #[serde(default)]
    pub backend: Backend,
    /// Reporting component written on Kubernetes events.
    pub reporting_component: Option<String>,
}

#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct ReconcileOptions {
    /// Conflict retry budget.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_stop_timeout() -> Duration {
    DEFAULT_STOP_TIMEOUT
}

/// Source task timeouts.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct LifecycleOptions {
    /// Time an adapter gets to validate and connect.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Time a stopping source gets before its task is aborted.
    #[serde(with = "humantime_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}
