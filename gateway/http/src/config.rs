//! Configuration for the HTTP dispatcher and webhook sources.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Default timeout of one watcher request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
/// Default lifetime of idle pooled connections.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(600);
/// Default number of idle connections kept per watcher host.
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 50;
/// Default method accepted by webhook routes.
pub const DEFAULT_METHOD: &str = "POST";

/// Errors that can occur while validating a webhook source.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Error parsing webhook source configuration: {source}")]
    ParseConfig {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Webhook port must be greater than zero")]
    ZeroPort,
    #[error("Webhook endpoint must start with '/', got {0:?}")]
    InvalidEndpoint(String),
    #[error("Invalid webhook method {0:?}")]
    InvalidMethod(String),
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_keepalive() -> Duration {
    DEFAULT_KEEPALIVE
}

fn default_max_idle_per_host() -> usize {
    DEFAULT_MAX_IDLE_PER_HOST
}

/// Connection settings of the shared HTTP client used for dispatch.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct HttpDispatchOptions {
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive: Duration,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

impl Default for HttpDispatchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
        }
    }
}

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

/// Ports are often written as strings in source configuration.
fn deserialize_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Configuration of one webhook source.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Port the webhook listens on; several sources may share one port.
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    /// Path of the route, unique per port.
    pub endpoint: String,
    /// Accepted HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
}

impl WebhookConfig {
    /// Parses and validates a raw YAML configuration.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let mut config: WebhookConfig =
            serde_yaml::from_str(raw).map_err(|source| Error::ParseConfig { source })?;
        if config.port == 0 {
            return Err(Error::ZeroPort);
        }
        if !config.endpoint.starts_with('/') {
            return Err(Error::InvalidEndpoint(config.endpoint));
        }
        config.method = config.method.to_ascii_uppercase();
        if axum::http::Method::from_bytes(config.method.as_bytes()).is_err() {
            return Err(Error::InvalidMethod(config.method));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_options_defaults() {
        let options: HttpDispatchOptions = serde_yaml::from_str("{}").unwrap();
        assert_eq!(options, HttpDispatchOptions::default());

        let options: HttpDispatchOptions =
            serde_yaml::from_str("timeout: 5s\nmax_idle_per_host: 4").unwrap();
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.keepalive, DEFAULT_KEEPALIVE);
        assert_eq!(options.max_idle_per_host, 4);
    }

    #[test]
    fn test_parse_webhook_with_string_port() {
        let config = WebhookConfig::parse("port: \"12000\"\nendpoint: /example").unwrap();
        assert_eq!(config.port, 12000);
        assert_eq!(config.endpoint, "/example");
        assert_eq!(config.method, "POST");
    }

    #[test]
    fn test_parse_webhook_normalizes_method() {
        let config = WebhookConfig::parse("port: 12000\nendpoint: /e\nmethod: put").unwrap();
        assert_eq!(config.method, "PUT");
    }

    #[test]
    fn test_parse_webhook_rejects_invalid() {
        assert!(matches!(
            WebhookConfig::parse("port: 0\nendpoint: /e"),
            Err(Error::ZeroPort)
        ));
        assert!(matches!(
            WebhookConfig::parse("port: 12000\nendpoint: e"),
            Err(Error::InvalidEndpoint(_))
        ));
        assert!(matches!(
            WebhookConfig::parse("port: 12000"),
            Err(Error::ParseConfig { .. })
        ));
        assert!(matches!(
            WebhookConfig::parse("port: 12000\nendpoint: /e\nmethod: \"BAD METHOD\""),
            Err(Error::InvalidMethod(_))
        ));
    }
}
