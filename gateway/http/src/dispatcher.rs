//! HTTP dispatcher posting envelopes to every watcher concurrently.
//!
//! A failing watcher never prevents delivery to the others; each failure is
//! listed in the returned report.

use crate::config::HttpDispatchOptions;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future;
use gateway_core::dispatch::{DeliveryFailure, DispatchReport, Dispatcher, Watcher, WatcherSet};
use gateway_core::event::Envelope;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use tracing::{debug, warn};
use url::Url;

/// Errors that can occur while building the dispatcher.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("HTTP client error: {source}")]
    Reqwest {
        #[source]
        source: reqwest::Error,
    },
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
}

/// Resolves the URL envelopes are posted to for a watcher.
///
/// An explicit watcher URL wins; otherwise the watcher's in-cluster service
/// address is combined with its port and endpoint.
pub fn watcher_url(watcher: &Watcher, namespace: &str) -> Result<Url, url::ParseError> {
    if let Some(url) = &watcher.url {
        return Url::parse(url);
    }
    let base = Url::parse(&format!(
        "http://{}:{}",
        watcher.service_host(namespace),
        watcher.port
    ))?;
    base.join(&watcher.endpoint)
}

/// Dispatcher delivering to sensors and gateways over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    watchers: WatcherSet,
    namespace: String,
}

impl HttpDispatcher {
    async fn post(&self, watcher: &Watcher, body: Bytes) -> Result<(), String> {
        let url = watcher_url(watcher, &self.namespace).map_err(|e| format!("invalid url: {e}"))?;
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("watcher responded with status {status}"))
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    #[tracing::instrument(skip(self, envelope), name = "http.dispatch", fields(
        event_id = %envelope.context.event_id,
    ))]
    async fn dispatch(
        &self,
        envelope: &Envelope,
    ) -> Result<DispatchReport, gateway_core::dispatch::Error> {
        let body = Bytes::from(
            envelope
                .to_json()
                .map_err(|source| gateway_core::dispatch::Error::Encode { source })?,
        );
        let watchers = self.watchers.snapshot().await;
        let targets: Vec<&Watcher> = watchers.iter().collect();

        let results = future::join_all(
            targets
                .iter()
                .map(|watcher| self.post(watcher, body.clone())),
        )
        .await;

        let mut report = DispatchReport {
            attempted: targets.len(),
            ..Default::default()
        };
        for (watcher, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => {
                    debug!(watcher = %watcher.name, "Event delivered");
                    report.delivered += 1;
                }
                Err(reason) => {
                    warn!(watcher = %watcher.name, reason = %reason, "Event delivery failed");
                    report.failed.push(DeliveryFailure {
                        watcher: watcher.name.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(report)
    }
}

/// Builder for HttpDispatcher.
#[derive(Default)]
pub struct HttpDispatcherBuilder {
    options: Option<HttpDispatchOptions>,
    watchers: Option<WatcherSet>,
    namespace: Option<String>,
}

impl HttpDispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: HttpDispatchOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Sets the shared watcher list read on every dispatch.
    pub fn watchers(mut self, watchers: WatcherSet) -> Self {
        self.watchers = Some(watchers);
        self
    }

    /// Sets the namespace of watchers that do not name one.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Builds the dispatcher and its pooled client.
    pub fn build(self) -> Result<HttpDispatcher, Error> {
        let options = self.options.unwrap_or_default();
        let client = reqwest::ClientBuilder::new()
            .timeout(options.timeout)
            .pool_idle_timeout(options.keepalive)
            .pool_max_idle_per_host(options.max_idle_per_host)
            .build()
            .map_err(|source| Error::Reqwest { source })?;

        Ok(HttpDispatcher {
            client,
            watchers: self
                .watchers
                .ok_or_else(|| Error::MissingBuilderAttribute("watchers".to_string()))?,
            namespace: self
                .namespace
                .ok_or_else(|| Error::MissingBuilderAttribute("namespace".to_string()))?,
        })
    }
}
