//! Providers of the gateway's source configuration.
//!
//! A provider yields the full map of source name to raw configuration every
//! time it may have changed. The source manager diffs each map against the
//! running sources, so repeating an unchanged map is harmless.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Map of source name to raw configuration.
pub type Sources = BTreeMap<String, String>;

/// Stream of source configuration maps.
pub type SourceStream = BoxStream<'static, Sources>;

/// Errors that can occur while providing source configuration.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Error reading sources from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error parsing sources from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Source of configuration updates for the source manager.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Starts watching and returns the stream of configuration maps.
    async fn watch(&self) -> Result<SourceStream, Error>;
}

/// Parses a YAML mapping of source name to configuration.
///
/// String values are taken as the raw configuration; any other value is
/// re-serialized to YAML so structured entries work too. An empty document
/// yields no sources.
pub fn parse_sources(text: &str) -> Result<Sources, serde_yaml::Error> {
    let entries: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(text)?;
    entries
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| -> Result<(String, String), serde_yaml::Error> {
            let raw = match value {
                serde_yaml::Value::String(raw) => raw,
                other => serde_yaml::to_string(&other)?,
            };
            Ok((name, raw))
        })
        .collect()
}

/// Provider polling a YAML file.
#[derive(Debug, Clone)]
pub struct FileSourceProvider {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileSourceProvider {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    async fn read(&self) -> Result<Sources, Error> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| Error::Read {
                path: self.path.clone(),
                source,
            })?;
        parse_sources(&text).map_err(|source| Error::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
impl SourceProvider for FileSourceProvider {
    /// Reads the file once, failing if it is unusable, then emits the map
    /// again each time a later poll finds different contents.
    ///
    /// Read and parse errors after the first read are logged and the last
    /// good map stays in effect.
    async fn watch(&self) -> Result<SourceStream, Error> {
        let initial = self.read().await?;
        debug!(path = ?self.path, sources = initial.len(), "Read source configuration");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let state = (self.clone(), interval, initial.clone());

        let updates = stream::unfold(state, |(provider, mut interval, mut last)| async move {
            loop {
                interval.tick().await;
                match provider.read().await {
                    Ok(sources) if sources != last => {
                        debug!(path = ?provider.path, sources = sources.len(), "Source configuration changed");
                        last = sources.clone();
                        return Some((sources, (provider, interval, last)));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Keeping previous source configuration"),
                }
            }
        });

        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }
}

/// Sources held in a ConfigMap's data.
pub fn config_map_sources(config_map: &ConfigMap) -> Sources {
    config_map.data.clone().unwrap_or_default()
}

/// Provider watching a single ConfigMap.
///
/// Deleting the ConfigMap yields an empty map, which stops every source.
#[derive(Clone)]
pub struct ConfigMapSourceProvider {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapSourceProvider {
    pub fn new(api: Api<ConfigMap>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
        }
    }
}

#[async_trait]
impl SourceProvider for ConfigMapSourceProvider {
    async fn watch(&self) -> Result<SourceStream, Error> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let name = self.name.clone();
        // Set while a relist has returned the ConfigMap.
        let mut listed = false;

        let stream = watcher(self.api.clone(), config)
            .default_backoff()
            .filter_map(move |event| {
                let sources = match event {
                    Ok(watcher::Event::Init) => {
                        listed = false;
                        None
                    }
                    Ok(watcher::Event::InitApply(config_map)) => {
                        listed = true;
                        Some(config_map_sources(&config_map))
                    }
                    Ok(watcher::Event::InitDone) if !listed => {
                        warn!(config_map = %name, "ConfigMap not found, no sources configured");
                        Some(Sources::new())
                    }
                    Ok(watcher::Event::InitDone) => None,
                    Ok(watcher::Event::Apply(config_map)) => Some(config_map_sources(&config_map)),
                    Ok(watcher::Event::Delete(_)) => {
                        warn!(config_map = %name, "ConfigMap deleted, stopping all sources");
                        Some(Sources::new())
                    }
                    Err(e) => {
                        warn!(error = %e, "ConfigMap watch failed, retrying");
                        None
                    }
                };
                futures::future::ready(sources)
            })
            .boxed();
        Ok(stream)
    }
}
