//! Source manager reconciling the running source set against configuration.
//!
//! Every configuration update is diffed against the running sources by identity.
//! Stale sources are stopped and new ones spawned as [`SourceTask`]s; sources
//! whose identity did not change keep running untouched.

use super::context::GatewayContext;
use super::runner::Runner;
use super::source::SourceTaskBuilder;
use crate::adapter::Adapter;
use crate::dispatch::Dispatcher;
use crate::lifecycle::Phase;
use crate::notification::{publish_or_log, Notification, NotificationBus};
use crate::source::{diff, identities, mint_time_id, Diff, SourceIdentity, SourceRuntimeContext};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, Instrument};

/// Source manager errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Error building source task: {source}")]
    SourceTask {
        #[source]
        source: super::source::Error,
    },
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
}

/// Owner of all running sources of one gateway.
#[derive(Debug, Clone)]
pub struct SourceManager {
    context: Arc<GatewayContext>,
    adapter: Arc<dyn Adapter>,
    dispatcher: Arc<dyn Dispatcher>,
    bus: Arc<dyn NotificationBus>,
    sources: Arc<Mutex<HashMap<String, SourceRuntimeContext>>>,
}

impl SourceManager {
    /// Applies a new source configuration map and returns what changed.
    ///
    /// Updates are serialized; a second call waits until the first finished
    /// stopping and starting its sources. One time identifier is minted per call
    /// and shared by every source the call starts.
    #[tracing::instrument(skip(self, configs), name = "source_manager.sync", fields(sources = configs.len()))]
    pub async fn sync(&self, configs: &BTreeMap<String, String>) -> Result<Diff, Error> {
        let mut sources = self.sources.lock().await;

        let time_id = mint_time_id();
        let mut desired = identities(configs, &time_id);
        let changes = diff(&*sources, &desired);
        if changes.is_empty() {
            debug!("Source configuration unchanged");
            return Ok(changes);
        }
        info!(
            time_id = %time_id,
            stale = changes.stale.len(),
            new = changes.new.len(),
            "Source configuration changed"
        );

        for id in &changes.stale {
            let Some(runtime) = sources.remove(id) else {
                continue;
            };
            self.remove(runtime).await;
        }

        for id in &changes.new {
            let Some(identity) = desired.remove(id) else {
                continue;
            };
            let runtime = self.start(identity).await?;
            sources.insert(id.clone(), runtime);
        }

        Ok(changes)
    }

    /// Stops every source, emitting `Removed` for each.
    #[tracing::instrument(skip(self), name = "source_manager.shutdown")]
    pub async fn shutdown(&self) {
        let drained: Vec<SourceRuntimeContext> =
            self.sources.lock().await.drain().map(|(_, runtime)| runtime).collect();
        info!(sources = drained.len(), "Stopping all sources");
        for runtime in drained {
            self.remove(runtime).await;
        }
    }

    /// Identities of the managed sources, sorted by name.
    ///
    /// Sources that completed or failed are still listed until the configuration
    /// drops or changes them.
    pub async fn sources(&self) -> Vec<SourceIdentity> {
        let mut identities: Vec<SourceIdentity> = self
            .sources
            .lock()
            .await
            .values()
            .map(|runtime| runtime.identity.clone())
            .collect();
        identities.sort_by(|a, b| a.name.cmp(&b.name));
        identities
    }

    /// Names of sources whose task is still running.
    pub async fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .lock()
            .await
            .values()
            .filter(|runtime| runtime.is_active())
            .map(|runtime| runtime.identity.name.clone())
            .collect();
        names.sort();
        names
    }

    async fn remove(&self, runtime: SourceRuntimeContext) {
        let identity = runtime.identity.clone();
        info!(source = %identity.name, source_id = %identity.id, "Stopping source");
        publish_or_log(
            self.bus.as_ref(),
            Notification::state_change(&identity, Phase::Removed, "source removed"),
        )
        .await;
        if !runtime.stop(self.context.stop_timeout).await {
            error!(source = %identity.name, "Source task aborted after stop timeout");
        }
    }

    async fn start(&self, identity: SourceIdentity) -> Result<SourceRuntimeContext, Error> {
        info!(source = %identity.name, source_id = %identity.id, "Starting source");
        // Published before the task exists so Initialized always precedes the
        // task's own notifications and any later Removed.
        publish_or_log(
            self.bus.as_ref(),
            Notification::state_change(&identity, Phase::Initialized, "source initialized"),
        )
        .await;

        let mut runtime = SourceRuntimeContext::new(identity.clone());
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = SourceTaskBuilder::new()
            .identity(identity.clone())
            .context(Arc::clone(&self.context))
            .adapter(Arc::clone(&self.adapter))
            .dispatcher(Arc::clone(&self.dispatcher))
            .bus(Arc::clone(&self.bus))
            .stop_rx(stop_rx)
            .active(runtime.active_flag())
            .build()
            .map_err(|source| Error::SourceTask { source })?;

        let span = tracing::Span::current();
        let handle = tokio::spawn(
            async move {
                if let Err(e) = task.run().await {
                    error!(source = %identity.name, error = %e, "Source task failed");
                }
            }
            .instrument(span),
        );
        runtime.attach(stop_tx, handle);
        Ok(runtime)
    }
}

/// Builder for SourceManager.
#[derive(Default)]
pub struct SourceManagerBuilder {
    context: Option<Arc<GatewayContext>>,
    adapter: Option<Arc<dyn Adapter>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    bus: Option<Arc<dyn NotificationBus>>,
}

impl SourceManagerBuilder {
    /// Creates a new SourceManager builder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: Arc<GatewayContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the adapter serving this gateway's source type.
    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<SourceManager, Error> {
        Ok(SourceManager {
            context: self
                .context
                .ok_or_else(|| Error::MissingBuilderAttribute("context".to_string()))?,
            adapter: self
                .adapter
                .ok_or_else(|| Error::MissingBuilderAttribute("adapter".to_string()))?,
            dispatcher: self
                .dispatcher
                .ok_or_else(|| Error::MissingBuilderAttribute("dispatcher".to_string()))?,
            bus: self
                .bus
                .ok_or_else(|| Error::MissingBuilderAttribute("bus".to_string()))?,
            sources: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}
