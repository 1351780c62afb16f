//! Keeps the dispatcher's watchers in step with the gateway resource.

use futures::StreamExt;
use gateway_core::dispatch::WatcherSet;
use gateway_core::host::{Gateway, K8sHost};
use kube::runtime::{watcher, WatchStreamExt};
use std::sync::Arc;
use tracing::{info, warn};

/// Replaces the watchers with those listed on the gateway resource.
///
/// A resource that lists no watchers leaves the configured ones in place.
/// Returns true if the watchers changed.
pub async fn refresh(watchers: &WatcherSet, gateway: &Gateway) -> bool {
    match &gateway.spec.watchers {
        Some(listed) => watchers.replace(listed.clone()).await,
        None => false,
    }
}

/// Watches the gateway resource and refreshes the watcher set on every change.
pub struct GatewayWatcher {
    host: Arc<K8sHost>,
    watchers: WatcherSet,
}

impl GatewayWatcher {
    pub fn new(host: Arc<K8sHost>, watchers: WatcherSet) -> Self {
        Self { host, watchers }
    }
}

impl gateway_core::task::runner::Runner for GatewayWatcher {
    type Error = gateway_core::host::k8s::Error;

    #[tracing::instrument(skip(self), name = "gateway.watchers", fields(gateway = %self.host.gateway_name()))]
    async fn run(self) -> Result<(), Self::Error> {
        let api = self.host.gateways()?;
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.host.gateway_name()));
        let mut gateways = watcher(api, config).default_backoff().applied_objects().boxed();

        while let Some(result) = gateways.next().await {
            match result {
                Ok(gateway) => {
                    if refresh(&self.watchers, &gateway).await {
                        let current = self.watchers.snapshot().await;
                        info!(
                            sensors = current.sensors.len(),
                            gateways = current.gateways.len(),
                            "Watchers updated from gateway resource"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Gateway watch failed, retrying"),
            }
        }
        Ok(())
    }
}
