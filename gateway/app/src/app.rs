use crate::config::{AppConfig, Backend, Protocol, SourceOptions};
use crate::source::{ConfigMapSourceProvider, FileSourceProvider, SourceProvider};
use crate::watchers::GatewayWatcher;
use futures::StreamExt;
use gateway_core::adapter::{interval, Adapter};
use gateway_core::client::Client;
use gateway_core::dispatch::{Dispatcher, WatcherSet};
use gateway_core::host::{K8sEventBus, K8sHost, K8sHostBuilder, K8sStatusStore};
use gateway_core::notification::{ChannelBus, NotificationBus};
use gateway_core::reconcile::ReconcilerBuilder;
use gateway_core::status::{memory::MemoryStatusStore, StatusStore};
use gateway_core::task::context::GatewayContextBuilder;
use gateway_core::task::manager::SourceManagerBuilder;
use gateway_core::task::runner::Runner;
use gateway_http::dispatcher::HttpDispatcherBuilder;
use gateway_http::server::PortRegistry;
use gateway_http::webhook::{self, WebhookAdapter};
use gateway_nats::dispatcher::NatsDispatcher;
use kube::Api;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Errors that can occur during application execution.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Gateway context could not be built.
    #[error("Invalid gateway configuration: {source}")]
    Context {
        #[source]
        source: gateway_core::task::context::Error,
    },
    /// Kubernetes host creation or connection error.
    #[error("Failed to create Kubernetes host: {source}")]
    Host {
        #[source]
        source: gateway_core::host::k8s::Error,
    },
    #[error("Failed to build HTTP dispatcher: {source}")]
    HttpDispatcher {
        #[source]
        source: gateway_http::dispatcher::Error,
    },
    #[error("Failed to connect NATS dispatcher: {source}")]
    Nats {
        #[source]
        source: gateway_nats::client::Error,
    },
    #[error("Failed to build state reconciler: {source}")]
    Reconciler {
        #[source]
        source: gateway_core::reconcile::Error,
    },
    #[error("Failed to build source manager: {source}")]
    Manager {
        #[source]
        source: gateway_core::task::manager::Error,
    },
    #[error("Failed to read source configuration: {source}")]
    Sources {
        #[source]
        source: crate::source::Error,
    },
    #[error("Unknown source type: {0}")]
    UnknownSourceType(String),
    #[error("NATS dispatch requires dispatch.nats options")]
    MissingNatsOptions,
    #[error("Gateway namespace is not configured")]
    MissingNamespace,
    #[error("Kubernetes host is required but not connected")]
    MissingHost,
}

/// Gateway application wiring sources, dispatch and status together.
pub struct App {
    /// Global application configuration.
    pub config: AppConfig,
}

impl App {
    /// Runs the gateway until `shutdown` completes or the source
    /// configuration stream ends, then stops every source.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send,
    {
        let config = self.config;

        let host = if config.requires_kubernetes() {
            Some(Arc::new(connect_host(&config).await?))
        } else {
            None
        };

        let namespace = match (&config.gateway.namespace, &host) {
            (Some(namespace), _) => namespace.clone(),
            (None, Some(host)) => host.namespace().to_string(),
            (None, None) => return Err(Error::MissingNamespace),
        };

        let mut context = GatewayContextBuilder::new()
            .gateway_name(&config.gateway.name)
            .namespace(&namespace)
            .event_time(config.gateway.event_time)
            .connect_timeout(config.lifecycle.connect_timeout)
            .stop_timeout(config.lifecycle.stop_timeout);
        if let Some(event_type) = &config.gateway.event_type {
            context = context.event_type(event_type);
        }
        if let Some(version) = &config.gateway.event_type_version {
            context = context.event_type_version(version);
        }
        let context = Arc::new(context.build().map_err(|source| Error::Context { source })?);

        let watchers = WatcherSet::new(config.dispatch.watchers.clone());
        let dispatcher = build_dispatcher(&config, &namespace, watchers.clone()).await?;

        let bus: Arc<dyn NotificationBus> = match config.notifications.backend {
            Backend::Memory => Arc::new(ChannelBus::new()),
            Backend::K8s => Arc::new(K8sEventBus::new(required(&host)?)),
        };
        let store: Arc<dyn StatusStore> = match config.status.backend {
            Backend::Memory => Arc::new(MemoryStatusStore::new()),
            Backend::K8s => Arc::new(K8sStatusStore::new(required(&host)?)),
        };

        let mut background: Vec<JoinHandle<()>> = Vec::new();

        let reconciler = ReconcilerBuilder::new()
            .bus(Arc::clone(&bus))
            .store(store)
            .retry(config.reconcile.retry.clone())
            .build()
            .map_err(|source| Error::Reconciler { source })?;
        background.push(tokio::spawn(
            async move {
                if let Err(e) = reconciler.run().await {
                    error!(error = %e, "State reconciler stopped");
                }
            }
            .instrument(Span::current()),
        ));

        if config.dispatch.watch_gateway {
            let gateway_watcher = GatewayWatcher::new(required(&host)?, watchers.clone());
            background.push(tokio::spawn(
                async move {
                    if let Err(e) = gateway_watcher.run().await {
                        error!(error = %e, "Gateway watcher stopped");
                    }
                }
                .instrument(Span::current()),
            ));
        }

        let manager = SourceManagerBuilder::new()
            .context(context)
            .adapter(build_adapter(&config.gateway.source_type)?)
            .dispatcher(dispatcher)
            .bus(bus)
            .build()
            .map_err(|source| Error::Manager { source })?;

        let provider = build_provider(&config, &host, &namespace)?;
        let mut updates = provider
            .watch()
            .await
            .map_err(|source| Error::Sources { source })?;

        info!(
            gateway = %config.gateway.name,
            namespace = %namespace,
            source_type = %config.gateway.source_type,
            "Gateway started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                update = updates.next() => match update {
                    Some(sources) => match manager.sync(&sources).await {
                        Ok(changes) => debug!(
                            stale = changes.stale.len(),
                            new = changes.new.len(),
                            "Sources synchronized"
                        ),
                        Err(e) => error!(error = %e, "Failed to apply source configuration"),
                    },
                    None => {
                        warn!("Source configuration stream ended");
                        break;
                    }
                },
            }
        }

        manager.shutdown().await;
        for handle in background {
            handle.abort();
        }
        info!("Gateway stopped");
        Ok(())
    }
}

impl Runner for App {
    type Error = Error;

    /// Runs the gateway until SIGINT or SIGTERM.
    #[tracing::instrument(skip(self), name = "app", fields(gateway = %self.config.gateway.name))]
    async fn run(self) -> Result<(), Error> {
        self.run_until(shutdown_signal()).await
    }
}

/// Completes on SIGINT, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn required(host: &Option<Arc<K8sHost>>) -> Result<Arc<K8sHost>, Error> {
    host.as_ref().map(Arc::clone).ok_or(Error::MissingHost)
}

async fn connect_host(config: &AppConfig) -> Result<K8sHost, Error> {
    let mut builder = K8sHostBuilder::new().gateway_name(&config.gateway.name);
    if let Some(namespace) = &config.gateway.namespace {
        builder = builder.namespace(namespace);
    }
    if let Some(component) = &config.notifications.reporting_component {
        builder = builder.reporting_component(component);
    }
    builder
        .build()
        .map_err(|source| Error::Host { source })?
        .connect()
        .await
        .map_err(|source| Error::Host { source })
}

fn build_adapter(source_type: &str) -> Result<Arc<dyn Adapter>, Error> {
    match source_type {
        webhook::SOURCE_TYPE => Ok(Arc::new(WebhookAdapter::new(PortRegistry::new()))),
        interval::SOURCE_TYPE => Ok(Arc::new(interval::IntervalAdapter)),
        other => Err(Error::UnknownSourceType(other.to_string())),
    }
}

async fn build_dispatcher(
    config: &AppConfig,
    namespace: &str,
    watchers: WatcherSet,
) -> Result<Arc<dyn Dispatcher>, Error> {
    match config.dispatch.protocol {
        Protocol::Http => {
            let dispatcher = HttpDispatcherBuilder::new()
                .options(config.dispatch.http.clone())
                .watchers(watchers)
                .namespace(namespace)
                .build()
                .map_err(|source| Error::HttpDispatcher { source })?;
            Ok(Arc::new(dispatcher))
        }
        Protocol::Nats => {
            let options = config
                .dispatch
                .nats
                .clone()
                .ok_or(Error::MissingNatsOptions)?;
            let client = gateway_nats::client::ClientBuilder::from_options(&options)
                .connection_name(&config.gateway.name)
                .build()
                .connect()
                .await
                .map_err(|source| Error::Nats { source })?;
            Ok(Arc::new(NatsDispatcher::new(Arc::new(client), options.subject)))
        }
    }
}

fn build_provider(
    config: &AppConfig,
    host: &Option<Arc<K8sHost>>,
    namespace: &str,
) -> Result<Box<dyn SourceProvider>, Error> {
    match &config.sources {
        SourceOptions::File {
            path,
            poll_interval,
        } => Ok(Box::new(FileSourceProvider::new(path, *poll_interval))),
        SourceOptions::ConfigMap {
            name,
            namespace: config_map_namespace,
        } => {
            let client = required(host)?
                .client()
                .map_err(|source| Error::Host { source })?;
            let api = Api::namespaced(client, config_map_namespace.as_deref().unwrap_or(namespace));
            Ok(Box::new(ConfigMapSourceProvider::new(api, name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DispatchOptions, GatewayOptions, LifecycleOptions, NotificationOptions, ReconcileOptions,
        StatusOptions,
    };
    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;
    use gateway_core::dispatch::{Watcher, Watchers};
    use gateway_core::event::{Envelope, EventTimeSource};
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn app_config(sources_path: &std::path::Path, watchers: Watchers) -> AppConfig {
        AppConfig {
            gateway: GatewayOptions {
                name: "heartbeat-gateway".to_string(),
                namespace: Some("argo-events".to_string()),
                source_type: interval::SOURCE_TYPE.to_string(),
                event_type: None,
                event_type_version: None,
                event_time: EventTimeSource::Transformation,
            },
            sources: SourceOptions::File {
                path: sources_path.to_path_buf(),
                poll_interval: Duration::from_millis(50),
            },
            dispatch: DispatchOptions {
                watchers,
                ..Default::default()
            },
            status: StatusOptions::default(),
            notifications: NotificationOptions::default(),
            reconcile: ReconcileOptions::default(),
            lifecycle: LifecycleOptions::default(),
        }
    }

    async fn sensor() -> (Watcher, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new()
            .route(
                "/",
                post(|State(tx): State<mpsc::UnboundedSender<Bytes>>, body: Bytes| async move {
                    let _ = tx.send(body);
                }),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let mut watcher = Watcher::new("heartbeat-sensor");
        watcher.url = Some(format!("http://{address}/"));
        (watcher, rx)
    }

    #[tokio::test]
    async fn test_app_dispatches_configured_sources() {
        let (watcher, mut received) = sensor().await;
        let mut sources = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        sources
            .write_all(b"heartbeat: \"interval: 20ms\\ncount: 2\\nmessage: ping\"\n")
            .unwrap();

        let config = app_config(
            sources.path(),
            Watchers {
                sensors: vec![watcher],
                gateways: vec![],
            },
        );
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let app = tokio::spawn(App { config }.run_until(async {
            let _ = stop_rx.await;
        }));

        for sequence in 1..=2 {
            let body = tokio::time::timeout(Duration::from_secs(5), received.recv())
                .await
                .unwrap()
                .unwrap();
            let envelope: Envelope = serde_json::from_slice(&body).unwrap();
            assert_eq!(envelope.context.event_type, "heartbeat-gateway");
            assert_eq!(envelope.context.source.host, "heartbeat-gateway:heartbeat");
            let payload: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
            assert_eq!(payload["sequence"], sequence);
        }

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), app)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_source_type() {
        let sources = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let mut config = app_config(sources.path(), Watchers::default());
        config.gateway.source_type = "calendar".to_string();

        let result = App { config }.run_until(std::future::pending()).await;
        assert!(matches!(result, Err(Error::UnknownSourceType(t)) if t == "calendar"));
    }

    #[tokio::test]
    async fn test_missing_namespace_without_kubernetes() {
        let sources = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let mut config = app_config(sources.path(), Watchers::default());
        config.gateway.namespace = None;

        let result = App { config }.run_until(std::future::pending()).await;
        assert!(matches!(result, Err(Error::MissingNamespace)));
    }

    #[tokio::test]
    async fn test_nats_requires_options() {
        let sources = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let mut config = app_config(sources.path(), Watchers::default());
        config.dispatch.protocol = Protocol::Nats;

        let result = App { config }.run_until(std::future::pending()).await;
        assert!(matches!(result, Err(Error::MissingNatsOptions)));
    }
}
