//! Kubernetes client shared by the gateway's status store and event bus.

use super::gateway::Gateway;
use crate::client::Client as GatewayClient;
use k8s_openapi::api::core::v1::Event;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::info;

/// Path of the namespace file mounted with the pod's service account.
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Default reporting component written on published events.
pub const DEFAULT_REPORTING_COMPONENT: &str = "gateway";

/// Errors specific to Kubernetes host operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Kubernetes API connection error: {source}")]
    KubernetesClient {
        #[source]
        source: kube::Error,
    },
    #[error("Error reading namespace from service account: {source}")]
    NamespaceRead {
        #[source]
        source: std::io::Error,
    },
    #[error("Kubernetes client is not connected")]
    KubernetesClientNotConnected,
    #[error("Missing required attribute: {0}")]
    MissingBuilderAttribute(String),
    #[error(
        "Could not detect pod identity: POD_NAME and HOSTNAME environment variables are not set"
    )]
    MissingPodIdentity,
}

/// Connection to the cluster the gateway runs in.
#[derive(Clone)]
pub struct K8sHost {
    /// Kubernetes client, set by [`connect`](GatewayClient::connect).
    client: Option<Arc<Client>>,
    /// Namespace of the gateway resource. Read from the service account when unset.
    namespace: Option<String>,
    /// Name of the gateway resource.
    gateway_name: String,
    /// Component written on published events and used to filter subscriptions.
    reporting_component: String,
    /// Instance written on published events, typically the pod name.
    reporting_instance: String,
}

impl std::fmt::Debug for K8sHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sHost")
            .field("client", &self.client.as_ref().map(|_| "Client"))
            .field("namespace", &self.namespace)
            .field("gateway_name", &self.gateway_name)
            .field("reporting_component", &self.reporting_component)
            .field("reporting_instance", &self.reporting_instance)
            .finish()
    }
}

impl GatewayClient for K8sHost {
    type Error = Error;

    #[tracing::instrument(skip(self), name = "k8s.connect")]
    async fn connect(mut self) -> Result<Self, Self::Error> {
        let client = Client::try_default()
            .await
            .map_err(|source| Error::KubernetesClient { source })?;

        let namespace = match self.namespace.take() {
            Some(namespace) => namespace,
            None => tokio::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
                .await
                .map_err(|source| Error::NamespaceRead { source })?
                .trim()
                .to_string(),
        };

        info!(
            namespace = %namespace,
            gateway = %self.gateway_name,
            instance = %self.reporting_instance,
            "K8s host connected"
        );
        self.namespace = Some(namespace);
        self.client = Some(Arc::new(client));
        Ok(self)
    }
}

impl K8sHost {
    pub fn gateway_name(&self) -> &str {
        &self.gateway_name
    }

    /// Namespace of the gateway, empty until known.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    pub fn reporting_component(&self) -> &str {
        &self.reporting_component
    }

    pub fn reporting_instance(&self) -> &str {
        &self.reporting_instance
    }

    /// Connected Kubernetes client.
    pub fn client(&self) -> Result<Client, Error> {
        self.client
            .as_ref()
            .map(|client| (**client).clone())
            .ok_or(Error::KubernetesClientNotConnected)
    }

    /// API for gateway resources in the gateway's namespace.
    pub fn gateways(&self) -> Result<Api<Gateway>, Error> {
        Ok(Api::namespaced(self.client()?, self.namespace()))
    }

    /// API for core/v1 events in the gateway's namespace.
    pub fn events(&self) -> Result<Api<Event>, Error> {
        Ok(Api::namespaced(self.client()?, self.namespace()))
    }
}

/// Builder for K8sHost.
#[derive(Default)]
pub struct K8sHostBuilder {
    namespace: Option<String>,
    gateway_name: Option<String>,
    reporting_component: Option<String>,
    reporting_instance: Option<String>,
}

impl K8sHostBuilder {
    /// Creates a new K8sHostBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the namespace instead of reading it from the service account.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn gateway_name(mut self, name: impl Into<String>) -> Self {
        self.gateway_name = Some(name.into());
        self
    }

    pub fn reporting_component(mut self, component: impl Into<String>) -> Self {
        self.reporting_component = Some(component.into());
        self
    }

    /// Sets the reporting instance (typically pod name).
    pub fn reporting_instance(mut self, instance: impl Into<String>) -> Self {
        self.reporting_instance = Some(instance.into());
        self
    }

    /// Builds the K8sHost instance without connecting.
    ///
    /// The reporting instance is detected from the POD_NAME or HOSTNAME
    /// environment variables when not provided.
    pub fn build(self) -> Result<K8sHost, Error> {
        let reporting_instance = match self.reporting_instance {
            Some(instance) => instance,
            None => std::env::var("POD_NAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .map_err(|_| Error::MissingPodIdentity)?,
        };

        Ok(K8sHost {
            client: None,
            namespace: self.namespace,
            gateway_name: self
                .gateway_name
                .ok_or_else(|| Error::MissingBuilderAttribute("gateway_name".to_string()))?,
            reporting_component: self
                .reporting_component
                .unwrap_or_else(|| DEFAULT_REPORTING_COMPONENT.to_string()),
            reporting_instance,
        })
    }
}
