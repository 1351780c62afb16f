//! Status store persisting node statuses on the gateway resource.

use super::k8s::K8sHost;
use crate::status::{Error, Nodes, StatusSnapshot, StatusStore};
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// HTTP status the API server answers with on a resource version mismatch.
const CONFLICT: u16 = 409;

/// Stores node statuses in the `status.nodes` field of the gateway resource.
///
/// Commits are merge patches carrying the base resource version, so the API
/// server rejects a commit built on an outdated read.
#[derive(Debug, Clone)]
pub struct K8sStatusStore {
    host: Arc<K8sHost>,
}

impl K8sStatusStore {
    pub fn new(host: Arc<K8sHost>) -> Self {
        Self { host }
    }
}

fn backend<E: std::error::Error + Send + Sync + 'static>(e: E) -> Error {
    Error::Backend {
        source: Box::new(e),
    }
}

fn map_kube_error(e: kube::Error, base: &StatusSnapshot) -> Error {
    match e {
        kube::Error::Api(response) if response.code == CONFLICT => {
            Error::Conflict(base.resource_version.clone())
        }
        e => backend(e),
    }
}

/// Builds the merge patch turning `base` into `nodes`.
///
/// Entries missing from `nodes` are set to null, which deletes them under merge
/// patch semantics.
pub fn status_patch(base: &StatusSnapshot, nodes: &Nodes) -> Result<Value, serde_json::Error> {
    let mut patch = Map::new();
    for id in base.nodes.keys().filter(|id| !nodes.contains_key(*id)) {
        patch.insert(id.clone(), Value::Null);
    }
    for (id, node) in nodes {
        if base.nodes.get(id) != Some(node) {
            patch.insert(id.clone(), serde_json::to_value(node)?);
        }
    }

    let mut body = json!({ "status": { "nodes": Value::Object(patch) } });
    if let Some(version) = &base.resource_version {
        body["metadata"] = json!({ "resourceVersion": version });
    }
    Ok(body)
}

#[async_trait]
impl StatusStore for K8sStatusStore {
    #[tracing::instrument(skip(self), name = "k8s.status.fetch")]
    async fn fetch(&self) -> Result<StatusSnapshot, Error> {
        let api = self.host.gateways().map_err(backend)?;
        let gateway = api.get(self.host.gateway_name()).await.map_err(backend)?;
        Ok(StatusSnapshot {
            nodes: gateway.nodes(),
            resource_version: gateway.metadata.resource_version,
        })
    }

    #[tracing::instrument(skip(self, base, nodes), name = "k8s.status.commit", fields(
        resource_version = ?base.resource_version,
    ))]
    async fn commit(&self, base: &StatusSnapshot, nodes: &Nodes) -> Result<StatusSnapshot, Error> {
        let api = self.host.gateways().map_err(backend)?;
        let patch = status_patch(base, nodes).map_err(backend)?;

        let gateway = api
            .patch_status(
                self.host.gateway_name(),
                &PatchParams::default(),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| map_kube_error(e, base))?;

        debug!(
            resource_version = ?gateway.metadata.resource_version,
            nodes = nodes.len(),
            "Gateway status committed"
        );
        Ok(StatusSnapshot {
            nodes: gateway.nodes(),
            resource_version: gateway.metadata.resource_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::K8sHostBuilder;
    use crate::lifecycle::Phase;
    use crate::status::NodeStatus;
    use chrono::{TimeZone, Utc};

    fn node(id: &str, phase: Phase) -> NodeStatus {
        NodeStatus {
            id: id.to_string(),
            name: format!("src-{id}"),
            phase,
            message: String::new(),
            started_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            time_id: "t1".to_string(),
        }
    }

    fn nodes(entries: &[(&str, Phase)]) -> Nodes {
        entries
            .iter()
            .map(|(id, phase)| (id.to_string(), node(id, *phase)))
            .collect()
    }

    #[test]
    fn test_patch_carries_changes_and_deletions() {
        let base = StatusSnapshot {
            nodes: nodes(&[("a", Phase::Running), ("b", Phase::Running)]),
            resource_version: Some("42".to_string()),
        };
        let next = nodes(&[("a", Phase::Running), ("c", Phase::Initialized)]);

        let patch = status_patch(&base, &next).unwrap();

        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        let patched = patch["status"]["nodes"].as_object().unwrap();
        assert_eq!(patched.len(), 2);
        assert!(patched["b"].is_null());
        assert_eq!(patched["c"]["phase"], "Initialized");
        assert_eq!(patched["c"]["timeId"], "t1");
        assert!(!patched.contains_key("a"));
    }

    #[test]
    fn test_patch_without_resource_version() {
        let patch = status_patch(&StatusSnapshot::default(), &nodes(&[("a", Phase::Initialized)]))
            .unwrap();
        assert!(patch.get("metadata").is_none());
    }

    #[test]
    fn test_conflict_is_mapped() {
        let base = StatusSnapshot {
            nodes: Nodes::new(),
            resource_version: Some("7".to_string()),
        };
        let error = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });

        let mapped = map_kube_error(error, &base);

        assert!(mapped.is_conflict());
        assert!(matches!(mapped, Error::Conflict(Some(version)) if version == "7"));
    }

    #[tokio::test]
    async fn test_fetch_requires_connection() {
        let host = K8sHostBuilder::new()
            .gateway_name("webhook-gateway")
            .namespace("argo-events")
            .reporting_instance("pod")
            .build()
            .unwrap();
        let store = K8sStatusStore::new(Arc::new(host));

        let err = store.fetch().await.unwrap_err();
        assert!(!err.is_conflict());
    }
}
