//! The `Gateway` custom resource.

use crate::dispatch::Watchers;
use crate::status::Nodes;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// API group of the gateway resource.
pub const GROUP: &str = "argoproj.io";
/// API version of the gateway resource.
pub const VERSION: &str = "v1alpha1";
/// Kind of the gateway resource.
pub const KIND: &str = "Gateway";

/// Desired state of a gateway as written by its operator.
#[derive(CustomResource, Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Gateway",
    namespaced,
    status = "GatewayStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Source type served by the gateway, e.g. `webhook`.
    #[serde(rename = "type", default)]
    pub gateway_type: String,
    /// Version stamped on every envelope.
    #[serde(default)]
    pub event_version: String,
    /// Downstream consumers of the gateway's events.
    #[serde(default)]
    pub watchers: Option<Watchers>,
}

/// Observed state of a gateway.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Per-source status keyed by source ID.
    #[serde(default)]
    pub nodes: Option<Nodes>,
}

impl Gateway {
    /// Watchers listed on the resource, empty when none are set.
    pub fn watchers(&self) -> Watchers {
        self.spec.watchers.clone().unwrap_or_default()
    }

    /// Node statuses recorded on the resource.
    pub fn nodes(&self) -> Nodes {
        self.status
            .as_ref()
            .and_then(|status| status.nodes.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Phase;
    use serde_json::json;

    #[test]
    fn test_deserialize_gateway() {
        let gateway: Gateway = serde_json::from_value(json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Gateway",
            "metadata": { "name": "webhook-gateway", "namespace": "argo-events" },
            "spec": {
                "type": "webhook",
                "eventVersion": "1.0",
                "watchers": {
                    "sensors": [{ "name": "webhook-sensor" }]
                }
            },
            "status": {
                "nodes": {
                    "abc": {
                        "id": "abc",
                        "name": "example",
                        "phase": "Running",
                        "message": "",
                        "startedAt": "2024-01-01T00:00:00Z",
                        "timeId": "t1"
                    }
                }
            }
        }))
        .unwrap();

        assert_eq!(gateway.spec.gateway_type, "webhook");
        let watchers = gateway.watchers();
        assert_eq!(watchers.sensors[0].name, "webhook-sensor");
        assert_eq!(watchers.sensors[0].port, crate::dispatch::DEFAULT_WATCHER_PORT);
        assert_eq!(gateway.nodes()["abc"].phase, Phase::Running);
    }

    #[test]
    fn test_missing_status_has_no_nodes() {
        let gateway = Gateway::new("g", GatewaySpec::default());
        assert!(gateway.nodes().is_empty());
        assert!(gateway.watchers().is_empty());
    }
}
