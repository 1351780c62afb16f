//! Notification bus backed by core/v1 Events.
//!
//! Each notification is published as an Event labelled with the gateway and
//! source identity. The reconciler watches unseen events of its gateway and
//! labels each one as seen once it has been applied, so a restarted reconciler
//! picks up where the previous one stopped.

use super::gateway::{GROUP, KIND, VERSION};
use super::k8s::K8sHost;
use crate::lifecycle::Phase;
use crate::notification::{Delivery, DeliveryStream, Error, Notification, NotificationBus, NotificationKind};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const LABEL_SOURCE_ID: &str = "gateway-event-source-id";
pub const LABEL_TIME_ID: &str = "gateway-event-source-time-id";
pub const LABEL_GATEWAY_NAME: &str = "gateway-name";
pub const LABEL_SEEN: &str = "gateway-event-seen";
/// Source names are not guaranteed to be valid label values.
pub const ANNOTATION_SOURCE_NAME: &str = "gateway-event-source-name";

/// Notification bus publishing and watching Kubernetes events.
#[derive(Debug, Clone)]
pub struct K8sEventBus {
    host: Arc<K8sHost>,
}

impl K8sEventBus {
    pub fn new(host: Arc<K8sHost>) -> Self {
        Self { host }
    }
}

/// Label selector matching unseen events of a gateway.
pub fn unseen_selector(gateway_name: &str) -> String {
    format!("{LABEL_GATEWAY_NAME}={gateway_name},!{LABEL_SEEN}")
}

/// Builds the event published for a notification.
pub fn to_event(host: &K8sHost, notification: &Notification) -> Event {
    let labels = BTreeMap::from([
        (LABEL_SOURCE_ID.to_string(), notification.id.clone()),
        (LABEL_TIME_ID.to_string(), notification.time_id.clone()),
        (LABEL_GATEWAY_NAME.to_string(), host.gateway_name().to_string()),
    ]);
    let annotations = BTreeMap::from([(
        ANNOTATION_SOURCE_NAME.to_string(),
        notification.name.clone(),
    )]);
    let event_type = if notification.phase == Phase::Error {
        "Warning"
    } else {
        "Normal"
    };

    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", host.gateway_name())),
            namespace: Some(host.namespace().to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(format!("{GROUP}/{VERSION}")),
            kind: Some(KIND.to_string()),
            name: Some(host.gateway_name().to_string()),
            namespace: Some(host.namespace().to_string()),
            ..Default::default()
        },
        reason: Some(notification.kind.as_str().to_string()),
        action: Some(notification.phase.as_str().to_string()),
        message: Some(notification.message.clone()),
        type_: Some(event_type.to_string()),
        event_time: Some(MicroTime(chrono::Utc::now())),
        reporting_component: Some(host.reporting_component().to_string()),
        reporting_instance: Some(host.reporting_instance().to_string()),
        ..Default::default()
    }
}

/// Reads a notification back from an event, if the event carries one.
pub fn from_event(event: &Event) -> Option<Notification> {
    let labels = event.metadata.labels.as_ref()?;
    let kind = match event.reason.as_deref()? {
        "StateChange" => NotificationKind::StateChange,
        "Escalation" => NotificationKind::Escalation,
        _ => return None,
    };
    let phase = event.action.as_deref()?.parse::<Phase>().ok()?;
    let name = event
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_SOURCE_NAME))
        .cloned()
        .unwrap_or_default();

    Some(Notification {
        id: labels.get(LABEL_SOURCE_ID)?.clone(),
        name,
        phase,
        message: event.message.clone().unwrap_or_default(),
        time_id: labels.get(LABEL_TIME_ID)?.clone(),
        kind,
    })
}

#[async_trait]
impl NotificationBus for K8sEventBus {
    #[tracing::instrument(skip(self, notification), name = "k8s.events.publish", fields(
        source_id = %notification.id,
        phase = %notification.phase,
    ))]
    async fn publish(&self, notification: Notification) -> Result<(), Error> {
        let api = self.host.events()?;
        let event = to_event(&self.host, &notification);
        api.create(&PostParams::default(), &event).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream, Error> {
        let api = self.host.events()?;
        let config = watcher::Config::default().labels(&unseen_selector(self.host.gateway_name()));
        let component = self.host.reporting_component().to_string();

        let stream = watcher(api, config)
            .default_backoff()
            .applied_objects()
            .filter_map(move |result| {
                let delivery = match result {
                    Ok(event) if event.reporting_component.as_deref() == Some(component.as_str()) => {
                        let receipt = event.metadata.name.clone();
                        match from_event(&event) {
                            Some(notification) => Some(Delivery {
                                notification,
                                receipt,
                            }),
                            None => {
                                warn!(event = ?receipt, "Ignoring event without notification");
                                None
                            }
                        }
                    }
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Event watch failed, retrying");
                        None
                    }
                };
                futures::future::ready(delivery)
            })
            .boxed();
        Ok(stream)
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), Error> {
        let Some(name) = delivery.receipt.as_deref() else {
            return Ok(());
        };
        let api = self.host.events()?;
        let patch = json!({ "metadata": { "labels": { LABEL_SEEN: "true" } } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(event = %name, "Event already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
