//! Canonical event envelope and the transformer producing it.
//!
//! Every raw adapter message becomes exactly one [`Envelope`], shaped like a
//! CloudEvents 0.1 event so HTTP and pub/sub watchers receive the same JSON.

use crate::adapter::RawMessage;
use crate::task::context::GatewayContext;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CloudEvents specification version stamped on every envelope.
pub const CLOUD_EVENTS_VERSION: &str = "0.1";
/// Content type assumed when an adapter does not report one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Errors that can occur while building or encoding envelopes.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Malformed payload from source {source_name}: {source}")]
    MalformedPayload {
        source_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("JSON error: {source}")]
    SerdeJson {
        #[source]
        source: serde_json::Error,
    },
}

/// Which clock reading becomes the envelope's event time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventTimeSource {
    /// Time the envelope was built.
    #[default]
    Transformation,
    /// Time the adapter received the message.
    Receipt,
}

/// Logical origin of an event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Uri {
    pub host: String,
}

/// Envelope metadata.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventContext {
    #[serde(rename = "EventID")]
    pub event_id: String,
    pub event_type: String,
    pub event_type_version: String,
    pub cloud_events_version: String,
    pub source: Uri,
    pub event_time: DateTime<Utc>,
    #[serde(rename = "SchemaURL", default, skip_serializing_if = "Option::is_none")]
    pub schema_url: Option<String>,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

/// Canonical, transport-neutral event.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub context: EventContext,
    #[serde(with = "crate::serde::base64_bytes")]
    pub payload: Bytes,
}

impl Envelope {
    /// Encodes the envelope as JSON, once per dispatch.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|source| Error::SerdeJson { source })
    }
}

/// Logical source host for a gateway's source.
pub fn source_host(gateway_name: &str, source_name: &str) -> String {
    format!("{gateway_name}:{source_name}")
}

fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == DEFAULT_CONTENT_TYPE || essence.ends_with("+json")
}

/// Maps raw adapter messages into envelopes for one gateway.
#[derive(Debug, Clone)]
pub struct Transformer {
    gateway_name: String,
    event_type: String,
    event_type_version: String,
    event_time: EventTimeSource,
}

impl Transformer {
    /// Creates a transformer stamping the gateway's event type on envelopes.
    pub fn new(context: &GatewayContext) -> Self {
        Self {
            gateway_name: context.gateway_name.clone(),
            event_type: context.event_type.clone(),
            event_type_version: context.event_type_version.clone(),
            event_time: context.event_time,
        }
    }

    /// Builds the envelope for one message of `source_name`.
    ///
    /// A fresh event ID is generated per call. JSON payloads are checked for
    /// well-formedness; other content types pass through untouched.
    pub fn transform(&self, source_name: &str, message: RawMessage) -> Result<Envelope, Error> {
        let content_type = message
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        if is_json(&content_type) {
            serde_json::from_slice::<serde::de::IgnoredAny>(&message.payload).map_err(
                |source| Error::MalformedPayload {
                    source_name: source_name.to_string(),
                    source,
                },
            )?;
        }

        let event_time = match self.event_time {
            EventTimeSource::Transformation => Utc::now(),
            EventTimeSource::Receipt => message.received_at,
        };

        Ok(Envelope {
            context: EventContext {
                event_id: uuid::Uuid::new_v4().to_string(),
                event_type: self.event_type.clone(),
                event_type_version: self.event_type_version.clone(),
                cloud_events_version: CLOUD_EVENTS_VERSION.to_string(),
                source: Uri {
                    host: source_host(&self.gateway_name, source_name),
                },
                event_time,
                schema_url: None,
                content_type,
                extensions: BTreeMap::new(),
            },
            payload: message.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::context::GatewayContextBuilder;
    use chrono::TimeZone;

    fn transformer(event_time: EventTimeSource) -> Transformer {
        let context = GatewayContextBuilder::new()
            .gateway_name("webhook-gateway")
            .namespace("argo-events")
            .event_type("webhook")
            .event_type_version("1.0")
            .event_time(event_time)
            .build()
            .unwrap();
        Transformer::new(&context)
    }

    #[test]
    fn test_transform_maps_fields() {
        let envelope = transformer(EventTimeSource::Transformation)
            .transform("src-A", RawMessage::new(r#"{"hello":"world"}"#))
            .unwrap();

        assert!(uuid::Uuid::parse_str(&envelope.context.event_id).is_ok());
        assert_eq!(envelope.context.event_type, "webhook");
        assert_eq!(envelope.context.event_type_version, "1.0");
        assert_eq!(envelope.context.cloud_events_version, CLOUD_EVENTS_VERSION);
        assert_eq!(envelope.context.source.host, "webhook-gateway:src-A");
        assert_eq!(envelope.context.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(envelope.payload, Bytes::from(r#"{"hello":"world"}"#));
    }

    #[test]
    fn test_transform_generates_fresh_ids() {
        let transformer = transformer(EventTimeSource::Transformation);
        let first = transformer.transform("s", RawMessage::new("1")).unwrap();
        let second = transformer.transform("s", RawMessage::new("1")).unwrap();
        assert_ne!(first.context.event_id, second.context.event_id);
    }

    #[test]
    fn test_transform_rejects_malformed_json() {
        let result = transformer(EventTimeSource::Transformation)
            .transform("src-A", RawMessage::new("{not json"));
        assert!(matches!(
            result,
            Err(Error::MalformedPayload { source_name, .. }) if source_name == "src-A"
        ));
    }

    #[test]
    fn test_transform_passes_opaque_payloads() {
        let envelope = transformer(EventTimeSource::Transformation)
            .transform("s", RawMessage::new("x").content_type("text/plain"))
            .unwrap();
        assert_eq!(envelope.context.content_type, "text/plain");
        assert_eq!(envelope.payload, Bytes::from("x"));
    }

    #[test]
    fn test_transform_uses_receipt_time() {
        let received = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        let envelope = transformer(EventTimeSource::Receipt)
            .transform("s", RawMessage::new("{}").received_at(received))
            .unwrap();
        assert_eq!(envelope.context.event_time, received);
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = transformer(EventTimeSource::Transformation)
            .transform("s", RawMessage::new("x").content_type("text/plain"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(value["Context"]["EventID"], envelope.context.event_id.as_str());
        assert_eq!(value["Context"]["Source"]["Host"], "webhook-gateway:s");
        assert_eq!(value["Context"]["CloudEventsVersion"], "0.1");
        assert_eq!(value["Payload"], "eA==");
        assert!(value["Context"].get("SchemaURL").is_none());
    }

    #[test]
    fn test_is_json_content_types() {
        assert!(is_json("application/json"));
        assert!(is_json("application/json; charset=utf-8"));
        assert!(is_json("application/cloudevents+json"));
        assert!(!is_json("text/plain"));
    }
}
