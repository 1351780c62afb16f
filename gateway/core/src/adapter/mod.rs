//! Boundary between the lifecycle engine and concrete source adapters.
//!
//! An adapter knows how to validate a source configuration, turn it into a
//! stream of raw messages and release whatever it holds on stop. The engine
//! depends on nothing else.

pub mod interval;

use crate::source::SourceIdentity;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::fmt::Debug;

/// Type alias for adapter errors.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Stream of raw messages produced by a started source.
///
/// Ending the stream signals a clean end of the source; an `Err` item is a
/// stream failure.
pub type MessageStream = BoxStream<'static, Result<RawMessage, Error>>;

/// One message as emitted by an adapter, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Content type of the payload when the adapter knows it.
    pub content_type: Option<String>,
    /// When the adapter received the message.
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Creates a message received now.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            content_type: None,
            received_at: Utc::now(),
        }
    }

    /// Sets the payload content type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Overrides the receipt time.
    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }
}

/// Contract every source adapter implements.
#[async_trait]
pub trait Adapter: Debug + Send + Sync + 'static {
    /// Short name of the source type this adapter serves, e.g. `"webhook"`.
    fn source_type(&self) -> &str;

    /// Checks that the raw configuration is complete and well formed.
    async fn validate(&self, source: &SourceIdentity) -> Result<(), Error>;

    /// Connects the source and returns its message stream.
    async fn start(&self, source: &SourceIdentity) -> Result<MessageStream, Error>;

    /// Releases anything the adapter holds for the source beyond the stream itself.
    async fn stop(&self, source: &SourceIdentity) -> Result<(), Error>;
}
