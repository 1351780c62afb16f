//! Dispatcher publishing envelopes to a NATS subject.
//!
//! Unlike HTTP there is a single destination, so a failed publish is an error of
//! the whole dispatch rather than an entry in the report.

use crate::client::Client;
use async_trait::async_trait;
use bytes::Bytes;
use gateway_core::dispatch::{DispatchReport, Dispatcher, Error};
use gateway_core::event::Envelope;
use std::sync::Arc;
use tracing::debug;

/// Errors raised by a NATS publish.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum PublishError {
    #[error("NATS client is not connected")]
    NotConnected,
    #[error("Error publishing to subject {subject}: {source}")]
    Publish {
        subject: String,
        #[source]
        source: async_nats::PublishError,
    },
    #[error("JetStream publish to subject {subject} failed: {source}")]
    JetStream {
        subject: String,
        #[source]
        source: async_nats::jetstream::context::PublishError,
    },
}

/// Subject an envelope is published to.
pub fn subject_for(configured: Option<&str>, envelope: &Envelope) -> String {
    configured
        .map(str::to_string)
        .unwrap_or_else(|| envelope.context.source.host.clone())
}

/// Dispatcher publishing every envelope once to NATS.
#[derive(Debug, Clone)]
pub struct NatsDispatcher {
    client: Arc<Client>,
    subject: Option<String>,
}

impl NatsDispatcher {
    /// Creates a dispatcher on a connected client.
    pub fn new(client: Arc<Client>, subject: Option<String>) -> Self {
        Self { client, subject }
    }

    async fn publish(&self, subject: String, body: Bytes) -> Result<(), Error> {
        if let Some(jetstream) = &self.client.jetstream {
            let ack = jetstream
                .publish(subject.clone(), body)
                .await
                .map_err(|source| transport(PublishError::JetStream {
                    subject: subject.clone(),
                    source,
                }))?;
            ack.await.map_err(|source| {
                transport(PublishError::JetStream {
                    subject: subject.clone(),
                    source,
                })
            })?;
            return Ok(());
        }

        let client = self.client.client.as_ref().ok_or_else(|| Error::Fatal {
            source: Box::new(PublishError::NotConnected),
        })?;
        client
            .publish(subject.clone(), body)
            .await
            .map_err(|source| transport(PublishError::Publish { subject, source }))
    }
}

fn transport(e: PublishError) -> Error {
    Error::Transport {
        source: Box::new(e),
    }
}

#[async_trait]
impl Dispatcher for NatsDispatcher {
    #[tracing::instrument(skip(self, envelope), name = "nats.dispatch", fields(
        event_id = %envelope.context.event_id,
    ))]
    async fn dispatch(&self, envelope: &Envelope) -> Result<DispatchReport, Error> {
        let body = Bytes::from(
            envelope
                .to_json()
                .map_err(|source| Error::Encode { source })?,
        );
        let subject = subject_for(self.subject.as_deref(), envelope);
        self.publish(subject.clone(), body).await?;
        debug!(subject = %subject, "Event published");

        Ok(DispatchReport {
            attempted: 1,
            delivered: 1,
            failed: Vec::new(),
        })
    }
}
