//! Timer-driven adapter producing messages at a fixed interval.
//!
//! Useful for heartbeats and for exercising a gateway without external
//! infrastructure. A configured `count` ends the stream, which completes the
//! source.

use super::{Adapter, MessageStream, RawMessage};
use crate::source::SourceIdentity;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

/// Source type served by [`IntervalAdapter`].
pub const SOURCE_TYPE: &str = "interval";

/// Errors that can occur while validating an interval source.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Error parsing interval source configuration: {source}")]
    ParseConfig {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Interval must be greater than zero")]
    ZeroInterval,
    #[error("Count must be greater than zero when set")]
    ZeroCount,
}

/// Configuration of one interval source.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct IntervalConfig {
    /// Time between messages, e.g. `"10s"`.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Optional number of messages after which the source completes.
    pub count: Option<u64>,
    /// Optional JSON value embedded in each message.
    pub message: Option<serde_json::Value>,
}

impl IntervalConfig {
    /// Parses and validates a raw YAML configuration.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let config: IntervalConfig =
            serde_yaml::from_str(raw).map_err(|source| Error::ParseConfig { source })?;
        if config.interval.is_zero() {
            return Err(Error::ZeroInterval);
        }
        if config.count == Some(0) {
            return Err(Error::ZeroCount);
        }
        Ok(config)
    }
}

/// Adapter emitting JSON messages on a timer.
#[derive(Debug, Default, Clone)]
pub struct IntervalAdapter;

#[async_trait]
impl Adapter for IntervalAdapter {
    fn source_type(&self) -> &str {
        SOURCE_TYPE
    }

    async fn validate(&self, source: &SourceIdentity) -> Result<(), super::Error> {
        IntervalConfig::parse(&source.raw_config)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, source), name = "interval.start", fields(source = %source.name))]
    async fn start(&self, source: &SourceIdentity) -> Result<MessageStream, super::Error> {
        let config = IntervalConfig::parse(&source.raw_config)?;
        let limit = config
            .count
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or(usize::MAX);

        let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let message = config.message.unwrap_or(serde_json::Value::Null);
        let stream = IntervalStream::new(ticker)
            .take(limit)
            .enumerate()
            .map(move |(sequence, _)| {
                let payload = json!({ "sequence": sequence + 1, "message": message });
                Ok(RawMessage::new(payload.to_string()).content_type("application/json"))
            })
            .boxed();

        Ok(stream)
    }

    async fn stop(&self, _source: &SourceIdentity) -> Result<(), super::Error> {
        Ok(())
    }
}
