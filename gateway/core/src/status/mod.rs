//! Durable per-source status and the store it is persisted to.
//!
//! The store is optimistic-concurrency controlled: a commit based on an outdated
//! snapshot fails with [`Error::Conflict`] and the caller re-fetches.

pub mod memory;

use crate::lifecycle::Phase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Node statuses keyed by source ID.
pub type Nodes = BTreeMap<String, NodeStatus>;

/// Errors returned by status stores.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Status was modified concurrently, resource version {0:?} is outdated")]
    Conflict(Option<String>),
    #[error("Status backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Whether a re-fetch and retry can resolve the error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// Last known lifecycle phase of one source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    pub name: String,
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub time_id: String,
}

/// Status read from the store together with its concurrency token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub nodes: Nodes,
    pub resource_version: Option<String>,
}

/// Durable home of the node status map.
#[async_trait]
pub trait StatusStore: Debug + Send + Sync + 'static {
    /// Reads the current status.
    async fn fetch(&self) -> Result<StatusSnapshot, Error>;

    /// Writes `nodes` if the store is still at `base`'s resource version.
    ///
    /// Entries present in `base` but absent from `nodes` are deleted.
    async fn commit(&self, base: &StatusSnapshot, nodes: &Nodes) -> Result<StatusSnapshot, Error>;
}
