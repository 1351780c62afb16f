//! In-memory status store.

use super::{Error, Nodes, StatusSnapshot};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    version: u64,
    nodes: Nodes,
}

/// Versioned in-process status store.
///
/// Suitable for single-process deployments and tests; every commit bumps the
/// version and a commit based on an older version is rejected.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatusStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current nodes, for inspection.
    pub async fn nodes(&self) -> Nodes {
        self.state.lock().await.nodes.clone()
    }

    /// Current version.
    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }
}

#[async_trait]
impl super::StatusStore for MemoryStatusStore {
    async fn fetch(&self) -> Result<StatusSnapshot, Error> {
        let state = self.state.lock().await;
        Ok(StatusSnapshot {
            nodes: state.nodes.clone(),
            resource_version: Some(state.version.to_string()),
        })
    }

    async fn commit(&self, base: &StatusSnapshot, nodes: &Nodes) -> Result<StatusSnapshot, Error> {
        let mut state = self.state.lock().await;
        let current = state.version.to_string();
        if base.resource_version.as_deref() != Some(current.as_str()) {
            return Err(Error::Conflict(base.resource_version.clone()));
        }

        state.version += 1;
        state.nodes = nodes.clone();
        Ok(StatusSnapshot {
            nodes: state.nodes.clone(),
            resource_version: Some(state.version.to_string()),
        })
    }
}
