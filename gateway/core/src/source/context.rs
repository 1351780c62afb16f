//! Runtime bundle owned by the source manager for each active source.

use super::identity::SourceIdentity;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runtime state of one started source.
///
/// Holds the stop signal and the task handle of the single task that owns the
/// adapter connection. Dropping the context without calling [`stop`](Self::stop)
/// closes the stop channel, which the task treats as a stop request.
#[derive(Debug)]
pub struct SourceRuntimeContext {
    /// Identity the source was started with.
    pub identity: SourceIdentity,
    active: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SourceRuntimeContext {
    /// Creates a context for a source that has not been spawned yet.
    pub fn new(identity: SourceIdentity) -> Self {
        Self {
            identity,
            active: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            handle: None,
        }
    }

    /// Shared flag the source task clears when it returns.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    /// Whether the source task is still running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Binds the spawned task to this context and marks it active.
    pub fn attach(&mut self, stop_tx: oneshot::Sender<()>, handle: JoinHandle<()>) {
        self.active.store(true, Ordering::Release);
        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
    }

    /// Requests a cooperative stop and waits up to `timeout` for the task to return.
    ///
    /// A task that does not observe the request in time is aborted. Returns true if
    /// the task returned on its own.
    pub async fn stop(mut self, timeout: Duration) -> bool {
        if let Some(stop_tx) = self.stop_tx.take() {
            // The task may already be gone after completing or failing.
            let _ = stop_tx.send(());
        }

        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        let graceful = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(source_id = %self.identity.id, error = %e, "Source task ended abnormally");
                true
            }
            Err(_) => {
                warn!(
                    source_id = %self.identity.id,
                    timeout = ?timeout,
                    "Source task did not stop in time, aborting"
                );
                handle.abort();
                false
            }
        };

        self.active.store(false, Ordering::Release);
        debug!(source_id = %self.identity.id, graceful, "Source stopped");
        graceful
    }
}
