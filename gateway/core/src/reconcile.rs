//! Single-writer reconciliation of lifecycle notifications into durable status.
//!
//! Notifications arrive unordered and possibly more than once. [`apply`] decides
//! what a notification does to the node map; [`Reconciler`] persists the result
//! under optimistic concurrency, re-fetching and re-applying on conflicts.

use crate::lifecycle::Phase;
use crate::notification::{Notification, NotificationBus, NotificationKind};
use crate::retry::RetryConfig;
use crate::source::is_newer_time_id;
use crate::status::{NodeStatus, Nodes, StatusStore};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Errors that can occur while reconciling.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Status store error: {source}")]
    Store {
        #[source]
        source: crate::status::Error,
    },
    #[error("Notification bus error: {source}")]
    Bus {
        #[source]
        source: crate::notification::Error,
    },
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
}

impl Error {
    fn is_conflict(&self) -> bool {
        matches!(self, Error::Store { source } if source.is_conflict())
    }
}

/// Why a notification left the status untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// No entry exists and the notification is not a first-sight `Initialized`.
    UnknownSource,
    /// The notification belongs to an older generation than the entry, or is an
    /// escalation from another generation.
    StaleTimeId,
    /// The entry already holds a phase of higher or equal terminal precedence.
    Superseded,
}

/// Effect of one notification on the node map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    /// A newer generation took over the entry.
    Replaced,
    Deleted,
    Discarded(Discard),
}

impl Outcome {
    /// Whether the node map changed and has to be persisted.
    pub fn is_change(&self) -> bool {
        !matches!(self, Outcome::Discarded(_))
    }
}

/// Whether `incoming` may overwrite `current` within one generation.
///
/// Higher precedence always wins. An equal phase only refreshes non-terminal
/// phases, so the first terminal phase sticks.
fn supersedes(current: Phase, incoming: Phase) -> bool {
    incoming.precedence() > current.precedence()
        || (incoming == current && !incoming.is_terminal())
}

/// Applies one notification to the node map.
pub fn apply(nodes: &mut Nodes, notification: &Notification, now: DateTime<Utc>) -> Outcome {
    let Some(node) = nodes.get_mut(&notification.id) else {
        if notification.kind == NotificationKind::StateChange
            && notification.phase == Phase::Initialized
        {
            nodes.insert(
                notification.id.clone(),
                NodeStatus {
                    id: notification.id.clone(),
                    name: notification.name.clone(),
                    phase: Phase::Initialized,
                    message: notification.message.clone(),
                    started_at: now,
                    time_id: notification.time_id.clone(),
                },
            );
            return Outcome::Created;
        }
        return Outcome::Discarded(Discard::UnknownSource);
    };

    if node.time_id != notification.time_id {
        let newer = notification.kind == NotificationKind::StateChange
            && is_newer_time_id(&notification.time_id, &node.time_id);
        if !newer {
            return Outcome::Discarded(Discard::StaleTimeId);
        }
        // Left behind by a process that stopped without emitting Removed.
        if notification.phase == Phase::Removed {
            nodes.remove(&notification.id);
            return Outcome::Deleted;
        }
        *node = NodeStatus {
            id: notification.id.clone(),
            name: notification.name.clone(),
            phase: notification.phase,
            message: notification.message.clone(),
            started_at: now,
            time_id: notification.time_id.clone(),
        };
        return Outcome::Replaced;
    }

    match notification.kind {
        NotificationKind::Escalation => {
            node.message = notification.message.clone();
            Outcome::Updated
        }
        NotificationKind::StateChange if notification.phase == Phase::Removed => {
            nodes.remove(&notification.id);
            Outcome::Deleted
        }
        NotificationKind::StateChange if supersedes(node.phase, notification.phase) => {
            node.phase = notification.phase;
            node.message = notification.message.clone();
            Outcome::Updated
        }
        NotificationKind::StateChange => Outcome::Discarded(Discard::Superseded),
    }
}

/// Sole writer of the durable status record.
#[derive(Debug)]
pub struct Reconciler {
    bus: Arc<dyn NotificationBus>,
    store: Arc<dyn StatusStore>,
    retry: RetryConfig,
}

impl Reconciler {
    /// Applies one notification and persists the result.
    ///
    /// Each attempt fetches the latest status and re-applies the notification, so a
    /// conflict never overwrites another writer's change. Conflicts are retried
    /// within the retry budget; other errors return immediately.
    #[tracing::instrument(skip(self, notification), name = "reconciler.reconcile", fields(
        source_id = %notification.id,
        time_id = %notification.time_id,
        phase = %notification.phase,
        kind = notification.kind.as_str(),
    ))]
    pub async fn reconcile(&self, notification: &Notification) -> Result<Outcome, Error> {
        tokio_retry::RetryIf::spawn(
            self.retry.strategy(),
            || async {
                let result = self.attempt(notification).await;
                if let Err(e) = &result {
                    if e.is_conflict() {
                        debug!(error = %e, "Status conflict, re-fetching");
                    }
                }
                result
            },
            |e: &Error| e.is_conflict(),
        )
        .await
    }

    async fn attempt(&self, notification: &Notification) -> Result<Outcome, Error> {
        let snapshot = self
            .store
            .fetch()
            .await
            .map_err(|source| Error::Store { source })?;

        let mut nodes = snapshot.nodes.clone();
        let outcome = apply(&mut nodes, notification, Utc::now());
        if outcome.is_change() {
            self.store
                .commit(&snapshot, &nodes)
                .await
                .map_err(|source| Error::Store { source })?;
        }
        Ok(outcome)
    }
}

impl crate::task::runner::Runner for Reconciler {
    type Error = Error;

    /// Consumes deliveries until the bus closes.
    #[tracing::instrument(skip(self), name = "reconciler.run")]
    async fn run(self) -> Result<(), Error> {
        let mut deliveries = self
            .bus
            .subscribe()
            .await
            .map_err(|source| Error::Bus { source })?;
        info!("State reconciler started");

        while let Some(delivery) = deliveries.next().await {
            match self.reconcile(&delivery.notification).await {
                Ok(Outcome::Discarded(reason)) => {
                    debug!(source_id = %delivery.notification.id, reason = ?reason, "Notification discarded");
                }
                Ok(outcome) => {
                    info!(
                        source_id = %delivery.notification.id,
                        phase = %delivery.notification.phase,
                        outcome = ?outcome,
                        "Status reconciled"
                    );
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        source_id = %delivery.notification.id,
                        error = %e,
                        "Retry budget exhausted, abandoning notification"
                    );
                }
                Err(e) => {
                    error!(source_id = %delivery.notification.id, error = %e, "Failed to reconcile notification");
                }
            }

            if let Err(e) = self.bus.acknowledge(&delivery).await {
                warn!(error = %e, "Failed to acknowledge notification");
            }
        }

        info!("Notification bus closed, state reconciler stopped");
        Ok(())
    }
}

/// Builder for Reconciler.
#[derive(Default)]
pub struct ReconcilerBuilder {
    bus: Option<Arc<dyn NotificationBus>>,
    store: Option<Arc<dyn StatusStore>>,
    retry: Option<RetryConfig>,
}

impl ReconcilerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the conflict retry budget. Defaults to [`RetryConfig::default`].
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<Reconciler, Error> {
        Ok(Reconciler {
            bus: self
                .bus
                .ok_or_else(|| Error::MissingBuilderAttribute("bus".to_string()))?,
            store: self
                .store
                .ok_or_else(|| Error::MissingBuilderAttribute("store".to_string()))?,
            retry: self.retry.unwrap_or_default(),
        })
    }
}
