//! Lifecycle notifications and the bus carrying them to the state reconciler.
//!
//! The bus is unordered and at-least-once. Consumers must not rely on delivery
//! order; the time identifier on each notification is what rejects stale updates.

use crate::lifecycle::Phase;
use crate::source::SourceIdentity;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

/// Type alias for bus errors.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Stream of deliveries handed to a subscriber.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Errors of the in-process bus.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("Notification channel is closed")]
    Closed,
    #[error("Notification channel already has a subscriber")]
    AlreadySubscribed,
}

/// What a notification asks the reconciler to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum NotificationKind {
    /// Phase transition of a source.
    #[default]
    StateChange,
    /// Diagnostic for a running source; only the message is recorded.
    Escalation,
}

impl NotificationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::StateChange => "StateChange",
            NotificationKind::Escalation => "Escalation",
        }
    }
}

/// Wire unit of the notification bus.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Notification {
    /// Source ID.
    pub id: String,
    /// Source name.
    pub name: String,
    pub phase: Phase,
    pub message: String,
    /// Generation the notification belongs to.
    pub time_id: String,
    #[serde(default)]
    pub kind: NotificationKind,
}

impl Notification {
    /// Phase transition for a source.
    pub fn state_change(
        identity: &SourceIdentity,
        phase: Phase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            phase,
            message: message.into(),
            time_id: identity.time_id.clone(),
            kind: NotificationKind::StateChange,
        }
    }

    /// Diagnostic about a failure that did not stop the source.
    pub fn escalation(identity: &SourceIdentity, message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Escalation,
            ..Self::state_change(identity, Phase::Error, message)
        }
    }
}

/// One notification as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub notification: Notification,
    /// Transport handle used to acknowledge the delivery, if the bus needs one.
    pub receipt: Option<String>,
}

/// Unordered, at-least-once side channel for lifecycle notifications.
#[async_trait]
pub trait NotificationBus: Debug + Send + Sync + 'static {
    /// Publishes a notification.
    async fn publish(&self, notification: Notification) -> Result<(), Error>;

    /// Opens the delivery stream for the single reconciler.
    async fn subscribe(&self) -> Result<DeliveryStream, Error>;

    /// Marks a delivery as processed so the bus does not hand it out again.
    async fn acknowledge(&self, _delivery: &Delivery) -> Result<(), Error> {
        Ok(())
    }
}

/// Publishes a notification, logging instead of failing.
///
/// Lifecycle notifications are best effort; a lost one is repaired by the next.
pub async fn publish_or_log(bus: &dyn NotificationBus, notification: Notification) {
    let id = notification.id.clone();
    let phase = notification.phase;
    if let Err(e) = bus.publish(notification).await {
        warn!(source_id = %id, phase = %phase, error = %e, "Failed to publish lifecycle notification");
    }
}

/// In-process bus backed by an unbounded channel.
#[derive(Debug)]
pub struct ChannelBus {
    tx: mpsc::UnboundedSender<Notification>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl NotificationBus for ChannelBus {
    async fn publish(&self, notification: Notification) -> Result<(), Error> {
        self.tx
            .send(notification)
            .map_err(|_| Box::new(ChannelError::Closed) as Error)
    }

    async fn subscribe(&self) -> Result<DeliveryStream, Error> {
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Box::new(ChannelError::AlreadySubscribed) as Error)?;
        Ok(UnboundedReceiverStream::new(rx)
            .map(|notification| Delivery {
                notification,
                receipt: None,
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SourceIdentity {
        SourceIdentity::new("src-A", "topic: foo", "t1")
    }

    #[test]
    fn test_state_change_carries_identity() {
        let n = Notification::state_change(&identity(), Phase::Running, "ok");
        assert_eq!(n.id, identity().id);
        assert_eq!(n.name, "src-A");
        assert_eq!(n.time_id, "t1");
        assert_eq!(n.phase, Phase::Running);
        assert_eq!(n.kind, NotificationKind::StateChange);
    }

    #[test]
    fn test_escalation_kind() {
        let n = Notification::escalation(&identity(), "dispatch failed");
        assert_eq!(n.kind, NotificationKind::Escalation);
        assert_eq!(n.phase, Phase::Error);
        assert_eq!(n.message, "dispatch failed");
    }

    #[tokio::test]
    async fn test_channel_bus_delivers() {
        let bus = ChannelBus::new();
        let mut deliveries = bus.subscribe().await.unwrap();

        bus.publish(Notification::state_change(&identity(), Phase::Initialized, ""))
            .await
            .unwrap();

        let delivery = deliveries.next().await.unwrap();
        assert_eq!(delivery.notification.phase, Phase::Initialized);
        assert!(delivery.receipt.is_none());
        bus.acknowledge(&delivery).await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_bus_single_subscriber() {
        let bus = ChannelBus::new();
        let _deliveries = bus.subscribe().await.unwrap();
        let Err(err) = bus.subscribe().await else {
            panic!("second subscription must fail");
        };
        assert!(matches!(
            err.downcast_ref::<ChannelError>(),
            Some(ChannelError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn test_channel_bus_closed() {
        let bus = ChannelBus::new();
        drop(bus.subscribe().await.unwrap());
        let err = bus
            .publish(Notification::state_change(&identity(), Phase::Running, ""))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChannelError>(),
            Some(ChannelError::Closed)
        ));
    }
}
