//! Per-source task driving one adapter connection through its lifecycle.
//!
//! The task is the only owner of the adapter stream. Every input it observes
//! (connect result, message, end of stream, failure, stop request) becomes a
//! [`SourceEvent`] and goes through the [`Lifecycle`] table before anything else
//! happens.

use super::context::GatewayContext;
use crate::adapter::{Adapter, MessageStream, RawMessage};
use crate::dispatch::Dispatcher;
use crate::event::Transformer;
use crate::lifecycle::{Lifecycle, Phase, SourceEvent};
use crate::notification::{publish_or_log, Notification, NotificationBus};
use crate::source::SourceIdentity;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Errors that can occur while running a source task.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Source lifecycle error: {source}")]
    Lifecycle {
        #[source]
        source: crate::lifecycle::Error,
    },
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
}

/// Shared part of a source task: everything but the stop signal.
#[derive(Debug)]
struct SourceHandler {
    identity: SourceIdentity,
    context: Arc<GatewayContext>,
    adapter: Arc<dyn Adapter>,
    dispatcher: Arc<dyn Dispatcher>,
    bus: Arc<dyn NotificationBus>,
    transformer: Transformer,
}

impl SourceHandler {
    /// Moves the lifecycle along and publishes the resulting phase change.
    ///
    /// Self-transitions and `Removed` are not published. The source manager owns
    /// the `Removed` notification.
    async fn transition(
        &self,
        lifecycle: &mut Lifecycle,
        event: &SourceEvent,
        message: &str,
    ) -> Result<Phase, Error> {
        let from = lifecycle.phase();
        let to = lifecycle
            .apply(event)
            .map_err(|source| Error::Lifecycle { source })?;

        if from != to && to != Phase::Removed {
            info!(from = %from, to = %to, "Source phase changed");
            publish_or_log(
                self.bus.as_ref(),
                Notification::state_change(&self.identity, to, message),
            )
            .await;
        }
        Ok(to)
    }

    /// Validates and starts the adapter under the connect timeout.
    async fn connect(&self) -> Result<MessageStream, String> {
        let connect = async {
            self.adapter.validate(&self.identity).await?;
            self.adapter.start(&self.identity).await
        };

        match tokio::time::timeout(self.context.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(format!("failed to start source: {e}")),
            Err(_) => Err(format!(
                "source did not connect within {:?}",
                self.context.connect_timeout
            )),
        }
    }

    /// Transforms and dispatches one message.
    ///
    /// Returns the failure reason when the dispatcher reports an unusable
    /// transport. Anything else is escalated and the source keeps running.
    async fn handle_message(&self, message: RawMessage) -> Option<String> {
        let envelope = match self.transformer.transform(&self.identity.name, message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Failed to transform message");
                self.escalate(format!("failed to transform message: {e}"))
                    .await;
                return None;
            }
        };

        let event_id = envelope.context.event_id.clone();
        match self.dispatcher.dispatch(&envelope).await {
            Ok(report) if report.is_complete() => {
                debug!(event_id = %event_id, watchers = report.attempted, "Event dispatched");
                None
            }
            Ok(report) => {
                let failures = report
                    .failed
                    .iter()
                    .map(|f| format!("{}: {}", f.watcher, f.reason))
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(
                    event_id = %event_id,
                    delivered = report.delivered,
                    attempted = report.attempted,
                    failures = %failures,
                    "Event not delivered to every watcher"
                );
                self.escalate(format!(
                    "failed to dispatch event {event_id} to {} of {} watchers: {failures}",
                    report.failed.len(),
                    report.attempted
                ))
                .await;
                None
            }
            Err(e) if e.is_fatal() => Some(format!("failed to dispatch event {event_id}: {e}")),
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Failed to dispatch event");
                self.escalate(format!("failed to dispatch event {event_id}: {e}"))
                    .await;
                None
            }
        }
    }

    async fn escalate(&self, message: String) {
        publish_or_log(
            self.bus.as_ref(),
            Notification::escalation(&self.identity, message),
        )
        .await;
    }
}

/// Task running a single source generation.
#[derive(Debug)]
pub struct SourceTask {
    handler: SourceHandler,
    stop_rx: oneshot::Receiver<()>,
    active: Arc<AtomicBool>,
}

impl SourceTask {
    /// Runs the lifecycle until the source reaches a final phase.
    async fn execute(&mut self) -> Result<Phase, Error> {
        let handler = &self.handler;
        let mut lifecycle = Lifecycle::new();

        let connected = tokio::select! {
            biased;
            _ = &mut self.stop_rx => None,
            result = handler.connect() => Some(result),
        };
        let mut stream = match connected {
            None => return handler.transition(&mut lifecycle, &SourceEvent::Stop, "").await,
            Some(Err(reason)) => {
                warn!(reason = %reason, "Source failed to connect");
                return handler
                    .transition(&mut lifecycle, &SourceEvent::Failed(reason.clone()), &reason)
                    .await;
            }
            Some(Ok(stream)) => stream,
        };
        handler
            .transition(&mut lifecycle, &SourceEvent::Connected, "source is running")
            .await?;

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut self.stop_rx => SourceEvent::Stop,
                next = stream.next() => match next {
                    Some(Ok(message)) => SourceEvent::Message(message),
                    Some(Err(e)) => SourceEvent::Failed(format!("source stream failed: {e}")),
                    None => SourceEvent::EndOfStream,
                },
            };

            let message = match &event {
                SourceEvent::Failed(reason) => {
                    warn!(reason = %reason, "Source stream failed");
                    reason.clone()
                }
                SourceEvent::EndOfStream => "source completed".to_string(),
                _ => String::new(),
            };
            let mut phase = handler.transition(&mut lifecycle, &event, &message).await?;

            if let SourceEvent::Message(message) = event {
                if let Some(reason) = handler.handle_message(message).await {
                    warn!(reason = %reason, "Dispatch transport failed, stopping source");
                    phase = handler
                        .transition(&mut lifecycle, &SourceEvent::Failed(reason.clone()), &reason)
                        .await?;
                }
            }

            if phase.is_terminal() || phase == Phase::Removed {
                return Ok(phase);
            }
        }
    }
}

impl super::runner::Runner for SourceTask {
    type Error = Error;

    #[tracing::instrument(skip(self), name = "source.run", fields(
        source = %self.handler.identity.name,
        source_id = %self.handler.identity.id,
        time_id = %self.handler.identity.time_id,
    ))]
    async fn run(mut self) -> Result<(), Error> {
        let result = self.execute().await;

        let identity = &self.handler.identity;
        if let Err(e) = self.handler.adapter.stop(identity).await {
            warn!(error = %e, "Failed to release source resources");
        }
        self.active.store(false, Ordering::Release);

        match &result {
            Ok(phase) => debug!(phase = %phase, "Source task finished"),
            Err(e) => warn!(error = %e, "Source task finished with error"),
        }
        result.map(|_| ())
    }
}

/// Builder for SourceTask.
#[derive(Default)]
pub struct SourceTaskBuilder {
    identity: Option<SourceIdentity>,
    context: Option<Arc<GatewayContext>>,
    adapter: Option<Arc<dyn Adapter>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    bus: Option<Arc<dyn NotificationBus>>,
    stop_rx: Option<oneshot::Receiver<()>>,
    active: Option<Arc<AtomicBool>>,
}

impl SourceTaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: SourceIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn context(mut self, context: Arc<GatewayContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the stop signal. A dropped sender counts as a stop request.
    pub fn stop_rx(mut self, stop_rx: oneshot::Receiver<()>) -> Self {
        self.stop_rx = Some(stop_rx);
        self
    }

    /// Sets the flag cleared when the task returns.
    pub fn active(mut self, active: Arc<AtomicBool>) -> Self {
        self.active = Some(active);
        self
    }

    pub fn build(self) -> Result<SourceTask, Error> {
        let context = self
            .context
            .ok_or_else(|| Error::MissingBuilderAttribute("context".to_string()))?;
        let handler = SourceHandler {
            identity: self
                .identity
                .ok_or_else(|| Error::MissingBuilderAttribute("identity".to_string()))?,
            transformer: Transformer::new(&context),
            context,
            adapter: self
                .adapter
                .ok_or_else(|| Error::MissingBuilderAttribute("adapter".to_string()))?,
            dispatcher: self
                .dispatcher
                .ok_or_else(|| Error::MissingBuilderAttribute("dispatcher".to_string()))?,
            bus: self
                .bus
                .ok_or_else(|| Error::MissingBuilderAttribute("bus".to_string()))?,
        };
        Ok(SourceTask {
            handler,
            stop_rx: self
                .stop_rx
                .ok_or_else(|| Error::MissingBuilderAttribute("stop_rx".to_string()))?,
            active: self
                .active
                .unwrap_or_else(|| Arc::new(AtomicBool::new(true))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationKind;
    use crate::task::context::GatewayContextBuilder;
    use crate::task::runner::Runner;
    use crate::testing::{DispatchMode, RecordingBus, RecordingDispatcher, Script, ScriptedAdapter};
    use std::time::Duration;

    struct Harness {
        adapter: Arc<ScriptedAdapter>,
        dispatcher: Arc<RecordingDispatcher>,
        bus: Arc<RecordingBus>,
        active: Arc<AtomicBool>,
    }

    fn task(adapter: ScriptedAdapter, mode: DispatchMode) -> (SourceTask, Harness, oneshot::Sender<()>) {
        let context = GatewayContextBuilder::new()
            .gateway_name("test-gateway")
            .namespace("argo-events")
            .connect_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let adapter = Arc::new(adapter);
        let dispatcher = Arc::new(RecordingDispatcher::new(mode));
        let bus = Arc::new(RecordingBus::default());
        let active = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = SourceTaskBuilder::new()
            .identity(SourceIdentity::new("src-A", "topic: foo", "t1"))
            .context(Arc::new(context))
            .adapter(adapter.clone())
            .dispatcher(dispatcher.clone())
            .bus(bus.clone())
            .stop_rx(stop_rx)
            .active(active.clone())
            .build()
            .unwrap();

        let harness = Harness {
            adapter,
            dispatcher,
            bus,
            active,
        };
        (task, harness, stop_tx)
    }

    fn json(payload: &str) -> RawMessage {
        RawMessage::new(payload.to_string()).content_type("application/json")
    }

    #[tokio::test]
    async fn test_messages_dispatched_until_end_of_stream() {
        let adapter = ScriptedAdapter::new().script(
            "src-A",
            Script {
                messages: vec![json(r#"{"n":1}"#), json(r#"{"n":2}"#)],
                end: true,
                ..Default::default()
            },
        );
        let (task, harness, _stop_tx) = task(adapter, DispatchMode::Deliver);

        task.run().await.unwrap();

        assert_eq!(harness.dispatcher.envelopes().len(), 2);
        assert_eq!(
            harness.dispatcher.envelopes()[0].context.source.host,
            "test-gateway:src-A"
        );
        assert_eq!(
            harness.bus.phases("src-A"),
            vec![Phase::Running, Phase::Completed]
        );
        assert_eq!(harness.adapter.stopped(), vec!["src-A".to_string()]);
        assert!(!harness.active.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_validation_failure_moves_to_error() {
        let adapter = ScriptedAdapter::new().script(
            "src-A",
            Script {
                reject: Some("missing port".to_string()),
                ..Default::default()
            },
        );
        let (task, harness, _stop_tx) = task(adapter, DispatchMode::Deliver);

        task.run().await.unwrap();

        let notifications = harness.bus.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].phase, Phase::Error);
        assert!(notifications[0].message.contains("missing port"));
        assert!(harness.adapter.started().is_empty());
    }

    #[tokio::test]
    async fn test_connect_timeout_moves_to_error() {
        let adapter = ScriptedAdapter::new().script(
            "src-A",
            Script {
                connect_delay: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        );
        let (task, harness, _stop_tx) = task(adapter, DispatchMode::Deliver);

        task.run().await.unwrap();

        assert_eq!(harness.bus.phases("src-A"), vec![Phase::Error]);
    }

    #[tokio::test]
    async fn test_stream_error_moves_to_error() {
        let adapter = ScriptedAdapter::new().script(
            "src-A",
            Script {
                stream_error: Some("connection reset".to_string()),
                ..Default::default()
            },
        );
        let (task, harness, _stop_tx) = task(adapter, DispatchMode::Deliver);

        task.run().await.unwrap();

        assert_eq!(
            harness.bus.phases("src-A"),
            vec![Phase::Running, Phase::Error]
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_escalated() {
        let adapter = ScriptedAdapter::new().script(
            "src-A",
            Script {
                messages: vec![json("{not json"), json(r#"{"ok":true}"#)],
                end: true,
                ..Default::default()
            },
        );
        let (task, harness, _stop_tx) = task(adapter, DispatchMode::Deliver);

        task.run().await.unwrap();

        let escalations: Vec<_> = harness
            .bus
            .notifications()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::Escalation)
            .collect();
        assert_eq!(escalations.len(), 1);
        assert!(escalations[0].message.contains("transform"));
        assert_eq!(harness.dispatcher.envelopes().len(), 1);
        assert_eq!(
            harness.bus.phases("src-A"),
            vec![Phase::Running, Phase::Completed]
        );
    }

    #[tokio::test]
    async fn test_partial_dispatch_failure_keeps_running() {
        let adapter = ScriptedAdapter::new().script(
            "src-A",
            Script {
                messages: vec![json("{}")],
                ..Default::default()
            },
        );
        let (task, harness, stop_tx) = task(adapter, DispatchMode::PartialFailure);
        let handle = tokio::spawn(task.run());

        let mut escalated = false;
        for _ in 0..100 {
            escalated = harness
                .bus
                .notifications()
                .iter()
                .any(|n| n.kind == NotificationKind::Escalation);
            if escalated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(escalated);
        assert!(harness.active.load(Ordering::Acquire));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(harness.bus.phases("src-A"), vec![Phase::Running]);
    }

    #[tokio::test]
    async fn test_fatal_dispatch_error_moves_to_error() {
        let adapter = ScriptedAdapter::new().script(
            "src-A",
            Script {
                messages: vec![json("{}")],
                ..Default::default()
            },
        );
        let (task, harness, _stop_tx) = task(adapter, DispatchMode::Fatal);

        task.run().await.unwrap();

        assert_eq!(
            harness.bus.phases("src-A"),
            vec![Phase::Running, Phase::Error]
        );
        assert_eq!(harness.adapter.stopped().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_publishes_nothing_and_releases_adapter() {
        let (task, harness, stop_tx) = task(ScriptedAdapter::new(), DispatchMode::Deliver);
        let handle = tokio::spawn(task.run());

        assert!(harness.bus.wait_for("src-A", Phase::Running).await);
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(harness.bus.phases("src-A"), vec![Phase::Running]);
        assert_eq!(harness.adapter.stopped(), vec!["src-A".to_string()]);
        assert!(!harness.active.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_task() {
        let (task, harness, stop_tx) = task(ScriptedAdapter::new(), DispatchMode::Deliver);
        let handle = tokio::spawn(task.run());

        assert!(harness.bus.wait_for("src-A", Phase::Running).await);
        drop(stop_tx);
        handle.await.unwrap().unwrap();

        assert_eq!(harness.adapter.stopped().len(), 1);
    }

    #[test]
    fn test_builder_missing_adapter() {
        let (_tx, rx) = oneshot::channel();
        let result = SourceTaskBuilder::new()
            .identity(SourceIdentity::new("a", "", "t"))
            .context(Arc::new(
                GatewayContextBuilder::new()
                    .gateway_name("g")
                    .namespace("n")
                    .build()
                    .unwrap(),
            ))
            .stop_rx(rx)
            .build();
        assert!(matches!(
            result,
            Err(Error::MissingBuilderAttribute(attr)) if attr == "adapter"
        ));
    }
}
