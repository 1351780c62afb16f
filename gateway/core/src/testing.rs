//! Test doubles shared by unit tests across the crate.

use crate::adapter::{Adapter, MessageStream, RawMessage};
use crate::dispatch::{DeliveryFailure, DispatchReport, Dispatcher, Error};
use crate::event::Envelope;
use crate::lifecycle::Phase;
use crate::notification::{Notification, NotificationBus};
use crate::source::SourceIdentity;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Behaviour of one scripted source, keyed by source name.
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    pub messages: Vec<RawMessage>,
    /// End the stream after the messages instead of staying open.
    pub end: bool,
    /// Reject the configuration during validation.
    pub reject: Option<String>,
    /// Yield a stream error after the messages.
    pub stream_error: Option<String>,
    /// Delay before `start` returns.
    pub connect_delay: Option<Duration>,
}

/// Adapter that replays scripts. Unscripted sources stay open without messages.
#[derive(Debug, Default)]
pub(crate) struct ScriptedAdapter {
    scripts: HashMap<String, Script>,
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, name: &str, script: Script) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn source_type(&self) -> &str {
        "scripted"
    }

    async fn validate(&self, source: &SourceIdentity) -> Result<(), crate::adapter::Error> {
        match self.scripts.get(&source.name).and_then(|s| s.reject.clone()) {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    async fn start(&self, source: &SourceIdentity) -> Result<MessageStream, crate::adapter::Error> {
        let script = self.scripts.get(&source.name).cloned().unwrap_or_default();
        if let Some(delay) = script.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.started.lock().unwrap().push(source.name.clone());

        let head = stream::iter(script.messages.into_iter().map(Ok));
        let tail: MessageStream = match (script.stream_error, script.end) {
            (Some(reason), _) => {
                stream::once(async move { Err::<RawMessage, crate::adapter::Error>(reason.into()) })
                    .boxed()
            }
            (None, true) => stream::empty().boxed(),
            (None, false) => stream::pending().boxed(),
        };
        Ok(head.chain(tail).boxed())
    }

    async fn stop(&self, source: &SourceIdentity) -> Result<(), crate::adapter::Error> {
        self.stopped.lock().unwrap().push(source.name.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DispatchMode {
    Deliver,
    PartialFailure,
    Fatal,
}

/// Dispatcher recording every envelope it is handed.
#[derive(Debug)]
pub(crate) struct RecordingDispatcher {
    mode: DispatchMode,
    pub envelopes: Mutex<Vec<Envelope>>,
}

impl RecordingDispatcher {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            envelopes: Mutex::new(Vec::new()),
        }
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, envelope: &Envelope) -> Result<DispatchReport, Error> {
        self.envelopes.lock().unwrap().push(envelope.clone());
        match self.mode {
            DispatchMode::Deliver => Ok(DispatchReport {
                attempted: 2,
                delivered: 2,
                failed: Vec::new(),
            }),
            DispatchMode::PartialFailure => Ok(DispatchReport {
                attempted: 2,
                delivered: 1,
                failed: vec![DeliveryFailure {
                    watcher: "w1".to_string(),
                    reason: "connection refused".to_string(),
                }],
            }),
            DispatchMode::Fatal => Err(Error::Fatal {
                source: "no connection".into(),
            }),
        }
    }
}

/// Bus that keeps every published notification for inspection.
#[derive(Debug, Default)]
pub(crate) struct RecordingBus {
    pub published: Mutex<Vec<Notification>>,
}

impl RecordingBus {
    pub fn notifications(&self) -> Vec<Notification> {
        self.published.lock().unwrap().clone()
    }

    /// Phases published for one source name, in publish order.
    pub fn phases(&self, name: &str) -> Vec<Phase> {
        self.notifications()
            .into_iter()
            .filter(|n| n.name == name && n.kind == crate::notification::NotificationKind::StateChange)
            .map(|n| n.phase)
            .collect()
    }

    /// Polls until `name` has published `phase` or a second has passed.
    pub async fn wait_for(&self, name: &str, phase: Phase) -> bool {
        for _ in 0..100 {
            if self.phases(name).contains(&phase) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl NotificationBus for RecordingBus {
    async fn publish(&self, notification: Notification) -> Result<(), crate::notification::Error> {
        self.published.lock().unwrap().push(notification);
        Ok(())
    }

    async fn subscribe(&self) -> Result<crate::notification::DeliveryStream, crate::notification::Error> {
        Ok(stream::empty().boxed())
    }
}
