//! Per-source lifecycle phases and the finite state machine driving them.
//!
//! Every source task feeds [`SourceEvent`]s into a [`Lifecycle`]. The legal
//! transitions live in a single table so they can be checked in isolation
//! from any I/O.

use crate::adapter::RawMessage;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Errors raised by the lifecycle state machine.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("Illegal lifecycle transition from {from} on {event:?}")]
    IllegalTransition { from: Phase, event: EventKind },
    #[error("Unknown lifecycle phase: {0}")]
    UnknownPhase(String),
}

/// Lifecycle phase of a source as recorded in status and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum Phase {
    #[default]
    New,
    Initialized,
    Running,
    Completed,
    Error,
    Removed,
}

impl Phase {
    /// Returns the wire name of the phase.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::New => "New",
            Phase::Initialized => "Initialized",
            Phase::Running => "Running",
            Phase::Completed => "Completed",
            Phase::Error => "Error",
            Phase::Removed => "Removed",
        }
    }

    /// Rank used when two notifications of the same generation race.
    ///
    /// `Removed > {Completed, Error} > Running > Initialized`.
    pub const fn precedence(&self) -> u8 {
        match self {
            Phase::New => 0,
            Phase::Initialized => 1,
            Phase::Running => 2,
            Phase::Completed | Phase::Error => 3,
            Phase::Removed => 4,
        }
    }

    /// Whether no further transition is possible from this phase.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Error | Phase::Removed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New" => Ok(Phase::New),
            "Initialized" => Ok(Phase::Initialized),
            "Running" => Ok(Phase::Running),
            "Completed" => Ok(Phase::Completed),
            "Error" => Ok(Phase::Error),
            "Removed" => Ok(Phase::Removed),
            other => Err(Error::UnknownPhase(other.to_string())),
        }
    }
}

/// Everything that can happen to a running source, as seen by its task loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Adapter validated the configuration and connected.
    Connected,
    /// Adapter produced a message.
    Message(RawMessage),
    /// Adapter signalled a clean end of stream.
    EndOfStream,
    /// Connect, validation, stream or unrecoverable dispatch failure.
    Failed(String),
    /// Stop requested by the source manager.
    Stop,
}

impl SourceEvent {
    /// Returns the payload-free discriminant used for table lookups.
    pub const fn kind(&self) -> EventKind {
        match self {
            SourceEvent::Connected => EventKind::Connected,
            SourceEvent::Message(_) => EventKind::Message,
            SourceEvent::EndOfStream => EventKind::EndOfStream,
            SourceEvent::Failed(_) => EventKind::Failed,
            SourceEvent::Stop => EventKind::Stop,
        }
    }
}

/// Discriminant of [`SourceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Message,
    EndOfStream,
    Failed,
    Stop,
}

/// Legal transitions as `(from, on, to)`.
const TRANSITIONS: &[(Phase, EventKind, Phase)] = &[
    (Phase::Initialized, EventKind::Connected, Phase::Running),
    (Phase::Initialized, EventKind::Failed, Phase::Error),
    (Phase::Initialized, EventKind::Stop, Phase::Removed),
    (Phase::Running, EventKind::Message, Phase::Running),
    (Phase::Running, EventKind::EndOfStream, Phase::Completed),
    (Phase::Running, EventKind::Failed, Phase::Error),
    (Phase::Running, EventKind::Stop, Phase::Removed),
];

/// Looks up the target phase for an event, if the transition is legal.
pub fn next_phase(from: Phase, event: EventKind) -> Option<Phase> {
    TRANSITIONS
        .iter()
        .find(|(state, on, _)| *state == from && *on == event)
        .map(|(_, _, to)| *to)
}

/// State machine for a single source generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    phase: Phase,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Creates a lifecycle in the `Initialized` phase.
    pub fn new() -> Self {
        Self {
            phase: Phase::Initialized,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Applies an event and returns the resulting phase.
    pub fn apply(&mut self, event: &SourceEvent) -> Result<Phase, Error> {
        let kind = event.kind();
        let to = next_phase(self.phase, kind).ok_or(Error::IllegalTransition {
            from: self.phase,
            event: kind,
        })?;
        self.phase = to;
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.phase(), Phase::Initialized);
        assert_eq!(
            lifecycle.apply(&SourceEvent::Connected).unwrap(),
            Phase::Running
        );
        assert_eq!(
            lifecycle
                .apply(&SourceEvent::Message(RawMessage::new("x")))
                .unwrap(),
            Phase::Running
        );
        assert_eq!(
            lifecycle.apply(&SourceEvent::EndOfStream).unwrap(),
            Phase::Completed
        );
    }

    #[test]
    fn test_stop_from_initialized_and_running() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.apply(&SourceEvent::Stop).unwrap(), Phase::Removed);

        let mut lifecycle = Lifecycle::new();
        lifecycle.apply(&SourceEvent::Connected).unwrap();
        assert_eq!(lifecycle.apply(&SourceEvent::Stop).unwrap(), Phase::Removed);
    }

    #[test]
    fn test_failure_before_running() {
        let mut lifecycle = Lifecycle::new();
        let phase = lifecycle
            .apply(&SourceEvent::Failed("bad config".to_string()))
            .unwrap();
        assert_eq!(phase, Phase::Error);
    }

    #[test]
    fn test_terminal_phases_reject_everything() {
        let mut lifecycle = Lifecycle::new();
        lifecycle
            .apply(&SourceEvent::Failed("boom".to_string()))
            .unwrap();

        let err = lifecycle.apply(&SourceEvent::Connected).unwrap_err();
        assert_eq!(
            err,
            Error::IllegalTransition {
                from: Phase::Error,
                event: EventKind::Connected
            }
        );
        assert!(lifecycle.apply(&SourceEvent::Stop).is_err());
        assert_eq!(lifecycle.phase(), Phase::Error);
    }

    #[test]
    fn test_message_before_running_is_illegal() {
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle
            .apply(&SourceEvent::Message(RawMessage::new("x")))
            .is_err());
    }

    #[test]
    fn test_every_transition_moves_forward() {
        for (from, _, to) in TRANSITIONS {
            assert!(to.precedence() >= from.precedence());
        }
    }

    #[test]
    fn test_precedence_order() {
        assert!(Phase::Removed.precedence() > Phase::Completed.precedence());
        assert_eq!(Phase::Completed.precedence(), Phase::Error.precedence());
        assert!(Phase::Error.precedence() > Phase::Running.precedence());
        assert!(Phase::Running.precedence() > Phase::Initialized.precedence());
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("Running".parse::<Phase>().unwrap(), Phase::Running);
        assert!(matches!(
            "Paused".parse::<Phase>(),
            Err(Error::UnknownPhase(p)) if p == "Paused"
        ));
        assert_eq!(Phase::Completed.to_string(), "Completed");
    }
}
