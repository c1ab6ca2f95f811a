//! Unified command stream types
//!
//! Every producer (capture poller, router, control adapter, signal
//! adapter) posts [`Command`]s onto one FIFO queue consumed by the
//! dispatcher.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::machine::PlayerState;

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Capture poller saw audio above the detect threshold
    AudioDetected,
    /// Capture poller saw enough consecutive quiet polls
    AudioLost,
    /// Pause for the given duration, or the configured default when `None`
    PauseRequested(Option<Duration>),
    /// Leave hibernation
    ResumeRequested,
    /// Pause when playing or idle, resume when hibernating
    TogglePause,
    /// Configuration reloaded: tear everything down and start over
    RestartRequested,
    /// Report the current state
    StatusRequested,
    /// Termination signal received
    KillRequested,
    /// No command arrived within the poll interval
    Tick,
    /// The playback path broke (open failed or routing error)
    PathFailed,
    /// The capture device could not be opened or stopped delivering samples
    CaptureFailed,
}

/// Instruction returned by the state machine for the dispatcher to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    OpenCapture,
    CloseCapture,
    OpenPlayback,
    ClosePlayback,
    StartRouting,
    StopRouting,
    /// Arm the hibernate timer; `None` means hibernate until resumed
    ArmHibernateTimer(Option<Instant>),
    DisarmHibernateTimer,
    ReplyStatus(PlayerState),
    /// Exit the dispatcher loop once the remaining effects ran
    Terminate,
}

/// One item of the unified command stream
#[derive(Debug)]
pub struct Command {
    pub event: Event,
    /// Where to deliver a [`SideEffect::ReplyStatus`]
    pub reply: Option<oneshot::Sender<PlayerState>>,
}

impl Command {
    pub fn event(event: Event) -> Self {
        Self { event, reply: None }
    }

    pub fn status(reply: oneshot::Sender<PlayerState>) -> Self {
        Self {
            event: Event::StatusRequested,
            reply: Some(reply),
        }
    }
}

impl From<Event> for Command {
    fn from(event: Event) -> Self {
        Self::event(event)
    }
}
