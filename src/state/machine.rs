//! Core state machine implementation
//!
//! A pure decision function: `(state, event, now) -> (next state, side
//! effects)`. It never touches a device; the dispatcher executes the
//! returned [`SideEffect`]s in order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error};

use super::command::{Event, SideEffect};
use crate::capture::Backoff;

/// The five possible player states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    /// No audio detected, no playback path
    Idle,
    /// Audio detected, capture routed to playback
    Play,
    /// Paused by a control command
    Hybernate,
    /// Terminal, absorbs every event
    Killed,
    /// Not initialised yet, or an invariant was violated
    Unknown,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl PlayerState {
    /// MPRIS `PlaybackStatus` equivalent
    pub fn playback_status(&self) -> &'static str {
        match self {
            PlayerState::Idle | PlayerState::Killed => "Stopped",
            PlayerState::Play => "Playing",
            PlayerState::Hybernate => "Paused",
            PlayerState::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerState::Idle => write!(f, "IDLE"),
            PlayerState::Play => write!(f, "PLAY"),
            PlayerState::Hybernate => write!(f, "HYBERNATE"),
            PlayerState::Killed => write!(f, "KILLED"),
            PlayerState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Result of feeding one event to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: PlayerState,
    pub to: PlayerState,
    pub effects: Vec<SideEffect>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn terminates(&self) -> bool {
        self.effects.contains(&SideEffect::Terminate)
    }
}

/// The state machine that owns player state and device-path bookkeeping
#[derive(Debug)]
pub struct LoopStateMachine {
    state: PlayerState,
    /// Capture handle requested open (and not reported failed since)
    capture_open: bool,
    playback_open: bool,
    routing: bool,
    /// Expiry of the current hibernation, `None` while indefinite
    hibernate_deadline: Option<Instant>,
    /// Used when a pause request carries no duration
    default_hibernate: Option<Duration>,
    /// Paces reopening the capture device after a failure
    capture_backoff: Backoff,
    capture_retry_at: Option<Instant>,
}

impl LoopStateMachine {
    pub fn new(default_hibernate: Option<Duration>, capture_backoff: Backoff) -> Self {
        Self {
            state: PlayerState::Unknown,
            capture_open: false,
            playback_open: false,
            routing: false,
            hibernate_deadline: None,
            default_hibernate,
            capture_backoff,
            capture_retry_at: None,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// True while playback is open or samples are being routed
    pub fn path_open(&self) -> bool {
        self.playback_open || self.routing
    }

    pub fn capture_open(&self) -> bool {
        self.capture_open
    }

    pub fn hibernate_deadline(&self) -> Option<Instant> {
        self.hibernate_deadline
    }

    /// Swap in reloaded settings. Takes effect from the next event.
    pub fn reconfigure(&mut self, default_hibernate: Option<Duration>, capture_backoff: Backoff) {
        self.default_hibernate = default_hibernate;
        self.capture_backoff = capture_backoff;
    }

    /// Leave `Unknown` for `Idle`, opening the capture device if needed
    pub fn initialize(&mut self) -> Transition {
        let from = self.state;
        let mut effects = Vec::new();

        if from != PlayerState::Unknown {
            debug!(state = %from, "initialize ignored, machine already running");
            return Transition {
                from,
                to: from,
                effects,
            };
        }

        self.close_path(&mut effects);
        if !self.capture_open {
            effects.push(SideEffect::OpenCapture);
            self.capture_open = true;
        }
        self.state = PlayerState::Idle;

        Transition {
            from,
            to: self.state,
            effects,
        }
    }

    /// Feed one event and get back the next state plus the side effects
    pub fn handle(&mut self, event: Event, now: Instant) -> Transition {
        let from = self.state;
        let mut effects = Vec::new();

        let event = match (from, event) {
            (PlayerState::Play | PlayerState::Idle, Event::TogglePause) => Event::PauseRequested(None),
            (_, Event::TogglePause) => Event::ResumeRequested,
            _ => event,
        };

        match (from, event) {
            (PlayerState::Killed, _) => {}

            (_, Event::KillRequested) => {
                self.close_path(&mut effects);
                if from == PlayerState::Hybernate {
                    effects.push(SideEffect::DisarmHibernateTimer);
                    self.hibernate_deadline = None;
                }
                if self.capture_open {
                    effects.push(SideEffect::CloseCapture);
                    self.capture_open = false;
                }
                effects.push(SideEffect::Terminate);
                self.state = PlayerState::Killed;
            }

            (_, Event::RestartRequested) => {
                self.close_path(&mut effects);
                if from == PlayerState::Hybernate {
                    effects.push(SideEffect::DisarmHibernateTimer);
                }
                self.hibernate_deadline = None;
                if self.capture_open {
                    effects.push(SideEffect::CloseCapture);
                    self.capture_open = false;
                }
                self.capture_backoff.reset();
                self.capture_retry_at = None;
                self.state = PlayerState::Unknown;
            }

            (_, Event::StatusRequested) => {
                effects.push(SideEffect::ReplyStatus(from));
            }

            (_, Event::PauseRequested(duration)) => {
                self.close_path(&mut effects);
                let deadline = duration.or(self.default_hibernate).map(|d| now + d);
                effects.push(SideEffect::ArmHibernateTimer(deadline));
                self.hibernate_deadline = deadline;
                self.state = PlayerState::Hybernate;
            }

            (PlayerState::Idle, Event::AudioDetected) => {
                if self.capture_open {
                    effects.push(SideEffect::OpenPlayback);
                    effects.push(SideEffect::StartRouting);
                    self.playback_open = true;
                    self.routing = true;
                    self.capture_backoff.reset();
                    self.state = PlayerState::Play;
                } else {
                    debug!("audio detected while capture is closed, ignoring");
                }
            }

            (PlayerState::Play, Event::AudioLost) | (PlayerState::Play, Event::PathFailed) => {
                self.close_path(&mut effects);
                self.state = PlayerState::Idle;
            }

            (PlayerState::Hybernate, Event::ResumeRequested) => {
                effects.push(SideEffect::DisarmHibernateTimer);
                self.hibernate_deadline = None;
                self.state = PlayerState::Idle;
            }

            (PlayerState::Hybernate, Event::Tick) => {
                if self.hibernate_deadline.is_some_and(|deadline| now >= deadline) {
                    effects.push(SideEffect::DisarmHibernateTimer);
                    self.hibernate_deadline = None;
                    self.state = PlayerState::Idle;
                }
            }

            (PlayerState::Idle, Event::Tick) => {
                let due = self.capture_retry_at.map_or(true, |at| now >= at);
                if !self.capture_open && due {
                    effects.push(SideEffect::OpenCapture);
                    self.capture_open = true;
                    self.capture_retry_at = None;
                }
            }

            (_, Event::CaptureFailed) => {
                if self.capture_open {
                    self.close_path(&mut effects);
                    effects.push(SideEffect::CloseCapture);
                    self.capture_open = false;
                    self.capture_retry_at = Some(now + self.capture_backoff.record_failure());
                    if from == PlayerState::Play {
                        self.state = PlayerState::Idle;
                    }
                }
            }

            _ => {}
        }

        self.enforce_invariants(&mut effects);

        Transition {
            from,
            to: self.state,
            effects,
        }
    }

    /// Stop routing and close playback, whichever is active
    fn close_path(&mut self, effects: &mut Vec<SideEffect>) {
        if self.routing {
            effects.push(SideEffect::StopRouting);
            self.routing = false;
        }
        if self.playback_open {
            effects.push(SideEffect::ClosePlayback);
            self.playback_open = false;
        }
    }

    /// The playback path is open if and only if the state is `Play`
    fn enforce_invariants(&mut self, effects: &mut Vec<SideEffect>) {
        let consistent = match self.state {
            PlayerState::Play => self.playback_open && self.routing,
            PlayerState::Killed => !self.path_open() && !self.capture_open,
            _ => !self.path_open(),
        };

        if !consistent {
            error!(
                state = %self.state,
                playback_open = self.playback_open,
                routing = self.routing,
                "device path out of sync with player state, resetting"
            );
            self.close_path(effects);
            if self.state != PlayerState::Killed {
                self.state = PlayerState::Unknown;
            }
        }
    }
}
