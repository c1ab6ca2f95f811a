//! Control adapter: transport commands in, typed commands out
//!
//! Each call maps 1:1 onto a command on the unified queue. Input that
//! cannot become a valid event is rejected here.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::ControlError;
use crate::state::{Command, Event, PlayerState};

/// How long `status` waits for the dispatcher by default
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ControlAdapter {
    commands: mpsc::Sender<Command>,
    status_timeout: Duration,
}

impl ControlAdapter {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self {
            commands,
            status_timeout: STATUS_TIMEOUT,
        }
    }

    /// Resume from hibernation
    pub async fn play(&self) -> Result<(), ControlError> {
        self.post(Event::ResumeRequested).await
    }

    /// Hibernate for `seconds`, or the configured default when omitted
    pub async fn pause(&self, seconds: Option<f64>) -> Result<(), ControlError> {
        let duration = seconds.map(parse_duration).transpose()?;
        self.post(Event::PauseRequested(duration)).await
    }

    /// Hibernate until resumed or the default duration passes
    pub async fn stop(&self) -> Result<(), ControlError> {
        self.post(Event::PauseRequested(None)).await
    }

    /// Pause or resume, whichever fits the state the dispatcher is in
    pub async fn toggle(&self) -> Result<(), ControlError> {
        self.post(Event::TogglePause).await
    }

    /// Current player state, as seen by the dispatcher
    pub async fn status(&self) -> Result<PlayerState, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::status(tx))
            .await
            .map_err(|_| ControlError::DispatcherGone)?;

        match tokio::time::timeout(self.status_timeout, rx).await {
            Ok(Ok(state)) => Ok(state),
            // Reply dropped: the dispatcher stopped before answering
            Ok(Err(_)) => Err(ControlError::DispatcherGone),
            Err(_) => Err(ControlError::StatusTimeout),
        }
    }

    async fn post(&self, event: Event) -> Result<(), ControlError> {
        debug!(?event, "control command");
        self.commands
            .send(Command::event(event))
            .await
            .map_err(|_| ControlError::DispatcherGone)
    }
}

fn parse_duration(seconds: f64) -> Result<Duration, ControlError> {
    Duration::try_from_secs_f64(seconds).map_err(|_| ControlError::InvalidDuration(seconds))
}
