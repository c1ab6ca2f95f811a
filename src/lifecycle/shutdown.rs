//! Signal handling for graceful shutdown and configuration reloads
//!
//! A termination signal becomes exactly one `KillRequested` on the
//! command queue. SIGHUP re-reads the configuration and restarts the
//! player. The dispatcher does the rest.

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::reload::ConfigReloader;
use crate::state::{Command, Event};

/// What a received signal asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// SIGTERM, SIGINT or SIGUSR1
    Shutdown(&'static str),
    /// SIGHUP
    Reload,
}

/// Handles shutdown signals (SIGTERM, SIGINT, SIGUSR1) and SIGHUP
pub struct ShutdownSignal {
    sigterm: Signal,
    sigint: Signal,
    sigusr1: Signal,
    sighup: Signal,
}

impl ShutdownSignal {
    /// Register the signal handlers
    pub fn new() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?,
            sigusr1: signal(SignalKind::user_defined1())
                .context("failed to register SIGUSR1 handler")?,
            sighup: signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> SignalAction {
        tokio::select! {
            _ = self.sigterm.recv() => SignalAction::Shutdown("SIGTERM"),
            _ = self.sigint.recv() => SignalAction::Shutdown("SIGINT"),
            _ = self.sigusr1.recv() => SignalAction::Shutdown("SIGUSR1"),
            _ = self.sighup.recv() => SignalAction::Reload,
        }
    }
}

/// Post `RestartRequested` after every successful reload and a single
/// `KillRequested` on the first termination signal
pub fn spawn_signal_adapter(
    mut signals: ShutdownSignal,
    commands: mpsc::Sender<Command>,
    reloader: ConfigReloader,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match signals.wait().await {
                SignalAction::Reload => {
                    info!(signal = "SIGHUP", "reload signal received");
                    if !reloader.reload() {
                        continue;
                    }
                    Event::RestartRequested
                }
                SignalAction::Shutdown(name) => {
                    info!(signal = name, "termination signal received");
                    Event::KillRequested
                }
            };

            if commands.send(Command::event(event)).await.is_err() {
                warn!("dispatcher already stopped");
                break;
            }
            if event == Event::KillRequested {
                break;
            }
        }
        debug!("signal adapter done");
    })
}
