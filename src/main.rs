//! usbloop: routes a flaky USB capture device to playback while audio is present
//!
//! The daemon runs one dispatcher loop that owns the player state:
//! - Capture poller posts presence events
//! - Control bus (Unix socket) posts play / pause / stop / status
//! - Termination signals post a kill request, SIGHUP reloads the config
//!
//! `usbloop ctl ...` is a small client for the control bus.

mod capture;
mod config;
mod control;
mod device;
mod dispatcher;
mod error;
mod events;
mod ipc;
mod lifecycle;
mod routing;
mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::capture::{CapturePoller, PollerView};
use crate::config::Config;
use crate::control::ControlAdapter;
use crate::device::DeviceGateway;
use crate::dispatcher::Dispatcher;
use crate::events::StateEvent;
use crate::ipc::{Client, Request, Response, Server};
use crate::lifecycle::{spawn_signal_adapter, ConfigReloader, ShutdownSignal};
use crate::routing::LevelMeter;

/// Pending commands before producers wait
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// How long the poller gets to notice shutdown
const POLLER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "usbloop", version, about)]
struct Cli {
    /// Config file (default: $USBLOOP_CONFIG or /etc/usbloop.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Capture device name, overrides the config file
    #[arg(short = 'c', long)]
    capture: Option<String>,

    /// Playback device name, overrides the config file
    #[arg(short = 'p', long)]
    playback: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the daemon (default)
    Run,
    /// Talk to a running daemon
    Ctl {
        #[command(subcommand)]
        action: CtlAction,
    },
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum CtlAction {
    /// Leave hibernation
    Play,
    /// Hibernate, optionally for a number of seconds
    Pause { seconds: Option<f64> },
    /// Hibernate until resumed
    Stop,
    /// Pause when playing or idle, resume when hibernating
    Toggle,
    /// Print the player state
    Status,
    /// Print state changes as they happen
    Watch,
    /// Check that the daemon answers
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = config::resolve_path(cli.config.as_deref());
    let mut config = Config::load(&config_path)?;
    if let Some(capture) = cli.capture {
        config.capture_device_id = Some(capture);
    }
    if let Some(playback) = cli.playback {
        config.playback_device_id = Some(playback);
    }
    config.validate()?;

    match cli.command {
        None | Some(CliCommand::Run) => run_daemon(config, &config_path).await,
        Some(CliCommand::Ctl { action }) => run_ctl(&config.socket_path, action).await,
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

async fn run_daemon(config: Config, config_path: &Path) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "usbloop starting"
    );

    let gateway = open_gateway(&config)?;
    let meter = Arc::new(LevelMeter::new());

    // Every producer -> dispatcher
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    // Dispatcher -> control bus subscribers
    let (event_tx, _) = broadcast::channel::<StateEvent>(64);
    // Dispatcher -> capture poller
    let (view_tx, view_rx) = watch::channel(PollerView::default());
    // SIGHUP reloads -> dispatcher and capture poller
    let (config_tx, config_rx) = watch::channel(config.clone());

    let dispatcher = Dispatcher::new(
        config_rx.clone(),
        Arc::clone(&gateway),
        Arc::clone(&meter),
        &command_tx,
        view_tx,
        event_tx.clone(),
    );

    let poller = CapturePoller::new(config_rx, gateway, meter, command_tx.clone(), view_rx);
    let poller_task = tokio::spawn(poller.run());

    let signal_task = spawn_signal_adapter(
        ShutdownSignal::new()?,
        command_tx.clone(),
        ConfigReloader::new(config_path.to_path_buf(), config_tx),
    );
    let server = Server::bind(&config.socket_path, ControlAdapter::new(command_tx), event_tx)?;

    info!("daemon initialized, entering main loop");

    let dispatcher_run = dispatcher.run(command_rx);
    tokio::pin!(dispatcher_run);

    let outcome = tokio::select! {
        outcome = &mut dispatcher_run => outcome,
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "control bus failed, continuing without it");
            }
            dispatcher_run.await
        }
    };

    // Cleanup
    info!("shutting down...");
    server.shutdown().await;
    signal_task.abort();
    match tokio::time::timeout(POLLER_JOIN_TIMEOUT, poller_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(?e, "capture poller failed"),
        Err(_) => warn!("capture poller did not stop in time"),
    }

    if let Err(e) = outcome {
        error!(%e, "shutdown did not complete cleanly");
        return Err(e.into());
    }

    info!("usbloop stopped");
    Ok(())
}

#[cfg(feature = "cpal")]
fn open_gateway(config: &Config) -> Result<Arc<dyn DeviceGateway>> {
    Ok(Arc::new(device::CpalGateway::spawn(config)?))
}

#[cfg(not(feature = "cpal"))]
fn open_gateway(_config: &Config) -> Result<Arc<dyn DeviceGateway>> {
    bail!("built without an audio backend, rebuild with `--features cpal`")
}

async fn run_ctl(socket_path: &Path, action: CtlAction) -> Result<()> {
    let mut client = Client::connect(socket_path).await?;

    let request = match action {
        CtlAction::Play => Request::Play,
        CtlAction::Pause { seconds } => Request::Pause { duration_s: seconds },
        CtlAction::Stop => Request::Stop,
        CtlAction::Toggle => Request::PlayPause,
        CtlAction::Status => Request::GetStatus,
        CtlAction::Watch => Request::Subscribe,
        CtlAction::Ping => Request::Ping,
    };

    match client.request(&request).await? {
        Response::Error { code, message } => bail!("{code}: {message}"),
        Response::Status(report) => println!("{}", report.state),
        Response::Pong => println!("pong"),
        _ => {}
    }

    if matches!(action, CtlAction::Watch) {
        while let Some(message) = client.next_message().await? {
            if let Response::Notification { event } = message {
                println!("{event}");
            }
        }
    }

    Ok(())
}
