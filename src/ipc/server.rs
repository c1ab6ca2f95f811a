//! Unix domain socket server for the control bus
//!
//! Provides request-response communication and push notifications for
//! state change events to subscribed clients. Requests are handed to the
//! [`ControlAdapter`]; malformed frames are answered here and never reach
//! the dispatcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::control::ControlAdapter;
use crate::error::ControlError;
use crate::events::StateEvent;

use super::protocol::{read_frame, write_message, Request, Response, StatusReport};

/// Error code for frames that are not a valid request
const UNKNOWN_COMMAND: &str = "unknown_command";

/// Control bus server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    context: Arc<ClientContext>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Shared by every client handler
struct ClientContext {
    control: ControlAdapter,
    events: broadcast::Sender<StateEvent>,
    start_time: Instant,
}

/// What woke a client handler
enum Step {
    Frame(Vec<u8>),
    Disconnected,
    Event(Result<StateEvent, broadcast::error::RecvError>),
}

impl Server {
    /// Bind the socket, replacing a stale one
    pub fn bind(
        socket_path: &Path,
        control: ControlAdapter,
        events: broadcast::Sender<StateEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "control bus listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            context: Arc::new(ClientContext {
                control,
                events,
                start_time: Instant::now(),
            }),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let context = Arc::clone(&self.context);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_client(stream, context) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Disconnect clients and remove the socket file
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("control bus shutdown complete");
    }
}

/// Handle a single client connection
async fn handle_client(stream: UnixStream, context: Arc<ClientContext>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::channel(8);
    let reader_task = tokio::spawn(read_frames(reader, frame_tx));
    let mut notifications: Option<broadcast::Receiver<StateEvent>> = None;

    let result: Result<()> = async {
        loop {
            let step = tokio::select! {
                frame = frame_rx.recv() => match frame {
                    Some(frame) => Step::Frame(frame),
                    None => Step::Disconnected,
                },
                event = next_event(&mut notifications) => Step::Event(event),
            };

            match step {
                Step::Frame(frame) => {
                    let response = match serde_json::from_slice::<Request>(&frame) {
                        Ok(request) => {
                            debug!(?request, "received request");
                            if request == Request::Subscribe && notifications.is_none() {
                                debug!("client subscribed to notifications");
                                notifications = Some(context.events.subscribe());
                            }
                            process_request(request, &context).await
                        }
                        Err(e) => {
                            debug!(%e, "rejecting malformed request");
                            Response::error(UNKNOWN_COMMAND, format!("malformed request: {e}"))
                        }
                    };
                    write_message(&mut writer, &response).await?;
                }
                Step::Event(Ok(event)) => {
                    write_message(&mut writer, &Response::Notification { event }).await?;
                }
                Step::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "subscriber lagged, notifications dropped");
                }
                Step::Event(Err(broadcast::error::RecvError::Closed)) => {
                    notifications = None;
                }
                Step::Disconnected => {
                    debug!("client disconnected");
                    return Ok(());
                }
            }
        }
    }
    .await;

    reader_task.abort();
    result
}

/// Forward frames until the client disconnects or sends garbage framing
async fn read_frames(mut reader: OwnedReadHalf, frames: mpsc::Sender<Vec<u8>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if frames.send(frame).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(?e, "unreadable frame, disconnecting");
                return;
            }
        }
    }
}

/// Next notification for a subscribed client; pends forever otherwise
async fn next_event(
    notifications: &mut Option<broadcast::Receiver<StateEvent>>,
) -> Result<StateEvent, broadcast::error::RecvError> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Process a request and return a response
async fn process_request(request: Request, context: &ClientContext) -> Response {
    let result = match request {
        Request::Ping => return Response::Pong,
        Request::Subscribe => return Response::Subscribed,
        Request::Play => context.control.play().await.map(|()| Response::Ok),
        Request::Pause { duration_s } => context.control.pause(duration_s).await.map(|()| Response::Ok),
        Request::Stop => context.control.stop().await.map(|()| Response::Ok),
        Request::PlayPause => context.control.toggle().await.map(|()| Response::Ok),
        Request::GetStatus => context.control.status().await.map(|state| {
            Response::Status(StatusReport::new(state, context.start_time.elapsed().as_secs()))
        }),
    };

    result.unwrap_or_else(|e: ControlError| {
        info!(%e, "control request rejected");
        Response::error(e.code(), e.to_string())
    })
}
