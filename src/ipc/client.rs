//! Control bus client used by `usbloop ctl`

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::net::UnixStream;

use super::protocol::{read_message, write_message, Request, Response};

/// One connection to a running daemon
pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {} (is the daemon running?)", socket_path.display()))?;
        Ok(Self { stream })
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.stream, request).await?;
        match self.next_message().await? {
            Some(response) => Ok(response),
            None => bail!("daemon closed the connection"),
        }
    }

    /// Next message pushed by the daemon, `None` once it disconnects
    pub async fn next_message(&mut self) -> Result<Option<Response>> {
        read_message(&mut self.stream).await
    }
}
