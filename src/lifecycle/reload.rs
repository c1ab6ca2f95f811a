//! Configuration reload on SIGHUP

use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;

/// Re-reads the config file and publishes it to the dispatcher and poller
pub struct ConfigReloader {
    path: PathBuf,
    config: watch::Sender<Config>,
}

impl ConfigReloader {
    pub fn new(path: PathBuf, config: watch::Sender<Config>) -> Self {
        Self { path, config }
    }

    /// Returns `false` and keeps the current configuration when the file
    /// cannot be used
    pub fn reload(&self) -> bool {
        let fresh = match self.read() {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %self.path.display(), "{e:#}, keeping current configuration");
                return false;
            }
        };

        let next = self.config.borrow().reloaded(fresh);
        self.config.send_replace(next);
        info!(path = %self.path.display(), "configuration reloaded");
        true
    }

    fn read(&self) -> Result<Config> {
        let config = Config::load(&self.path)?;
        config.validate()?;
        Ok(config)
    }
}
