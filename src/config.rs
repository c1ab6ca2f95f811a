//! Configuration loading and management
//!
//! The config file is JSON. Absent keys take their defaults; a missing
//! file is created with the defaults so it can be edited in place.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::level::Thresholds;
use crate::capture::Backoff;
use crate::device::StreamFormat;

/// Default location of the config file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/usbloop.json";

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "USBLOOP_CONFIG";

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture device name, `None` for the system default input
    pub capture_device_id: Option<String>,

    /// Playback device name, `None` for the system default output
    pub playback_device_id: Option<String>,

    /// Capture poll interval and dispatcher tick
    pub poll_interval_ms: u64,

    /// Poll interval while a detect or release count is partway up,
    /// `None` = same as `poll_interval_ms`
    pub follow_interval_ms: Option<u64>,

    /// Consecutive quiet polls before audio counts as lost
    pub silence_debounce_count: u32,

    /// Consecutive loud polls before audio counts as present
    pub detect_count: u32,

    pub read_failure_backoff_base_ms: u64,
    pub read_failure_backoff_max_ms: u64,

    /// Consecutive read failures before the capture device is reopened (0 = never)
    pub capture_reopen_failures: u32,

    /// Hibernate duration for a pause without one, `None` = until resumed
    pub default_hibernate_duration_s: Option<f64>,

    /// Detection threshold in dBFS
    pub sensitivity_db: f32,

    /// Frames examined per poll
    pub sample_frames: usize,

    pub channels: u16,
    pub sample_rate: u32,
    pub period_frames: u32,

    /// Path to the Unix domain socket for the control bus
    pub socket_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_device_id: None,
            playback_device_id: None,
            poll_interval_ms: 500,
            follow_interval_ms: None,
            silence_debounce_count: 10,
            detect_count: 1,
            read_failure_backoff_base_ms: 10,
            read_failure_backoff_max_ms: 1000,
            capture_reopen_failures: 50,
            default_hibernate_duration_s: None,
            sensitivity_db: -60.0,
            sample_frames: 20,
            channels: 2,
            sample_rate: 48_000,
            period_frames: 1024,
            socket_path: default_socket_path(),
        }
    }
}

/// `$XDG_RUNTIME_DIR/usbloop.sock`, falling back to `/tmp`
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("usbloop.sock")
}

/// Config file location: explicit path, then `USBLOOP_CONFIG`, then the default
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl Config {
    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults (written back best-effort);
    /// invalid JSON yields the defaults with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                match config.save(path) {
                    Ok(()) => info!(?path, "wrote default configuration"),
                    Err(e) => debug!(?path, %e, "could not write default configuration"),
                }
                return Ok(config);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config {}", path.display()))
            }
        };

        match serde_json::from_str(&text) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(?path, %e, "invalid configuration, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Reject values the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 || self.follow_interval_ms == Some(0) {
            bail!("poll_interval_ms and follow_interval_ms must be greater than zero");
        }
        if self.silence_debounce_count == 0 || self.detect_count == 0 {
            bail!("silence_debounce_count and detect_count must be at least 1");
        }
        if self.read_failure_backoff_base_ms == 0 {
            bail!("read_failure_backoff_base_ms must be greater than zero");
        }
        if self.read_failure_backoff_max_ms < self.read_failure_backoff_base_ms {
            bail!(
                "read_failure_backoff_max_ms ({}) is below read_failure_backoff_base_ms ({})",
                self.read_failure_backoff_max_ms,
                self.read_failure_backoff_base_ms
            );
        }
        if self.channels == 0 || self.sample_rate == 0 || self.sample_frames == 0 {
            bail!("channels, sample_rate and sample_frames must be greater than zero");
        }
        if !self.sensitivity_db.is_finite() {
            bail!("sensitivity_db must be a finite number");
        }
        if let Some(secs) = self.default_hibernate_duration_s {
            if Duration::try_from_secs_f64(secs).is_err() {
                bail!("default_hibernate_duration_s must be a non-negative number of seconds");
            }
        }
        Ok(())
    }

    /// `fresh`, except for the devices, stream format and socket, which
    /// stay as they were opened at startup
    pub fn reloaded(&self, fresh: Config) -> Config {
        let next = Config {
            capture_device_id: self.capture_device_id.clone(),
            playback_device_id: self.playback_device_id.clone(),
            channels: self.channels,
            sample_rate: self.sample_rate,
            period_frames: self.period_frames,
            socket_path: self.socket_path.clone(),
            ..fresh.clone()
        };
        if next != fresh {
            info!("device, stream format and socket changes apply after a restart");
        }
        next
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn follow_interval(&self) -> Duration {
        self.follow_interval_ms
            .map_or_else(|| self.poll_interval(), Duration::from_millis)
    }

    /// `None` also when the configured value is unusable (rejected by `validate`)
    pub fn default_hibernate(&self) -> Option<Duration> {
        self.default_hibernate_duration_s
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Read-failure backoff: starts at the poll interval and grows by the
    /// configured step with every consecutive failure
    pub fn read_backoff(&self) -> Backoff {
        Backoff::new(
            self.poll_interval(),
            Duration::from_millis(self.read_failure_backoff_base_ms),
            Duration::from_millis(self.read_failure_backoff_max_ms),
        )
    }

    /// Pacing for reopening a failed capture device
    pub fn reopen_backoff(&self) -> Backoff {
        let max = Duration::from_millis(self.read_failure_backoff_max_ms);
        Backoff::new(self.poll_interval(), self.poll_interval().min(max), max)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::from_sensitivity(self.sensitivity_db)
    }

    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            channels: self.channels,
            sample_rate: self.sample_rate,
            period_frames: self.period_frames,
        }
    }
}
