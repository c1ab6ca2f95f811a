//! Error types
//!
//! Device errors are recovered where they are observed (poller or
//! dispatcher). Only a failure while shutting down escapes as
//! [`DaemonError::FatalShutdown`].

use crate::device::DeviceKind;

/// Errors reported by a [`DeviceGateway`](crate::device::DeviceGateway)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// No device matches the configured id
    #[error("{kind} device not found: {name}")]
    NotFound { kind: DeviceKind, name: String },

    /// The device exists but cannot be used right now (busy, unplugged, xrun)
    #[error("{kind} device unavailable: {reason}")]
    Unavailable { kind: DeviceKind, reason: String },

    /// A non-blocking read found nothing ready
    #[error("read would block")]
    WouldBlock,

    /// Opening the device failed
    #[error("failed to open {kind} device: {reason}")]
    OpenFailed { kind: DeviceKind, reason: String },

    /// The handle does not refer to an open device
    #[error("{kind} handle {id} is not open")]
    NotOpen { kind: DeviceKind, id: u64 },

    /// Any other error from the audio backend
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    /// Whether the poller should simply back off and retry
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::WouldBlock | DeviceError::Unavailable { .. })
    }

    pub fn unavailable(kind: DeviceKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            kind,
            reason: reason.into(),
        }
    }

    pub fn open_failed(kind: DeviceKind, reason: impl Into<String>) -> Self {
        Self::OpenFailed {
            kind,
            reason: reason.into(),
        }
    }
}

/// Errors returned to control bus callers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    /// Pause duration was negative, NaN or infinite
    #[error("invalid pause duration: {0}")]
    InvalidDuration(f64),

    /// The dispatcher has stopped accepting commands
    #[error("dispatcher is not running")]
    DispatcherGone,

    /// The dispatcher did not answer a status query in time
    #[error("timed out waiting for status")]
    StatusTimeout,
}

impl ControlError {
    /// Stable error code used on the control bus
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::InvalidDuration(_) => "unknown_command",
            ControlError::DispatcherGone => "unavailable",
            ControlError::StatusTimeout => "timeout",
        }
    }
}

/// Errors that end the dispatcher loop
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Cleanup after a kill request did not complete
    #[error("shutdown cleanup failed: {}", failures.join("; "))]
    FatalShutdown { failures: Vec<String> },
}
