//! Device gateway: the only way the daemon touches audio hardware
//!
//! Handles are plain ids. The gateway keeps the real devices and
//! releases them on `close` (idempotent) or when it is dropped.

#[cfg(feature = "cpal")]
mod cpal_backend;
#[cfg(test)]
pub mod mock;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

#[cfg(feature = "cpal")]
pub use cpal_backend::CpalGateway;

/// Which side of the loop a device sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Capture,
    Playback,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Capture => write!(f, "capture"),
            DeviceKind::Playback => write!(f, "playback"),
        }
    }
}

/// Opaque reference to an open device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub kind: DeviceKind,
    pub id: u64,
}

/// Successful outcome of a non-blocking read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Interleaved i16 samples, whole frames only
    Data(Vec<i16>),
    /// The device is healthy but had nothing to deliver
    Silence,
}

/// Non-blocking access to capture and playback devices.
///
/// `try_read` and `write` must never block; a read with nothing ready
/// returns [`DeviceError::WouldBlock`].
pub trait DeviceGateway: Send + Sync {
    fn open_capture(&self) -> Result<DeviceHandle, DeviceError>;

    fn open_playback(&self) -> Result<DeviceHandle, DeviceError>;

    /// Release a device. Closing an unknown or already closed handle is a no-op.
    fn close(&self, handle: DeviceHandle) -> Result<(), DeviceError>;

    fn try_read(&self, handle: DeviceHandle) -> Result<ReadOutcome, DeviceError>;

    /// Queue samples for playback, returning how many were accepted
    fn write(&self, handle: DeviceHandle, samples: &[i16]) -> Result<usize, DeviceError>;
}

/// Stream parameters shared by both devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub period_frames: u32,
}

impl StreamFormat {
    /// Samples in one second of audio, used to size device buffers
    pub fn samples_per_second(&self) -> usize {
        self.sample_rate as usize * usize::from(self.channels)
    }
}
