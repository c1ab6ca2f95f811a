//! Events module for player notifications
//!
//! The dispatcher broadcasts these to control bus subscribers.

use serde::{Deserialize, Serialize};

use crate::device::DeviceKind;
use crate::state::PlayerState;

/// Events emitted by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// The player moved to a new state
    StateChanged { from: PlayerState, to: PlayerState },

    /// A device operation failed and the player recovered
    DeviceFault {
        /// Which device failed
        device: DeviceKind,
        message: String,
    },
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::StateChanged { from, to } => write!(f, "{} -> {}", from, to),
            StateEvent::DeviceFault { device, message } => {
                write!(f, "{} fault: {}", device, message)
            }
        }
    }
}
