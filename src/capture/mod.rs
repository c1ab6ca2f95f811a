//! Capture poller and the policies it applies
//!
//! The poller reads the capture device without blocking, turns the
//! outcome into presence events through a debouncing detector, and
//! backs off while the device keeps failing.

mod backoff;
mod detector;
pub mod level;
mod poller;

pub use backoff::Backoff;
pub use detector::{Observation, PresenceDetector};
pub use poller::{CapturePoller, PollerView};
