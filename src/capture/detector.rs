//! Debounced audio presence detection

use super::level::Thresholds;
use crate::state::Event;

/// What one poll saw
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Median level of the newest samples
    Level(f32),
    /// The device delivered nothing
    Silence,
}

/// Turns poll observations into `AudioDetected` / `AudioLost`.
///
/// Presence is signalled after `detect_count` consecutive polls above the
/// detect threshold and withdrawn after `release_count` consecutive polls
/// below the (lower) release threshold.
#[derive(Debug, Clone)]
pub struct PresenceDetector {
    thresholds: Thresholds,
    detect_count: u32,
    release_count: u32,
    signalled: bool,
    loud: u32,
    quiet: u32,
}

impl PresenceDetector {
    pub fn new(thresholds: Thresholds, detect_count: u32, release_count: u32) -> Self {
        Self {
            thresholds,
            detect_count: detect_count.max(1),
            release_count: release_count.max(1),
            signalled: false,
            loud: 0,
            quiet: 0,
        }
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled
    }

    /// A detect or release count is partway up
    pub fn is_following(&self) -> bool {
        self.loud > 0 || self.quiet > 0
    }

    /// Align with the player state published by the dispatcher
    pub fn sync(&mut self, playing: bool) {
        self.signalled = playing;
        self.loud = 0;
        self.quiet = 0;
    }

    pub fn observe(&mut self, observation: Observation) -> Option<Event> {
        if self.signalled {
            let quiet = match observation {
                Observation::Level(level) => level < self.thresholds.release,
                Observation::Silence => true,
            };
            self.quiet = if quiet { self.quiet + 1 } else { 0 };

            if self.quiet >= self.release_count {
                self.signalled = false;
                self.quiet = 0;
                return Some(Event::AudioLost);
            }
        } else {
            let loud = matches!(observation, Observation::Level(level) if level > self.thresholds.detect);
            self.loud = if loud { self.loud + 1 } else { 0 };

            if self.loud >= self.detect_count {
                self.signalled = true;
                self.loud = 0;
                return Some(Event::AudioDetected);
            }
        }

        None
    }
}
