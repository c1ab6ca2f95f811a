//! Amplitude math for presence detection.
//!
//! Levels are normalised to full scale (`1.0` = `i16` peak). A chunk's
//! level is the median absolute sample over its most recent frames,
//! which ignores isolated clicks that a peak meter would report.

/// Release threshold sits this far below the detect threshold
pub const RELEASE_HYSTERESIS_DB: f32 = 3.0;

const FULL_SCALE: f32 = 32768.0;

/// Convert a dBFS value to a linear amplitude (sign of `db` is ignored)
pub fn db_to_amplitude(db: f32) -> f32 {
    10f32.powf(-db.abs() / 20.0)
}

/// Detect/release thresholds derived from a sensitivity in dBFS
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Level above which audio counts as present
    pub detect: f32,
    /// Level below which audio counts as gone
    pub release: f32,
}

impl Thresholds {
    pub fn from_sensitivity(db: f32) -> Self {
        Self {
            detect: db_to_amplitude(db),
            release: db_to_amplitude(db.abs() + RELEASE_HYSTERESIS_DB),
        }
    }
}

/// Median absolute amplitude over the last `frames` frames of `samples`.
///
/// Returns `None` when there is not a single complete frame.
pub fn median_level(samples: &[i16], channels: u16, frames: usize) -> Option<f32> {
    let channels = usize::from(channels.max(1));
    let complete = samples.len() - samples.len() % channels;
    let take = frames.max(1).saturating_mul(channels).min(complete);
    if take == 0 {
        return None;
    }

    let mut magnitudes: Vec<u16> = samples[complete - take..complete]
        .iter()
        .map(|s| s.unsigned_abs())
        .collect();
    magnitudes.sort_unstable();

    let mid = magnitudes.len() / 2;
    let median = if magnitudes.len() % 2 == 0 {
        (f32::from(magnitudes[mid - 1]) + f32::from(magnitudes[mid])) / 2.0
    } else {
        f32::from(magnitudes[mid])
    };

    Some(median / FULL_SCALE)
}
