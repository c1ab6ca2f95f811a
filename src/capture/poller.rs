//! Capture poller task

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::level::median_level;
use super::{Backoff, Observation, PresenceDetector};
use crate::config::Config;
use crate::device::{DeviceGateway, DeviceHandle, ReadOutcome};
use crate::routing::LevelMeter;
use crate::state::{Command, Event, PlayerState};

/// What the dispatcher publishes to the poller after every event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerView {
    pub state: PlayerState,
    /// Open capture handle, if any
    pub capture: Option<DeviceHandle>,
    /// Bumped on every state change, including ones undone within the
    /// same dispatch (a playback open that failed right after
    /// `AudioDetected`)
    pub epoch: u64,
}

/// Watches the capture device and posts presence events.
///
/// In `IDLE` it reads the device itself. In `PLAY` the router owns the
/// reads, so the poller watches the shared level meter instead. It is
/// suspended in `HYBERNATE` and `UNKNOWN` and exits on `KILLED`.
pub struct CapturePoller {
    gateway: Arc<dyn DeviceGateway>,
    meter: Arc<LevelMeter>,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<PollerView>,
    config: watch::Receiver<Config>,
    detector: PresenceDetector,
    backoff: Backoff,
    follow_interval: Duration,
    reopen_after: u32,
    channels: u16,
    sample_frames: usize,
    last_view: PollerView,
    last_chunks: u64,
}

impl CapturePoller {
    pub fn new(
        mut config: watch::Receiver<Config>,
        gateway: Arc<dyn DeviceGateway>,
        meter: Arc<LevelMeter>,
        commands: mpsc::Sender<Command>,
        view: watch::Receiver<PollerView>,
    ) -> Self {
        let current = config.borrow_and_update().clone();
        Self {
            gateway,
            meter,
            commands,
            view,
            config,
            detector: detector_for(&current),
            backoff: current.read_backoff(),
            follow_interval: current.follow_interval(),
            reopen_after: current.capture_reopen_failures,
            channels: current.channels,
            sample_frames: current.sample_frames,
            last_view: PollerView::default(),
            last_chunks: 0,
        }
    }

    pub async fn run(mut self) {
        info!("capture poller started");

        loop {
            // A dropped config sender just means no more reloads
            if self.config.has_changed().unwrap_or(false) {
                let config = self.config.borrow_and_update().clone();
                self.reconfigure(&config);
            }

            let view = *self.view.borrow_and_update();
            self.apply_view(view);

            let delay = match (view.state, view.capture) {
                (PlayerState::Killed, _) => break,
                (PlayerState::Idle, Some(handle)) => self.poll_device(handle).await,
                (PlayerState::Play, _) => {
                    let observation = self.poll_meter();
                    self.observe(observation).await.map(|()| self.next_delay())
                }
                _ => {
                    // Suspended until the dispatcher publishes something new
                    if self.view.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let Some(delay) = delay else {
                debug!("command queue closed");
                break;
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.view.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("capture poller stopped");
    }

    fn reconfigure(&mut self, config: &Config) {
        info!(
            sensitivity_db = config.sensitivity_db,
            poll_interval_ms = config.poll_interval_ms,
            "capture poller reconfigured"
        );
        self.detector = detector_for(config);
        self.detector.sync(self.last_view.state == PlayerState::Play);
        self.backoff = config.read_backoff();
        self.follow_interval = config.follow_interval();
        self.reopen_after = config.capture_reopen_failures;
        self.channels = config.channels;
        self.sample_frames = config.sample_frames;
    }

    fn apply_view(&mut self, view: PollerView) {
        if view.epoch != self.last_view.epoch
            || view.state != self.last_view.state
            || view.capture != self.last_view.capture
        {
            self.detector.sync(view.state == PlayerState::Play);
            debug!(
                state = %view.state,
                epoch = view.epoch,
                signalled = self.detector.is_signalled(),
                "poller resynced"
            );
            self.last_chunks = self.meter.snapshot().0;
        }
        if view.capture != self.last_view.capture {
            self.backoff.reset();
        }
        self.last_view = view;
    }

    /// Follow interval while a count is partway up, otherwise the backoff delay
    fn next_delay(&self) -> Duration {
        if self.backoff.failures() == 0 && self.detector.is_following() {
            self.follow_interval
        } else {
            self.backoff.delay()
        }
    }

    /// One non-blocking read. Returns the delay before the next poll,
    /// `None` once the command queue is gone.
    async fn poll_device(&mut self, handle: DeviceHandle) -> Option<Duration> {
        match self.gateway.try_read(handle) {
            Ok(outcome) => {
                self.backoff.reset();
                let observation = match outcome {
                    ReadOutcome::Data(samples) => median_level(&samples, self.channels, self.sample_frames)
                        .map_or(Observation::Silence, Observation::Level),
                    ReadOutcome::Silence => Observation::Silence,
                };
                self.observe(observation).await?;
                Some(self.next_delay())
            }
            Err(e) => {
                let delay = self.backoff.record_failure();
                let failures = self.backoff.failures();
                if e.is_transient() {
                    debug!(%e, failures, ?delay, "capture read failed");
                } else {
                    warn!(%e, failures, ?delay, "capture read failed");
                }

                if self.reopen_after > 0 && failures == self.reopen_after {
                    warn!(failures, "capture device keeps failing, requesting reopen");
                    self.send(Event::CaptureFailed).await?;
                }
                Some(delay)
            }
        }
    }

    /// A poll with no newly routed chunk counts as silence
    fn poll_meter(&mut self) -> Observation {
        let (chunks, level) = self.meter.snapshot();
        if chunks == self.last_chunks {
            Observation::Silence
        } else {
            self.last_chunks = chunks;
            Observation::Level(level)
        }
    }

    async fn observe(&mut self, observation: Observation) -> Option<()> {
        match self.detector.observe(observation) {
            Some(event) => {
                info!(?event, "presence changed");
                self.send(event).await
            }
            None => Some(()),
        }
    }

    async fn send(&self, event: Event) -> Option<()> {
        self.commands.send(Command::event(event)).await.ok()
    }
}

fn detector_for(config: &Config) -> PresenceDetector {
    PresenceDetector::new(
        config.thresholds(),
        config.detect_count,
        config.silence_debounce_count,
    )
}
