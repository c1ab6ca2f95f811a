//! Capture→playback routing while the player is in `PLAY`
//!
//! The router drains the capture device, forwards every chunk to the
//! playback device and records the chunk level in a [`LevelMeter`] so
//! the capture poller can keep watching for silence without touching
//! the device itself.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::level::median_level;
use crate::device::{DeviceGateway, DeviceHandle, ReadOutcome};
use crate::error::DeviceError;
use crate::state::{Command, Event};

/// Pause after forwarding a chunk
const ACTIVE_PAUSE: Duration = Duration::from_millis(1);
/// Pause when the capture device had nothing ready
const IDLE_PAUSE: Duration = Duration::from_millis(2);
/// Consecutive transient capture errors tolerated before reporting a fault
const MAX_CAPTURE_ERRORS: u32 = 250;

/// Level of the most recently routed chunk plus a running chunk count
#[derive(Debug, Default)]
pub struct LevelMeter {
    level: AtomicU32,
    chunks: AtomicU64,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, level: f32) {
        self.level.store(level.to_bits(), Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Release);
    }

    /// `(chunks routed so far, level of the latest chunk)`
    pub fn snapshot(&self) -> (u64, f32) {
        let chunks = self.chunks.load(Ordering::Acquire);
        let level = f32::from_bits(self.level.load(Ordering::Relaxed));
        (chunks, level)
    }
}

/// Sample layout the router needs to meter chunks
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub channels: u16,
    pub sample_frames: usize,
}

/// Handle to a running routing task
pub struct Router {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Router {
    /// Spawn the routing task for an open capture/playback pair.
    ///
    /// Faults are reported as commands on `faults`; the task exits right
    /// after reporting one. A report still waiting for queue space is
    /// dropped once a stop is requested.
    pub fn start(
        gateway: Arc<dyn DeviceGateway>,
        capture: DeviceHandle,
        playback: DeviceHandle,
        meter: Arc<LevelMeter>,
        faults: mpsc::Sender<Command>,
        settings: RouterSettings,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            debug!(capture = capture.id, playback = playback.id, "routing started");
            if let Some(event) = route(gateway, capture, playback, meter, settings, &mut stop_rx).await {
                tokio::select! {
                    sent = faults.send(Command::event(event)) => {
                        if sent.is_err() {
                            warn!(?event, "could not report routing fault, dispatcher gone");
                        }
                    }
                    _ = &mut stop_rx => debug!(?event, "routing stopped before the fault was reported"),
                }
            }
            debug!("routing stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Stop the task and wait for it to finish
    pub async fn stop(mut self) -> Result<(), DeviceError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // The task may already have exited after a fault
            let _ = stop_tx.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| DeviceError::Backend(format!("routing task failed: {e}")))
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Routing loop. Returns the fault event to report, if any.
async fn route(
    gateway: Arc<dyn DeviceGateway>,
    capture: DeviceHandle,
    playback: DeviceHandle,
    meter: Arc<LevelMeter>,
    settings: RouterSettings,
    stop_rx: &mut oneshot::Receiver<()>,
) -> Option<Event> {
    let mut capture_errors = 0u32;

    loop {
        let pause = match gateway.try_read(capture) {
            Ok(ReadOutcome::Data(samples)) => {
                capture_errors = 0;
                if let Some(level) = median_level(&samples, settings.channels, settings.sample_frames) {
                    meter.record(level);
                }
                if let Err(e) = gateway.write(playback, &samples) {
                    warn!(%e, "playback write failed");
                    return Some(Event::PathFailed);
                }
                ACTIVE_PAUSE
            }
            Ok(ReadOutcome::Silence) | Err(DeviceError::WouldBlock) => IDLE_PAUSE,
            Err(e) if e.is_transient() => {
                capture_errors += 1;
                if capture_errors >= MAX_CAPTURE_ERRORS {
                    warn!(%e, errors = capture_errors, "capture keeps failing while routing");
                    return Some(Event::CaptureFailed);
                }
                IDLE_PAUSE
            }
            Err(e) => {
                warn!(%e, "capture read failed while routing");
                return Some(Event::CaptureFailed);
            }
        };

        tokio::select! {
            _ = &mut *stop_rx => {
                info!("routing stop requested");
                return None;
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::ScriptedGateway;
    use crate::device::DeviceKind;

    const SETTINGS: RouterSettings = RouterSettings {
        channels: 2,
        sample_frames: 20,
    };

    fn start(
        gw: &Arc<ScriptedGateway>,
        meter: &Arc<LevelMeter>,
    ) -> (Router, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(4);
        (start_with(gw, meter, tx), rx)
    }

    fn start_with(
        gw: &Arc<ScriptedGateway>,
        meter: &Arc<LevelMeter>,
        tx: mpsc::Sender<Command>,
    ) -> Router {
        let capture = gw.open_capture().unwrap();
        let playback = gw.open_playback().unwrap();
        Router::start(
            Arc::clone(gw) as Arc<dyn DeviceGateway>,
            capture,
            playback,
            Arc::clone(meter),
            tx,
            SETTINGS,
        )
    }

    #[test]
    fn test_level_meter_snapshot() {
        let meter = LevelMeter::new();
        assert_eq!(meter.snapshot(), (0, 0.0));
        meter.record(0.25);
        meter.record(0.5);
        assert_eq!(meter.snapshot(), (2, 0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_capture_to_playback() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.push_read(Ok(ReadOutcome::Data(vec![1000, -1000, 1000, -1000])));
        gw.push_read(Ok(ReadOutcome::Data(vec![5, 6])));
        let meter = Arc::new(LevelMeter::new());

        let (router, mut rx) = start(&gw, &meter);
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.stop().await.unwrap();

        assert_eq!(gw.written(), vec![1000, -1000, 1000, -1000, 5, 6]);
        let (chunks, _) = meter.snapshot();
        assert_eq!(chunks, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_reports_path_fault() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.push_read(Ok(ReadOutcome::Data(vec![1, 2])));
        gw.fail_writes(true);
        let meter = Arc::new(LevelMeter::new());

        let (router, mut rx) = start(&gw, &meter);
        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.event, Event::PathFailed);
        // stopping an exited router is fine
        router.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_capture_errors_report_capture_fault() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.set_idle_read(Err(DeviceError::unavailable(DeviceKind::Capture, "unplugged")));
        let meter = Arc::new(LevelMeter::new());

        let (router, mut rx) = start(&gw, &meter);
        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.event, Event::CaptureFailed);
        router.stop().await.unwrap();
        assert!(gw.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_would_block_is_not_a_fault() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.set_idle_read(Err(DeviceError::WouldBlock));
        let meter = Arc::new(LevelMeter::new());

        let (router, mut rx) = start(&gw, &meter);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        router.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_waits_for_queue_space() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.push_read(Ok(ReadOutcome::Data(vec![1, 2])));
        gw.fail_writes(true);
        let meter = Arc::new(LevelMeter::new());

        let (tx, mut rx) = mpsc::channel(1);
        tx.send(Command::event(Event::Tick)).await.unwrap();
        let router = start_with(&gw, &meter, tx);

        // the queue is full for a while
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.recv().await.unwrap().event, Event::Tick);

        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.event, Event::PathFailed);
        router.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_wait_for_a_full_queue() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.push_read(Ok(ReadOutcome::Data(vec![1, 2])));
        gw.fail_writes(true);
        let meter = Arc::new(LevelMeter::new());

        let (tx, _rx) = mpsc::channel(1);
        tx.send(Command::event(Event::Tick)).await.unwrap();
        let router = start_with(&gw, &meter, tx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(1), router.stop())
            .await
            .expect("stop should not block on the fault report")
            .unwrap();
    }
}
