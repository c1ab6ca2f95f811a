//! Command dispatcher
//!
//! The single loop that owns the player state and the device path. It
//! pulls one command at a time from the unified queue (or synthesizes a
//! `Tick` when nothing arrives within the poll interval), feeds it to the
//! state machine and executes the returned side effects in order before
//! looking at the next command.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capture::PollerView;
use crate::config::Config;
use crate::device::{DeviceGateway, DeviceHandle, DeviceKind};
use crate::error::{DaemonError, DeviceError};
use crate::events::StateEvent;
use crate::routing::{LevelMeter, Router, RouterSettings};
use crate::state::{Command, Event, LoopStateMachine, PlayerState, SideEffect};

/// Open device handles. Whatever is still open when this is dropped
/// gets closed.
struct DevicePath {
    gateway: Arc<dyn DeviceGateway>,
    capture: Option<DeviceHandle>,
    playback: Option<DeviceHandle>,
}

impl DevicePath {
    fn close(&mut self, kind: DeviceKind) -> Result<(), DeviceError> {
        let slot = match kind {
            DeviceKind::Capture => &mut self.capture,
            DeviceKind::Playback => &mut self.playback,
        };
        match slot.take() {
            Some(handle) => self.gateway.close(handle),
            None => Ok(()),
        }
    }
}

impl Drop for DevicePath {
    fn drop(&mut self) {
        for handle in [self.playback.take(), self.capture.take()].into_iter().flatten() {
            if let Err(e) = self.gateway.close(handle) {
                warn!(kind = %handle.kind, %e, "failed to release device");
            }
        }
    }
}

/// A side effect that did not complete
struct EffectFailure {
    effect: SideEffect,
    error: DeviceError,
    /// Event fed back to the machine, `None` when logging is enough
    recovery: Option<Event>,
}

impl EffectFailure {
    fn device(&self) -> DeviceKind {
        match self.effect {
            SideEffect::OpenCapture | SideEffect::CloseCapture => DeviceKind::Capture,
            _ => DeviceKind::Playback,
        }
    }
}

/// Owns the state machine and executes its decisions
pub struct Dispatcher {
    machine: LoopStateMachine,
    // Declared before `path` so routing stops before the handles close
    router: Option<Router>,
    path: DevicePath,
    meter: Arc<LevelMeter>,
    router_settings: RouterSettings,
    poll_interval: Duration,
    /// Lets the router report faults without keeping the queue open
    commands: mpsc::WeakSender<Command>,
    /// Latest configuration, applied on `RestartRequested`
    config: watch::Receiver<Config>,
    view_tx: watch::Sender<PollerView>,
    events: broadcast::Sender<StateEvent>,
    /// Count of state changes, published so the poller can resync
    epoch: u64,
    terminated: bool,
}

impl Dispatcher {
    pub fn new(
        mut config: watch::Receiver<Config>,
        gateway: Arc<dyn DeviceGateway>,
        meter: Arc<LevelMeter>,
        commands: &mpsc::Sender<Command>,
        view_tx: watch::Sender<PollerView>,
        events: broadcast::Sender<StateEvent>,
    ) -> Self {
        let current = config.borrow_and_update().clone();
        Self {
            machine: LoopStateMachine::new(current.default_hibernate(), current.reopen_backoff()),
            router: None,
            path: DevicePath {
                gateway,
                capture: None,
                playback: None,
            },
            meter,
            router_settings: RouterSettings {
                channels: current.channels,
                sample_frames: current.sample_frames,
            },
            poll_interval: current.poll_interval(),
            commands: commands.downgrade(),
            config,
            view_tx,
            events,
            epoch: 0,
            terminated: false,
        }
    }

    /// Run the loop until a kill request has been handled.
    ///
    /// A closed command queue counts as a kill request.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<(), DaemonError> {
        self.start().await;

        loop {
            let command = match tokio::time::timeout(self.wait_timeout(), commands.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => {
                    warn!("command queue closed, shutting down");
                    Command::event(Event::KillRequested)
                }
                Err(_) => Command::event(Event::Tick),
            };

            if !self.dispatch(command).await? {
                break;
            }
        }

        info!("dispatcher stopped");
        Ok(())
    }

    /// Leave `UNKNOWN` for `IDLE`
    pub async fn start(&mut self) {
        let from = self.machine.state();
        let transition = self.machine.initialize();
        info!(from = %from, to = %transition.to, "player initialized");
        self.count(transition.changed());
        self.execute(transition.effects, None).await;
        self.settle(from).await;
    }

    /// Handle one command. Returns `false` once the loop must stop.
    pub async fn dispatch(&mut self, command: Command) -> Result<bool, DaemonError> {
        let Command { event, reply } = command;
        if event == Event::RestartRequested {
            self.reload();
        }
        let transition = self.machine.handle(event, Instant::now());
        self.count(transition.changed());

        if transition.changed() {
            info!(from = %transition.from, to = %transition.to, ?event, "state transition");
        } else if event != Event::Tick {
            debug!(state = %transition.to, ?event, "event handled");
        }

        if transition.terminates() {
            let result = self.shutdown(transition.effects, reply).await;
            self.publish(transition.from);
            return result.map(|()| false);
        }

        self.execute(transition.effects, reply).await;
        self.settle(transition.from).await;
        Ok(!self.terminated)
    }

    /// Wait at most one poll interval, less when hibernation is about to end
    fn wait_timeout(&self) -> Duration {
        match self.machine.hibernate_deadline() {
            Some(deadline) if self.machine.state() == PlayerState::Hybernate => {
                deadline.saturating_duration_since(Instant::now()).min(self.poll_interval)
            }
            _ => self.poll_interval,
        }
    }

    /// Execute effects in order. The first failure aborts the rest and is
    /// fed back to the machine as a recovery event.
    async fn execute(&mut self, effects: Vec<SideEffect>, mut reply: Option<oneshot::Sender<PlayerState>>) {
        for effect in effects {
            let Err(failure) = self.apply(effect, &mut reply).await else {
                continue;
            };

            warn!(?effect, error = %failure.error, "side effect failed");
            self.report(&failure);

            if let Some(event) = failure.recovery {
                self.recover(event).await;
                break;
            }
        }
    }

    /// Apply the machine's answer to a failed effect, logging any further errors
    async fn recover(&mut self, event: Event) {
        let transition = self.machine.handle(event, Instant::now());
        info!(from = %transition.from, to = %transition.to, ?event, "recovering from device failure");
        self.count(transition.changed());

        for effect in transition.effects {
            if let Err(failure) = self.apply(effect, &mut None).await {
                warn!(?effect, error = %failure.error, "recovery step failed");
                self.report(&failure);
            }
        }

        if !self.machine.capture_open() {
            info!("capture device closed, reopening after backoff");
        }
    }

    /// Kill handling: every effect runs, failures are collected
    async fn shutdown(
        &mut self,
        effects: Vec<SideEffect>,
        mut reply: Option<oneshot::Sender<PlayerState>>,
    ) -> Result<(), DaemonError> {
        let mut failures = Vec::new();

        for effect in effects {
            if let Err(failure) = self.apply(effect, &mut reply).await {
                error!(?effect, error = %failure.error, "shutdown step failed");
                failures.push(format!("{effect:?}: {}", failure.error));
            }
        }

        // Anything the machine did not know about
        drop(self.router.take());
        for kind in [DeviceKind::Playback, DeviceKind::Capture] {
            if let Err(e) = self.path.close(kind) {
                error!(%kind, %e, "failed to release device");
                failures.push(format!("release {kind}: {e}"));
            }
        }

        if failures.is_empty() {
            info!("shutdown complete");
            Ok(())
        } else {
            Err(DaemonError::FatalShutdown { failures })
        }
    }

    async fn apply(
        &mut self,
        effect: SideEffect,
        reply: &mut Option<oneshot::Sender<PlayerState>>,
    ) -> Result<(), EffectFailure> {
        debug!(?effect, "executing side effect");
        let fail = |error: DeviceError, recovery: Option<Event>| EffectFailure {
            effect,
            error,
            recovery,
        };

        match effect {
            SideEffect::OpenCapture => {
                let handle = self
                    .path
                    .gateway
                    .open_capture()
                    .map_err(|e| fail(e, Some(Event::CaptureFailed)))?;
                info!(id = handle.id, "capture device opened");
                self.path.capture = Some(handle);
            }
            SideEffect::CloseCapture => {
                self.path.close(DeviceKind::Capture).map_err(|e| fail(e, None))?;
            }
            SideEffect::OpenPlayback => {
                let handle = self
                    .path
                    .gateway
                    .open_playback()
                    .map_err(|e| fail(e, Some(Event::PathFailed)))?;
                info!(id = handle.id, "playback device opened");
                self.path.playback = Some(handle);
            }
            SideEffect::ClosePlayback => {
                self.path.close(DeviceKind::Playback).map_err(|e| fail(e, None))?;
            }
            SideEffect::StartRouting => {
                let (Some(capture), Some(playback)) = (self.path.capture, self.path.playback) else {
                    let missing = if self.path.capture.is_none() {
                        DeviceKind::Capture
                    } else {
                        DeviceKind::Playback
                    };
                    return Err(fail(
                        DeviceError::NotOpen { kind: missing, id: 0 },
                        Some(Event::PathFailed),
                    ));
                };
                let faults = self.commands.upgrade().ok_or_else(|| {
                    fail(
                        DeviceError::Backend("command queue closed".into()),
                        Some(Event::PathFailed),
                    )
                })?;
                if let Some(stale) = self.router.take() {
                    warn!("routing already running, replacing it");
                    if let Err(e) = stale.stop().await {
                        warn!(%e, "failed to stop previous routing");
                    }
                }
                self.router = Some(Router::start(
                    Arc::clone(&self.path.gateway),
                    capture,
                    playback,
                    Arc::clone(&self.meter),
                    faults,
                    self.router_settings,
                ));
            }
            SideEffect::StopRouting => {
                if let Some(router) = self.router.take() {
                    router.stop().await.map_err(|e| fail(e, None))?;
                }
            }
            // The deadline lives in the machine; the wait timeout follows it
            SideEffect::ArmHibernateTimer(deadline) => match deadline {
                Some(at) => info!(
                    secs = at.saturating_duration_since(Instant::now()).as_secs_f64(),
                    "hibernating"
                ),
                None => info!("hibernating until resumed"),
            },
            SideEffect::DisarmHibernateTimer => debug!("hibernate timer disarmed"),
            SideEffect::ReplyStatus(state) => match reply.take() {
                Some(tx) => {
                    if tx.send(state).is_err() {
                        debug!("status requester went away");
                    }
                }
                None => debug!(state = %state, "status requested without a reply channel"),
            },
            SideEffect::Terminate => {
                self.terminated = true;
            }
        }

        Ok(())
    }

    /// Re-initialize after a restart or an invariant reset, then publish
    async fn settle(&mut self, from: PlayerState) {
        if self.machine.state() == PlayerState::Unknown {
            info!("player state unknown, re-initializing");
            let transition = self.machine.initialize();
            self.count(transition.changed());
            self.execute(transition.effects, None).await;
        }
        self.publish(from);
    }

    fn count(&mut self, changed: bool) {
        if changed {
            self.epoch = self.epoch.wrapping_add(1);
        }
    }

    /// Pick up a reloaded configuration, if there is one
    fn reload(&mut self) {
        // A dropped sender means nothing new can arrive
        if !self.config.has_changed().unwrap_or(false) {
            debug!("restart without a configuration change");
            return;
        }
        let config = self.config.borrow_and_update().clone();
        self.machine
            .reconfigure(config.default_hibernate(), config.reopen_backoff());
        self.router_settings = RouterSettings {
            channels: config.channels,
            sample_frames: config.sample_frames,
        };
        self.poll_interval = config.poll_interval();
        info!(poll_interval_ms = config.poll_interval_ms, "dispatcher reconfigured");
    }

    /// Tell the poller and bus subscribers about the current state
    fn publish(&self, from: PlayerState) {
        let view = PollerView {
            state: self.machine.state(),
            capture: self.path.capture,
            epoch: self.epoch,
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });

        if from != view.state {
            // No subscribers is fine
            let _ = self.events.send(StateEvent::StateChanged { from, to: view.state });
        }
    }

    fn report(&self, failure: &EffectFailure) {
        let _ = self.events.send(StateEvent::DeviceFault {
            device: failure.device(),
            message: failure.error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CapturePoller;
    use crate::device::mock::ScriptedGateway;
    use crate::device::ReadOutcome;

    struct Harness {
        dispatcher: Dispatcher,
        gw: Arc<ScriptedGateway>,
        config_tx: watch::Sender<Config>,
        tx: mpsc::Sender<Command>,
        rx: mpsc::Receiver<Command>,
        view: watch::Receiver<PollerView>,
        events: broadcast::Receiver<StateEvent>,
    }

    fn config() -> Config {
        Config {
            poll_interval_ms: 100,
            read_failure_backoff_max_ms: 1000,
            ..Config::default()
        }
    }

    fn harness(config: Config, gw: ScriptedGateway) -> Harness {
        let gw = Arc::new(gw);
        let (tx, rx) = mpsc::channel(16);
        let (view_tx, view) = watch::channel(PollerView::default());
        let (events_tx, events) = broadcast::channel(16);
        let (config_tx, config_rx) = watch::channel(config);
        let dispatcher = Dispatcher::new(
            config_rx,
            Arc::clone(&gw) as Arc<dyn DeviceGateway>,
            Arc::new(LevelMeter::new()),
            &tx,
            view_tx,
            events_tx,
        );
        Harness {
            dispatcher,
            gw,
            config_tx,
            tx,
            rx,
            view,
            events,
        }
    }

    async fn status(dispatcher: &mut Dispatcher) -> PlayerState {
        let (tx, rx) = oneshot::channel();
        assert!(dispatcher.dispatch(Command::status(tx)).await.unwrap());
        rx.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_opens_capture_and_publishes() {
        let mut h = harness(config(), ScriptedGateway::new());
        h.dispatcher.start().await;

        assert_eq!(h.dispatcher.machine.state(), PlayerState::Idle);
        assert!(h.gw.is_open(DeviceKind::Capture));
        let view = *h.view.borrow();
        assert_eq!(view.state, PlayerState::Idle);
        assert!(view.capture.is_some());
        assert_eq!(
            h.events.try_recv().unwrap(),
            StateEvent::StateChanged {
                from: PlayerState::Unknown,
                to: PlayerState::Idle
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_play_pause_kill() {
        let mut h = harness(config(), ScriptedGateway::new());
        let d = &mut h.dispatcher;
        d.start().await;

        assert!(d.dispatch(Event::AudioDetected.into()).await.unwrap());
        assert_eq!(d.machine.state(), PlayerState::Play);
        assert_eq!(h.gw.open_count(DeviceKind::Playback), 1);
        assert!(d.router.is_some());

        // a second detection does not open anything
        assert!(d.dispatch(Event::AudioDetected.into()).await.unwrap());
        assert_eq!(h.gw.open_count(DeviceKind::Playback), 1);

        assert!(d.dispatch(Event::PauseRequested(None).into()).await.unwrap());
        assert_eq!(d.machine.state(), PlayerState::Hybernate);
        assert_eq!(h.gw.close_count(DeviceKind::Playback), 1);
        assert!(!h.gw.is_open(DeviceKind::Playback));
        assert!(d.router.is_none());

        assert!(!d.dispatch(Event::KillRequested.into()).await.unwrap());
        assert_eq!(d.machine.state(), PlayerState::Killed);
        assert!(!h.gw.is_open(DeviceKind::Capture));
        assert_eq!(h.view.borrow().state, PlayerState::Killed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reply_keeps_state() {
        let mut h = harness(config(), ScriptedGateway::new());
        h.dispatcher.start().await;
        assert_eq!(status(&mut h.dispatcher).await, PlayerState::Idle);

        h.dispatcher.dispatch(Event::AudioDetected.into()).await.unwrap();
        assert_eq!(status(&mut h.dispatcher).await, PlayerState::Play);
        assert_eq!(h.dispatcher.machine.state(), PlayerState::Play);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_open_failure_falls_back_to_idle() {
        let gw = ScriptedGateway::new();
        gw.fail_playback_opens(1);
        let mut h = harness(config(), gw);
        h.dispatcher.start().await;
        while h.events.try_recv().is_ok() {}

        assert!(h.dispatcher.dispatch(Event::AudioDetected.into()).await.unwrap());
        assert_eq!(h.dispatcher.machine.state(), PlayerState::Idle);
        assert!(!h.gw.is_open(DeviceKind::Playback));
        assert!(h.dispatcher.router.is_none());
        assert!(matches!(
            h.events.try_recv().unwrap(),
            StateEvent::DeviceFault {
                device: DeviceKind::Playback,
                ..
            }
        ));

        // the next detection succeeds
        h.dispatcher.dispatch(Event::AudioDetected.into()).await.unwrap();
        assert_eq!(h.dispatcher.machine.state(), PlayerState::Play);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_with_failed_cleanup_is_fatal() {
        let mut h = harness(config(), ScriptedGateway::new());
        h.dispatcher.start().await;
        h.dispatcher.dispatch(Event::AudioDetected.into()).await.unwrap();
        h.gw.fail_close(true);

        let err = h.dispatcher.dispatch(Event::KillRequested.into()).await.unwrap_err();
        let DaemonError::FatalShutdown { failures } = err;
        assert_eq!(failures.len(), 2);
        // every step still ran
        assert!(!h.gw.is_open(DeviceKind::Playback));
        assert!(!h.gw.is_open(DeviceKind::Capture));
        assert_eq!(h.dispatcher.machine.state(), PlayerState::Killed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hibernate_expires_through_ticks() {
        let h = harness(config(), ScriptedGateway::new());
        let Harness {
            dispatcher,
            tx,
            rx,
            mut view,
            ..
        } = h;
        let task = tokio::spawn(dispatcher.run(rx));

        tx.send(Event::PauseRequested(Some(Duration::from_secs(2))).into())
            .await
            .unwrap();
        view.wait_for(|v| v.state == PlayerState::Hybernate).await.unwrap();
        let paused_at = Instant::now();

        view.wait_for(|v| v.state == PlayerState::Idle).await.unwrap();
        let elapsed = paused_at.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "woke after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2100), "woke after {elapsed:?}");

        tx.send(Event::KillRequested.into()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_open_failure_is_retried() {
        let gw = ScriptedGateway::new();
        gw.fail_capture_opens(2);
        let h = harness(config(), gw);
        let Harness {
            dispatcher,
            gw,
            tx,
            rx,
            mut view,
            ..
        } = h;
        let task = tokio::spawn(dispatcher.run(rx));

        view.wait_for(|v| v.state == PlayerState::Idle && v.capture.is_some())
            .await
            .unwrap();
        assert!(gw.is_open(DeviceKind::Capture));
        assert_eq!(gw.open_count(DeviceKind::Capture), 1);

        drop(tx);
        task.await.unwrap().unwrap();
        assert!(!gw.is_open(DeviceKind::Capture));
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_fault_returns_to_idle() {
        let gw = ScriptedGateway::new();
        gw.set_idle_read(Ok(ReadOutcome::Data(vec![100, 100])));
        gw.fail_writes(true);
        let h = harness(config(), gw);
        let Harness {
            dispatcher,
            gw,
            tx,
            rx,
            mut events,
            ..
        } = h;
        let task = tokio::spawn(dispatcher.run(rx));

        tx.send(Event::AudioDetected.into()).await.unwrap();
        let mut seen = Vec::new();
        while seen.last() != Some(&PlayerState::Idle) || seen.len() < 3 {
            if let StateEvent::StateChanged { to, .. } = events.recv().await.unwrap() {
                seen.push(to);
            }
        }
        assert_eq!(seen, vec![PlayerState::Idle, PlayerState::Play, PlayerState::Idle]);
        assert!(!gw.is_open(DeviceKind::Playback));

        tx.send(Event::KillRequested.into()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_shuts_down() {
        let h = harness(config(), ScriptedGateway::new());
        let Harness {
            dispatcher, tx, rx, view, ..
        } = h;
        drop(tx);
        dispatcher.run(rx).await.unwrap();
        assert_eq!(view.borrow().state, PlayerState::Killed);
    }

    #[test]
    fn test_device_path_closes_on_drop() {
        let gw = Arc::new(ScriptedGateway::new());
        let path = DevicePath {
            gateway: Arc::clone(&gw) as Arc<dyn DeviceGateway>,
            capture: Some(gw.open_capture().unwrap()),
            playback: Some(gw.open_playback().unwrap()),
        };
        drop(path);
        assert!(!gw.is_open(DeviceKind::Capture));
        assert!(!gw.is_open(DeviceKind::Playback));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_applies_reloaded_config() {
        let mut h = harness(config(), ScriptedGateway::new());
        h.dispatcher.start().await;
        h.dispatcher.dispatch(Event::AudioDetected.into()).await.unwrap();
        let epoch = h.view.borrow().epoch;

        h.config_tx.send_modify(|config| config.default_hibernate_duration_s = Some(30.0));
        assert!(h.dispatcher.dispatch(Event::RestartRequested.into()).await.unwrap());

        assert_eq!(h.dispatcher.machine.state(), PlayerState::Idle);
        assert!(!h.gw.is_open(DeviceKind::Playback));
        assert_eq!(h.gw.open_count(DeviceKind::Capture), 2);
        assert!(h.dispatcher.router.is_none());
        // PLAY -> UNKNOWN -> IDLE
        assert_eq!(h.view.borrow().epoch, epoch + 2);

        let paused_at = Instant::now();
        h.dispatcher.dispatch(Event::PauseRequested(None).into()).await.unwrap();
        let deadline = h.dispatcher.machine.hibernate_deadline().unwrap();
        assert!(deadline >= paused_at + Duration::from_secs(30));
        assert!(deadline < paused_at + Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_pauses_then_resumes() {
        let mut h = harness(config(), ScriptedGateway::new());
        h.dispatcher.start().await;
        h.dispatcher.dispatch(Event::AudioDetected.into()).await.unwrap();

        h.dispatcher.dispatch(Event::TogglePause.into()).await.unwrap();
        assert_eq!(h.dispatcher.machine.state(), PlayerState::Hybernate);
        assert!(!h.gw.is_open(DeviceKind::Playback));

        h.dispatcher.dispatch(Event::TogglePause.into()).await.unwrap();
        assert_eq!(h.dispatcher.machine.state(), PlayerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_play_attempt_bumps_epoch() {
        let gw = ScriptedGateway::new();
        gw.fail_playback_opens(1);
        let mut h = harness(config(), gw);
        h.dispatcher.start().await;
        let before = *h.view.borrow();

        h.dispatcher.dispatch(Event::AudioDetected.into()).await.unwrap();
        let after = *h.view.borrow();
        assert_eq!(after.state, PlayerState::Idle);
        assert_eq!(after.capture, before.capture);
        // IDLE -> PLAY -> IDLE within one dispatch
        assert_eq!(after.epoch, before.epoch + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_routing_twice_replaces_router() {
        let mut h = harness(config(), ScriptedGateway::new());
        h.dispatcher.start().await;
        h.dispatcher.dispatch(Event::AudioDetected.into()).await.unwrap();
        assert!(h.dispatcher.router.is_some());

        assert!(h.dispatcher.apply(SideEffect::StartRouting, &mut None).await.is_ok());
        assert!(h.dispatcher.router.is_some());

        assert!(!h.dispatcher.dispatch(Event::KillRequested.into()).await.unwrap());
        assert!(h.dispatcher.router.is_none());
    }

    /// Dispatcher and capture poller running together on one gateway
    struct Daemon {
        gw: Arc<ScriptedGateway>,
        tx: mpsc::Sender<Command>,
        view: watch::Receiver<PollerView>,
        events: broadcast::Receiver<StateEvent>,
        dispatcher: tokio::task::JoinHandle<Result<(), DaemonError>>,
        poller: tokio::task::JoinHandle<()>,
    }

    fn daemon_config() -> Config {
        Config {
            poll_interval_ms: 100,
            channels: 1,
            sample_frames: 4,
            silence_debounce_count: 3,
            ..Config::default()
        }
    }

    fn spawn_daemon(gw: ScriptedGateway) -> Daemon {
        let gw = Arc::new(gw);
        let meter = Arc::new(LevelMeter::new());
        let (tx, rx) = mpsc::channel(16);
        let (view_tx, view) = watch::channel(PollerView::default());
        let (events_tx, events) = broadcast::channel(64);
        let (_config_tx, config_rx) = watch::channel(daemon_config());

        let dispatcher = Dispatcher::new(
            config_rx.clone(),
            Arc::clone(&gw) as Arc<dyn DeviceGateway>,
            Arc::clone(&meter),
            &tx,
            view_tx,
            events_tx,
        );
        let poller = CapturePoller::new(
            config_rx,
            Arc::clone(&gw) as Arc<dyn DeviceGateway>,
            meter,
            tx.clone(),
            view.clone(),
        );
        Daemon {
            gw,
            tx,
            view,
            events,
            dispatcher: tokio::spawn(dispatcher.run(rx)),
            poller: tokio::spawn(poller.run()),
        }
    }

    impl Daemon {
        async fn kill(self) {
            self.tx.send(Event::KillRequested.into()).await.unwrap();
            self.dispatcher.await.unwrap().unwrap();
            self.poller.await.unwrap();
        }
    }

    fn loud() -> Result<ReadOutcome, DeviceError> {
        Ok(ReadOutcome::Data(vec![8000; 4]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_open_failure_is_retried_while_audio_continues() {
        let gw = ScriptedGateway::new();
        gw.set_idle_read(loud());
        gw.fail_playback_opens(1);
        let mut d = spawn_daemon(gw);

        tokio::time::timeout(
            Duration::from_secs(10),
            d.view.wait_for(|v| v.state == PlayerState::Play),
        )
        .await
        .expect("should reach PLAY after the failed open")
        .unwrap();
        assert_eq!(d.gw.open_count(DeviceKind::Playback), 1);

        // audio keeps flowing through the router
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(d.view.borrow().state, PlayerState::Play);
        assert!(!d.gw.written().is_empty());
        d.kill().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_fault_recovers_while_audio_continues() {
        let gw = ScriptedGateway::new();
        gw.set_idle_read(loud());
        gw.fail_writes(true);
        let mut d = spawn_daemon(gw);

        // PLAY, then the router fault sends it back to IDLE
        loop {
            match d.events.recv().await {
                Ok(StateEvent::StateChanged {
                    from: PlayerState::Play,
                    to: PlayerState::Idle,
                }) => break,
                Ok(_) => {}
                // fault cycles outran the subscriber
                Err(broadcast::error::RecvError::Lagged(_)) => break,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }

        d.gw.fail_writes(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(d.view.borrow().state, PlayerState::Play);
        assert!(d.gw.is_open(DeviceKind::Playback));
        assert!(!d.gw.written().is_empty());
        d.kill().await;
    }
}
