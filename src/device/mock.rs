//! Scripted gateway for tests without audio hardware.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::{DeviceGateway, DeviceHandle, DeviceKind, ReadOutcome};
use crate::error::DeviceError;

/// A gateway whose reads, failures and writes are scripted by the test.
///
/// Reads are served from a queue; once it is empty every read returns
/// the idle outcome (silence unless changed). All written samples are
/// recorded.
pub struct ScriptedGateway {
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: u64,
    open: HashMap<u64, DeviceKind>,
    reads: VecDeque<Result<ReadOutcome, DeviceError>>,
    idle_read: Result<ReadOutcome, DeviceError>,
    capture_open_failures: u32,
    playback_open_failures: u32,
    fail_writes: bool,
    fail_close: bool,
    opened: HashMap<DeviceKind, u32>,
    closed: HashMap<DeviceKind, u32>,
    written: Vec<i16>,
    reads_attempted: u32,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                open: HashMap::new(),
                reads: VecDeque::new(),
                idle_read: Ok(ReadOutcome::Silence),
                capture_open_failures: 0,
                playback_open_failures: 0,
                fail_writes: false,
                fail_close: false,
                opened: HashMap::new(),
                closed: HashMap::new(),
                written: Vec::new(),
                reads_attempted: 0,
            }),
        }
    }

    /// Queue the outcome of the next read
    pub fn push_read(&self, outcome: Result<ReadOutcome, DeviceError>) {
        self.inner.lock().reads.push_back(outcome);
    }

    /// Outcome of every read once the queue is drained
    pub fn set_idle_read(&self, outcome: Result<ReadOutcome, DeviceError>) {
        self.inner.lock().idle_read = outcome;
    }

    pub fn fail_capture_opens(&self, times: u32) {
        self.inner.lock().capture_open_failures = times;
    }

    pub fn fail_playback_opens(&self, times: u32) {
        self.inner.lock().playback_open_failures = times;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.inner.lock().fail_close = fail;
    }

    pub fn is_open(&self, kind: DeviceKind) -> bool {
        self.inner.lock().open.values().any(|k| *k == kind)
    }

    pub fn open_count(&self, kind: DeviceKind) -> u32 {
        self.inner.lock().opened.get(&kind).copied().unwrap_or(0)
    }

    pub fn close_count(&self, kind: DeviceKind) -> u32 {
        self.inner.lock().closed.get(&kind).copied().unwrap_or(0)
    }

    /// Reads attempted on an open capture handle
    pub fn read_count(&self) -> u32 {
        self.inner.lock().reads_attempted
    }

    pub fn written(&self) -> Vec<i16> {
        self.inner.lock().written.clone()
    }

    fn open(&self, kind: DeviceKind) -> Result<DeviceHandle, DeviceError> {
        let mut inner = self.inner.lock();
        let failures = match kind {
            DeviceKind::Capture => &mut inner.capture_open_failures,
            DeviceKind::Playback => &mut inner.playback_open_failures,
        };
        if *failures > 0 {
            *failures -= 1;
            return Err(DeviceError::open_failed(kind, "scripted failure"));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.open.insert(id, kind);
        *inner.opened.entry(kind).or_insert(0) += 1;
        Ok(DeviceHandle { kind, id })
    }

    fn check_open(inner: &Inner, handle: DeviceHandle) -> Result<(), DeviceError> {
        match inner.open.get(&handle.id) {
            Some(kind) if *kind == handle.kind => Ok(()),
            _ => Err(DeviceError::NotOpen {
                kind: handle.kind,
                id: handle.id,
            }),
        }
    }
}

impl DeviceGateway for ScriptedGateway {
    fn open_capture(&self) -> Result<DeviceHandle, DeviceError> {
        self.open(DeviceKind::Capture)
    }

    fn open_playback(&self) -> Result<DeviceHandle, DeviceError> {
        self.open(DeviceKind::Playback)
    }

    fn close(&self, handle: DeviceHandle) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if inner.open.remove(&handle.id).is_some() {
            *inner.closed.entry(handle.kind).or_insert(0) += 1;
            if inner.fail_close {
                return Err(DeviceError::Backend("scripted close failure".into()));
            }
        }
        Ok(())
    }

    fn try_read(&self, handle: DeviceHandle) -> Result<ReadOutcome, DeviceError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner, handle)?;
        inner.reads_attempted += 1;
        match inner.reads.pop_front() {
            Some(outcome) => outcome,
            None => inner.idle_read.clone(),
        }
    }

    fn write(&self, handle: DeviceHandle, samples: &[i16]) -> Result<usize, DeviceError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner, handle)?;
        if inner.fail_writes {
            return Err(DeviceError::unavailable(DeviceKind::Playback, "scripted write failure"));
        }
        inner.written.extend_from_slice(samples);
        Ok(samples.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_follow_script_then_idle() {
        let gw = ScriptedGateway::new();
        let capture = gw.open_capture().unwrap();
        gw.push_read(Ok(ReadOutcome::Data(vec![1, 2])));
        gw.push_read(Err(DeviceError::WouldBlock));

        assert_eq!(gw.try_read(capture), Ok(ReadOutcome::Data(vec![1, 2])));
        assert_eq!(gw.try_read(capture), Err(DeviceError::WouldBlock));
        assert_eq!(gw.try_read(capture), Ok(ReadOutcome::Silence));
    }

    #[test]
    fn test_close_is_idempotent() {
        let gw = ScriptedGateway::new();
        let playback = gw.open_playback().unwrap();
        assert!(gw.is_open(DeviceKind::Playback));

        gw.close(playback).unwrap();
        gw.close(playback).unwrap();
        assert!(!gw.is_open(DeviceKind::Playback));
        assert_eq!(gw.close_count(DeviceKind::Playback), 1);
        assert!(matches!(gw.write(playback, &[0]), Err(DeviceError::NotOpen { .. })));
    }

    #[test]
    fn test_scripted_open_failures() {
        let gw = ScriptedGateway::new();
        gw.fail_capture_opens(1);
        assert!(gw.open_capture().is_err());
        assert!(gw.open_capture().is_ok());
        assert_eq!(gw.open_count(DeviceKind::Capture), 1);
    }
}
