//! cpal device gateway
//!
//! cpal streams are `!Send`, so they live on a dedicated `audio-host`
//! thread that opens and drops them on request. Samples cross over
//! through lock-free SPSC ring buffers: the capture callback produces,
//! `try_read` consumes; `write` produces, the playback callback
//! consumes. Neither side ever blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use super::{DeviceGateway, DeviceHandle, DeviceKind, ReadOutcome, StreamFormat};
use crate::config::Config;
use crate::error::DeviceError;

/// Symmetric i16 max for f32 conversion (avoids asymmetric clipping).
const I16_MAX_SYMMETRIC: f32 = i16::MAX as f32;

/// Requests handled on the audio host thread
enum HostRequest {
    OpenCapture {
        id: u64,
        fault: Arc<AtomicBool>,
        reply: Sender<Result<HeapCons<i16>, DeviceError>>,
    },
    OpenPlayback {
        id: u64,
        fault: Arc<AtomicBool>,
        reply: Sender<Result<HeapProd<i16>, DeviceError>>,
    },
    Close {
        id: u64,
    },
    Shutdown,
}

struct CaptureSlot {
    consumer: HeapCons<i16>,
    fault: Arc<AtomicBool>,
}

struct PlaybackSlot {
    producer: HeapProd<i16>,
    fault: Arc<AtomicBool>,
}

/// Device selection and format handed to the host thread
#[derive(Debug, Clone)]
struct HostConfig {
    capture_device: Option<String>,
    playback_device: Option<String>,
    format: StreamFormat,
}

/// Gateway backed by the default cpal host (ALSA on Linux)
pub struct CpalGateway {
    requests: Sender<HostRequest>,
    channels: usize,
    next_id: AtomicU64,
    captures: Mutex<HashMap<u64, CaptureSlot>>,
    playbacks: Mutex<HashMap<u64, PlaybackSlot>>,
    host_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpalGateway {
    /// Start the audio host thread
    pub fn spawn(config: &Config) -> Result<Self, DeviceError> {
        let host_config = HostConfig {
            capture_device: config.capture_device_id.clone(),
            playback_device: config.playback_device_id.clone(),
            format: config.stream_format(),
        };
        let (requests, rx) = unbounded();

        let handle = thread::Builder::new()
            .name("audio-host".to_string())
            .spawn(move || {
                info!("audio host thread started");
                run_host(host_config, rx);
                info!("audio host thread stopped");
            })
            .map_err(|e| DeviceError::Backend(format!("failed to spawn audio host thread: {e}")))?;

        Ok(Self {
            requests,
            channels: usize::from(config.channels.max(1)),
            next_id: AtomicU64::new(1),
            captures: Mutex::new(HashMap::new()),
            playbacks: Mutex::new(HashMap::new()),
            host_thread: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, request: HostRequest) -> Result<(), DeviceError> {
        self.requests
            .send(request)
            .map_err(|_| DeviceError::Backend("audio host thread stopped".into()))
    }
}

impl DeviceGateway for CpalGateway {
    fn open_capture(&self) -> Result<DeviceHandle, DeviceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fault = Arc::new(AtomicBool::new(false));
        let (reply, response) = bounded(1);

        self.send(HostRequest::OpenCapture {
            id,
            fault: Arc::clone(&fault),
            reply,
        })?;
        let consumer = response
            .recv()
            .map_err(|_| DeviceError::Backend("audio host thread stopped".into()))??;

        self.captures.lock().insert(id, CaptureSlot { consumer, fault });
        Ok(DeviceHandle {
            kind: DeviceKind::Capture,
            id,
        })
    }

    fn open_playback(&self) -> Result<DeviceHandle, DeviceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fault = Arc::new(AtomicBool::new(false));
        let (reply, response) = bounded(1);

        self.send(HostRequest::OpenPlayback {
            id,
            fault: Arc::clone(&fault),
            reply,
        })?;
        let producer = response
            .recv()
            .map_err(|_| DeviceError::Backend("audio host thread stopped".into()))??;

        self.playbacks.lock().insert(id, PlaybackSlot { producer, fault });
        Ok(DeviceHandle {
            kind: DeviceKind::Playback,
            id,
        })
    }

    fn close(&self, handle: DeviceHandle) -> Result<(), DeviceError> {
        let was_open = match handle.kind {
            DeviceKind::Capture => self.captures.lock().remove(&handle.id).is_some(),
            DeviceKind::Playback => self.playbacks.lock().remove(&handle.id).is_some(),
        };
        if !was_open {
            debug!(kind = %handle.kind, id = handle.id, "close on a closed handle");
            return Ok(());
        }
        self.send(HostRequest::Close { id: handle.id })
    }

    fn try_read(&self, handle: DeviceHandle) -> Result<ReadOutcome, DeviceError> {
        let mut captures = self.captures.lock();
        let slot = captures.get_mut(&handle.id).ok_or(DeviceError::NotOpen {
            kind: handle.kind,
            id: handle.id,
        })?;

        if slot.fault.load(Ordering::Acquire) {
            return Err(DeviceError::unavailable(DeviceKind::Capture, "stream reported an error"));
        }

        let available = slot.consumer.occupied_len();
        let whole_frames = available - available % self.channels;
        if whole_frames == 0 {
            return Err(DeviceError::WouldBlock);
        }

        let mut samples = vec![0i16; whole_frames];
        let read = slot.consumer.pop_slice(&mut samples);
        samples.truncate(read);
        Ok(ReadOutcome::Data(samples))
    }

    fn write(&self, handle: DeviceHandle, samples: &[i16]) -> Result<usize, DeviceError> {
        let mut playbacks = self.playbacks.lock();
        let slot = playbacks.get_mut(&handle.id).ok_or(DeviceError::NotOpen {
            kind: handle.kind,
            id: handle.id,
        })?;

        if slot.fault.load(Ordering::Acquire) {
            return Err(DeviceError::unavailable(DeviceKind::Playback, "stream reported an error"));
        }

        let written = slot.producer.push_slice(samples);
        if written < samples.len() {
            debug!(dropped = samples.len() - written, "playback buffer full");
        }
        Ok(written)
    }
}

impl Drop for CpalGateway {
    fn drop(&mut self) {
        let _ = self.requests.send(HostRequest::Shutdown);
        if let Some(handle) = self.host_thread.lock().take() {
            if handle.join().is_err() {
                error!("audio host thread panicked");
            }
        }
    }
}

/// Audio host thread body: owns every live stream
fn run_host(config: HostConfig, requests: Receiver<HostRequest>) {
    let mut streams: HashMap<u64, Stream> = HashMap::new();

    while let Ok(request) = requests.recv() {
        match request {
            HostRequest::OpenCapture { id, fault, reply } => {
                let result = open_input(&config, fault).map(|(stream, consumer)| {
                    streams.insert(id, stream);
                    consumer
                });
                if let Err(e) = &result {
                    warn!(%e, "capture open failed");
                }
                let _ = reply.send(result);
            }
            HostRequest::OpenPlayback { id, fault, reply } => {
                let result = open_output(&config, fault).map(|(stream, producer)| {
                    streams.insert(id, stream);
                    producer
                });
                if let Err(e) = &result {
                    warn!(%e, "playback open failed");
                }
                let _ = reply.send(result);
            }
            HostRequest::Close { id } => {
                if streams.remove(&id).is_some() {
                    debug!(id, "stream closed");
                }
            }
            HostRequest::Shutdown => break,
        }
    }

    // Dropping the streams stops them
    streams.clear();
}

fn find_device(kind: DeviceKind, name: Option<&str>) -> Result<Device, DeviceError> {
    let host = cpal::default_host();

    match name {
        Some(name) => {
            let mut devices = match kind {
                DeviceKind::Capture => host.input_devices(),
                DeviceKind::Playback => host.output_devices(),
            }
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| DeviceError::NotFound {
                    kind,
                    name: name.to_string(),
                })
        }
        None => match kind {
            DeviceKind::Capture => host.default_input_device(),
            DeviceKind::Playback => host.default_output_device(),
        }
        .ok_or_else(|| DeviceError::NotFound {
            kind,
            name: "default".to_string(),
        }),
    }
}

fn stream_config(format: &StreamFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: match format.period_frames {
            0 => cpal::BufferSize::Default,
            frames => cpal::BufferSize::Fixed(frames),
        },
    }
}

fn open_input(
    config: &HostConfig,
    fault: Arc<AtomicBool>,
) -> Result<(Stream, HeapCons<i16>), DeviceError> {
    let kind = DeviceKind::Capture;
    let device = find_device(kind, config.capture_device.as_deref())?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let sample_format = device
        .default_input_config()
        .map_err(|e| DeviceError::open_failed(kind, e.to_string()))?
        .sample_format();
    let stream_config = stream_config(&config.format);

    let (mut producer, consumer) = HeapRb::<i16>::new(config.format.samples_per_second()).split();
    let on_error = move |err: cpal::StreamError| {
        warn!(%err, "capture stream error");
        fault.store(true, Ordering::Release);
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                // Non-blocking push - drops samples if the reader fell behind
                let _ = producer.push_slice(data);
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    let converted = (sample * I16_MAX_SYMMETRIC).clamp(-I16_MAX_SYMMETRIC, I16_MAX_SYMMETRIC);
                    let _ = producer.try_push(converted as i16);
                }
            },
            on_error,
            None,
        ),
        other => {
            return Err(DeviceError::open_failed(
                kind,
                format!("unsupported sample format {other:?}"),
            ))
        }
    }
    .map_err(|e| DeviceError::open_failed(kind, e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::open_failed(kind, e.to_string()))?;

    info!(device = %name, ?sample_format, "capture stream started");
    Ok((stream, consumer))
}

fn open_output(
    config: &HostConfig,
    fault: Arc<AtomicBool>,
) -> Result<(Stream, HeapProd<i16>), DeviceError> {
    let kind = DeviceKind::Playback;
    let device = find_device(kind, config.playback_device.as_deref())?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let sample_format = device
        .default_output_config()
        .map_err(|e| DeviceError::open_failed(kind, e.to_string()))?
        .sample_format();
    let stream_config = stream_config(&config.format);

    let (producer, mut consumer) = HeapRb::<i16>::new(config.format.samples_per_second()).split();
    let on_error = move |err: cpal::StreamError| {
        warn!(%err, "playback stream error");
        fault.store(true, Ordering::Release);
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let filled = consumer.pop_slice(data);
                data[filled..].fill(0);
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for sample in data.iter_mut() {
                    *sample = consumer
                        .try_pop()
                        .map_or(0.0, |s| f32::from(s) / I16_MAX_SYMMETRIC);
                }
            },
            on_error,
            None,
        ),
        other => {
            return Err(DeviceError::open_failed(
                kind,
                format!("unsupported sample format {other:?}"),
            ))
        }
    }
    .map_err(|e| DeviceError::open_failed(kind, e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::open_failed(kind, e.to_string()))?;

    info!(device = %name, ?sample_format, "playback stream started");
    Ok((stream, producer))
}
