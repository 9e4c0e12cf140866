//! Microphone capture using cpal, writing 16 kHz mono 16-bit PCM to disk.
//!
//! Capture is fire-and-forget: `start_recording` returns immediately and all
//! outcomes (completion, failure, max-duration auto-stop) arrive as
//! [`CaptureEvent`]s on the single-consumer channel handed to the
//! constructing context. The audio callback does exactly two things per
//! buffer: write samples to the WAV file and compute one peak level. The
//! level is computed inline with the write so the visualization can never
//! drift from what was actually recorded.

use crate::config::ConfigStore;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use hound::{WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Capture output format, fixed by the recognizer contract.
pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;

/// Errors raised while setting up or finalizing a capture.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Failed to get device config: {0}")]
    DeviceConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStart(String),

    #[error("Failed to write audio: {0}")]
    Encoding(String),
}

/// Events emitted by the capture component.
///
/// Consumed by the session orchestrator only; levels are forwarded from
/// there to the GUI fan-out channel.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// Peak amplitude of the last buffer, normalized to [0, 1].
    Level(f32),
    /// Recording finished and the WAV file at `path` is plausible audio.
    Completed { path: PathBuf },
    /// Recording failed; `reason` is user-facing.
    Failed { reason: String },
    /// The max-duration timer fired. The normal stop path follows, so a
    /// `Completed`/`Failed` event still arrives afterwards.
    MaxDurationReached,
}

/// Control surface the session orchestrator drives.
///
/// Start/stop are fire-and-forget; outcomes arrive as [`CaptureEvent`]s.
pub trait CaptureControl: Send + Sync {
    fn start_recording(&self, path: PathBuf);
    fn stop_recording(&self);
    fn has_input_device(&self) -> bool;
    fn is_recording(&self) -> bool;
}

enum CaptureCommand {
    Stop,
}

struct CaptureHandle {
    command_tx: mpsc::Sender<CaptureCommand>,
    // Detached on stop; the thread signals completion through events.
    _thread: JoinHandle<()>,
}

/// Shared state between the audio callback and the capture thread.
///
/// The callback must never block on anything other than the write itself,
/// so everything here is a plain mutex around the writer plus atomics.
struct CaptureSink {
    writer: StdMutex<Option<WavWriter<BufWriter<File>>>>,
    events: UnboundedSender<CaptureEvent>,
    frames_written: AtomicU64,
    max_frames: u64,
    max_duration_fired: AtomicBool,
    stop_requested: Arc<AtomicBool>,
    write_error: StdMutex<Option<String>>,
}

impl CaptureSink {
    /// Process one interleaved buffer: downmix, write, emit one level sample.
    fn push(&self, samples: &[f32], channels: usize) {
        let channels = channels.max(1);
        let mut peak: f32 = 0.0;

        {
            let mut guard = match self.writer.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let Some(writer) = guard.as_mut() else {
                return;
            };

            for frame in samples.chunks_exact(channels) {
                let mono = frame.iter().copied().sum::<f32>() / channels as f32;
                let a = mono.abs();
                if a > peak {
                    peak = a;
                }

                let sample_i16 = (mono.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                if let Err(e) = writer.write_sample(sample_i16) {
                    let mut err = match self.write_error.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if err.is_none() {
                        *err = Some(e.to_string());
                    }
                    self.stop_requested.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }

        let _ = self.events.send(CaptureEvent::Level(peak.min(1.0)));

        let pushed = (samples.len() / channels) as u64;
        let frames = self.frames_written.fetch_add(pushed, Ordering::SeqCst) + pushed;

        if frames >= self.max_frames && !self.max_duration_fired.swap(true, Ordering::SeqCst) {
            log::info!("Audio capture reached max duration, auto-stopping");
            let _ = self.events.send(CaptureEvent::MaxDurationReached);
            self.stop_requested.store(true, Ordering::SeqCst);
        }
    }

    fn take_error(&self) -> Option<String> {
        match self.write_error.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Microphone capture manager.
///
/// Runs the cpal stream in a dedicated thread to avoid Send/Sync issues with
/// `cpal::Stream`; only one recording can be active at a time, and a second
/// `start_recording` while active is a no-op.
pub struct AudioCapture {
    events: UnboundedSender<CaptureEvent>,
    config: ConfigStore,
    handle: StdMutex<Option<CaptureHandle>>,
    active: Arc<AtomicBool>,
}

impl AudioCapture {
    pub fn new(events: UnboundedSender<CaptureEvent>, config: ConfigStore) -> Self {
        Self {
            events,
            config,
            handle: StdMutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    fn fail(&self, reason: String) {
        log::error!("Audio capture failed: {}", reason);
        let _ = self.events.send(CaptureEvent::Failed { reason });
    }
}

/// Find an input stream config that can deliver 16 kHz audio.
///
/// Mono is preferred; a multi-channel config is accepted and downmixed in
/// the callback. Devices that cannot run at 16 kHz are rejected, matching
/// the recognizer's fixed input format.
fn pick_stream_config(
    device: &cpal::Device,
) -> Result<(cpal::StreamConfig, SampleFormat), CaptureError> {
    let supported = device
        .supported_input_configs()
        .map_err(|e| CaptureError::DeviceConfig(e.to_string()))?;

    let mut fallback: Option<(cpal::StreamConfig, SampleFormat)> = None;
    for range in supported {
        if range.min_sample_rate().0 > SAMPLE_RATE || range.max_sample_rate().0 < SAMPLE_RATE {
            continue;
        }
        let format = range.sample_format();
        let config = range
            .with_sample_rate(cpal::SampleRate(SAMPLE_RATE))
            .config();
        if config.channels == CHANNELS {
            return Ok((config, format));
        }
        if fallback.is_none() {
            fallback = Some((config, format));
        }
    }

    fallback.ok_or_else(|| {
        CaptureError::DeviceConfig("input device does not support 16 kHz capture".to_string())
    })
}

impl CaptureControl for AudioCapture {
    fn start_recording(&self, path: PathBuf) {
        if self.active.load(Ordering::SeqCst) {
            log::debug!("Audio capture already active, ignoring start");
            return;
        }

        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            self.fail(CaptureError::NoInputDevice.to_string());
            return;
        };

        let (stream_config, sample_format) = match pick_stream_config(&device) {
            Ok(picked) => picked,
            Err(e) => {
                self.fail(e.to_string());
                return;
            }
        };

        let spec = WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = match WavWriter::create(&path, spec) {
            Ok(w) => w,
            Err(e) => {
                self.fail(CaptureError::Encoding(e.to_string()).to_string());
                return;
            }
        };

        let config = self.config.snapshot();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(CaptureSink {
            writer: StdMutex::new(Some(writer)),
            events: self.events.clone(),
            frames_written: AtomicU64::new(0),
            max_frames: (config.max_recording_duration_secs.max(0.0) * SAMPLE_RATE as f32) as u64,
            max_duration_fired: AtomicBool::new(false),
            stop_requested: stop_requested.clone(),
            write_error: StdMutex::new(None),
        });

        let (command_tx, command_rx) = mpsc::channel();
        let events = self.events.clone();
        let active = self.active.clone();
        active.store(true, Ordering::SeqCst);

        log::info!(
            "Audio capture starting: {} ch @ {} Hz -> {}",
            stream_config.channels,
            stream_config.sample_rate.0,
            path.display()
        );

        let min_file_bytes = config.min_audio_file_bytes;
        let min_recording_ms = config.min_recording_ms;
        let thread = thread::spawn(move || {
            run_capture_thread(
                device,
                stream_config,
                sample_format,
                sink,
                command_rx,
                stop_requested,
                events,
                path,
                min_file_bytes,
                min_recording_ms,
            );
            active.store(false, Ordering::SeqCst);
        });

        let mut guard = match self.handle.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(CaptureHandle {
            command_tx,
            _thread: thread,
        });
    }

    fn stop_recording(&self) {
        let handle = {
            let mut guard = match self.handle.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            log::info!("Stopping audio capture");
            // Completion is reported via events; do not join here.
            let _ = handle.command_tx.send(CaptureCommand::Stop);
        }
    }

    fn has_input_device(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn is_recording(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop_recording();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_capture_thread(
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
    sink: Arc<CaptureSink>,
    command_rx: mpsc::Receiver<CaptureCommand>,
    stop_requested: Arc<AtomicBool>,
    events: UnboundedSender<CaptureEvent>,
    path: PathBuf,
    min_file_bytes: u64,
    min_recording_ms: u32,
) {
    use cpal::Sample;

    let err_fn = |err| {
        log::error!("Audio stream error: {}", err);
    };

    let channels = config.channels as usize;
    let stream = match sample_format {
        SampleFormat::F32 => {
            let sink = sink.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    sink.push(data, channels);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let sink = sink.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s.to_float_sample()).collect();
                    sink.push(&samples, channels);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let sink = sink.clone();
            device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s.to_float_sample()).collect();
                    sink.push(&samples, channels);
                },
                err_fn,
                None,
            )
        }
        other => {
            let _ = events.send(CaptureEvent::Failed {
                reason: CaptureError::DeviceConfig(format!("unsupported sample format: {other:?}"))
                    .to_string(),
            });
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = events.send(CaptureEvent::Failed {
                reason: CaptureError::StreamBuild(e.to_string()).to_string(),
            });
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = events.send(CaptureEvent::Failed {
            reason: CaptureError::StreamStart(e.to_string()).to_string(),
        });
        return;
    }

    // Wait for a stop command, the max-duration flag, or a write error.
    loop {
        if stop_requested.load(Ordering::SeqCst) {
            break;
        }
        match command_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(CaptureCommand::Stop) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Stop delivering callbacks before finalizing the file.
    drop(stream);

    finalize_recording(&sink, &events, &path, min_file_bytes, min_recording_ms);
}

/// Finalize the WAV file and classify the outcome.
fn finalize_recording(
    sink: &CaptureSink,
    events: &UnboundedSender<CaptureEvent>,
    path: &std::path::Path,
    min_file_bytes: u64,
    min_recording_ms: u32,
) {
    let writer = {
        let mut guard = match sink.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    };

    if let Some(writer) = writer {
        if let Err(e) = writer.finalize() {
            let _ = events.send(CaptureEvent::Failed {
                reason: CaptureError::Encoding(e.to_string()).to_string(),
            });
            return;
        }
    }

    if let Some(err) = sink.take_error() {
        let _ = events.send(CaptureEvent::Failed {
            reason: CaptureError::Encoding(err).to_string(),
        });
        return;
    }

    let frames = sink.frames_written.load(Ordering::SeqCst);
    let duration_ms = frames * 1000 / SAMPLE_RATE as u64;
    if duration_ms < min_recording_ms as u64 {
        // Advisory only: rejection happens on file size below.
        log::warn!(
            "Recording is very short ({} ms < {} ms)",
            duration_ms,
            min_recording_ms
        );
    }

    let file_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if file_bytes < min_file_bytes {
        log::warn!(
            "Recording file is implausibly small ({} bytes), treating as empty",
            file_bytes
        );
        let _ = events.send(CaptureEvent::Failed {
            reason: "no audio captured".to_string(),
        });
        return;
    }

    log::info!(
        "Audio capture complete: {} bytes, {:.2}s",
        file_bytes,
        frames as f64 / SAMPLE_RATE as f64
    );
    let _ = events.send(CaptureEvent::Completed {
        path: path.to_path_buf(),
    });
}
