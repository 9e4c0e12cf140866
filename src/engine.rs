//! The transcription engine: one authoritative state machine, a transactional
//! model-activation operation, and the external-recognizer primitive.
//!
//! All engine state mutations funnel through this object. Ordinary
//! Ready/Recording/Processing/Error transitions are driven by the session
//! orchestrator from a single logical thread of control; only the
//! model-activation path needs real mutual exclusion, and it uses a
//! bounded-wait lock so an interactive caller gets a fast rejection instead
//! of queueing behind another activation.

use crate::config::ConfigStore;
use crate::events::{publish, CoreEvent, EventSender};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex as TokioMutex;

/// How long `activate_model` waits for the activation lock before rejecting.
const ACTIVATION_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Brief settle delay after verifying the target model, before committing.
/// Guards callers that poll engine state immediately after requesting a switch.
const ACTIVATION_SETTLE: Duration = Duration::from_millis(600);

/// The engine's operating states.
///
/// `Loading` is reachable only through [`EngineStateMachine::activate_model`];
/// requesting it via [`EngineStateMachine::set_state`] is a contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Loading,
    Ready,
    Recording,
    Processing,
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "Idle",
            EngineState::Loading => "Loading",
            EngineState::Ready => "Ready",
            EngineState::Recording => "Recording",
            EngineState::Processing => "Processing",
            EngineState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Errors from state transitions and model activation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Loading is an internal transition and cannot be requested")]
    LoadingIsInternal,

    #[error("Engine is busy ({0})")]
    Busy(EngineState),

    #[error("Another model activation is in progress")]
    ActivationLockTimeout,

    #[error("Model file not found: {0}")]
    ModelNotFound(String),
}

/// Errors from the recognizer primitive.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("Recognizer is not configured: {0}")]
    NotConfigured(String),

    #[error("Transcription timed out after {0:?}")]
    Timeout(Duration),

    #[error("Recognizer failed: {0}")]
    Process(String),

    #[error("Audio I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transcription cancelled")]
    Cancelled,
}

impl TranscriptionError {
    /// Terminal failures are never retried by the session: a missing
    /// recognizer/model will not appear between attempts, a timed-out
    /// process was already force-killed, and cancellation is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TranscriptionError::NotConfigured(_)
                | TranscriptionError::Timeout(_)
                | TranscriptionError::Cancelled
        )
    }
}

/// One completed recognizer run.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    /// Duration of the transcribed audio, in seconds.
    pub duration_seconds: f64,
}

/// Seam between the orchestrator and the recognizer, mockable in tests.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio_path: &Path,
        timeout: Duration,
    ) -> Result<TranscriptionResult, TranscriptionError>;
}

/// The single authoritative engine state object.
pub struct EngineStateMachine {
    state: StdMutex<EngineState>,
    activation_lock: TokioMutex<()>,
    activation_settle: Duration,
    config: ConfigStore,
    events: EventSender,
}

impl EngineStateMachine {
    /// Construct the engine, probing the configuration once: a complete
    /// configuration starts `Ready`, otherwise the engine stays `Idle`.
    pub fn new(config: ConfigStore, events: EventSender) -> Self {
        let initial = if config.snapshot().is_configured() {
            EngineState::Ready
        } else {
            EngineState::Idle
        };
        log::info!("Engine initialized in state {}", initial);
        Self {
            state: StdMutex::new(initial),
            activation_lock: TokioMutex::new(()),
            activation_settle: ACTIVATION_SETTLE,
            config,
            events,
        }
    }

    /// Override the activation settle delay (used to exercise lock contention).
    pub fn with_activation_settle(mut self, settle: Duration) -> Self {
        self.activation_settle = settle;
        self
    }

    pub fn state(&self) -> EngineState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_configured(&self) -> bool {
        self.config.snapshot().is_configured()
    }

    /// Unconditional internal transition; activation owns these.
    fn force_state(&self, next: EngineState) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *guard != next {
            log::debug!("Engine state {} -> {}", *guard, next);
            *guard = next;
            publish(&self.events, CoreEvent::EngineStateChanged(next));
        }
    }

    /// Externally requested transition.
    ///
    /// Requesting `Loading` is a misuse of the API and is rejected loudly.
    /// While an activation holds the engine in `Loading`, external requests
    /// other than `Ready`/`Error` are ignored: the activation will publish
    /// its own outcome.
    pub fn set_state(&self, next: EngineState) -> Result<(), EngineError> {
        if next == EngineState::Loading {
            log::error!("External caller requested Loading; rejecting");
            return Err(EngineError::LoadingIsInternal);
        }

        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if *guard == EngineState::Loading
            && !matches!(next, EngineState::Ready | EngineState::Error)
        {
            log::debug!("Ignoring state request {} while Loading", next);
            return Ok(());
        }

        if *guard != next {
            log::debug!("Engine state {} -> {}", *guard, next);
            *guard = next;
            publish(&self.events, CoreEvent::EngineStateChanged(next));
        }
        Ok(())
    }

    /// Clear an error condition.
    pub fn reset(&self) {
        if self.state() == EngineState::Error {
            self.force_state(EngineState::Ready);
        }
    }

    /// Transactionally switch the default model.
    ///
    /// Either the new model path is verified and committed and the engine
    /// ends `Ready`, or nothing was persisted and the prior externally
    /// visible state is restored. The activation lock is bounded: a second
    /// concurrent activation is rejected after [`ACTIVATION_LOCK_WAIT`]
    /// rather than queued.
    pub async fn activate_model(&self, model_path: &Path) -> Result<(), EngineError> {
        let state = self.state();
        if matches!(state, EngineState::Recording | EngineState::Processing) {
            return Err(EngineError::Busy(state));
        }

        let _guard = tokio::time::timeout(ACTIVATION_LOCK_WAIT, self.activation_lock.lock())
            .await
            .map_err(|_| {
                log::warn!("Model activation lock wait timed out");
                EngineError::ActivationLockTimeout
            })?;
        // Lock released when _guard drops, on every path below.

        let previous = self.state();
        self.force_state(EngineState::Loading);

        if !model_path.is_file() {
            log::error!("Model activation failed: {} missing", model_path.display());
            self.force_state(previous);
            return Err(EngineError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        tokio::time::sleep(self.activation_settle).await;

        self.config
            .commit(|c| c.default_model_path = model_path.to_path_buf());
        log::info!("Activated model {}", model_path.display());

        self.force_state(EngineState::Ready);
        Ok(())
    }

    async fn run_recognizer(
        &self,
        audio_path: &Path,
        timeout: Duration,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let config = self.config.snapshot();

        if !config.recognizer_path.is_file() {
            return Err(TranscriptionError::NotConfigured(format!(
                "recognizer executable missing: {}",
                config.recognizer_path.display()
            )));
        }
        if !config.default_model_path.is_file() {
            return Err(TranscriptionError::NotConfigured(format!(
                "model file missing: {}",
                config.default_model_path.display()
            )));
        }

        let started = Instant::now();
        log::info!(
            "Spawning recognizer for {} (timeout {:?})",
            audio_path.display(),
            timeout
        );

        let mut command = Command::new(&config.recognizer_path);
        command
            .arg("-m")
            .arg(&config.default_model_path)
            .arg("-f")
            .arg(audio_path)
            .arg("-nt")
            .arg("-otxt")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // Own process group so a timeout can take down forked children too.
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| TranscriptionError::Process(format!("failed to spawn: {e}")))?;
        #[cfg(unix)]
        let child_id = child.id();

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(TranscriptionError::Io(e)),
            Err(_) => {
                // The wait future was dropped, and kill_on_drop tears the
                // direct child down; a hung model cannot wedge us. Signal the
                // whole group as well in case the recognizer forked.
                #[cfg(unix)]
                if let Some(pid) = child_id {
                    unsafe {
                        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
                log::warn!("Recognizer timed out after {:?}, killed", timeout);
                return Err(TranscriptionError::Timeout(timeout));
            }
        };

        log::debug!(
            "Recognizer exited with {:?} in {:?}",
            output.status.code(),
            started.elapsed()
        );

        // Prefer the companion text file; stdout parsing is the fallback.
        let companion = companion_txt_path(audio_path);
        let raw_text = if companion.is_file() {
            let text = std::fs::read_to_string(&companion)?;
            if let Err(e) = std::fs::remove_file(&companion) {
                log::warn!("Failed to remove {}: {}", companion.display(), e);
            }
            text
        } else if output.status.success() {
            parse_recognizer_stdout(&String::from_utf8_lossy(&output.stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscriptionError::Process(format!(
                "exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        };

        let text = normalize_transcript(&raw_text);
        let duration_seconds = wav_duration_seconds(audio_path).unwrap_or(0.0);

        log::info!(
            "Transcription complete: {} chars from {:.2}s of audio",
            text.len(),
            duration_seconds
        );
        Ok(TranscriptionResult {
            text,
            duration_seconds,
        })
    }
}

#[async_trait]
impl Transcriber for EngineStateMachine {
    async fn transcribe(
        &self,
        audio_path: &Path,
        timeout: Duration,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        self.run_recognizer(audio_path, timeout).await
    }
}

/// The recognizer writes `<input>.txt` next to the input file.
fn companion_txt_path(audio_path: &Path) -> PathBuf {
    let mut name = audio_path.as_os_str().to_os_string();
    name.push(".txt");
    PathBuf::from(name)
}

/// Extract transcript lines from recognizer stdout, dropping diagnostics.
fn parse_recognizer_stdout(stdout: &str) -> String {
    const DIAGNOSTIC_PREFIXES: [&str; 4] = ["whisper_", "ggml_", "main:", "system_info:"];

    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('['))
        .filter(|line| {
            !DIAGNOSTIC_PREFIXES
                .iter()
                .any(|prefix| line.starts_with(prefix))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip common recognizer hallucination markers and trim.
fn normalize_transcript(text: &str) -> String {
    const FILTERS: [&str; 5] = [
        "[BLANK_AUDIO]",
        "[silence]",
        "(music)",
        "[MUSIC]",
        "(silence)",
    ];

    let mut out = text.to_string();
    for filter in FILTERS {
        out = out.replace(filter, "");
    }
    out.trim().to_string()
}

fn wav_duration_seconds(path: &Path) -> Option<f64> {
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    let frames = reader.duration() as f64;
    Some(frames / spec.sample_rate as f64)
}
