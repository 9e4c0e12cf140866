//! The dictation session orchestrator.
//!
//! One session at a time, from either trigger source. The session owns the
//! record -> transcribe -> post-process -> deliver pipeline and guarantees
//! cleanup on every exit path: the temp WAV is removed, the engine returns
//! to a resting state, and session ownership is cleared.

use crate::audio_capture::{CaptureControl, CaptureEvent};
use crate::config::ConfigStore;
use crate::delivery::{DeliveryError, TextDelivery};
use crate::engine::{EngineState, EngineStateMachine, Transcriber, TranscriptionError};
use crate::events::{publish, CoreEvent, EventSender};
use crate::history::{HistoryItem, HistorySink};
use crate::llm::{DictationMode, PostProcessor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where a start/stop request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    /// Global shortcut press.
    Shortcut,
    /// Button in the interface.
    Interface,
}

impl std::fmt::Display for SessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionSource::Shortcut => f.write_str("shortcut"),
            SessionSource::Interface => f.write_str("interface"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A dictation session is already active")]
    AlreadyActive,

    #[error("No audio input device available")]
    NoInputDevice,

    #[error("Recognizer is not configured")]
    NotConfigured,

    #[error("No recording in progress")]
    NotRecording,

    #[error("Model activation in progress")]
    ModelActivating,

    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),
}

/// Human-readable status for each engine state.
pub fn status_text(state: EngineState) -> &'static str {
    match state {
        EngineState::Idle => "Idle",
        EngineState::Loading => "Loading model…",
        EngineState::Ready => "Ready",
        EngineState::Recording => "Listening…",
        EngineState::Processing => "Transcribing…",
        EngineState::Error => "Error",
    }
}

struct ActiveSession {
    source: SessionSource,
    started_at: Instant,
    cancel: CancellationToken,
    audio_path: PathBuf,
}

enum PipelineOutcome {
    Delivered,
    NoSpeech,
    Cancelled,
    Failed { reason: String, configuration: bool },
}

pub struct DictationSession {
    engine: Arc<EngineStateMachine>,
    capture: Arc<dyn CaptureControl>,
    transcriber: Arc<dyn Transcriber>,
    post: Arc<PostProcessor>,
    delivery: Arc<dyn TextDelivery>,
    history: Option<Arc<dyn HistorySink>>,
    config: ConfigStore,
    events: EventSender,
    active_mode: StdMutex<DictationMode>,
    active: StdMutex<Option<ActiveSession>>,
}

impl DictationSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<EngineStateMachine>,
        capture: Arc<dyn CaptureControl>,
        transcriber: Arc<dyn Transcriber>,
        post: Arc<PostProcessor>,
        delivery: Arc<dyn TextDelivery>,
        history: Option<Arc<dyn HistorySink>>,
        config: ConfigStore,
        events: EventSender,
    ) -> Self {
        Self {
            engine,
            capture,
            transcriber,
            post,
            delivery,
            history,
            config,
            events,
            active_mode: StdMutex::new(DictationMode::raw()),
            active: StdMutex::new(None),
        }
    }

    /// Switch the dictation mode used for post-processing.
    pub fn set_mode(&self, mode: DictationMode) {
        let mut guard = self
            .active_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        log::info!("Dictation mode set to {}", mode.id);
        *guard = mode;
    }

    /// Begin a recording session.
    ///
    /// Rejection is based on engine state: any request arriving while the
    /// engine is `Recording` or `Processing` fails with `AlreadyActive`,
    /// regardless of which source started the running session. Ownership and
    /// the engine transition are claimed under the lock, before any capture
    /// work starts, so two racing triggers cannot both pass the check.
    pub fn start(&self, source: SessionSource) -> Result<PathBuf, SessionError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let state = self.engine.state();
        if matches!(state, EngineState::Recording | EngineState::Processing) || active.is_some() {
            log::debug!("Rejecting start from {}: engine is {}", source, state);
            return Err(SessionError::AlreadyActive);
        }
        // While Loading, the engine ignores a Recording request; accepting the
        // start would run capture the engine never acknowledges.
        if state == EngineState::Loading {
            log::debug!("Rejecting start from {}: model activation in progress", source);
            return Err(SessionError::ModelActivating);
        }
        if !self.capture.has_input_device() {
            return Err(SessionError::NoInputDevice);
        }
        if !self.config.snapshot().is_configured() {
            return Err(SessionError::NotConfigured);
        }

        let audio_path = std::env::temp_dir().join(format!("sotto_rec_{}.wav", Uuid::new_v4()));
        self.engine.set_state(EngineState::Recording)?;
        *active = Some(ActiveSession {
            source,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            audio_path: audio_path.clone(),
        });
        drop(active);

        log::info!("Recording started from {} -> {}", source, audio_path.display());
        self.capture.start_recording(audio_path.clone());
        publish(
            &self.events,
            CoreEvent::SessionStatusChanged(status_text(EngineState::Recording)),
        );
        Ok(audio_path)
    }

    /// Stop the current recording and hand off to transcription.
    ///
    /// Either source may stop a session; the owner field is diagnostic.
    /// Returns immediately. The pipeline continues when the capture layer
    /// delivers its completion event.
    pub fn stop(&self, source: SessionSource) -> Result<(), SessionError> {
        let active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let session = match active.as_ref() {
            Some(session) if self.engine.state() == EngineState::Recording => session,
            _ => return Err(SessionError::NotRecording),
        };
        if session.source != source {
            log::debug!("Session started by {} stopped by {}", session.source, source);
        }
        log::info!(
            "Recording stopped after {:?}",
            session.started_at.elapsed()
        );
        drop(active);

        self.engine.set_state(EngineState::Processing)?;
        publish(
            &self.events,
            CoreEvent::SessionStatusChanged(status_text(EngineState::Processing)),
        );
        self.capture.stop_recording();
        Ok(())
    }

    /// Abort the current session. The transcript, if any, is discarded.
    pub fn cancel(&self) {
        let active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(session) = active.as_ref() {
            log::info!(
                "Cancelling session started by {} ({})",
                session.source,
                session.audio_path.display()
            );
            session.cancel.cancel();
        }
        drop(active);
        self.capture.stop_recording();
    }

    /// Consume capture events until the channel closes. Run this once, on
    /// the session's owning task.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<CaptureEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                CaptureEvent::Level(level) => {
                    publish(&self.events, CoreEvent::AudioLevel(level));
                }
                CaptureEvent::MaxDurationReached => {
                    log::info!("Max recording duration reached, stopping");
                    publish(&self.events, CoreEvent::MaxDurationReached);
                }
                CaptureEvent::Completed { path } => {
                    publish(&self.events, CoreEvent::RecordingCompleted(path.clone()));
                    self.on_capture_complete(path).await;
                }
                CaptureEvent::Failed { reason } => {
                    log::error!("Capture failed: {}", reason);
                    publish(&self.events, CoreEvent::RecordingFailed(reason));
                    self.finish_without_audio().await;
                }
            }
        }
        log::debug!("Capture event channel closed, session loop exiting");
    }

    /// Capture failed before producing usable audio: reset and clear.
    /// The capture layer may still have left a partial file behind.
    async fn finish_without_audio(&self) {
        let path = {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            active.take().map(|session| session.audio_path)
        };
        if let Some(path) = path {
            remove_temp_file(&path).await;
        }

        if matches!(
            self.engine.state(),
            EngineState::Recording | EngineState::Processing
        ) {
            let _ = self.engine.set_state(EngineState::Ready);
        }
        publish(&self.events, CoreEvent::SessionStatusChanged("Error"));
    }

    async fn on_capture_complete(&self, path: PathBuf) {
        // The guard must not live across an await; clone the token out first.
        let cancel = {
            let active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            active.as_ref().map(|session| session.cancel.clone())
        };
        let Some(cancel) = cancel else {
            // Completion raced a cleanup; nothing owns this file.
            log::warn!("Capture completed with no active session");
            remove_temp_file(&path).await;
            return;
        };

        // Auto-stop (max duration) completes without a stop() call, so the
        // engine may still be Recording here.
        if self.engine.state() == EngineState::Recording {
            let _ = self.engine.set_state(EngineState::Processing);
            publish(
                &self.events,
                CoreEvent::SessionStatusChanged(status_text(EngineState::Processing)),
            );
        }

        let outcome = self.run_pipeline(&path, &cancel).await;

        // Cleanup runs for every outcome.
        remove_temp_file(&path).await;

        let status = match &outcome {
            PipelineOutcome::Delivered => {
                let _ = self.engine.set_state(EngineState::Ready);
                "Ready"
            }
            PipelineOutcome::NoSpeech => {
                log::info!("No speech detected");
                let _ = self.engine.set_state(EngineState::Ready);
                "No speech detected"
            }
            PipelineOutcome::Cancelled => {
                log::info!("Session cancelled, transcript discarded");
                let _ = self.engine.set_state(EngineState::Ready);
                "Cancelled"
            }
            PipelineOutcome::Failed {
                reason,
                configuration,
            } => {
                log::error!("Dictation pipeline failed: {}", reason);
                let next = if *configuration {
                    EngineState::Error
                } else {
                    EngineState::Ready
                };
                let _ = self.engine.set_state(next);
                "Error"
            }
        };

        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = None;
        drop(active);

        publish(&self.events, CoreEvent::SessionStatusChanged(status));
    }

    async fn run_pipeline(&self, path: &Path, cancel: &CancellationToken) -> PipelineOutcome {
        let config = self.config.snapshot();
        let timeout = Duration::from_secs(config.transcription_timeout_secs);
        let started = Instant::now();

        // Bounded retry: retry_limit extra attempts for transient failures.
        let mut attempt: u32 = 0;
        let transcription = loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TranscriptionError::Cancelled),
                result = self.transcriber.transcribe(path, timeout) => result,
            };

            match result {
                Ok(transcription) => break transcription,
                Err(TranscriptionError::Cancelled) => return PipelineOutcome::Cancelled,
                Err(e) if e.is_terminal() => {
                    return PipelineOutcome::Failed {
                        configuration: matches!(e, TranscriptionError::NotConfigured(_)),
                        reason: e.to_string(),
                    };
                }
                Err(e) if attempt > config.retry_limit => {
                    log::error!("Transcription failed after {} attempts: {}", attempt, e);
                    return PipelineOutcome::Failed {
                        reason: e.to_string(),
                        configuration: false,
                    };
                }
                Err(e) => {
                    log::warn!("Transcription attempt {} failed, retrying: {}", attempt, e);
                }
            }
        };

        if transcription.text.trim().is_empty() {
            return PipelineOutcome::NoSpeech;
        }

        let mode = self
            .active_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let text = self.post.process(&transcription.text, &mode, cancel).await;

        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled;
        }

        match self.delivery.deliver(&text, cancel).await {
            Ok(()) => {}
            Err(DeliveryError::Cancelled) => return PipelineOutcome::Cancelled,
            Err(e) => {
                return PipelineOutcome::Failed {
                    reason: e.to_string(),
                    configuration: false,
                };
            }
        }

        if let Some(history) = &self.history {
            let item = HistoryItem::new(
                text,
                transcription.duration_seconds,
                started.elapsed().as_millis() as u64,
            );
            let history = history.clone();
            tokio::spawn(async move {
                if let Err(e) = history.record(item).await {
                    log::warn!("Failed to record history entry: {}", e);
                }
            });
        }

        PipelineOutcome::Delivered
    }
}

async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed temp recording {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::TranscriptionResult;
    use crate::events::event_channel;
    use crate::llm::ProviderRouter;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockCapture {
        has_device: bool,
        recording: AtomicBool,
        starts: StdMutex<Vec<PathBuf>>,
        stops: AtomicUsize,
    }

    impl MockCapture {
        fn new(has_device: bool) -> Arc<Self> {
            Arc::new(Self {
                has_device,
                recording: AtomicBool::new(false),
                starts: StdMutex::new(Vec::new()),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl CaptureControl for MockCapture {
        fn start_recording(&self, path: PathBuf) {
            self.recording.store(true, Ordering::SeqCst);
            self.starts.lock().unwrap().push(path);
        }

        fn stop_recording(&self) {
            self.recording.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn has_input_device(&self) -> bool {
            self.has_device
        }

        fn is_recording(&self) -> bool {
            self.recording.load(Ordering::SeqCst)
        }
    }

    struct MockTranscriber {
        results: StdMutex<VecDeque<Result<TranscriptionResult, TranscriptionError>>>,
        calls: AtomicUsize,
    }

    impl MockTranscriber {
        fn scripted(
            results: Vec<Result<TranscriptionResult, TranscriptionError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                results: StdMutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn ok(text: &str) -> Arc<Self> {
            Self::scripted(vec![Ok(TranscriptionResult {
                text: text.to_string(),
                duration_seconds: 1.5,
            })])
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transcriber for MockTranscriber {
        async fn transcribe(
            &self,
            _audio_path: &Path,
            _timeout: Duration,
        ) -> Result<TranscriptionResult, TranscriptionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(TranscriptionResult {
                        text: "unscripted".to_string(),
                        duration_seconds: 0.0,
                    })
                })
        }
    }

    struct MockDelivery {
        delivered: StdMutex<Vec<String>>,
        fail: bool,
    }

    impl MockDelivery {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: StdMutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                delivered: StdMutex::new(Vec::new()),
                fail: true,
            })
        }

        fn texts(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TextDelivery for MockDelivery {
        async fn deliver(
            &self,
            text: &str,
            cancel: &CancellationToken,
        ) -> Result<(), DeliveryError> {
            if cancel.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }
            if self.fail {
                return Err(DeliveryError::Inject("no input backend".to_string()));
            }
            self.delivered.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct MockHistory {
        items: StdMutex<Vec<HistoryItem>>,
    }

    #[async_trait]
    impl HistorySink for MockHistory {
        async fn record(&self, item: HistoryItem) -> std::io::Result<()> {
            self.items.lock().unwrap().push(item);
            Ok(())
        }
    }

    struct Harness {
        session: Arc<DictationSession>,
        capture: Arc<MockCapture>,
        transcriber: Arc<MockTranscriber>,
        delivery: Arc<MockDelivery>,
        engine: Arc<EngineStateMachine>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(
        has_device: bool,
        transcriber: Arc<MockTranscriber>,
        delivery: Arc<MockDelivery>,
        history: Option<Arc<dyn HistorySink>>,
    ) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().expect("tempdir");
        let recognizer = dir.path().join("recognizer");
        let model = dir.path().join("model.bin");
        std::fs::write(&recognizer, b"#!/bin/sh\n").expect("write");
        std::fs::write(&model, b"weights").expect("write");

        let config = ConfigStore::new(EngineConfig {
            recognizer_path: recognizer,
            models_dir: dir.path().to_path_buf(),
            default_model_path: model,
            ..EngineConfig::default()
        });

        let (events, _rx) = event_channel();
        let engine = Arc::new(EngineStateMachine::new(config.clone(), events.clone()));
        let capture = MockCapture::new(has_device);
        let post = Arc::new(PostProcessor::new(ProviderRouter::new(vec![])));

        let session = Arc::new(DictationSession::new(
            engine.clone(),
            capture.clone(),
            transcriber.clone(),
            post,
            delivery.clone(),
            history,
            config,
            events,
        ));
        Harness {
            session,
            capture,
            transcriber,
            delivery,
            engine,
            _dir: dir,
        }
    }

    fn harness(transcriber: Arc<MockTranscriber>) -> Harness {
        harness_with(true, transcriber, MockDelivery::new(), None)
    }

    #[test]
    fn test_status_text_mapping() {
        assert_eq!(status_text(EngineState::Recording), "Listening…");
        assert_eq!(status_text(EngineState::Processing), "Transcribing…");
        assert_eq!(status_text(EngineState::Ready), "Ready");
    }

    #[tokio::test]
    async fn test_second_start_rejected_regardless_of_source() {
        let h = harness(MockTranscriber::ok("hello"));

        h.session.start(SessionSource::Shortcut).expect("start");
        assert_eq!(h.engine.state(), EngineState::Recording);

        let err = h.session.start(SessionSource::Interface).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));
        let err = h.session.start(SessionSource::Shortcut).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));
    }

    #[tokio::test]
    async fn test_start_without_input_device_leaves_engine_ready() {
        let h = harness_with(
            false,
            MockTranscriber::ok("hello"),
            MockDelivery::new(),
            None,
        );

        let err = h.session.start(SessionSource::Shortcut).unwrap_err();
        assert!(matches!(err, SessionError::NoInputDevice));
        assert_eq!(h.engine.state(), EngineState::Ready);
        assert!(h.capture.starts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_recording_is_rejected() {
        let h = harness(MockTranscriber::ok("hello"));
        let err = h.session.stop(SessionSource::Shortcut).unwrap_err();
        assert!(matches!(err, SessionError::NotRecording));
    }

    #[tokio::test]
    async fn test_either_source_may_stop() {
        let h = harness(MockTranscriber::ok("hello"));
        h.session.start(SessionSource::Shortcut).expect("start");

        h.session.stop(SessionSource::Interface).expect("stop");
        assert_eq!(h.engine.state(), EngineState::Processing);
        assert_eq!(h.capture.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_happy_path_delivers_and_cleans_up() {
        let h = harness(MockTranscriber::ok("hello world"));

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        std::fs::write(&path, b"RIFFfake").expect("write");
        h.session.stop(SessionSource::Shortcut).expect("stop");

        h.session.on_capture_complete(path.clone()).await;

        assert_eq!(h.delivery.texts(), vec!["hello world".to_string()]);
        assert!(!path.exists());
        assert_eq!(h.engine.state(), EngineState::Ready);
        // Ownership is cleared, so a new session can start.
        h.session.start(SessionSource::Interface).expect("restart");
    }

    #[tokio::test]
    async fn test_empty_transcript_is_no_speech() {
        let h = harness(MockTranscriber::ok("   "));

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        h.session.stop(SessionSource::Shortcut).expect("stop");
        h.session.on_capture_complete(path).await;

        assert!(h.delivery.texts().is_empty());
        assert_eq!(h.engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_not_configured_fails_without_retry_and_enters_error() {
        let h = harness(MockTranscriber::scripted(vec![Err(
            TranscriptionError::NotConfigured("model gone".to_string()),
        )]));

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        h.session.stop(SessionSource::Shortcut).expect("stop");
        h.session.on_capture_complete(path).await;

        assert_eq!(h.transcriber.call_count(), 1);
        assert_eq!(h.engine.state(), EngineState::Error);
        assert!(h.delivery.texts().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_terminal() {
        let h = harness(MockTranscriber::scripted(vec![Err(
            TranscriptionError::Timeout(Duration::from_secs(120)),
        )]));

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        h.session.stop(SessionSource::Shortcut).expect("stop");
        h.session.on_capture_complete(path).await;

        assert_eq!(h.transcriber.call_count(), 1);
        assert_eq!(h.engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_success() {
        let h = harness(MockTranscriber::scripted(vec![
            Err(TranscriptionError::Process("flaky".to_string())),
            Err(TranscriptionError::Process("flaky".to_string())),
            Ok(TranscriptionResult {
                text: "third time".to_string(),
                duration_seconds: 1.0,
            }),
        ]));

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        h.session.stop(SessionSource::Shortcut).expect("stop");
        h.session.on_capture_complete(path).await;

        // retry_limit 2 allows three attempts total.
        assert_eq!(h.transcriber.call_count(), 3);
        assert_eq!(h.delivery.texts(), vec!["third time".to_string()]);
        assert_eq!(h.engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_cleanly() {
        let h = harness(MockTranscriber::scripted(vec![
            Err(TranscriptionError::Process("down".to_string())),
            Err(TranscriptionError::Process("down".to_string())),
            Err(TranscriptionError::Process("down".to_string())),
            Err(TranscriptionError::Process("down".to_string())),
        ]));

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        h.session.stop(SessionSource::Shortcut).expect("stop");
        h.session.on_capture_complete(path).await;

        assert_eq!(h.transcriber.call_count(), 3);
        assert!(h.delivery.texts().is_empty());
        assert_eq!(h.engine.state(), EngineState::Ready);
        h.session.start(SessionSource::Shortcut).expect("restart");
    }

    #[tokio::test]
    async fn test_cancel_discards_transcript() {
        let h = harness(MockTranscriber::ok("should be discarded"));

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        h.session.cancel();
        h.session.on_capture_complete(path).await;

        assert_eq!(h.transcriber.call_count(), 0);
        assert!(h.delivery.texts().is_empty());
        assert_eq!(h.engine.state(), EngineState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_during_model_activation_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recognizer = dir.path().join("recognizer");
        let model = dir.path().join("model.bin");
        std::fs::write(&recognizer, b"#!/bin/sh\n").expect("write");
        std::fs::write(&model, b"weights").expect("write");
        let config = ConfigStore::new(EngineConfig {
            recognizer_path: recognizer,
            models_dir: dir.path().to_path_buf(),
            default_model_path: model.clone(),
            ..EngineConfig::default()
        });

        let (events, _rx) = event_channel();
        let engine = Arc::new(
            EngineStateMachine::new(config.clone(), events.clone())
                .with_activation_settle(Duration::from_secs(5)),
        );
        let capture = MockCapture::new(true);
        let session = Arc::new(DictationSession::new(
            engine.clone(),
            capture.clone(),
            MockTranscriber::ok("hello"),
            Arc::new(PostProcessor::new(ProviderRouter::new(vec![]))),
            MockDelivery::new(),
            None,
            config,
            events,
        ));

        let activation = {
            let engine = engine.clone();
            let model = model.clone();
            tokio::spawn(async move { engine.activate_model(&model).await })
        };
        while engine.state() != EngineState::Loading {
            tokio::task::yield_now().await;
        }

        // A start during activation must be rejected, not silently ignored.
        let err = session.start(SessionSource::Shortcut).unwrap_err();
        assert!(matches!(err, SessionError::ModelActivating));
        assert!(capture.starts.lock().unwrap().is_empty());
        assert!(!capture.is_recording());

        activation.await.expect("join").expect("activation");
        assert_eq!(engine.state(), EngineState::Ready);
        session.start(SessionSource::Shortcut).expect("start after activation");
    }

    struct HangingTranscriber;

    #[async_trait]
    impl Transcriber for HangingTranscriber {
        async fn transcribe(
            &self,
            _audio_path: &Path,
            _timeout: Duration,
        ) -> Result<TranscriptionResult, TranscriptionError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_transcription_short_circuits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recognizer = dir.path().join("recognizer");
        let model = dir.path().join("model.bin");
        std::fs::write(&recognizer, b"#!/bin/sh\n").expect("write");
        std::fs::write(&model, b"weights").expect("write");
        let config = ConfigStore::new(EngineConfig {
            recognizer_path: recognizer,
            models_dir: dir.path().to_path_buf(),
            default_model_path: model,
            ..EngineConfig::default()
        });

        let (events, _rx) = event_channel();
        let engine = Arc::new(EngineStateMachine::new(config.clone(), events.clone()));
        let delivery = MockDelivery::new();
        let session = Arc::new(DictationSession::new(
            engine.clone(),
            MockCapture::new(true),
            Arc::new(HangingTranscriber),
            Arc::new(PostProcessor::new(ProviderRouter::new(vec![]))),
            delivery.clone(),
            None,
            config,
            events,
        ));

        let path = session.start(SessionSource::Shortcut).expect("start");
        std::fs::write(&path, b"RIFFfake").expect("write");
        session.stop(SessionSource::Shortcut).expect("stop");

        let pipeline = {
            let session = session.clone();
            let path = path.clone();
            tokio::spawn(async move { session.on_capture_complete(path).await })
        };
        tokio::task::yield_now().await;
        session.cancel();
        pipeline.await.expect("join");

        assert!(delivery.texts().is_empty());
        assert!(!path.exists());
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_terminal() {
        let h = harness_with(
            true,
            MockTranscriber::ok("hello"),
            MockDelivery::failing(),
            None,
        );

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        std::fs::write(&path, b"RIFFfake").expect("write");
        h.session.stop(SessionSource::Shortcut).expect("stop");
        h.session.on_capture_complete(path.clone()).await;

        // Cleanup still ran despite the failure.
        assert!(!path.exists());
        assert_eq!(h.engine.state(), EngineState::Ready);
        h.session.start(SessionSource::Shortcut).expect("restart");
    }

    #[tokio::test]
    async fn test_capture_failure_resets_session() {
        let h = harness(MockTranscriber::ok("hello"));

        h.session.start(SessionSource::Shortcut).expect("start");
        h.session.finish_without_audio().await;

        assert_eq!(h.engine.state(), EngineState::Ready);
        assert_eq!(h.transcriber.call_count(), 0);
        h.session.start(SessionSource::Interface).expect("restart");
    }

    #[tokio::test]
    async fn test_capture_failure_removes_temp_file() {
        let h = harness(MockTranscriber::ok("hello"));

        // An undersized recording fails capture but still exists on disk.
        let path = h.session.start(SessionSource::Shortcut).expect("start");
        std::fs::write(&path, b"RIFFtiny").expect("write");
        h.session.finish_without_audio().await;

        assert!(!path.exists());
        assert_eq!(h.engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_history_records_delivered_text() {
        let history = Arc::new(MockHistory {
            items: StdMutex::new(Vec::new()),
        });
        let h = harness_with(
            true,
            MockTranscriber::ok("for the record"),
            MockDelivery::new(),
            Some(history.clone()),
        );

        let path = h.session.start(SessionSource::Shortcut).expect("start");
        h.session.stop(SessionSource::Shortcut).expect("stop");
        h.session.on_capture_complete(path).await;

        // The history write is a spawned task; give it a chance to run.
        for _ in 0..100 {
            if !history.items.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let items = history.items.lock().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].transcript, "for the record");
        assert!((items[0].duration_secs - 1.5).abs() < f64::EPSILON);
    }
}
