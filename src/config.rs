//! Engine configuration: immutable snapshots plus an explicit commit step.
//!
//! Components never share a mutable config object. Each operation takes a
//! [`ConfigStore::snapshot`] and works against that copy; the only writer is
//! the transactional model-activation path, which goes through
//! [`ConfigStore::commit`] after verifying the target model file exists.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Default cap on a single recording, in seconds.
pub const DEFAULT_MAX_RECORDING_SECS: f32 = 120.0;

/// Recordings shorter than this are logged as suspiciously short, but not
/// rejected at capture time. Rejection happens on final file size.
pub const DEFAULT_MIN_RECORDING_MS: u32 = 500;

/// A finalized WAV below this size is treated as "no audio captured".
/// 1 KiB is well under any real utterance at 16 kHz mono 16-bit.
pub const DEFAULT_MIN_AUDIO_FILE_BYTES: u64 = 1024;

/// Default wall-clock limit on one recognizer run.
pub const DEFAULT_TRANSCRIPTION_TIMEOUT_SECS: u64 = 120;

/// Default number of retries for transient transcription failures.
pub const DEFAULT_RETRY_LIMIT: u32 = 2;

/// Configuration consumed by the dictation core.
///
/// This mirrors the settings surface owned by the shell application; the core
/// reads it, and writes back only `default_model_path` (via model activation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the external recognizer executable.
    pub recognizer_path: PathBuf,
    /// Directory holding downloaded model files.
    pub models_dir: PathBuf,
    /// Model file used for transcription.
    pub default_model_path: PathBuf,
    /// Maximum recording duration before auto-stop, in seconds.
    pub max_recording_duration_secs: f32,
    /// Advisory minimum recording duration, in milliseconds.
    pub min_recording_ms: u32,
    /// Byte-size floor below which a recording counts as empty.
    pub min_audio_file_bytes: u64,
    /// Wall-clock timeout for one recognizer run, in seconds.
    pub transcription_timeout_secs: u64,
    /// Retries allowed for transient transcription failures.
    pub retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recognizer_path: PathBuf::new(),
            models_dir: PathBuf::new(),
            default_model_path: PathBuf::new(),
            max_recording_duration_secs: DEFAULT_MAX_RECORDING_SECS,
            min_recording_ms: DEFAULT_MIN_RECORDING_MS,
            min_audio_file_bytes: DEFAULT_MIN_AUDIO_FILE_BYTES,
            transcription_timeout_secs: DEFAULT_TRANSCRIPTION_TIMEOUT_SECS,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Whether the recognizer can actually run: executable and model present.
    pub fn is_configured(&self) -> bool {
        self.recognizer_path.is_file() && self.default_model_path.is_file()
    }
}

/// Shared, committed configuration.
///
/// Readers get owned snapshots; a snapshot never changes under its holder.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<EngineConfig>>,
}

impl ConfigStore {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Take an immutable copy of the current configuration.
    pub fn snapshot(&self) -> EngineConfig {
        // A poisoned lock only means a writer panicked mid-commit; the data
        // itself is still a plain struct, so recover it.
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Atomically apply a mutation and publish the new snapshot.
    pub fn commit(&self, apply: impl FnOnce(&mut EngineConfig)) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut guard);
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
