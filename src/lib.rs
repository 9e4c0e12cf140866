//! Core library for sotto, a local-first voice dictation pipeline.
//!
//! The shell application (GUI, hotkeys, settings UI) sits on top of this
//! crate. The crate owns the full dictation path: microphone capture to a
//! temp WAV, engine state, child-process speech recognition, optional LLM
//! cleanup, and keyboard delivery of the final text.

pub mod audio_capture;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod events;
pub mod history;
pub mod llm;
pub mod session;

pub use audio_capture::{AudioCapture, CaptureControl, CaptureEvent};
pub use config::{ConfigStore, EngineConfig};
pub use delivery::{KeyboardDelivery, TextDelivery};
pub use engine::{EngineState, EngineStateMachine, Transcriber, TranscriptionResult};
pub use events::{event_channel, CoreEvent, EventReceiver, EventSender};
pub use history::{HistoryItem, HistorySink, JsonHistory};
pub use llm::{DictationMode, LlmProvider, PostProcessor, ProviderRouter};
pub use session::{status_text, DictationSession, SessionSource};
