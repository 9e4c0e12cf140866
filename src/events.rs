//! Events exposed to the shell/observability collaborator.
//!
//! Two channel kinds with different consumption semantics:
//!
//! - [`CoreEvent`] fans out over a `tokio::sync::broadcast` channel. Any
//!   number of observers (level meters, status labels, tray icons) may
//!   subscribe; a lagging subscriber loses old events, which is acceptable
//!   because every event is either transient (levels) or superseded by the
//!   next state change.
//! - Capture completion flows over a dedicated single-consumer mpsc channel
//!   owned by the session orchestrator (see `audio_capture::CaptureEvent`).
//!   That channel must never drop events, so it is not a broadcast.

use crate::engine::EngineState;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Buffered events per subscriber before lag kicks in.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events the core publishes for the GUI collaborator.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// The engine's authoritative state changed.
    EngineStateChanged(EngineState),
    /// Normalized input level in [0, 1], emitted continuously while recording.
    AudioLevel(f32),
    /// A recording finished and its WAV file is ready.
    RecordingCompleted(PathBuf),
    /// A recording failed; the string is user-facing.
    RecordingFailed(String),
    /// The max-duration timer fired; the stop itself completes asynchronously.
    MaxDurationReached,
    /// Human-readable session status ("Listening…", "Transcribing…", ...).
    SessionStatusChanged(&'static str),
}

pub type EventSender = broadcast::Sender<CoreEvent>;
pub type EventReceiver = broadcast::Receiver<CoreEvent>;

/// Create the fan-out event channel.
///
/// The constructing context owns the sender and hands it to the components
/// that publish; subscribers call `sender.subscribe()`.
pub fn event_channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Publish an event, ignoring the no-subscriber case.
///
/// The core must keep working when nothing is listening (e.g. headless tests).
pub fn publish(sender: &EventSender, event: CoreEvent) {
    let _ = sender.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let (tx, rx) = event_channel();
        drop(rx);
        publish(&tx, CoreEvent::MaxDurationReached);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_subscribers() {
        let (tx, mut rx1) = event_channel();
        let mut rx2 = tx.subscribe();

        publish(&tx, CoreEvent::AudioLevel(0.5));

        assert!(matches!(rx1.recv().await, Ok(CoreEvent::AudioLevel(_))));
        assert!(matches!(rx2.recv().await, Ok(CoreEvent::AudioLevel(_))));
    }
}
