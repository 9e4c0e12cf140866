//! Text delivery into the focused application.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Text injection failed: {0}")]
    Inject(String),

    #[error("Delivery cancelled")]
    Cancelled,
}

/// Seam between the session and the platform input layer, mockable in tests.
#[async_trait]
pub trait TextDelivery: Send + Sync {
    async fn deliver(&self, text: &str, cancel: &CancellationToken) -> Result<(), DeliveryError>;
}

/// Types the transcript into whatever window has keyboard focus.
pub struct KeyboardDelivery;

#[async_trait]
impl TextDelivery for KeyboardDelivery {
    async fn deliver(&self, text: &str, cancel: &CancellationToken) -> Result<(), DeliveryError> {
        if cancel.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }
        if text.is_empty() {
            return Ok(());
        }

        log::info!("Delivering {} chars via keyboard injection", text.len());

        // enigo is synchronous and must not block the runtime.
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            use enigo::{Enigo, Keyboard, Settings};

            let mut enigo = Enigo::new(&Settings::default())
                .map_err(|e| DeliveryError::Inject(format!("input backend init: {}", e)))?;
            enigo
                .text(&text)
                .map_err(|e| DeliveryError::Inject(format!("text injection: {}", e)))
        })
        .await
        .map_err(|e| DeliveryError::Inject(format!("injection task panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_token_skips_injection() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = KeyboardDelivery
            .deliver("hello", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_text_is_a_no_op() {
        let result = KeyboardDelivery.deliver("", &CancellationToken::new()).await;
        assert!(result.is_ok());
    }
}
