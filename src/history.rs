//! Dictation history persistence.
//!
//! The session records each completed dictation fire-and-forget; a failed
//! write never affects delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One completed dictation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: Uuid,
    pub transcript: String,
    pub timestamp: DateTime<Utc>,
    /// Length of the recorded audio, in seconds.
    pub duration_secs: f64,
    /// Wall-clock time from capture completion to delivery.
    pub processing_time_ms: u64,
}

impl HistoryItem {
    pub fn new(transcript: String, duration_secs: f64, processing_time_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            transcript,
            timestamp: Utc::now(),
            duration_secs,
            processing_time_ms,
        }
    }
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, item: HistoryItem) -> std::io::Result<()>;
}

/// Newest-first JSON array on disk.
pub struct JsonHistory {
    path: PathBuf,
}

impl JsonHistory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn load(&self) -> Vec<HistoryItem> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                // A corrupt file starts over rather than blocking new entries.
                log::warn!("History file unreadable, starting fresh: {}", e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl HistorySink for JsonHistory {
    async fn record(&self, item: HistoryItem) -> std::io::Result<()> {
        let mut items = self.load().await;
        items.insert(0, item);

        let json = serde_json::to_string_pretty(&items)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.path, json).await
    }
}
