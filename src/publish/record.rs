//! Publication records and where they go.

use crate::error::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

/// File kind assumed when the destination does not report one.
pub const DEFAULT_FILE_KIND: &str = "image/png";

/// One delivered page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub destination_id: i64,
    pub message_id: i64,
    pub filename: String,
    pub file_kind: String,
    pub views: u64,
    pub size_bytes: usize,
    pub published_at: DateTime<Utc>,
}

/// Receives a record for every successful delivery.
///
/// Recording is best effort: a sink error is logged by the publisher and
/// never turns a delivered page into a failure.
#[async_trait]
pub trait PublicationSink: Send + Sync {
    async fn record(&self, record: &PublicationRecord) -> Result<(), RelayError>;
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemoryPublicationSink {
    records: Mutex<Vec<PublicationRecord>>,
}

impl MemoryPublicationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PublicationRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl PublicationSink for MemoryPublicationSink {
    async fn record(&self, record: &PublicationRecord) -> Result<(), RelayError> {
        self.records
            .lock()
            .map_err(|_| RelayError::Internal("publication sink poisoned".into()))?
            .push(record.clone());
        Ok(())
    }
}

/// Writes each record to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublicationSink;

#[async_trait]
impl PublicationSink for LoggingPublicationSink {
    async fn record(&self, record: &PublicationRecord) -> Result<(), RelayError> {
        info!(
            destination_id = record.destination_id,
            message_id = record.message_id,
            filename = %record.filename,
            file_kind = %record.file_kind,
            bytes = record.size_bytes,
            "Publication recorded"
        );
        Ok(())
    }
}
