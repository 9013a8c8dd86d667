//! Page delivery with a fixed retry schedule.
//!
//! ## Retry policy
//!
//! A delivery is tried once, then once more after each delay of the
//! schedule (default `[0, 1, 2, 3, 5, 8]` seconds, so seven attempts spread
//! over about 19 seconds). Every destination error is treated as transient:
//! rate limits, gateway errors and dropped connections all clear up on their
//! own often enough that giving up early loses more pages than it saves.
//! When the schedule runs out the page fails with
//! [`RelayError::DeliveryExhausted`], which the dispatcher does not retry
//! again.
//!
//! Each delivery (not each attempt) is one sample in [`PublishStats`].

pub mod destination;
pub mod record;
pub mod stats;

pub use destination::{BotApiDestination, DeliveredMessage, DeliveryError, Destination};
pub use record::{
    LoggingPublicationSink, MemoryPublicationSink, PublicationRecord, PublicationSink,
    DEFAULT_FILE_KIND,
};
pub use stats::{PublishStats, PublishSummary};

use crate::error::RelayError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Delivers pages and records the result.
pub struct Publisher {
    destination: Arc<dyn Destination>,
    schedule: Vec<Duration>,
    sink: Arc<dyn PublicationSink>,
    stats: Arc<PublishStats>,
}

impl Publisher {
    pub fn new(
        destination: Arc<dyn Destination>,
        schedule: Vec<Duration>,
        sink: Arc<dyn PublicationSink>,
        stats: Arc<PublishStats>,
    ) -> Self {
        Self {
            destination,
            schedule,
            sink,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<PublishStats> {
        &self.stats
    }

    /// Attempts made before giving up: one plus one per scheduled delay.
    pub fn max_attempts(&self) -> u32 {
        self.schedule.len() as u32 + 1
    }

    /// Deliver `bytes` as `filename` to `destination_id`.
    pub async fn publish(
        &self,
        destination_id: i64,
        bytes: &[u8],
        filename: &str,
    ) -> Result<PublicationRecord, RelayError> {
        let started = Instant::now();
        let max_attempts = self.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.schedule[attempt as usize - 2];
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let sent_at = Instant::now();
            let result = self
                .destination
                .send_document(destination_id, bytes, filename)
                .await;
            debug!(
                attempt,
                bytes = bytes.len(),
                elapsed_ms = sent_at.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Delivery attempt"
            );

            match result {
                Ok(message) => {
                    self.stats
                        .record(true, started.elapsed(), attempt - 1, bytes.len());
                    let record = PublicationRecord {
                        destination_id,
                        message_id: message.message_id,
                        filename: filename.to_string(),
                        file_kind: message
                            .file_kind
                            .unwrap_or_else(|| DEFAULT_FILE_KIND.to_string()),
                        views: message.views.unwrap_or(0),
                        size_bytes: bytes.len(),
                        published_at: Utc::now(),
                    };
                    if let Err(e) = self.sink.record(&record).await {
                        warn!(filename, error = %e, "Could not record publication");
                    }
                    info!(
                        destination_id,
                        message_id = record.message_id,
                        filename,
                        attempt,
                        "Page published"
                    );
                    return Ok(record);
                }
                Err(e) => {
                    warn!(filename, attempt, max_attempts, error = %e, "Delivery failed");
                    last_error = e.to_string();
                }
            }
        }

        self.stats
            .record(false, started.elapsed(), max_attempts - 1, bytes.len());
        error!(filename, attempts = max_attempts, error = %last_error, "Delivery exhausted");
        Err(RelayError::DeliveryExhausted {
            filename: filename.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}
