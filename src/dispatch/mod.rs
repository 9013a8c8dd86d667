//! Task requests, task kinds and their static routing onto queues.
//!
//! ## Routing
//!
//! | Task kind            | Queue     |
//! |----------------------|-----------|
//! | `preview`            | `preview` |
//! | `pdf-render`         | `pdf`     |
//! | `office-render`      | `office`  |
//! | `spreadsheet-render` | `office`  |
//! | `publish`            | `publish` |
//! | `cleanup`            | `default` |
//!
//! Queue names are configurable ([`crate::config::DispatchSettings`]); the
//! mapping from kind to queue is not.
//!
//! ## Requests
//!
//! Every request is one variant of the closed, tagged [`TaskRequest`] enum
//! and is validated before it is queued. A document travels either as a blob
//! key (the normal case) or inline as base64 (small payloads, tests).

pub mod queue;
pub mod worker;

pub use queue::{Dispatcher, TaskContext, TaskHandler, TaskTicket};
pub use worker::{BatchOutcome, TaskExecutor, TaskOutput};

use crate::blob::{BlobKey, BlobStore};
use crate::config::{DispatchSettings, PageSelection, QueueSettings};
use crate::convert::DocumentFormat;
use crate::error::RelayError;
use crate::watermark::WatermarkOverrides;
use base64::Engine;
use serde::{Deserialize, Serialize};

// ── Kinds and queues ─────────────────────────────────────────────────────

/// Logical category of dispatched work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Preview,
    PdfRender,
    OfficeRender,
    SpreadsheetRender,
    Publish,
    Cleanup,
}

impl TaskKind {
    /// The queue this kind always runs on.
    pub fn route(self) -> QueueName {
        match self {
            TaskKind::Preview => QueueName::Preview,
            TaskKind::PdfRender => QueueName::Pdf,
            TaskKind::OfficeRender | TaskKind::SpreadsheetRender => QueueName::Office,
            TaskKind::Publish => QueueName::Publish,
            TaskKind::Cleanup => QueueName::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Preview => "preview",
            TaskKind::PdfRender => "pdf-render",
            TaskKind::OfficeRender => "office-render",
            TaskKind::SpreadsheetRender => "spreadsheet-render",
            TaskKind::Publish => "publish",
            TaskKind::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Preview,
    Pdf,
    Office,
    Publish,
    Default,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Preview,
        QueueName::Pdf,
        QueueName::Office,
        QueueName::Publish,
        QueueName::Default,
    ];

    /// Configured name and worker count of this queue.
    pub fn settings(self, dispatch: &DispatchSettings) -> &QueueSettings {
        let [preview, pdf, office, publish, default] = dispatch.queues();
        match self {
            QueueName::Preview => preview,
            QueueName::Pdf => pdf,
            QueueName::Office => office,
            QueueName::Publish => publish,
            QueueName::Default => default,
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────

/// Where a task finds its document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Stored in the blob store.
    BlobKey(BlobKey),
    /// Base64 in the request itself.
    Inline(String),
}

impl Payload {
    pub fn inline(bytes: &[u8]) -> Self {
        Payload::Inline(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn blob_key(&self) -> Option<&BlobKey> {
        match self {
            Payload::BlobKey(key) => Some(key),
            Payload::Inline(_) => None,
        }
    }

    fn validate(&self) -> Result<(), RelayError> {
        match self {
            Payload::Inline(data) if data.trim().is_empty() => {
                Err(RelayError::InvalidTask("inline payload is empty".into()))
            }
            _ => Ok(()),
        }
    }

    /// Fetch the bytes. `destructive` claims a blob so no other task can.
    pub(crate) async fn resolve(
        &self,
        store: &dyn BlobStore,
        destructive: bool,
    ) -> Result<Vec<u8>, RelayError> {
        match self {
            Payload::BlobKey(key) => store.load(key, destructive).await,
            Payload::Inline(data) => base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| RelayError::InvalidTask(format!("inline payload is not base64: {e}"))),
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────────

/// Convert an upload and store its previews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub payload: Payload,
    pub filename: String,
    /// Declared format tag; detected from `filename` when absent.
    #[serde(default)]
    pub format: Option<String>,
    /// Delete the source blob once the preview is stored.
    #[serde(default)]
    pub release_source: bool,
}

/// Convert a document and publish the selected pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub destination_id: i64,
    pub payload: Payload,
    pub filename: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub watermark: Option<String>,
    #[serde(default)]
    pub overrides: WatermarkOverrides,
    #[serde(default)]
    pub pages: PageSelection,
}

impl RenderRequest {
    pub fn document_format(&self) -> Result<DocumentFormat, RelayError> {
        match &self.format {
            Some(tag) => DocumentFormat::from_tag(tag),
            None => DocumentFormat::detect(self.mime.as_deref(), &self.filename),
        }
    }
}

fn yes() -> bool {
    true
}

/// Publish one ready page image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub destination_id: i64,
    pub payload: Payload,
    pub filename: String,
    #[serde(default)]
    pub watermark: Option<String>,
    /// When false the watermark text is ignored.
    #[serde(default = "yes")]
    pub apply_watermark: bool,
    #[serde(default)]
    pub overrides: WatermarkOverrides,
}

/// Delete blobs nobody is going to claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardRequest {
    pub keys: Vec<BlobKey>,
}

/// Every unit of work the dispatcher accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "kebab-case")]
pub enum TaskRequest {
    Preview(PreviewRequest),
    Render(RenderRequest),
    Publish(PublishRequest),
    Discard(DiscardRequest),
}

impl TaskRequest {
    /// Parse and validate a JSON request.
    pub fn from_json(raw: &str) -> Result<Self, RelayError> {
        let request: Self = serde_json::from_str(raw)
            .map_err(|e| RelayError::InvalidTask(format!("malformed request: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    /// Check the request before it is queued.
    pub fn validate(&self) -> Result<(), RelayError> {
        let require_name = |name: &str| {
            if name.trim().is_empty() {
                Err(RelayError::InvalidTask("filename is empty".into()))
            } else {
                Ok(())
            }
        };
        let require_destination = |id: i64| {
            if id == 0 {
                Err(RelayError::InvalidTask("destination id is missing".into()))
            } else {
                Ok(())
            }
        };

        match self {
            TaskRequest::Preview(r) => {
                r.payload.validate()?;
                require_name(&r.filename)
            }
            TaskRequest::Render(r) => {
                r.payload.validate()?;
                require_name(&r.filename)?;
                require_destination(r.destination_id)?;
                r.document_format().map(|_| ())
            }
            TaskRequest::Publish(r) => {
                r.payload.validate()?;
                require_name(&r.filename)?;
                require_destination(r.destination_id)
            }
            TaskRequest::Discard(r) if r.keys.is_empty() => {
                Err(RelayError::InvalidTask("nothing to discard".into()))
            }
            TaskRequest::Discard(_) => Ok(()),
        }
    }

    /// The kind, and therefore the queue, of this request.
    pub fn kind(&self) -> Result<TaskKind, RelayError> {
        Ok(match self {
            TaskRequest::Preview(_) => TaskKind::Preview,
            TaskRequest::Render(r) => match r.document_format()? {
                DocumentFormat::Pdf => TaskKind::PdfRender,
                DocumentFormat::Word => TaskKind::OfficeRender,
                DocumentFormat::Spreadsheet => TaskKind::SpreadsheetRender,
                DocumentFormat::Png => TaskKind::Publish,
            },
            TaskRequest::Publish(_) => TaskKind::Publish,
            TaskRequest::Discard(_) => TaskKind::Cleanup,
        })
    }
}
