//! Error types for the render-relay library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`RelayError`]: **Fatal for the operation**: a conversion, storage
//!   access or delivery cannot complete. Every variant maps onto a
//!   [`FailureKind`], and the dispatcher decides whether to retry from the
//!   kind alone, never by matching on message text.
//!
//! * [`PreviewError`]: the typed error of the preview path. Unknown format,
//!   missing tool and an empty result set are distinguished so a
//!   request-facing process can phrase a useful answer for the uploader.
//!
//! * [`PageFailure`]: **Non-fatal**: one page of a batch failed to publish
//!   while the others went through. Stored in
//!   [`crate::dispatch::BatchOutcome`] so callers see partial success instead
//!   of losing the whole document to one bad page.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a failure, used for retry decisions.
///
/// | Kind          | Retried by the dispatcher? | Typical cause                          |
/// |---------------|----------------------------|----------------------------------------|
/// | `Environment` | never                      | missing LibreOffice, pdfium, fonts     |
/// | `Input`       | never                      | corrupt or unsupported document        |
/// | `Storage`     | never                      | blob expired or already claimed        |
/// | `Transient`   | yes, with backoff          | backend connection reset               |
/// | `Delivery`    | never (already retried)    | destination kept failing               |
/// | `Internal`    | never                      | time limit, worker bug                 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Environment,
    Input,
    Storage,
    Transient,
    Delivery,
    Internal,
}

impl FailureKind {
    /// Whether a task that failed with this kind may be attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Environment => "environment",
            FailureKind::Input => "input",
            FailureKind::Storage => "storage",
            FailureKind::Transient => "transient",
            FailureKind::Delivery => "delivery",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// All fatal errors returned by the render-relay library.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Environment errors ────────────────────────────────────────────────
    /// An external conversion binary could not be found or started.
    #[error("{tool} is not available: {detail}\nInstall it or point {hint} at an existing binary.")]
    ToolMissing {
        tool: String,
        detail: String,
        hint: String,
    },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/dir-containing-libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    /// None of the configured watermark fonts could be loaded.
    #[error("No usable watermark font among {candidates:?}\nSet WATERMARK_FONT_PREFERRED to a TrueType file.")]
    FontUnavailable { candidates: Vec<PathBuf> },

    /// No converter is wired for a format that needs one.
    #[error("No {capability} capability configured")]
    CapabilityMissing { capability: &'static str },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Declared format tag or file suffix is not one we convert.
    #[error("Unsupported document format '{0}'\nSupported: pdf, doc, docx, xls, xlsx, ods, png")]
    UnknownFormat(String),

    /// The document could not be parsed by the rasterizer or package reader.
    #[error("{format} document is corrupt: {detail}")]
    CorruptDocument { format: String, detail: String },

    /// The external converter ran but refused the document.
    #[error("{tool} rejected the document: {detail}")]
    ConversionRejected { tool: String, detail: String },

    /// The external converter exceeded its time budget.
    #[error("{tool} did not finish within {secs}s")]
    ConversionTimeout { tool: String, secs: u64 },

    /// A converter produced nothing to publish.
    #[error("'{filename}' produced no pages")]
    NoPages { filename: String },

    /// A page image could not be decoded or encoded.
    #[error("Image processing failed: {0}")]
    Image(String),

    /// A task payload failed validation at the queue boundary.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    // ── Storage errors ────────────────────────────────────────────────────
    /// The key was never stored, has expired, or was already claimed.
    #[error("Blob '{key}' not found or already used")]
    BlobNotFound { key: String },

    /// The blob key does not have the `<prefix>:<id>` shape.
    #[error("Malformed blob key '{0}'")]
    MalformedKey(String),

    /// The blob backend could not be reached.
    #[error("Blob backend unavailable: {0}")]
    BlobBackend(String),

    // ── Delivery errors ───────────────────────────────────────────────────
    /// Every attempt in the backoff schedule failed.
    #[error("Delivery of '{filename}' failed after {attempts} attempts: {last_error}")]
    DeliveryExhausted {
        filename: String,
        attempts: u32,
        last_error: String,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Task supervision ──────────────────────────────────────────────────
    /// The task ran past its time limit.
    #[error("Task exceeded its {limit}s time limit")]
    TimeLimitExceeded { limit: u64 },

    /// The dispatcher is shutting down or the queue is gone.
    #[error("Dispatcher unavailable: {0}")]
    DispatcherClosed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Classify this error for retry and reporting purposes.
    pub fn kind(&self) -> FailureKind {
        match self {
            RelayError::ToolMissing { .. }
            | RelayError::PdfiumBindingFailed(_)
            | RelayError::FontUnavailable { .. }
            | RelayError::CapabilityMissing { .. }
            | RelayError::InvalidConfig(_) => FailureKind::Environment,

            RelayError::UnknownFormat(_)
            | RelayError::CorruptDocument { .. }
            | RelayError::ConversionRejected { .. }
            | RelayError::ConversionTimeout { .. }
            | RelayError::NoPages { .. }
            | RelayError::Image(_)
            | RelayError::InvalidTask(_) => FailureKind::Input,

            RelayError::BlobNotFound { .. } | RelayError::MalformedKey(_) => FailureKind::Storage,

            RelayError::BlobBackend(_) => FailureKind::Transient,

            RelayError::DeliveryExhausted { .. } => FailureKind::Delivery,

            RelayError::TimeLimitExceeded { .. }
            | RelayError::DispatcherClosed(_)
            | RelayError::Internal(_) => FailureKind::Internal,
        }
    }

    pub(crate) fn image(err: image::ImageError) -> Self {
        RelayError::Image(err.to_string())
    }
}

/// Errors from [`crate::preview::PreviewGenerator`].
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("Unsupported preview format '{0}'")]
    UnknownFormat(String),

    #[error("Preview tool unavailable: {0}")]
    ToolMissing(#[source] RelayError),

    #[error("'{filename}' produced no preview pages")]
    Empty { filename: String },

    #[error("Preview conversion failed: {0}")]
    Conversion(#[source] RelayError),
}

impl PreviewError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PreviewError::UnknownFormat(_) | PreviewError::Empty { .. } => FailureKind::Input,
            PreviewError::ToolMissing(_) => FailureKind::Environment,
            PreviewError::Conversion(inner) => inner.kind(),
        }
    }
}

impl From<RelayError> for PreviewError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::UnknownFormat(tag) => PreviewError::UnknownFormat(tag),
            RelayError::NoPages { filename } => PreviewError::Empty { filename },
            other if other.kind() == FailureKind::Environment => PreviewError::ToolMissing(other),
            other => PreviewError::Conversion(other),
        }
    }
}

impl From<PreviewError> for RelayError {
    fn from(err: PreviewError) -> Self {
        match err {
            PreviewError::UnknownFormat(tag) => RelayError::UnknownFormat(tag),
            PreviewError::Empty { filename } => RelayError::NoPages { filename },
            PreviewError::ToolMissing(inner) | PreviewError::Conversion(inner) => inner,
        }
    }
}

/// A non-fatal failure for a single page of a batch.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("Page {page_index} ('{filename}'): {reason}")]
pub struct PageFailure {
    /// 1-based page index within the source document.
    pub page_index: usize,
    pub filename: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl PageFailure {
    pub fn new(page_index: usize, filename: impl Into<String>, err: &RelayError) -> Self {
        Self {
            page_index,
            filename: filename.into(),
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}
