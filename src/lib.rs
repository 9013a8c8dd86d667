//! # render-relay
//!
//! Turn uploaded documents into watermarked PNG pages and publish them to a
//! chat destination through routed, retried task queues.
//!
//! ## Why this crate?
//!
//! Publishing a document page by page into a channel looks simple until the
//! uploads are real: a DOCX needs an office suite, a spreadsheet printed
//! whole is a postage stamp, the destination rate-limits, and a 40-page PDF
//! should not be lost to one flaky request. This crate splits the job into
//! small, independently retried units of work on separate queues so that a
//! slow office conversion never holds up a page that is ready to go out.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Blob     store the source under a short-lived key
//!  ├─ 2. Preview  convert, store full-res PNG + JPEG thumbnail per page
//!  ├─ 3. Render   convert again on the format's queue, select pages
//!  ├─ 4. Mark     tile the watermark text over each page (cached tiles)
//!  ├─ 5. Publish  deliver each page with a fixed backoff schedule
//!  └─ 6. Record   publication record + rolling delivery stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_relay::dispatch::{Dispatcher, Payload, RenderRequest, TaskExecutor, TaskRequest};
//! use render_relay::publish::{BotApiDestination, LoggingPublicationSink, PublishStats, Publisher};
//! use render_relay::watermark::{Compositor, TileCache};
//! use render_relay::{Converters, MemoryBlobStore, PageSelection, PdfiumRasterizer, PipelineConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(PipelineConfig::from_env()?);
//!     let destination = BotApiDestination::new(std::env::var("BOT_TOKEN")?, config.delivery_timeout)?;
//!     let publisher = Publisher::new(
//!         Arc::new(destination),
//!         config.publish_backoff.clone(),
//!         Arc::new(LoggingPublicationSink),
//!         Arc::new(PublishStats::default()),
//!     );
//!     let executor = TaskExecutor::new(
//!         config.clone(),
//!         Arc::new(MemoryBlobStore::default()),
//!         Converters::new(Some(Arc::new(PdfiumRasterizer::new(None))), None),
//!         Arc::new(Compositor::new(Arc::new(TileCache::new(config.tile_cache_capacity)))),
//!         Arc::new(publisher),
//!     );
//!     let dispatcher = Dispatcher::start(config.dispatch.clone(), Arc::new(executor));
//!
//!     let ticket = dispatcher.submit(TaskRequest::Render(RenderRequest {
//!         destination_id: -1001234567890,
//!         payload: Payload::inline(&std::fs::read("report.pdf")?),
//!         filename: "report.pdf".into(),
//!         format: None,
//!         mime: None,
//!         watermark: Some("CONFIDENTIAL".into()),
//!         overrides: Default::default(),
//!         pages: PageSelection::All,
//!     }))?;
//!     println!("{:?}", ticket.wait().await?);
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `relay` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `redis` | off     | `blob::RedisBlobStore`, sharing blobs between processes |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! render-relay = { version = "0.1", default-features = false }
//! ```
//!
//! ## Queues
//!
//! | Queue     | Work                                   | Default workers |
//! |-----------|----------------------------------------|-----------------|
//! | `preview` | preview generation                     | 2               |
//! | `pdf`     | PDF render-and-publish                 | 2               |
//! | `office`  | Word / spreadsheet render-and-publish  | 1               |
//! | `publish` | single-page publish, PNG uploads       | 2               |
//! | `default` | blob cleanup                           | 1               |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod blob;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod preview;
pub mod progress;
pub mod publish;
pub mod watermark;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use blob::{BlobKey, BlobStore, MemoryBlobStore};
pub use config::{
    DispatchSettings, PageSelection, PipelineConfig, PipelineConfigBuilder, WatermarkSettings,
};
pub use convert::{
    Converters, DocumentFormat, LibreOfficeConverter, OfficeConverter, PdfiumRasterizer,
    Rasterizer,
};
pub use dispatch::{BatchOutcome, Dispatcher, TaskExecutor, TaskOutput, TaskRequest};
pub use error::{FailureKind, PageFailure, PreviewError, RelayError};
pub use preview::{PreviewGenerator, PreviewPage, PreviewResult};
pub use progress::{NoopProgressCallback, ProgressCallback, PublishProgressCallback};
pub use publish::{PublicationRecord, Publisher};
