//! Task execution: what each request actually does.
//!
//! | Request   | Source load        | Work                                              |
//! |-----------|--------------------|---------------------------------------------------|
//! | `preview` | non-destructive    | convert, store full-res PNG + JPEG per page       |
//! | `render`  | destructive        | convert, select pages, watermark, publish each    |
//! | `publish` | destructive        | watermark (if asked), publish                     |
//! | `discard` | n/a                | delete the listed blobs                           |
//!
//! A render task publishes its pages independently: one page failing to
//! deliver is recorded as a [`PageFailure`] and the rest still go out. The
//! task as a whole succeeds when every selected page was published.

use super::queue::{TaskContext, TaskHandler};
use super::{PreviewRequest, PublishRequest, RenderRequest, TaskRequest};
use crate::blob::BlobStore;
use crate::config::{EmptySelection, PipelineConfig};
use crate::convert::{file_suffix, sanitize_base_name, ConvertOptions, Converters, DocumentFormat};
use crate::error::{PageFailure, RelayError};
use crate::preview::{PreviewGenerator, PreviewResult};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::publish::{PublicationRecord, Publisher};
use crate::watermark::{Compositor, WatermarkOverrides, WatermarkSpec};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Digits in render-and-publish page suffixes (`base-001.png`).
pub const RENDER_INDEX_WIDTH: usize = 3;

/// Result of a render-and-publish task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// True only if every selected page was published.
    pub ok: bool,
    pub pages_selected: usize,
    pub published: Vec<PublicationRecord>,
    pub failures: Vec<PageFailure>,
}

/// What a settled task hands back to its submitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutput {
    Preview(PreviewResult),
    Batch(BatchOutcome),
    Published(PublicationRecord),
    Discarded { count: usize },
}

/// Runs [`TaskRequest`]s against the pipeline's services.
pub struct TaskExecutor {
    config: Arc<PipelineConfig>,
    store: Arc<dyn BlobStore>,
    converters: Converters,
    previews: PreviewGenerator,
    compositor: Arc<Compositor>,
    publisher: Arc<Publisher>,
    progress: ProgressCallback,
}

impl TaskExecutor {
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn BlobStore>,
        converters: Converters,
        compositor: Arc<Compositor>,
        publisher: Arc<Publisher>,
    ) -> Self {
        let previews = PreviewGenerator::new(converters.clone(), store.clone(), config.clone());
        Self {
            config,
            store,
            converters,
            previews,
            compositor,
            publisher,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn previews(&self) -> &PreviewGenerator {
        &self.previews
    }

    /// Run one request to completion.
    pub async fn execute(
        &self,
        request: &TaskRequest,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, RelayError> {
        match request {
            TaskRequest::Preview(r) => self.preview(r).await.map(TaskOutput::Preview),
            TaskRequest::Render(r) => self.render(r, ctx).await.map(TaskOutput::Batch),
            TaskRequest::Publish(r) => self.publish_page(r).await.map(TaskOutput::Published),
            TaskRequest::Discard(r) => {
                self.store.delete_many(&r.keys).await?;
                info!(count = r.keys.len(), "Blobs discarded");
                Ok(TaskOutput::Discarded {
                    count: r.keys.len(),
                })
            }
        }
    }

    #[instrument(skip_all, fields(filename = %r.filename))]
    async fn preview(&self, r: &PreviewRequest) -> Result<PreviewResult, RelayError> {
        let bytes = r.payload.resolve(self.store.as_ref(), false).await?;
        let result = self
            .previews
            .generate(bytes, &r.filename, r.format.as_deref())
            .await?;

        if r.release_source {
            if let Some(key) = r.payload.blob_key() {
                if let Err(e) = self.store.delete(key).await {
                    warn!(%key, error = %e, "Could not release source blob");
                }
            }
        }
        Ok(result)
    }

    #[instrument(skip_all, fields(filename = %r.filename, destination_id = r.destination_id))]
    async fn render(&self, r: &RenderRequest, ctx: &TaskContext) -> Result<BatchOutcome, RelayError> {
        let format = r.document_format()?;
        let bytes = r.payload.resolve(self.store.as_ref(), true).await?;

        let base = sanitize_base_name(&r.filename, format.default_base_name());
        let opts = ConvertOptions::new(base, self.config.dpi)
            .index_width(RENDER_INDEX_WIDTH)
            .max_rendered_pixels(self.config.max_rendered_pixels);
        let suffix = file_suffix(&r.filename);
        let document = self
            .converters
            .convert(bytes, format, suffix.as_deref(), &opts)
            .await?;

        let fallback = match format {
            DocumentFormat::Pdf => EmptySelection::FirstPage,
            _ => EmptySelection::AllPages,
        };
        let selected = r.pages.to_indices(document.pages.len(), fallback);
        let spec = self.watermark_spec(r.watermark.as_deref(), &r.overrides);
        let total = selected.len();
        info!(
            pages_total = document.pages.len(),
            selected = total,
            watermark = spec.is_some(),
            "Publishing pages"
        );
        self.progress.on_batch_start(total);

        let mut published = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for idx in selected {
            let page = &document.pages[idx];
            if ctx.soft_limit_reached() {
                let err = RelayError::TimeLimitExceeded {
                    limit: self.config.dispatch.soft_time_limit.as_secs(),
                };
                self.progress.on_page_failed(page.page_index, total, &err.to_string());
                failures.push(PageFailure::new(page.page_index, &page.filename, &err));
                continue;
            }
            match self
                .deliver(page.png.clone(), spec.as_ref(), r.destination_id, &page.filename)
                .await
            {
                Ok(record) => {
                    self.progress
                        .on_page_published(page.page_index, total, &page.filename);
                    published.push(record);
                }
                Err(e) => {
                    warn!(page = page.page_index, error = %e, "Page not published");
                    self.progress
                        .on_page_failed(page.page_index, total, &e.to_string());
                    failures.push(PageFailure::new(page.page_index, &page.filename, &e));
                }
            }
        }

        self.progress.on_batch_complete(total, published.len());
        Ok(BatchOutcome {
            ok: failures.is_empty(),
            pages_selected: total,
            published,
            failures,
        })
    }

    #[instrument(skip_all, fields(filename = %r.filename, destination_id = r.destination_id))]
    async fn publish_page(&self, r: &PublishRequest) -> Result<PublicationRecord, RelayError> {
        let png = r.payload.resolve(self.store.as_ref(), true).await?;
        let spec = if r.apply_watermark {
            self.watermark_spec(r.watermark.as_deref(), &r.overrides)
        } else {
            None
        };
        self.deliver(png, spec.as_ref(), r.destination_id, &r.filename)
            .await
    }

    fn watermark_spec(
        &self,
        text: Option<&str>,
        overrides: &WatermarkOverrides,
    ) -> Option<WatermarkSpec> {
        text.and_then(|t| WatermarkSpec::from_settings(&self.config.watermark, t))
            .map(|spec| spec.with_overrides(overrides))
    }

    /// Watermark (when `spec` is set) and publish one page.
    async fn deliver(
        &self,
        png: Vec<u8>,
        spec: Option<&WatermarkSpec>,
        destination_id: i64,
        filename: &str,
    ) -> Result<PublicationRecord, RelayError> {
        let payload = match spec {
            Some(spec) => {
                let compositor = self.compositor.clone();
                let spec = spec.clone();
                tokio::task::spawn_blocking(move || compositor.apply_png(&png, Some(&spec)))
                    .await
                    .map_err(|e| RelayError::Internal(format!("Watermark task panicked: {e}")))??
            }
            None => png,
        };
        self.publisher.publish(destination_id, &payload, filename).await
    }
}

#[async_trait]
impl TaskHandler for TaskExecutor {
    async fn handle(
        &self,
        request: &TaskRequest,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, RelayError> {
        self.execute(request, ctx).await
    }
}
