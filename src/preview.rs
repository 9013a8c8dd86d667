//! Preview generation: upload → stored full-resolution pages + JPEG previews.
//!
//! The preview step runs before the uploader has chosen anything. It converts
//! the whole document once, parks every full-resolution page in the blob
//! store for the publish step, and stores a small JPEG of each page for
//! display. Only keys and metadata travel back to the caller, so the task
//! result stays small no matter how large the document is.

use crate::blob::{BlobKey, BlobStore};
use crate::config::PipelineConfig;
use crate::convert::{
    decode_image, sanitize_base_name, ConvertOptions, Converters, DocumentFormat, PageExtra,
    RenderedPage,
};
use crate::error::{PreviewError, RelayError};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Metadata of one previewed page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewPage {
    pub filename: String,
    pub preview_key: BlobKey,
    pub fullres_key: BlobKey,
    pub page_index: usize,
    pub pages_total: usize,
    /// Full-resolution dimensions.
    pub width: u32,
    pub height: u32,
    #[serde(flatten)]
    pub extra: PageExtra,
}

/// Result of previewing one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewResult {
    pub format: DocumentFormat,
    pub pages: Vec<PreviewPage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheets_total: Option<usize>,
}

impl PreviewResult {
    /// Every key this preview stored.
    pub fn keys(&self) -> Vec<BlobKey> {
        keys_of(&self.pages)
    }
}

fn keys_of(pages: &[PreviewPage]) -> Vec<BlobKey> {
    pages
        .iter()
        .flat_map(|p| [p.preview_key.clone(), p.fullres_key.clone()])
        .collect()
}

struct Thumbnail {
    jpeg: Vec<u8>,
    width: u32,
    height: u32,
}

/// Converts uploads and stores their pages.
pub struct PreviewGenerator {
    converters: Converters,
    store: Arc<dyn BlobStore>,
    config: Arc<PipelineConfig>,
}

impl PreviewGenerator {
    pub fn new(converters: Converters, store: Arc<dyn BlobStore>, config: Arc<PipelineConfig>) -> Self {
        Self {
            converters,
            store,
            config,
        }
    }

    /// Preview `bytes` uploaded as `filename`.
    ///
    /// `format_tag` is the declared format; when absent it is detected from
    /// the filename. Zero resulting pages is always an error.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn generate(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        format_tag: Option<&str>,
    ) -> Result<PreviewResult, PreviewError> {
        let format = match format_tag {
            Some(tag) => DocumentFormat::from_tag(tag)?,
            None => DocumentFormat::detect(None, filename)?,
        };
        let base = sanitize_base_name(filename, format.default_base_name());
        let opts = ConvertOptions::new(base, self.config.dpi)
            .index_width(2)
            .max_rendered_pixels(self.config.max_rendered_pixels);
        let suffix = crate::convert::file_suffix(filename);

        let converted = self
            .converters
            .convert(bytes, format, suffix.as_deref(), &opts)
            .await?;
        if converted.pages.is_empty() {
            return Err(PreviewError::Empty {
                filename: filename.to_string(),
            });
        }

        let mut pages = Vec::with_capacity(converted.pages.len());
        for page in converted.pages {
            match self.store_page(page).await {
                Ok(p) => pages.push(p),
                Err(e) => {
                    // Leave nothing behind for a preview the caller never sees.
                    if let Err(cleanup) = self.store.delete_many(&keys_of(&pages)).await {
                        warn!(error = %cleanup, "Could not discard partial preview");
                    }
                    return Err(e.into());
                }
            }
        }

        info!(format = %format, pages = pages.len(), "Preview ready");
        Ok(PreviewResult {
            format,
            pages,
            sheets_total: converted.sheets_total,
        })
    }

    async fn store_page(&self, page: RenderedPage) -> Result<PreviewPage, RelayError> {
        let max_dim = self.config.preview_max_dim;
        let quality = self.config.preview_quality;
        let png = page.png;
        let (png, thumb) = tokio::task::spawn_blocking(move || {
            let thumb = make_thumbnail(&png, max_dim, quality);
            (png, thumb)
        })
        .await
        .map_err(|e| RelayError::Internal(format!("Preview task panicked: {e}")))?;
        let thumb = thumb?;

        let blobs = &self.config.blobs;
        let fullres_key = self.store.store(&blobs.fullres_prefix, png, None).await?;
        let preview_key = match self.store.store(&blobs.preview_prefix, thumb.jpeg, None).await {
            Ok(key) => key,
            Err(e) => {
                if let Err(cleanup) = self.store.delete(&fullres_key).await {
                    warn!(key = %fullres_key, error = %cleanup, "Could not release partial preview");
                }
                return Err(e);
            }
        };
        debug!(filename = %page.filename, %fullres_key, %preview_key, "Stored page");

        Ok(PreviewPage {
            filename: page.filename,
            preview_key,
            fullres_key,
            page_index: page.page_index,
            pages_total: page.pages_total,
            width: thumb.width,
            height: thumb.height,
            extra: page.extra,
        })
    }
}

/// Downscale a page so its longest side is at most `max_dim`, as JPEG.
fn make_thumbnail(png: &[u8], max_dim: u32, quality: u8) -> Result<Thumbnail, RelayError> {
    let page = decode_image(png)?;
    let (width, height) = (page.width(), page.height());
    let small = if width.max(height) > max_dim {
        page.resize(max_dim, max_dim, FilterType::Lanczos3)
    } else {
        page
    };
    let rgb = small.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode_image(&rgb)
        .map_err(RelayError::image)?;
    Ok(Thumbnail {
        jpeg,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::convert::{encode_png, Rasterizer};
    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};
    use std::time::Duration;

    /// Refuses thumbnails; optionally refuses deletes too.
    struct NoThumbnails {
        inner: MemoryBlobStore,
        deletes_fail: bool,
    }

    #[async_trait]
    impl BlobStore for NoThumbnails {
        async fn store(
            &self,
            prefix: &str,
            bytes: Vec<u8>,
            ttl: Option<Duration>,
        ) -> Result<BlobKey, RelayError> {
            if prefix == "preview" {
                return Err(RelayError::BlobBackend("disk full".into()));
            }
            self.inner.store(prefix, bytes, ttl).await
        }

        async fn load(&self, key: &BlobKey, destructive: bool) -> Result<Vec<u8>, RelayError> {
            self.inner.load(key, destructive).await
        }

        async fn delete(&self, key: &BlobKey) -> Result<(), RelayError> {
            if self.deletes_fail {
                return Err(RelayError::BlobBackend("connection reset".into()));
            }
            self.inner.delete(key).await
        }
    }

    /// Renders `pages` blank pages of 2000×1000 regardless of input.
    struct BlankPages(usize);

    impl Rasterizer for BlankPages {
        fn rasterize(
            &self,
            _pdf: &[u8],
            _dpi: u32,
            _max_pixels: u32,
            _limit: Option<usize>,
        ) -> Result<Vec<Vec<u8>>, RelayError> {
            let page = DynamicImage::ImageRgb8(RgbImage::new(2000, 1000));
            (0..self.0).map(|_| encode_png(&page)).collect()
        }
    }

    fn generator(pages: usize) -> (PreviewGenerator, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::default());
        let config = PipelineConfig::builder().preview_max_dim(500).build().unwrap();
        let converters = Converters::new(Some(Arc::new(BlankPages(pages))), None);
        (
            PreviewGenerator::new(converters, store.clone(), Arc::new(config)),
            store,
        )
    }

    #[tokio::test]
    async fn every_page_is_stored_twice() {
        let (gen, store) = generator(3);
        let result = gen.generate(b"%PDF".to_vec(), "Q3 report.pdf", None).await.unwrap();

        assert_eq!(result.format, DocumentFormat::Pdf);
        let names: Vec<_> = result.pages.iter().map(|p| p.filename.as_str()).collect();
        assert_eq!(names, ["Q3_report-01.png", "Q3_report-02.png", "Q3_report-03.png"]);
        assert_eq!(store.len(), 6);

        let page = &result.pages[1];
        assert_eq!((page.page_index, page.pages_total), (2, 3));
        assert_eq!((page.width, page.height), (2000, 1000));
        assert_eq!(page.fullres_key.prefix(), "renderpng");
        assert_eq!(page.preview_key.prefix(), "preview");

        let jpeg = store.load(&page.preview_key, false).await.unwrap();
        let thumb = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (500, 250));
    }

    #[tokio::test]
    async fn declared_format_wins_over_filename() {
        let (gen, _) = generator(1);
        let err = gen
            .generate(b"x".to_vec(), "upload.pdf", Some("pptx"))
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::UnknownFormat(_)));
    }

    #[tokio::test]
    async fn zero_pages_is_an_error() {
        let (gen, store) = generator(0);
        let err = gen.generate(b"%PDF".to_vec(), "empty.pdf", None).await.unwrap_err();
        assert!(matches!(err, PreviewError::Empty { .. }), "{err:?}");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn missing_office_suite_is_an_environment_error() {
        let (gen, _) = generator(1);
        let err = gen.generate(b"PK".to_vec(), "memo.docx", None).await.unwrap_err();
        assert!(matches!(err, PreviewError::ToolMissing(_)), "{err:?}");
        assert_eq!(err.kind(), crate::error::FailureKind::Environment);
    }

    async fn generate_with(store: Arc<NoThumbnails>) -> PreviewError {
        let config = PipelineConfig::builder().preview_max_dim(500).build().unwrap();
        let converters = Converters::new(Some(Arc::new(BlankPages(2))), None);
        PreviewGenerator::new(converters, store, Arc::new(config))
            .generate(b"%PDF".to_vec(), "deck.pdf", None)
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn failed_thumbnail_releases_the_full_page() {
        let store = Arc::new(NoThumbnails {
            inner: MemoryBlobStore::default(),
            deletes_fail: false,
        });
        let err = generate_with(store.clone()).await;
        assert_eq!(err.kind(), crate::error::FailureKind::Transient);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn failed_release_keeps_the_original_error() {
        let store = Arc::new(NoThumbnails {
            inner: MemoryBlobStore::default(),
            deletes_fail: true,
        });
        let err = generate_with(store.clone()).await;
        assert!(err.to_string().contains("disk full"), "{err}");
        assert_eq!(store.inner.len(), 1);
    }

    #[test]
    fn small_pages_are_not_upscaled() {
        let png = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(40, 30))).unwrap();
        let thumb = make_thumbnail(&png, 1600, 85).unwrap();
        let decoded = image::load_from_memory(&thumb.jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }
}
