//! PDF rasterisation via pdfium.
//!
//! ## Why bind per call?
//!
//! pdfium keeps global library state. Binding inside each blocking call
//! confines that state to the blocking thread doing the work, so the tokio
//! worker threads never touch the C library.
//!
//! ## Why cap pixels as well as DPI?
//!
//! 300 DPI is right for letter and A4 pages, but an A0 drawing at the same
//! density would allocate several hundred megabytes. `max_pixels` caps the
//! longest edge while leaving ordinary pages at full density.

use super::{encode_png, number_pages, rasterize_blocking, ConvertOptions, Rasterizer, RenderedPage};
use crate::error::RelayError;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Points per inch in PDF user space.
const PDF_POINTS_PER_INCH: f32 = 72.0;

/// [`Rasterizer`] backed by the pdfium library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    library_dir: Option<PathBuf>,
}

impl PdfiumRasterizer {
    /// Use the pdfium library in `library_dir`, or the system one when `None`.
    pub fn new(library_dir: Option<PathBuf>) -> Self {
        Self { library_dir }
    }

    /// Check that the library can be bound, without rendering anything.
    pub fn probe(&self) -> Result<(), RelayError> {
        self.bind().map(|_| ())
    }

    fn bind(&self) -> Result<Pdfium, RelayError> {
        let bindings = match &self.library_dir {
            Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| RelayError::PdfiumBindingFailed(format!("{e:?}")))?;
        Ok(Pdfium::new(bindings))
    }

    fn library_label(&self) -> String {
        self.library_dir
            .as_deref()
            .map(Path::display)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "system".to_string())
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn rasterize(
        &self,
        pdf: &[u8],
        dpi: u32,
        max_pixels: u32,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, RelayError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| RelayError::CorruptDocument {
                format: "pdf".into(),
                detail: format!("{e:?}"),
            })?;

        let pages = document.pages();
        let total = pages.len() as usize;
        let wanted = limit.map_or(total, |l| l.min(total));
        info!(pages = total, rendering = wanted, dpi, library = %self.library_label(), "PDF loaded");

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(dpi as f32 / PDF_POINTS_PER_INCH)
            .set_maximum_width(max_pixels as i32)
            .set_maximum_height(max_pixels as i32);

        let mut out = Vec::with_capacity(wanted);
        for idx in 0..wanted {
            let page = pages
                .get(idx as u16)
                .map_err(|e| RelayError::CorruptDocument {
                    format: "pdf".into(),
                    detail: format!("page {}: {e:?}", idx + 1),
                })?;
            let bitmap =
                page.render_with_config(&render_config)
                    .map_err(|e| RelayError::CorruptDocument {
                        format: "pdf".into(),
                        detail: format!("page {} did not render: {e:?}", idx + 1),
                    })?;
            let image = bitmap.as_image();
            debug!(page = idx + 1, width = image.width(), height = image.height(), "Rendered page");
            out.push(encode_png(&image)?);
        }
        Ok(out)
    }
}

/// Rasterise every page of a PDF and name the results.
pub async fn convert(
    rasterizer: Arc<dyn Rasterizer>,
    pdf: Vec<u8>,
    opts: &ConvertOptions,
) -> Result<Vec<RenderedPage>, RelayError> {
    let pngs = rasterize_blocking(rasterizer, pdf, opts.dpi, opts.max_rendered_pixels, None).await?;
    Ok(number_pages(pngs, opts))
}
