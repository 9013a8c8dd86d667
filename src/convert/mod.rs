//! Format converters: document bytes → ordered list of PNG pages.
//!
//! Every converter honours the same output contract: a list of
//! [`RenderedPage`]s in natural document order, each carrying its filename,
//! PNG bytes (RGB, no alpha), 1-based page index and the total page count.
//!
//! | Format                 | Path                                                        |
//! |------------------------|-------------------------------------------------------------|
//! | PDF                    | [`Rasterizer`] at the configured DPI                        |
//! | DOC / DOCX             | [`OfficeConverter`] → PDF → [`Rasterizer`]                  |
//! | XLS / XLSX / ODS       | region detection → per-region export → PDF → page 1 raster |
//! | PNG                    | passthrough, one page                                       |
//!
//! ## Why injected capabilities?
//!
//! Rasterising and office conversion are external programs with heavy
//! native dependencies. Modelling them as the [`Rasterizer`] and
//! [`OfficeConverter`] traits keeps the orchestration testable with fakes and
//! turns a missing capability into an environment error instead of a panic.

pub mod office;
pub mod pdf;
pub mod png;
pub mod spreadsheet;

use crate::error::RelayError;
use async_trait::async_trait;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub use office::LibreOfficeConverter;
pub use pdf::PdfiumRasterizer;

/// Longest base name kept in output filenames.
pub const MAX_BASE_NAME_LEN: usize = 48;

// ── Formats ──────────────────────────────────────────────────────────────

/// Document families the pipeline converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Word,
    Spreadsheet,
    Png,
}

impl DocumentFormat {
    /// Parse a declared format tag (`pdf`, `docx`, `xlsx`, `png` and their aliases).
    pub fn from_tag(tag: &str) -> Result<Self, RelayError> {
        match tag.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "doc" | "docx" | "dot" | "word" => Ok(Self::Word),
            "xls" | "xlsx" | "xlsm" | "xlt" | "ods" | "fods" | "excel" | "spreadsheet" => {
                Ok(Self::Spreadsheet)
            }
            "png" => Ok(Self::Png),
            other => Err(RelayError::UnknownFormat(other.to_string())),
        }
    }

    /// Detect the format from an optional MIME type, then the filename suffix.
    pub fn detect(mime: Option<&str>, filename: &str) -> Result<Self, RelayError> {
        if let Some(format) = mime.and_then(Self::from_mime) {
            return Ok(format);
        }
        let suffix = file_suffix(filename).unwrap_or_default();
        Self::from_tag(&suffix).map_err(|_| RelayError::UnknownFormat(filename.to_string()))
    }

    fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
        match mime.as_str() {
            "application/pdf" => Some(Self::Pdf),
            "image/png" => Some(Self::Png),
            "application/msword"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Word)
            }
            "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel.sheet.macroenabled.12"
            | "application/vnd.oasis.opendocument.spreadsheet" => Some(Self::Spreadsheet),
            _ => None,
        }
    }

    /// Base name used when the upload has no usable stem.
    pub fn default_base_name(self) -> &'static str {
        match self {
            Self::Pdf => "page",
            Self::Word => "document",
            Self::Spreadsheet => "sheet",
            Self::Png => "image",
        }
    }

    /// Suffix handed to the office converter when the filename has none.
    pub fn default_suffix(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Word => "docx",
            Self::Spreadsheet => "xlsx",
            Self::Png => "png",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Word => "docx",
            Self::Spreadsheet => "xlsx",
            Self::Png => "png",
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower-cased suffix of `filename`, without the dot.
pub fn file_suffix(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

// ── Naming ───────────────────────────────────────────────────────────────

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static regex is valid"));

/// Turn an upload filename into a safe output base name.
///
/// Runs of characters outside `[A-Za-z0-9._-]` become `_`, the result is
/// trimmed of `._-` at both ends and truncated to [`MAX_BASE_NAME_LEN`].
pub fn sanitize_base_name(filename: &str, fallback: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let cleaned = UNSAFE_CHARS.replace_all(stem, "_");
    let trimmed: String = cleaned
        .trim_matches(|c| c == '_' || c == '.' || c == '-')
        .chars()
        .take(MAX_BASE_NAME_LEN)
        .collect();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed
    }
}

/// Filename of page `index` (0-based) out of `total`.
///
/// A single page is never suffixed; otherwise the 1-based index is
/// zero-padded to `width` digits.
pub fn page_filename(base: &str, index: usize, total: usize, width: usize) -> String {
    if total <= 1 {
        format!("{base}.png")
    } else {
        format!("{base}-{:0width$}.png", index + 1, width = width)
    }
}

// ── Output contract ──────────────────────────────────────────────────────

/// Spreadsheet-only metadata of a rendered region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
    /// A1-style range, e.g. `B2:F19`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_range: Option<String>,
    /// 1-based index of the table within its sheet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_index: Option<usize>,
    /// 1-based index of the sheet within the workbook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables_in_sheet: Option<usize>,
}

/// One renderable unit produced by a converter.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub filename: String,
    pub png: Vec<u8>,
    /// 1-based position in document order.
    pub page_index: usize,
    pub pages_total: usize,
    pub extra: PageExtra,
}

/// Result of converting one document.
#[derive(Debug, Clone)]
pub struct ConvertedDocument {
    pub format: DocumentFormat,
    pub pages: Vec<RenderedPage>,
    /// Number of worksheets inspected, for spreadsheets.
    pub sheets_total: Option<usize>,
}

/// Per-call conversion options.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub base_name: String,
    pub dpi: u32,
    pub max_rendered_pixels: u32,
    /// Digits in page suffixes: 2 for previews, 3 for render-and-publish.
    pub index_width: usize,
}

impl ConvertOptions {
    pub fn new(base_name: impl Into<String>, dpi: u32) -> Self {
        Self {
            base_name: base_name.into(),
            dpi,
            max_rendered_pixels: 10_000,
            index_width: 2,
        }
    }

    pub fn index_width(mut self, width: usize) -> Self {
        self.index_width = width.max(1);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.max_rendered_pixels = px;
        self
    }
}

/// Assign filenames and indices to page images in document order.
pub(crate) fn number_pages(pngs: Vec<Vec<u8>>, opts: &ConvertOptions) -> Vec<RenderedPage> {
    let total = pngs.len();
    pngs.into_iter()
        .enumerate()
        .map(|(i, png)| RenderedPage {
            filename: page_filename(&opts.base_name, i, total, opts.index_width),
            png,
            page_index: i + 1,
            pages_total: total,
            extra: PageExtra::default(),
        })
        .collect()
}

// ── Capabilities ─────────────────────────────────────────────────────────

/// Rasterise PDF bytes into page images.
///
/// Implementations block; callers run them under `spawn_blocking`.
pub trait Rasterizer: Send + Sync {
    /// Render up to `limit` pages (all when `None`) at `dpi`, as RGB PNG bytes.
    fn rasterize(
        &self,
        pdf: &[u8],
        dpi: u32,
        max_pixels: u32,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, RelayError>;
}

/// Export profile of an office-to-PDF conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportProfile {
    /// Text documents: embedded standard fonts, lossless, no page skipping.
    Writer,
    /// Spreadsheets: lossless, fit to pages.
    Calc,
}

/// Target of an office conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    Pdf(ExportProfile),
    /// Normalise any spreadsheet into an Office Open XML workbook.
    Xlsx,
}

/// Convert office documents through an external suite.
#[async_trait]
pub trait OfficeConverter: Send + Sync {
    /// Convert `bytes`, whose original suffix is `suffix`, into `target`.
    async fn convert(
        &self,
        bytes: &[u8],
        suffix: &str,
        target: ExportTarget,
    ) -> Result<Vec<u8>, RelayError>;
}

/// Run a rasterizer on the blocking pool.
pub(crate) async fn rasterize_blocking(
    rasterizer: Arc<dyn Rasterizer>,
    pdf: Vec<u8>,
    dpi: u32,
    max_pixels: u32,
    limit: Option<usize>,
) -> Result<Vec<Vec<u8>>, RelayError> {
    tokio::task::spawn_blocking(move || rasterizer.rasterize(&pdf, dpi, max_pixels, limit))
        .await
        .map_err(|e| RelayError::Internal(format!("Rasterizer task panicked: {e}")))?
}

/// The converters available to a worker.
#[derive(Clone)]
pub struct Converters {
    rasterizer: Option<Arc<dyn Rasterizer>>,
    office: Option<Arc<dyn OfficeConverter>>,
}

impl Converters {
    pub fn new(
        rasterizer: Option<Arc<dyn Rasterizer>>,
        office: Option<Arc<dyn OfficeConverter>>,
    ) -> Self {
        Self { rasterizer, office }
    }

    fn rasterizer(&self) -> Result<Arc<dyn Rasterizer>, RelayError> {
        self.rasterizer
            .clone()
            .ok_or(RelayError::CapabilityMissing {
                capability: "PDF rasterizer",
            })
    }

    fn office(&self) -> Result<Arc<dyn OfficeConverter>, RelayError> {
        self.office.clone().ok_or(RelayError::CapabilityMissing {
            capability: "office converter",
        })
    }

    /// Convert a document of `format` into pages.
    ///
    /// `suffix` is the upload's original extension, which tells the office
    /// stage how to read the bytes; it falls back to the format default.
    pub async fn convert(
        &self,
        bytes: Vec<u8>,
        format: DocumentFormat,
        suffix: Option<&str>,
        opts: &ConvertOptions,
    ) -> Result<ConvertedDocument, RelayError> {
        let suffix = suffix.unwrap_or(format.default_suffix()).to_ascii_lowercase();
        info!(
            format = %format,
            bytes = bytes.len(),
            base = %opts.base_name,
            "Converting document"
        );

        let (pages, sheets_total) = match format {
            DocumentFormat::Pdf => (pdf::convert(self.rasterizer()?, bytes, opts).await?, None),
            DocumentFormat::Word => {
                let office = self.office()?;
                (
                    office::convert_document(office.as_ref(), self.rasterizer()?, &bytes, &suffix, opts)
                        .await?,
                    None,
                )
            }
            DocumentFormat::Spreadsheet => {
                let office = self.office()?;
                let rendered = spreadsheet::convert(
                    office.as_ref(),
                    self.rasterizer()?,
                    bytes,
                    &suffix,
                    opts,
                )
                .await?;
                (rendered.pages, Some(rendered.sheets_total))
            }
            DocumentFormat::Png => (png::convert(bytes, opts)?, None),
        };

        if pages.is_empty() {
            return Err(RelayError::NoPages {
                filename: opts.base_name.clone(),
            });
        }
        debug!(pages = pages.len(), "Conversion finished");
        Ok(ConvertedDocument {
            format,
            pages,
            sheets_total,
        })
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────

/// Encode an image as an RGB PNG.
///
/// Alpha is dropped first: pages are opaque and the destination renders
/// transparent pixels as black on some clients.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, RelayError> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(RelayError::image)?;
    debug!("Encoded {}x{} page → {} bytes PNG", rgb.width(), rgb.height(), buf.len());
    Ok(buf)
}

/// Decode PNG (or any supported raster) bytes.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, RelayError> {
    image::load_from_memory(bytes).map_err(RelayError::image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn format_tags_and_aliases() {
        assert_eq!(DocumentFormat::from_tag("PDF").unwrap(), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_tag("docx").unwrap(), DocumentFormat::Word);
        assert_eq!(DocumentFormat::from_tag(".ods").unwrap(), DocumentFormat::Spreadsheet);
        assert!(matches!(
            DocumentFormat::from_tag("odt"),
            Err(RelayError::UnknownFormat(_))
        ));
    }

    #[test]
    fn detect_prefers_mime_then_suffix() {
        assert_eq!(
            DocumentFormat::detect(Some("application/pdf"), "scan.bin").unwrap(),
            DocumentFormat::Pdf
        );
        assert_eq!(
            DocumentFormat::detect(Some("application/octet-stream"), "Budget.XLSM").unwrap(),
            DocumentFormat::Spreadsheet
        );
        assert_eq!(
            DocumentFormat::detect(None, "letter.dot").unwrap(),
            DocumentFormat::Word
        );
        assert!(DocumentFormat::detect(None, "notes.txt").is_err());
    }

    #[test]
    fn sanitize_replaces_runs_and_truncates() {
        assert_eq!(sanitize_base_name("Годовой отчёт 2024.pdf", "page"), "2024");
        assert_eq!(sanitize_base_name("my report (final).docx", "document"), "my_report_final");
        assert_eq!(sanitize_base_name("???.xlsx", "sheet"), "sheet");
        let long = format!("{}.pdf", "a".repeat(100));
        assert_eq!(sanitize_base_name(&long, "page").len(), MAX_BASE_NAME_LEN);
    }

    #[test]
    fn page_names_suffix_only_multi_page() {
        assert_eq!(page_filename("doc", 0, 1, 2), "doc.png");
        assert_eq!(page_filename("doc", 0, 3, 2), "doc-01.png");
        assert_eq!(page_filename("doc", 11, 12, 2), "doc-12.png");
        assert_eq!(page_filename("doc", 1, 3, 3), "doc-002.png");
    }

    #[test]
    fn numbering_preserves_order() {
        let opts = ConvertOptions::new("scan", 300).index_width(3);
        let pages = number_pages(vec![vec![1], vec![2], vec![3]], &opts);
        let names: Vec<_> = pages.iter().map(|p| p.filename.as_str()).collect();
        assert_eq!(names, ["scan-001.png", "scan-002.png", "scan-003.png"]);
        assert!(pages.iter().all(|p| p.pages_total == 3));
        assert_eq!(pages[2].png, vec![3]);
    }

    #[test]
    fn encode_drops_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 10])));
        let png = encode_png(&img).unwrap();
        let back = decode_image(&png).unwrap();
        assert!(matches!(back, DynamicImage::ImageRgb8(_)));
    }

    #[tokio::test]
    async fn missing_office_capability_is_environment_error() {
        let converters = Converters::new(None, None);
        let err = converters
            .convert(
                b"doc".to_vec(),
                DocumentFormat::Word,
                Some("docx"),
                &ConvertOptions::new("d", 300),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Environment);
    }
}
