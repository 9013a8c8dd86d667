//! Configuration types for the render-and-publish pipeline.
//!
//! Every knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`] or read from the process environment with
//! [`PipelineConfig::from_env`]. Watermark defaults are kept apart in
//! [`WatermarkSettings`] because they are process-wide and overridable per
//! call, while the rest of the config is fixed for the life of a worker.
//!
//! # Environment
//!
//! | Variable                | Default     | Meaning                                   |
//! |-------------------------|-------------|-------------------------------------------|
//! | `SOURCE_BLOB_TTL`       | 3600        | seconds an uploaded document is kept      |
//! | `FULLRES_BLOB_TTL`      | 21600       | seconds a full-resolution page is kept    |
//! | `PREVIEW_BLOB_TTL`      | 3600        | seconds a preview JPEG is kept            |
//! | `FULLRES_BLOB_PREFIX`   | `renderpng` | key prefix of full-resolution pages       |
//! | `RENDER_DPI`            | 300         | rasterisation density                     |
//! | `PREVIEW_MAX_DIM`       | 1600        | longest preview side in pixels            |
//! | `OFFICE_BINARY`         | PATH lookup | LibreOffice / soffice executable          |
//! | `OFFICE_TIMEOUT_SECS`   | 240         | per-conversion time budget                |
//! | `PDFIUM_LIB_PATH`       | system      | directory holding libpdfium               |
//! | `RELAY_<NAME>_QUEUE`    | `<name>`    | queue name for preview/pdf/office/publish/default |
//! | `RELAY_<NAME>_WORKERS`  | 1–2         | workers per queue                         |
//! | `TASK_SOFT_TIME_LIMIT`  | 600         | seconds before a task is asked to stop    |
//! | `TASK_TIME_LIMIT`       | 660         | seconds before a task is terminated       |
//!
//! Values that fail to parse are logged and replaced by the default.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default delivery backoff schedule in seconds.
pub const DEFAULT_BACKOFF_SCHEDULE: [u64; 6] = [0, 1, 2, 3, 5, 8];

/// Configuration for the whole pipeline.
///
/// # Example
/// ```rust
/// use render_relay::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .dpi(200)
///     .preview_max_dim(1200)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 200);
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rasterisation density for PDF pages. Range: 72–600. Default: 300.
    pub dpi: u32,

    /// Safety cap on either rendered dimension, in pixels. Default: 10000.
    ///
    /// A 300-DPI render of an A0 sheet would be ~10 000 × 14 000 px; the cap
    /// scales such pages down instead of allocating gigabytes.
    pub max_rendered_pixels: u32,

    /// Longest side of a preview JPEG. Default: 1600.
    pub preview_max_dim: u32,

    /// JPEG quality of previews, 1–100. Default: 85.
    pub preview_quality: u8,

    /// Blob key prefixes and TTLs.
    pub blobs: BlobSettings,

    /// Explicit LibreOffice binary. `None` searches `PATH`.
    pub office_binary: Option<PathBuf>,

    /// Time budget for one office conversion. Default: 240 s.
    pub office_timeout: Duration,

    /// Directory holding the pdfium shared library. `None` binds the system library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Delays slept before each delivery retry. Default: `[0, 1, 2, 3, 5, 8]` s.
    pub publish_backoff: Vec<Duration>,

    /// Per-request timeout of the destination HTTP call. Default: 30 s.
    pub delivery_timeout: Duration,

    /// Capacity of the watermark tile cache. Default: 32.
    pub tile_cache_capacity: usize,

    /// Queue names, worker pools and task limits.
    pub dispatch: DispatchSettings,

    /// Process-wide watermark defaults.
    pub watermark: WatermarkSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 10_000,
            preview_max_dim: 1600,
            preview_quality: 85,
            blobs: BlobSettings::default(),
            office_binary: None,
            office_timeout: Duration::from_secs(240),
            pdfium_lib_path: None,
            publish_backoff: DEFAULT_BACKOFF_SCHEDULE
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            delivery_timeout: Duration::from_secs(30),
            tile_cache_capacity: 32,
            dispatch: DispatchSettings::default(),
            watermark: WatermarkSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Read the configuration from environment variables.
    pub fn from_env() -> Result<Self, RelayError> {
        let defaults = Self::default();
        let blobs = BlobSettings {
            source_ttl: env_secs("SOURCE_BLOB_TTL", defaults.blobs.source_ttl),
            fullres_ttl: env_secs("FULLRES_BLOB_TTL", defaults.blobs.fullres_ttl),
            preview_ttl: env_secs("PREVIEW_BLOB_TTL", defaults.blobs.preview_ttl),
            fullres_prefix: env_string("FULLRES_BLOB_PREFIX", &defaults.blobs.fullres_prefix),
            ..defaults.blobs
        };

        let mut builder = Self::builder()
            .dpi(env_parse("RENDER_DPI", defaults.dpi))
            .preview_max_dim(env_parse("PREVIEW_MAX_DIM", defaults.preview_max_dim))
            .blobs(blobs)
            .office_timeout(env_secs("OFFICE_TIMEOUT_SECS", defaults.office_timeout))
            .dispatch(DispatchSettings::from_env())
            .watermark(WatermarkSettings::from_env());

        if let Some(path) = env_path("OFFICE_BINARY") {
            builder = builder.office_binary(path);
        }
        if let Some(path) = env_path("PDFIUM_LIB_PATH") {
            builder = builder.pdfium_lib_path(path);
        }
        builder.build()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn preview_max_dim(mut self, px: u32) -> Self {
        self.config.preview_max_dim = px;
        self
    }

    pub fn preview_quality(mut self, quality: u8) -> Self {
        self.config.preview_quality = quality;
        self
    }

    pub fn blobs(mut self, blobs: BlobSettings) -> Self {
        self.config.blobs = blobs;
        self
    }

    pub fn office_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.office_binary = Some(path.into());
        self
    }

    pub fn office_timeout(mut self, timeout: Duration) -> Self {
        self.config.office_timeout = timeout;
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn publish_backoff(mut self, schedule: Vec<Duration>) -> Self {
        self.config.publish_backoff = schedule;
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.config.delivery_timeout = timeout;
        self
    }

    pub fn tile_cache_capacity(mut self, n: usize) -> Self {
        self.config.tile_cache_capacity = n.max(1);
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchSettings) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    pub fn watermark(mut self, watermark: WatermarkSettings) -> Self {
        self.config.watermark = watermark;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, RelayError> {
        let c = &self.config;
        if !(72..=600).contains(&c.dpi) {
            return Err(RelayError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.preview_max_dim < 64 {
            return Err(RelayError::InvalidConfig(format!(
                "Preview dimension must be ≥ 64, got {}",
                c.preview_max_dim
            )));
        }
        if !(1..=100).contains(&c.preview_quality) {
            return Err(RelayError::InvalidConfig(format!(
                "Preview quality must be 1–100, got {}",
                c.preview_quality
            )));
        }
        if c.publish_backoff.is_empty() {
            return Err(RelayError::InvalidConfig(
                "Publish backoff schedule must not be empty".into(),
            ));
        }
        c.blobs.validate()?;
        c.dispatch.validate()?;
        Ok(self.config)
    }
}

// ── Blob settings ────────────────────────────────────────────────────────

/// Key prefixes and default TTLs of the three payload classes.
///
/// Source uploads and full-resolution renders keep separate TTLs: a render
/// may wait for the uploader's page selection long after its source was
/// converted and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSettings {
    pub source_prefix: String,
    pub fullres_prefix: String,
    pub preview_prefix: String,
    pub source_ttl: Duration,
    pub fullres_ttl: Duration,
    pub preview_ttl: Duration,
}

impl Default for BlobSettings {
    fn default() -> Self {
        Self {
            source_prefix: "source".into(),
            fullres_prefix: "renderpng".into(),
            preview_prefix: "preview".into(),
            source_ttl: Duration::from_secs(3600),
            fullres_ttl: Duration::from_secs(6 * 3600),
            preview_ttl: Duration::from_secs(3600),
        }
    }
}

impl BlobSettings {
    fn validate(&self) -> Result<(), RelayError> {
        for prefix in [&self.source_prefix, &self.fullres_prefix, &self.preview_prefix] {
            if prefix.is_empty() || prefix.contains(':') {
                return Err(RelayError::InvalidConfig(format!(
                    "Blob prefix '{prefix}' must be non-empty and contain no ':'"
                )));
            }
        }
        for ttl in [self.source_ttl, self.fullres_ttl, self.preview_ttl] {
            if ttl.is_zero() {
                return Err(RelayError::InvalidConfig("Blob TTLs must be > 0".into()));
            }
        }
        Ok(())
    }
}

// ── Dispatch settings ────────────────────────────────────────────────────

/// Name and worker count of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    pub workers: usize,
}

impl QueueSettings {
    fn new(name: &str, workers: usize) -> Self {
        Self {
            name: name.to_string(),
            workers,
        }
    }

    fn from_env(key: &str, default: Self) -> Self {
        Self {
            name: env_string(&format!("RELAY_{key}_QUEUE"), &default.name),
            workers: env_parse(&format!("RELAY_{key}_WORKERS"), default.workers),
        }
    }
}

/// Queue layout and supervision limits of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub preview: QueueSettings,
    pub pdf: QueueSettings,
    pub office: QueueSettings,
    pub publish: QueueSettings,
    pub default: QueueSettings,

    /// After this, the running task is told to wrap up.
    pub soft_time_limit: Duration,
    /// After this, the running task is aborted.
    pub hard_time_limit: Duration,

    /// Retries of a task that failed with a transient error. Default: 3.
    pub max_retries: u32,
    /// Redeliveries of a task whose worker crashed. Default: 2.
    pub max_redeliveries: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            preview: QueueSettings::new("preview", 2),
            pdf: QueueSettings::new("pdf", 2),
            office: QueueSettings::new("office", 1),
            publish: QueueSettings::new("publish", 2),
            default: QueueSettings::new("default", 1),
            soft_time_limit: Duration::from_secs(600),
            hard_time_limit: Duration::from_secs(660),
            max_retries: 3,
            max_redeliveries: 2,
        }
    }
}

impl DispatchSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            preview: QueueSettings::from_env("PREVIEW", d.preview),
            pdf: QueueSettings::from_env("PDF", d.pdf),
            office: QueueSettings::from_env("OFFICE", d.office),
            publish: QueueSettings::from_env("PUBLISH", d.publish),
            default: QueueSettings::from_env("DEFAULT", d.default),
            soft_time_limit: env_secs("TASK_SOFT_TIME_LIMIT", d.soft_time_limit),
            hard_time_limit: env_secs("TASK_TIME_LIMIT", d.hard_time_limit),
            max_retries: env_parse("TASK_MAX_RETRIES", d.max_retries),
            max_redeliveries: d.max_redeliveries,
        }
    }

    pub(crate) fn queues(&self) -> [&QueueSettings; 5] {
        [
            &self.preview,
            &self.pdf,
            &self.office,
            &self.publish,
            &self.default,
        ]
    }

    fn validate(&self) -> Result<(), RelayError> {
        for q in self.queues() {
            if q.name.is_empty() {
                return Err(RelayError::InvalidConfig("Queue names must be non-empty".into()));
            }
            if q.workers == 0 {
                return Err(RelayError::InvalidConfig(format!(
                    "Queue '{}' needs at least 1 worker",
                    q.name
                )));
            }
        }
        if self.hard_time_limit < self.soft_time_limit {
            return Err(RelayError::InvalidConfig(format!(
                "Hard time limit ({}s) must not be below the soft limit ({}s)",
                self.hard_time_limit.as_secs(),
                self.soft_time_limit.as_secs()
            )));
        }
        Ok(())
    }
}

// ── Watermark settings ───────────────────────────────────────────────────

/// Process-wide watermark defaults.
///
/// A per-call [`crate::watermark::WatermarkSpec`] is derived from these plus
/// the caller's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkSettings {
    /// Fill alpha, clamped to 16–255 when compositing.
    pub opacity: u8,
    /// Minimum grid step between tile origins, in pixels.
    pub step: u32,
    /// Rotation in degrees; negative tilts the text upwards to the right.
    pub angle: f32,
    pub color: [u8; 3],
    pub font_preferred: PathBuf,
    pub font_fallback: PathBuf,
    /// Font size as a fraction of the larger page dimension.
    pub font_scale: f32,
    pub min_font_size: u32,
    /// Tile width as a fraction of page width.
    pub tile_scale_x: f32,
    /// Tile height as a fraction of page height.
    pub tile_scale_y: f32,
    /// Vertical nudge of the text inside its tile, in pixels.
    pub text_offset: i32,
}

impl Default for WatermarkSettings {
    fn default() -> Self {
        Self {
            opacity: 63,
            step: 350,
            angle: -25.0,
            color: [60, 60, 60],
            font_preferred: PathBuf::from("Roboto-Regular.ttf"),
            font_fallback: PathBuf::from("DejaVuSans.ttf"),
            font_scale: 0.03,
            min_font_size: 18,
            tile_scale_x: 0.6,
            tile_scale_y: 0.25,
            text_offset: -1,
        }
    }
}

impl WatermarkSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            opacity: env_parse::<u32>("WATERMARK_OPACITY", d.opacity as u32).min(255) as u8,
            step: env_parse("WATERMARK_STEP", d.step).max(1),
            angle: env_parse("WATERMARK_ANGLE", d.angle),
            color: std::env::var("WATERMARK_COLOR")
                .ok()
                .and_then(|raw| parse_color(&raw))
                .unwrap_or(d.color),
            font_preferred: env_path("WATERMARK_FONT_PREFERRED").unwrap_or(d.font_preferred),
            font_fallback: env_path("WATERMARK_FONT_FALLBACK").unwrap_or(d.font_fallback),
            font_scale: positive_or(env_parse("WATERMARK_FONT_SCALE", d.font_scale), d.font_scale),
            min_font_size: env_parse("WATERMARK_MIN_FONT_SIZE", d.min_font_size).max(1),
            tile_scale_x: positive_or(
                env_parse("WATERMARK_TILE_SCALE_X", d.tile_scale_x),
                d.tile_scale_x,
            ),
            tile_scale_y: positive_or(
                env_parse("WATERMARK_TILE_SCALE_Y", d.tile_scale_y),
                d.tile_scale_y,
            ),
            text_offset: env_parse("WATERMARK_TEXT_OFFSET", d.text_offset),
        }
    }
}

/// Parse `"r,g,b"`, clamping each channel to 0–255.
///
/// Returns `None` unless exactly three integer components are present.
pub fn parse_color(raw: &str) -> Option<[u8; 3]> {
    let parts: Vec<i64> = raw
        .split(',')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [r, g, b] => Some([
            (*r).clamp(0, 255) as u8,
            (*g).clamp(0, 255) as u8,
            (*b).clamp(0, 255) as u8,
        ]),
        _ => None,
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Which pages of a converted document to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSelection {
    /// Publish every page (default).
    #[default]
    All,
    /// Publish specific pages (1-indexed).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand into 0-indexed page numbers.
    ///
    /// Duplicates and out-of-range entries are dropped and the result is in
    /// document order, whatever order the request listed. When an explicit
    /// set filters down to nothing, `empty_fallback` decides: all pages, or
    /// just the first.
    pub fn to_indices(&self, total_pages: usize, empty_fallback: EmptySelection) -> Vec<usize> {
        let pages = match self {
            PageSelection::All => return (0..total_pages).collect(),
            PageSelection::Set(pages) => pages,
        };
        let mut picked: Vec<usize> = Vec::new();
        for &p in pages {
            if p >= 1 && p <= total_pages && !picked.contains(&(p - 1)) {
                picked.push(p - 1);
            }
        }
        picked.sort_unstable();
        if picked.is_empty() {
            picked = match empty_fallback {
                EmptySelection::AllPages => (0..total_pages).collect(),
                EmptySelection::FirstPage => (0..total_pages.min(1)).collect(),
            };
        }
        picked
    }
}

/// What an empty page selection means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptySelection {
    AllPages,
    FirstPage,
}

// ── Env helpers ──────────────────────────────────────────────────────────

pub(crate) fn env_parse<T: FromStr + Copy + std::fmt::Debug>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %raw, ?default, "Ignoring unparseable setting");
                default
            }
        },
        _ => default,
    }
}

pub(crate) fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn positive_or(value: f32, default: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let c = PipelineConfig::builder().build().unwrap();
        assert_eq!(c.dpi, 300);
        assert_eq!(c.preview_max_dim, 1600);
        assert_eq!(c.preview_quality, 85);
        assert_eq!(c.publish_backoff.len(), 6);
        assert_eq!(c.blobs.fullres_prefix, "renderpng");
    }

    #[test]
    fn dpi_is_clamped() {
        let c = PipelineConfig::builder().dpi(10_000).build().unwrap();
        assert_eq!(c.dpi, 600);
        let c = PipelineConfig::builder().dpi(1).build().unwrap();
        assert_eq!(c.dpi, 72);
    }

    #[test]
    fn rejects_tiny_preview_and_bad_quality() {
        assert!(PipelineConfig::builder().preview_max_dim(10).build().is_err());
        assert!(PipelineConfig::builder().preview_quality(0).build().is_err());
        assert!(PipelineConfig::builder().preview_quality(101).build().is_err());
    }

    #[test]
    fn rejects_empty_backoff() {
        let err = PipelineConfig::builder()
            .publish_backoff(vec![])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("backoff"));
    }

    #[test]
    fn rejects_zero_workers_and_inverted_limits() {
        let mut d = DispatchSettings::default();
        d.office.workers = 0;
        assert!(PipelineConfig::builder().dispatch(d).build().is_err());

        let d = DispatchSettings {
            soft_time_limit: Duration::from_secs(100),
            hard_time_limit: Duration::from_secs(50),
            ..DispatchSettings::default()
        };
        assert!(PipelineConfig::builder().dispatch(d).build().is_err());
    }

    #[test]
    fn rejects_prefix_with_colon() {
        let blobs = BlobSettings {
            preview_prefix: "pre:view".into(),
            ..BlobSettings::default()
        };
        assert!(PipelineConfig::builder().blobs(blobs).build().is_err());
    }

    #[test]
    fn color_parsing_clamps_and_rejects() {
        assert_eq!(parse_color("60,60,60"), Some([60, 60, 60]));
        assert_eq!(parse_color(" 300, -5 ,7"), Some([255, 0, 7]));
        assert_eq!(parse_color("1,2"), None);
        assert_eq!(parse_color("a,b,c"), None);
    }

    #[test]
    fn selection_dedups_sorts_and_skips_out_of_range() {
        let sel = PageSelection::Set(vec![3, 1, 3, 9, 0]);
        assert_eq!(sel.to_indices(4, EmptySelection::AllPages), vec![0, 2]);
        let reversed = PageSelection::Set(vec![4, 2]);
        assert_eq!(reversed.to_indices(5, EmptySelection::FirstPage), vec![1, 3]);
    }

    #[test]
    fn empty_selection_fallbacks() {
        let sel = PageSelection::Set(vec![42]);
        assert_eq!(sel.to_indices(3, EmptySelection::AllPages), vec![0, 1, 2]);
        assert_eq!(sel.to_indices(3, EmptySelection::FirstPage), vec![0]);
        assert_eq!(
            PageSelection::All.to_indices(2, EmptySelection::FirstPage),
            vec![0, 1]
        );
        assert!(PageSelection::Set(vec![])
            .to_indices(0, EmptySelection::FirstPage)
            .is_empty());
    }
}
