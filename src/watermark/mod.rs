//! Tiled text watermarks.
//!
//! ## How a page is watermarked
//!
//! 1. Font size is `max(min_font_size, max(W, H) · font_scale)`.
//! 2. The text is drawn once, centred, onto a transparent tile of
//!    `W · tile_scale_x` by `H · tile_scale_y` pixels.
//! 3. The tile is rotated on an expanded canvas so no glyph is clipped.
//! 4. The rotated tile is alpha-composited over the page on a grid whose step
//!    is at least half the rotated tile in each direction, starting one tile
//!    before the origin so the edges are covered too.
//!
//! Steps 1–3 depend only on the visual parameters, so their result is cached
//! in a [`TileCache`] and a whole batch of same-sized pages costs one render.
//!
//! ## Why not draw the text directly on the page?
//!
//! Laying out and rotating text is the expensive part. Drawing it per grid
//! cell would repeat that work dozens of times per page; compositing a
//! ready bitmap is a tight pixel loop.

pub mod cache;
pub mod font;

pub use cache::{CacheStats, TileCache, TileKey};
pub use font::{FontLibrary, LoadedFont};

use crate::config::WatermarkSettings;
use crate::convert::{decode_image, encode_png};
use crate::error::RelayError;
use ab_glyph::PxScale;
use image::{imageops, DynamicImage, GenericImageView, Rgba, RgbImage, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Lowest alpha a watermark may be drawn with.
pub const MIN_OPACITY: u8 = 16;

/// Parameters of one overlay.
///
/// "No watermark" is expressed as `Option::<WatermarkSpec>::None`, never as a
/// spec with empty text.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkSpec {
    pub text: String,
    pub opacity: u8,
    pub step: u32,
    pub angle: f32,
    pub color: [u8; 3],
    pub font_preferred: PathBuf,
    pub font_fallback: PathBuf,
    pub font_scale: f32,
    pub min_font_size: u32,
    pub tile_scale_x: f32,
    pub tile_scale_y: f32,
    pub text_offset: i32,
}

/// Per-call adjustments on top of the process-wide [`WatermarkSettings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<[u8; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

impl WatermarkSpec {
    /// Build a spec from settings, or `None` when `text` is blank.
    pub fn from_settings(settings: &WatermarkSettings, text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            text: text.to_string(),
            opacity: settings.opacity,
            step: settings.step,
            angle: settings.angle,
            color: settings.color,
            font_preferred: settings.font_preferred.clone(),
            font_fallback: settings.font_fallback.clone(),
            font_scale: settings.font_scale,
            min_font_size: settings.min_font_size,
            tile_scale_x: settings.tile_scale_x,
            tile_scale_y: settings.tile_scale_y,
            text_offset: settings.text_offset,
        })
    }

    pub fn with_overrides(mut self, overrides: &WatermarkOverrides) -> Self {
        if let Some(opacity) = overrides.opacity {
            self.opacity = opacity;
        }
        if let Some(angle) = overrides.angle {
            self.angle = angle;
        }
        if let Some(color) = overrides.color {
            self.color = color;
        }
        if let Some(step) = overrides.step {
            self.step = step.max(1);
        }
        self
    }

    /// Opacity actually used for drawing.
    pub fn effective_opacity(&self) -> u8 {
        self.opacity.max(MIN_OPACITY)
    }

    fn font_size(&self, width: u32, height: u32) -> u32 {
        let scaled = (width.max(height) as f32 * self.font_scale).round() as u32;
        scaled.max(self.min_font_size)
    }

    fn tile_dims(&self, width: u32, height: u32) -> (u32, u32) {
        (
            ((width as f32 * self.tile_scale_x).round() as u32).max(1),
            ((height as f32 * self.tile_scale_y).round() as u32).max(1),
        )
    }
}

/// Applies watermarks, sharing rendered tiles through a [`TileCache`].
pub struct Compositor {
    cache: Arc<TileCache>,
    fonts: FontLibrary,
}

impl Compositor {
    pub fn new(cache: Arc<TileCache>) -> Self {
        Self::with_fonts(cache, FontLibrary::default())
    }

    pub fn with_fonts(cache: Arc<TileCache>, fonts: FontLibrary) -> Self {
        Self { cache, fonts }
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    /// Watermark `image`, returning an RGB page.
    ///
    /// `None` (or a blank text) returns the page converted to RGB unchanged.
    pub fn apply(
        &self,
        image: &DynamicImage,
        spec: Option<&WatermarkSpec>,
    ) -> Result<RgbImage, RelayError> {
        let Some(spec) = spec.filter(|s| !s.text.trim().is_empty()) else {
            return Ok(image.to_rgb8());
        };

        let (width, height) = image.dimensions();
        let font = self.fonts.resolve(&spec.font_preferred, &spec.font_fallback)?;
        let font_size = spec.font_size(width, height);
        let (tile_width, tile_height) = spec.tile_dims(width, height);

        let key = TileKey {
            text: spec.text.trim().to_string(),
            font_id: font.id.clone(),
            font_size,
            tile_width,
            tile_height,
            color: spec.color,
            opacity: spec.effective_opacity(),
            angle_centideg: (spec.angle * 100.0).round() as i32,
            text_offset: spec.text_offset,
        };
        let tile = self
            .cache
            .get_or_render(key, || Ok(render_tile(&font, spec, font_size, tile_width, tile_height)))?;

        let mut canvas = image.to_rgba8();
        tile_over(&mut canvas, &tile, spec.step);
        debug!(width, height, font_size, "Watermark applied");
        Ok(DynamicImage::ImageRgba8(canvas).to_rgb8())
    }

    /// Decode a page, watermark it, and encode it back to PNG.
    pub fn apply_png(&self, png: &[u8], spec: Option<&WatermarkSpec>) -> Result<Vec<u8>, RelayError> {
        let page = decode_image(png)?;
        let marked = self.apply(&page, spec)?;
        encode_png(&DynamicImage::ImageRgb8(marked))
    }
}

fn render_tile(
    font: &LoadedFont,
    spec: &WatermarkSpec,
    font_size: u32,
    tile_width: u32,
    tile_height: u32,
) -> RgbaImage {
    let text = spec.text.trim();
    let scale = PxScale::from(font_size as f32);
    let (text_w, text_h) = text_size(scale, &font.font, text);

    let mut tile = RgbaImage::new(tile_width, tile_height);
    let x = (tile_width as i32 - text_w as i32) / 2;
    let y = (tile_height as i32 - text_h as i32) / 2 + spec.text_offset;
    let [r, g, b] = spec.color;
    let fill = Rgba([r, g, b, spec.effective_opacity()]);
    draw_text_mut(&mut tile, fill, x, y, scale, &font.font, text);

    rotate_expanded(&tile, spec.angle)
}

/// Rotate counter-clockwise by `angle` degrees, growing the canvas to fit.
fn rotate_expanded(tile: &RgbaImage, angle: f32) -> RgbaImage {
    if angle.rem_euclid(360.0) == 0.0 {
        return tile.clone();
    }
    let theta = angle.to_radians();
    let (w, h) = (tile.width() as f32, tile.height() as f32);
    let (sin, cos) = (theta.sin().abs(), theta.cos().abs());
    let side_w = (w * cos + h * sin).ceil().max(w) as u32;
    let side_h = (w * sin + h * cos).ceil().max(h) as u32;

    // Pad to the rotated bounding box first; rotation keeps dimensions.
    let mut padded = RgbaImage::new(side_w, side_h);
    let dx = (side_w - tile.width()) / 2;
    let dy = (side_h - tile.height()) / 2;
    imageops::replace(&mut padded, tile, dx as i64, dy as i64);

    // imageproc turns clockwise for positive theta.
    let rotated = rotate_about_center(&padded, -theta, Interpolation::Bilinear, Rgba([0, 0, 0, 0]));
    crop_to_rotated(rotated, w, h, sin, cos)
}

fn crop_to_rotated(mut img: RgbaImage, w: f32, h: f32, sin: f32, cos: f32) -> RgbaImage {
    let want_w = ((w * cos + h * sin).ceil() as u32).clamp(1, img.width());
    let want_h = ((w * sin + h * cos).ceil() as u32).clamp(1, img.height());
    let x = (img.width() - want_w) / 2;
    let y = (img.height() - want_h) / 2;
    imageops::crop(&mut img, x, y, want_w, want_h).to_image()
}

fn tile_over(canvas: &mut RgbaImage, tile: &RgbaImage, step: u32) {
    let (tw, th) = (tile.width() as i64, tile.height() as i64);
    let step_x = (step as i64).max(tw / 2).max(1);
    let step_y = (step as i64).max(th / 2).max(1);
    let (cw, ch) = (canvas.width() as i64, canvas.height() as i64);

    let mut y = -th;
    while y < ch + th {
        let mut x = -tw;
        while x < cw + tw {
            imageops::overlay(canvas, tile, x, y);
            x += step_x;
        }
        y += step_y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(text: &str) -> WatermarkSpec {
        WatermarkSpec::from_settings(&WatermarkSettings::default(), text).unwrap()
    }

    fn page() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 300, image::Rgb([255, 255, 255])))
    }

    fn compositor_with_font() -> Option<Compositor> {
        let fonts = FontLibrary::default();
        let d = WatermarkSettings::default();
        if fonts.resolve(&d.font_preferred, &d.font_fallback).is_err() {
            println!("SKIP: no TrueType font installed");
            return None;
        }
        Some(Compositor::with_fonts(Arc::new(TileCache::new(4)), fonts))
    }

    #[test]
    fn blank_text_is_no_watermark() {
        assert!(WatermarkSpec::from_settings(&WatermarkSettings::default(), "  \n").is_none());
    }

    #[test]
    fn no_spec_returns_page_as_rgb() {
        let compositor = Compositor::with_fonts(Arc::new(TileCache::new(1)), FontLibrary::new(vec![]));
        let src = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, Rgba([9, 8, 7, 255])));
        let out = compositor.apply(&src, None).unwrap();
        assert_eq!(out, src.to_rgb8());
        assert!(compositor.cache().is_empty());
    }

    #[test]
    fn opacity_is_floored() {
        let mut s = spec("X");
        s.opacity = 0;
        assert_eq!(s.effective_opacity(), MIN_OPACITY);
        s.opacity = 255;
        assert_eq!(s.effective_opacity(), 255);
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let base = spec("X");
        let changed = base.clone().with_overrides(&WatermarkOverrides {
            opacity: Some(200),
            step: Some(0),
            ..Default::default()
        });
        assert_eq!(changed.opacity, 200);
        assert_eq!(changed.step, 1);
        assert_eq!(changed.angle, base.angle);
        assert_eq!(changed.color, base.color);
    }

    #[test]
    fn font_size_tracks_larger_side_with_floor() {
        let s = spec("X");
        assert_eq!(s.font_size(3000, 2000), 90);
        assert_eq!(s.font_size(100, 50), 18);
        assert_eq!(s.tile_dims(1000, 400), (600, 100));
    }

    #[test]
    fn rotation_expands_bounds() {
        let tile = RgbaImage::from_pixel(100, 20, Rgba([0, 0, 0, 255]));
        let upright = rotate_expanded(&tile, 90.0);
        assert!(upright.height() >= 99 && upright.width() <= 22);
        assert_eq!(rotate_expanded(&tile, 0.0).dimensions(), (100, 20));
        let tilted = rotate_expanded(&tile, -25.0);
        assert!(tilted.width() > 90 && tilted.height() > 50);
    }

    #[test]
    fn grid_covers_every_corner() {
        let mut canvas = RgbaImage::from_pixel(50, 50, Rgba([255, 255, 255, 255]));
        let tile = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        tile_over(&mut canvas, &tile, 10);
        for (x, y) in [(0, 0), (49, 0), (0, 49), (49, 49), (25, 25)] {
            assert_eq!(canvas.get_pixel(x, y).0, [0, 0, 0, 255], "pixel {x},{y}");
        }
    }

    #[test]
    fn same_spec_twice_is_byte_identical_and_renders_once() {
        let Some(compositor) = compositor_with_font() else { return };
        let s = spec("CONFIDENTIAL");
        let a = compositor.apply(&page(), Some(&s)).unwrap();
        let b = compositor.apply(&page(), Some(&s)).unwrap();
        assert_eq!(a.as_raw(), b.as_raw());
        assert_eq!(compositor.cache().stats(), CacheStats { hits: 1, renders: 1 });
        assert_ne!(a, page().to_rgb8(), "watermark should change some pixels");
    }

    #[test]
    fn png_round_trip_keeps_dimensions() {
        let Some(compositor) = compositor_with_font() else { return };
        let png = encode_png(&page()).unwrap();
        let marked = compositor.apply_png(&png, Some(&spec("DRAFT"))).unwrap();
        assert_eq!(decode_image(&marked).unwrap().dimensions(), (400, 300));
    }
}
