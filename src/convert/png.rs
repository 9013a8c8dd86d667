//! PNG passthrough: the upload already is the page.

use super::{decode_image, encode_png, page_filename, ConvertOptions, PageExtra, RenderedPage};
use crate::error::RelayError;
use image::ImageFormat;

/// Wrap a PNG upload as a single page.
///
/// Bytes are passed through untouched when they already decode as an
/// alpha-free PNG; anything else is re-encoded to RGB PNG so downstream
/// stages see one format.
pub fn convert(bytes: Vec<u8>, opts: &ConvertOptions) -> Result<Vec<RenderedPage>, RelayError> {
    let img = decode_image(&bytes)?;
    let is_plain_png =
        image::guess_format(&bytes).ok() == Some(ImageFormat::Png) && !img.color().has_alpha();
    let png = if is_plain_png { bytes } else { encode_png(&img)? };
    Ok(vec![RenderedPage {
        filename: page_filename(&opts.base_name, 0, 1, opts.index_width),
        png,
        page_index: 1,
        pages_total: 1,
        extra: PageExtra::default(),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_of(img: DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn rgb_png_passes_through() {
        let bytes = png_of(DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([1, 2, 3]))));
        let pages = convert(bytes.clone(), &ConvertOptions::new("scan", 300)).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].filename, "scan.png");
        assert_eq!(pages[0].png, bytes);
    }

    #[test]
    fn alpha_png_is_flattened() {
        let bytes = png_of(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            2,
            2,
            Rgba([9, 9, 9, 128]),
        )));
        let pages = convert(bytes.clone(), &ConvertOptions::new("scan", 300)).unwrap();
        assert_ne!(pages[0].png, bytes);
        assert!(!decode_image(&pages[0].png).unwrap().color().has_alpha());
    }

    #[test]
    fn garbage_is_input_error() {
        let err = convert(b"not a png".to_vec(), &ConvertOptions::new("x", 300)).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Input);
    }
}
