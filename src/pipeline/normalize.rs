//! Image normalisation: one color representation, bounded longest edge.
//!
//! The engine only accepts 8-bit RGB. Palette, alpha and grayscale inputs are
//! converted with the `image` crate's standard conversions (alpha dropped,
//! luma replicated). Images whose longest edge exceeds the soft threshold are
//! shrunk with Lanczos3 so the longest edge lands exactly on the threshold.
//!
//! Input already in RGB and within bounds passes through untouched, which
//! makes the stage idempotent.

use crate::pipeline::validate::DecodedImage;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::debug;

/// An RGB image whose longest edge is at most the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    image: RgbImage,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_rgb(self) -> RgbImage {
        self.image
    }
}

/// Target size for an image whose longest edge must become `max_edge`.
///
/// Each edge is `round(dim × max_edge / longest)`, never below 1. Images
/// already within bounds keep their size.
pub fn scaled_dimensions(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_edge {
        return (width, height);
    }
    let ratio = f64::from(max_edge) / f64::from(longest);
    let scale = |dim: u32| ((f64::from(dim) * ratio).round() as u32).clamp(1, max_edge);
    (scale(width), scale(height))
}

/// Normalise a decoded image. Never fails.
pub fn normalize(decoded: DecodedImage, max_edge: u32) -> NormalizedImage {
    let mode = decoded.color_mode();
    let (width, height) = (decoded.width(), decoded.height());
    let rgb = decoded.into_image().into_rgb8();

    let (new_w, new_h) = scaled_dimensions(width, height, max_edge.max(1));
    let image = if (new_w, new_h) == (width, height) {
        rgb
    } else {
        debug!(
            "Resizing {}x{} → {}x{} (max edge {})",
            width, height, new_w, new_h, max_edge
        );
        imageops::resize(&rgb, new_w, new_h, FilterType::Lanczos3)
    };

    debug!("Normalised {} {}x{} → RGB {}x{}", mode, width, height, new_w, new_h);
    NormalizedImage { image }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageFormatTag;
    use crate::pipeline::validate::ColorMode;
    use image::{DynamicImage, GrayImage, Luma, Rgb, Rgba, RgbaImage};

    fn decoded(img: DynamicImage) -> DecodedImage {
        DecodedImage::new(ImageFormatTag::Png, img).unwrap()
    }

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]))
    }

    #[test]
    fn within_bounds_rgb_is_pixel_identical() {
        let img = gradient(40, 25);
        let out = normalize(decoded(DynamicImage::ImageRgb8(img.clone())), 64);
        assert_eq!(out.as_rgb(), &img);
    }

    #[test]
    fn normalisation_is_idempotent() {
        let once = normalize(decoded(DynamicImage::ImageRgb8(gradient(300, 120))), 100);
        let twice = normalize(
            decoded(DynamicImage::ImageRgb8(once.clone().into_rgb())),
            100,
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn longest_edge_lands_on_threshold() {
        let out = normalize(decoded(DynamicImage::ImageRgb8(gradient(2000, 1000))), 1024);
        assert_eq!((out.width(), out.height()), (1024, 512));

        let out = normalize(decoded(DynamicImage::ImageRgb8(gradient(300, 900))), 100);
        assert_eq!((out.width(), out.height()), (33, 100));
    }

    #[test]
    fn aspect_ratio_preserved_within_rounding() {
        for &(w, h, edge) in &[
            (5000u32, 3000u32, 1024u32),
            (2000, 1000, 1024),
            (3000, 4000, 1000),
            (1999, 1001, 640),
            (333, 7777, 384),
            (1025, 1024, 1024),
        ] {
            let (nw, nh) = scaled_dimensions(w, h, edge);
            assert_eq!(nw.max(nh), edge, "{w}x{h}");
            let before = (f64::from(w) / f64::from(h) * 100.0).round() as i64;
            let after = (f64::from(nw) / f64::from(nh) * 100.0).round() as i64;
            assert!(
                (before - after).abs() <= 1,
                "{w}x{h} → {nw}x{nh}: {before} vs {after}"
            );
        }
    }

    #[test]
    fn tiny_edges_never_collapse_to_zero() {
        assert_eq!(scaled_dimensions(10_000, 1, 100), (100, 1));
    }

    #[test]
    fn grayscale_and_alpha_become_rgb() {
        let gray = decoded(DynamicImage::ImageLuma8(GrayImage::from_pixel(3, 3, Luma([200]))));
        assert_eq!(gray.color_mode(), ColorMode::Grayscale);
        let out = normalize(gray, 10);
        assert_eq!(out.as_rgb().get_pixel(1, 1), &Rgb([200, 200, 200]));

        let rgba = decoded(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            2,
            2,
            Rgba([10, 20, 30, 0]),
        )));
        let out = normalize(rgba, 10);
        assert_eq!(out.as_rgb().get_pixel(0, 0), &Rgb([10, 20, 30]));
    }
}
