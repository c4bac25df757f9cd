//! Pixel encoding: `NormalizedImage` → BLIP `pixel_values` tensor.
//!
//! Mirrors the BLIP image processor: bicubic resize to a square of the vision
//! tower's input size, scale to `[0, 1]`, normalise with the CLIP mean/std,
//! channels-first with a leading batch dimension. The tensor is built on the
//! CPU in F32 and only then moved and cast for the target device.

use crate::pipeline::normalize::NormalizedImage;
use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use tracing::debug;

/// Input resolution of the BLIP captioning vision tower.
pub const BLIP_IMAGE_SIZE: usize = 384;

/// CLIP normalisation constants used by the BLIP processor.
pub const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// Build the `(1, 3, size, size)` pixel tensor for `image`.
pub fn pixel_values(
    image: &NormalizedImage,
    size: usize,
    device: &Device,
    dtype: DType,
) -> candle_core::Result<Tensor> {
    let side = size as u32;
    let resized = imageops::resize(image.as_rgb(), side, side, FilterType::CatmullRom);
    let data = resized.into_raw();

    let cpu = Device::Cpu;
    let pixels = Tensor::from_vec(data, (size, size, 3), &cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &cpu)?.reshape((3, 1, 1))?;

    let normalised = (pixels.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;

    debug!(
        "Encoded {}x{} image → pixel_values (1, 3, {}, {})",
        image.width(),
        image.height(),
        size,
        size
    );
    normalised.unsqueeze(0)?.to_dtype(dtype)?.to_device(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageFormatTag;
    use crate::pipeline::normalize::normalize;
    use crate::pipeline::validate::DecodedImage;
    use candle_core::IndexOp;
    use image::{DynamicImage, Rgb, RgbImage};

    fn solid(w: u32, h: u32, px: [u8; 3]) -> NormalizedImage {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb(px)));
        normalize(DecodedImage::new(ImageFormatTag::Png, img).unwrap(), 1024)
    }

    #[test]
    fn shape_is_batch_channels_first() {
        let t = pixel_values(&solid(50, 20, [0, 0, 0]), 32, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(t.dims(), &[1, 3, 32, 32]);
        assert_eq!(t.dtype(), DType::F32);
    }

    #[test]
    fn white_pixels_follow_clip_normalisation() {
        let t = pixel_values(&solid(8, 8, [255, 255, 255]), 8, &Device::Cpu, DType::F32).unwrap();
        for c in 0..3 {
            let v: f32 = t.i((0, c, 4, 4)).unwrap().to_scalar().unwrap();
            let expected = (1.0 - IMAGE_MEAN[c]) / IMAGE_STD[c];
            assert!((v - expected).abs() < 1e-4, "channel {c}: {v} vs {expected}");
        }
    }

    #[test]
    fn half_precision_cast() {
        let t = pixel_values(&solid(4, 4, [9, 9, 9]), 4, &Device::Cpu, DType::F16).unwrap();
        assert_eq!(t.dtype(), DType::F16);
    }
}
