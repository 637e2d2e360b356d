use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};

use crate::output::is_channel_count;
use crate::RawImage;

/// Converts an extracted image into 8-bit RGB.
pub fn normalize(raw: RawImage) -> Result<RgbImage> {
    let rgb = match raw {
        RawImage::Decoded(img) => img.to_rgb8(),
        RawImage::Pixels(tensor) => tensor_to_rgb(&tensor)?,
    };
    if rgb.width() == 0 || rgb.height() == 0 {
        bail!("image has no pixels");
    }
    Ok(rgb)
}

pub fn normalize_to_dynamic(raw: RawImage) -> Result<DynamicImage> {
    normalize(raw).map(DynamicImage::ImageRgb8)
}

/// Converts a pixel tensor into an RGB image.
///
/// Accepts `(H, W)`, `(C, H, W)` or `(H, W, C)` with 1, 3 or 4 channels, plus
/// any number of leading singleton dimensions. Float data whose maximum does
/// not exceed 1.0 is treated as normalized and scaled to `0..=255`.
pub fn tensor_to_rgb(img: &Tensor) -> Result<RgbImage> {
    let mut img = img.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    while img.rank() > 3 && img.dim(0)? == 1 {
        img = img.squeeze(0)?;
    }
    if img.rank() == 2 {
        img = img.unsqueeze(0)?;
    }
    if img.rank() != 3 {
        bail!("expected a single image, got tensor of shape {:?}", img.dims());
    }

    // A plane count in front wins, even when the last axis could be one too.
    if is_channel_count(img.dim(0)?) {
        img = img.permute((1, 2, 0))?;
    }
    let (height, width, channels) = img.dims3()?;
    let img = match channels {
        3 => img,
        4 => img.narrow(2, 0, 3)?,
        1 => img.broadcast_as((height, width, 3))?,
        other => bail!("unsupported channel count {other}"),
    };

    let max = img.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    let img = if max <= 1.0 { (img * 255.0)? } else { img };
    let pixels = img
        .clamp(0f32, 255f32)?
        .round()?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;

    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_first_normalized_with_alpha() -> Result<()> {
        // (1, 4, 2, 5): batch of one, RGBA planes, values in [0, 1].
        let mut data = Vec::new();
        for plane in 0..4 {
            for i in 0..10 {
                data.push(match plane {
                    0 => 1.0f32,
                    1 => 0.5,
                    2 => i as f32 / 9.0,
                    _ => 0.25,
                });
            }
        }
        let tensor = Tensor::from_vec(data, (1, 4, 2, 5), &Device::Cpu)?;
        let rgb = tensor_to_rgb(&tensor)?;

        assert_eq!(rgb.dimensions(), (5, 2));
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 128, 0]);
        assert_eq!(rgb.get_pixel(4, 1).0, [255, 128, 255]);
        assert_eq!(rgb.as_raw().len(), 5 * 2 * 3);
        Ok(())
    }

    #[test]
    fn test_channel_last_bytes_kept() -> Result<()> {
        let data: Vec<f32> = vec![10.0, 20.0, 30.0, 200.0, 210.0, 220.0];
        let tensor = Tensor::from_vec(data, (2, 1, 3), &Device::Cpu)?;
        let rgb = tensor_to_rgb(&tensor)?;
        assert_eq!(rgb.dimensions(), (1, 2));
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 20, 30]);
        assert_eq!(rgb.get_pixel(0, 1).0, [200, 210, 220]);
        Ok(())
    }

    #[test]
    fn test_leading_plane_axis_wins_over_trailing() -> Result<()> {
        // (3, 8, 4): RGB planes of an 8x4 image, the trailing 4 is the width.
        let mut data = Vec::new();
        for plane in 0..3 {
            for _ in 0..32 {
                data.push([0.0f32, 0.5, 1.0][plane]);
            }
        }
        let tensor = Tensor::from_vec(data, (3, 8, 4), &Device::Cpu)?;
        let rgb = tensor_to_rgb(&tensor)?;
        assert_eq!(rgb.dimensions(), (4, 8));
        assert_eq!(rgb.get_pixel(3, 7).0, [0, 128, 255]);

        let grey = Tensor::ones((1, 6, 3), DType::F32, &Device::Cpu)?;
        assert_eq!(tensor_to_rgb(&grey)?.dimensions(), (3, 6));
        Ok(())
    }

    #[test]
    fn test_grey_plane_is_replicated() -> Result<()> {
        let tensor = Tensor::from_vec(vec![0.0f32, 1.0, 0.0, 1.0], (2, 2), &Device::Cpu)?;
        let rgb = tensor_to_rgb(&tensor)?;
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
        assert_eq!(rgb.get_pixel(0, 1).0, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_out_of_range_values_are_clamped() -> Result<()> {
        let tensor = Tensor::from_vec(vec![-5.0f32, 300.0, 128.0], (1, 1, 3), &Device::Cpu)?;
        let rgb = tensor_to_rgb(&tensor)?;
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 255, 128]);
        Ok(())
    }

    #[test]
    fn test_batch_is_rejected() -> Result<()> {
        let tensor = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(tensor_to_rgb(&tensor).is_err());
        Ok(())
    }

    #[test]
    fn test_decoded_image_drops_alpha() -> Result<()> {
        let rgba = image::RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 4]));
        let rgb = normalize(RawImage::Decoded(DynamicImage::ImageRgba8(rgba)))?;
        assert_eq!(rgb.get_pixel(1, 1).0, [1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let raw = RawImage::Decoded(DynamicImage::new_rgb8(0, 0));
        assert!(normalize(raw).is_err());
    }
}
