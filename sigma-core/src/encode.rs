use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;

pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Encodes an image as PNG and returns the bytes as standard base64.
pub fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_png_base64_decodes_back() -> Result<()> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([7, 8, 9])));
        let encoded = image_to_base64_png(&img)?;

        let bytes = BASE64_STANDARD.decode(encoded)?;
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&bytes)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(2, 1).0, [7, 8, 9]);
        Ok(())
    }
}
