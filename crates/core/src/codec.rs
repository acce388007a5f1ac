//! Pixel source and sink backed by the `image` crate.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};

use crate::error::{Result, Waifu2xError};
use crate::types::{AlphaChannel, Image, OutputFormat, Waifu2xOutput};

/// Decode PNG/JPEG bytes into planes. Alpha keeps its native depth: 8 bit,
/// 16 bit, or float mapped onto the full 32 bit range.
pub fn decode(bytes: &[u8]) -> Result<Image> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| Waifu2xError::DecodeFailed(e.to_string()))?;
    let width = decoded.width() as usize;
    let height = decoded.height() as usize;
    if width == 0 || height == 0 {
        return Err(Waifu2xError::DecodeFailed(format!(
            "empty image {width}x{height}"
        )));
    }

    let alpha = match &decoded {
        DynamicImage::ImageLumaA8(buf) => Some(AlphaChannel {
            bits: 8,
            samples: buf.pixels().map(|p| u32::from(p.0[1])).collect(),
        }),
        DynamicImage::ImageRgba8(buf) => Some(AlphaChannel {
            bits: 8,
            samples: buf.pixels().map(|p| u32::from(p.0[3])).collect(),
        }),
        DynamicImage::ImageLumaA16(buf) => Some(AlphaChannel {
            bits: 16,
            samples: buf.pixels().map(|p| u32::from(p.0[1])).collect(),
        }),
        DynamicImage::ImageRgba16(buf) => Some(AlphaChannel {
            bits: 16,
            samples: buf.pixels().map(|p| u32::from(p.0[3])).collect(),
        }),
        DynamicImage::ImageRgba32F(buf) => Some(AlphaChannel {
            bits: 32,
            samples: buf
                .pixels()
                .map(|p| (p.0[3].clamp(0.0, 1.0) as f64 * f64::from(u32::MAX)).round() as u32)
                .collect(),
        }),
        _ => None,
    };

    let rgb = decoded.to_rgb8();
    let mut image = Image::from_rgb(width, height, rgb.as_raw());
    image.alpha = alpha;
    Ok(image)
}

/// Encode an output buffer. PNG keeps alpha when the output has it; JPEG
/// always drops it. `quality` only applies to JPEG (1..=100).
pub fn encode(output: &Waifu2xOutput, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    let failed = |e: image::ImageError| Waifu2xError::EncodeFailed(e.to_string());
    let expected = output.width * output.height * 4;
    if output.pixels.len() != expected {
        return Err(Waifu2xError::EncodeFailed(format!(
            "buffer has {} bytes, expected {expected}",
            output.pixels.len()
        )));
    }
    let width = u32::try_from(output.width)
        .map_err(|_| Waifu2xError::EncodeFailed(format!("width {} too large", output.width)))?;
    let height = u32::try_from(output.height)
        .map_err(|_| Waifu2xError::EncodeFailed(format!("height {} too large", output.height)))?;

    let mut bytes = Vec::new();
    match format {
        OutputFormat::Png if output.has_alpha => {
            PngEncoder::new(&mut bytes)
                .write_image(&output.pixels, width, height, ExtendedColorType::Rgba8)
                .map_err(failed)?;
        }
        OutputFormat::Png => {
            PngEncoder::new(&mut bytes)
                .write_image(&strip_alpha(&output.pixels), width, height, ExtendedColorType::Rgb8)
                .map_err(failed)?;
        }
        OutputFormat::Jpeg => {
            JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
                .write_image(&strip_alpha(&output.pixels), width, height, ExtendedColorType::Rgb8)
                .map_err(failed)?;
        }
    }
    Ok(bytes)
}

fn strip_alpha(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(image: DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, Waifu2xError::DecodeFailed(_)));
    }

    #[test]
    fn test_decode_rgba_keeps_alpha() {
        let mut img = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 255]));
        img.put_pixel(1, 1, Rgba([1, 2, 3, 128]));
        let decoded = decode(&png_bytes(DynamicImage::ImageRgba8(img))).unwrap();
        assert_eq!((decoded.width, decoded.height), (2, 2));
        assert_eq!(decoded.r, vec![10, 10, 10, 1]);
        let alpha = decoded.alpha.unwrap();
        assert_eq!(alpha.bits, 8);
        assert_eq!(alpha.samples, vec![255, 255, 255, 128]);
    }

    #[test]
    fn test_decode_16_bit_alpha() {
        let img = image::ImageBuffer::<image::Rgba<u16>, _>::from_pixel(1, 1, Rgba([0, 0, 0, 0x8000]));
        let decoded = decode(&png_bytes(DynamicImage::ImageRgba16(img))).unwrap();
        let alpha = decoded.alpha.unwrap();
        assert_eq!(alpha.bits, 16);
        assert_eq!(alpha.samples, vec![0x8000]);
    }

    #[test]
    fn test_decode_rgb_has_no_alpha() {
        let img = image::RgbImage::from_pixel(3, 1, image::Rgb([7, 8, 9]));
        let decoded = decode(&png_bytes(DynamicImage::ImageRgb8(img))).unwrap();
        assert!(decoded.alpha.is_none());
        assert_eq!(decoded.b, vec![9, 9, 9]);
    }

    #[test]
    fn test_encode_png_alpha_round_trip() {
        let output = Waifu2xOutput {
            pixels: vec![1, 2, 3, 40, 5, 6, 7, 255],
            width: 2,
            height: 1,
            has_alpha: true,
        };
        let bytes = encode(&output, OutputFormat::Png, 90).unwrap();
        let back = image::load_from_memory(&bytes).unwrap();
        assert_eq!(back.color(), image::ColorType::Rgba8);
        assert_eq!(back.to_rgba8().into_raw(), output.pixels);
    }

    #[test]
    fn test_encode_png_without_alpha_is_rgb() {
        let output = Waifu2xOutput {
            pixels: vec![1, 2, 3, 255],
            width: 1,
            height: 1,
            has_alpha: false,
        };
        let bytes = encode(&output, OutputFormat::Png, 90).unwrap();
        let back = image::load_from_memory(&bytes).unwrap();
        assert_eq!(back.color(), image::ColorType::Rgb8);
    }

    #[test]
    fn test_encode_jpeg() {
        let output = Waifu2xOutput {
            pixels: [200u8, 100, 50, 255].repeat(16 * 16),
            width: 16,
            height: 16,
            has_alpha: true,
        };
        let bytes = encode(&output, OutputFormat::Jpeg, 95).unwrap();
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
        let back = decode(&bytes).unwrap();
        assert!(back.alpha.is_none());
        assert!((i32::from(back.r[0]) - 200).abs() < 8);
    }

    #[test]
    fn test_encode_rejects_short_buffer() {
        let output = Waifu2xOutput {
            pixels: vec![0; 3],
            width: 1,
            height: 1,
            has_alpha: false,
        };
        let err = encode(&output, OutputFormat::Png, 90).unwrap_err();
        assert!(matches!(err, Waifu2xError::EncodeFailed(_)));
    }
}
