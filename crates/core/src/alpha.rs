//! Alpha channel detection and independent rescaling.

use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::error::{Result, Waifu2xError};
use crate::types::Image;

const OPAQUE: u8 = u8::MAX;

/// Extract an 8-bit alpha plane, or `None` when the image has no alpha or
/// every pixel is fully opaque.
///
/// 16 and 32 bit samples keep their most significant byte.
pub fn detect(image: &Image) -> Result<Option<Vec<u8>>> {
    let Some(alpha) = &image.alpha else {
        return Ok(None);
    };
    let shift = msb_shift(alpha.bits)?;
    let plane: Vec<u8> = alpha
        .samples
        .iter()
        .map(|sample| ((sample >> shift) & 0xff) as u8)
        .collect();

    if plane.iter().all(|a| *a == OPAQUE) {
        return Ok(None);
    }
    Ok(Some(plane))
}

/// Reject alpha channels stored at a depth [`detect`] cannot read. Cheap
/// enough to run before any tile is dispatched.
pub fn check_depth(image: &Image) -> Result<()> {
    match &image.alpha {
        Some(alpha) => msb_shift(alpha.bits).map(|_| ()),
        None => Ok(()),
    }
}

fn msb_shift(bits: u8) -> Result<u32> {
    match bits {
        8 => Ok(0),
        16 => Ok(8),
        32 => Ok(24),
        other => Err(Waifu2xError::UnsupportedAlphaBits(other)),
    }
}

/// Resample a `width x height` alpha plane to `(width*scale) x (height*scale)`
/// with a Catmull-Rom (bicubic) filter.
pub fn rescale(alpha: Vec<u8>, width: usize, height: usize, scale: usize) -> Result<Vec<u8>> {
    let failed = |msg: String| Waifu2xError::AlphaRescaleFailed(msg);
    if scale == 1 {
        if alpha.len() != width * height {
            return Err(failed(format!(
                "plane has {} samples, expected {}",
                alpha.len(),
                width * height
            )));
        }
        return Ok(alpha);
    }

    let to_u32 = |v: usize| u32::try_from(v).map_err(|_| failed(format!("dimension {v} too large")));
    let (w, h) = (to_u32(width)?, to_u32(height)?);
    let (out_w, out_h) = (
        to_u32(width.saturating_mul(scale))?,
        to_u32(height.saturating_mul(scale))?,
    );

    let source = GrayImage::from_raw(w, h, alpha)
        .ok_or_else(|| failed(format!("plane does not hold {width}x{height} samples")))?;
    let resized = imageops::resize(&source, out_w, out_h, FilterType::CatmullRom);
    Ok(resized.into_raw())
}
