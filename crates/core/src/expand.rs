//! Border expansion: numeric margin around the float planes plus the
//! pixel-level canvas growth for images smaller than one tile.

use ndarray::{s, Array3, ArrayView2};

use crate::error::{Result, Waifu2xError};
use crate::types::Image;

/// Added to every center value after normalization. Empirical correction
/// carried over from upstream waifu2x (improves PSNR by ~0.09 on average).
pub const CLIP_ETA8: f32 = 0.00196;

/// RGB planes normalized to `[0,1]` and padded by `shrink` on every side.
///
/// Stored as one `[3, height + 2*shrink, width + 2*shrink]` array.
#[derive(Debug, Clone)]
pub struct ExpandedPlanes {
    pub data: Array3<f32>,
    pub shrink: usize,
}

impl ExpandedPlanes {
    pub fn width(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn plane(&self, channel: usize) -> ArrayView2<'_, f32> {
        self.data.slice(s![channel, .., ..])
    }
}

/// Expand the RGB planes of `image` by `shrink` pixels of replicated border.
pub fn expand(image: &Image, shrink: usize) -> Result<ExpandedPlanes> {
    image.check_planes().map_err(Waifu2xError::ExpandFailed)?;

    let (w, h) = (image.width, image.height);
    let ex_w = w
        .checked_add(2 * shrink)
        .ok_or_else(|| Waifu2xError::ExpandFailed(format!("width {w} overflows")))?;
    let ex_h = h
        .checked_add(2 * shrink)
        .ok_or_else(|| Waifu2xError::ExpandFailed(format!("height {h} overflows")))?;
    ex_w.checked_mul(ex_h)
        .and_then(|n| n.checked_mul(3))
        .ok_or_else(|| Waifu2xError::ExpandFailed(format!("{ex_w}x{ex_h} planes overflow")))?;

    let mut data = Array3::<f32>::zeros((3, ex_h, ex_w));
    for (c, src) in image.planes().into_iter().enumerate() {
        let mut plane = data.slice_mut(s![c, .., ..]);
        let px = |x: usize, y: usize| f32::from(src[y * w + x]) / 255.0;

        for y in 0..h {
            let row = y + shrink;
            for x in 0..w {
                plane[[row, x + shrink]] = px(x, y) + CLIP_ETA8;
            }
            let (left, right) = (px(0, y), px(w - 1, y));
            for x in 0..shrink {
                plane[[row, x]] = left;
                plane[[row, w + shrink + x]] = right;
            }
        }

        for x in 0..w {
            let (top, bottom) = (px(x, 0), px(x, h - 1));
            for y in 0..shrink {
                plane[[y, x + shrink]] = top;
                plane[[h + shrink + y, x + shrink]] = bottom;
            }
        }

        let corners = [
            (0, 0, px(0, 0)),
            (w + shrink, 0, px(w - 1, 0)),
            (0, h + shrink, px(0, h - 1)),
            (w + shrink, h + shrink, px(w - 1, h - 1)),
        ];
        for (cx, cy, value) in corners {
            plane
                .slice_mut(s![cy..cy + shrink, cx..cx + shrink])
                .fill(value);
        }
    }

    Ok(ExpandedPlanes { data, shrink })
}

/// Grow an image smaller than `block_size` in either dimension to a canvas
/// of at least `block_size x block_size`, original pixels at the top-left and
/// the last row/column replicated outward.
///
/// Images already large enough are returned unchanged. The alpha channel is
/// not carried over; it is processed from the original image.
pub fn pre_expand(image: &Image, block_size: usize) -> Result<Image> {
    image.check_planes().map_err(Waifu2xError::ExpandFailed)?;
    if image.width >= block_size && image.height >= block_size {
        return Ok(Image {
            alpha: None,
            ..image.clone()
        });
    }

    let (w, h) = (image.width, image.height);
    let new_w = w.max(block_size);
    let new_h = h.max(block_size);
    let pixels = new_w
        .checked_mul(new_h)
        .ok_or_else(|| Waifu2xError::ExpandFailed(format!("{new_w}x{new_h} canvas overflows")))?;

    let grow = |src: &[u8]| {
        let mut out = Vec::with_capacity(pixels);
        for y in 0..new_h {
            let row = &src[y.min(h - 1) * w..][..w];
            out.extend_from_slice(row);
            out.resize(out.len() + (new_w - w), row[w - 1]);
        }
        out
    };

    Ok(Image {
        width: new_w,
        height: new_h,
        r: grow(&image.r),
        g: grow(&image.g),
        b: grow(&image.b),
        alpha: None,
    })
}
