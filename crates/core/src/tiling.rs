//! Tile coverage of a `width x height` image by square blocks.
//!
//! Grid tiles come first, then a right-aligned column, a bottom-aligned row
//! and finally the corner tile. Edge tiles overlap their grid neighbours in
//! the input, but each tile owns a disjoint destination region: grid tiles
//! own their whole block, edge tiles own only the remainder strip no grid
//! tile reaches.

use crate::types::{Region, TileRect};

/// Cover a `width x height` image with `tile_size` blocks.
///
/// Requires `width >= tile_size` and `height >= tile_size` (callers
/// pre-expand undersized images). The tile count is
/// `ceil(width / tile_size) * ceil(height / tile_size)`.
pub fn crop_rects(width: usize, height: usize, tile_size: usize) -> Vec<TileRect> {
    debug_assert!(tile_size > 0);
    debug_assert!(width >= tile_size && height >= tile_size);

    let num_w = width / tile_size;
    let num_h = height / tile_size;
    let rem_w = width % tile_size != 0;
    let rem_h = height % tile_size != 0;

    let mut rects = Vec::with_capacity(width.div_ceil(tile_size) * height.div_ceil(tile_size));
    let tile = |x, y| TileRect {
        x,
        y,
        size: tile_size,
    };

    for i in 0..num_w {
        for j in 0..num_h {
            rects.push(tile(i * tile_size, j * tile_size));
        }
    }
    if rem_w {
        for j in 0..num_h {
            rects.push(tile(width - tile_size, j * tile_size));
        }
    }
    if rem_h {
        for i in 0..num_w {
            rects.push(tile(i * tile_size, height - tile_size));
        }
    }
    if rem_w && rem_h {
        rects.push(tile(width - tile_size, height - tile_size));
    }
    rects
}

impl TileRect {
    /// Source-space region this tile is the sole writer of.
    ///
    /// Starts at the first grid line at or after the tile origin, so an
    /// edge tile yields to the grid tiles it overlaps.
    pub fn owned_region(&self, width: usize, height: usize) -> Region {
        let x0 = self.x.div_ceil(self.size) * self.size;
        let y0 = self.y.div_ceil(self.size) * self.size;
        let x1 = (self.x + self.size).min(width);
        let y1 = (self.y + self.size).min(height);
        Region {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0),
            height: y1.saturating_sub(y0),
        }
    }
}
