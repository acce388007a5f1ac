//! Reassembly of per-tile outputs into the final RGBA buffer.
//!
//! [`ResultMerger`] owns four output planes. It is driven by a single merge
//! task ([`spawn_merger`]) that receives tiles and the alpha plane over a
//! channel, so concurrent batches never touch the planes directly.

use ndarray::Array3;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{reassembly_failed, Result, Waifu2xError};
use crate::model::{ModelDescriptor, ValueRange};
use crate::types::{Region, TileRect};

/// Output geometry shared by the batch tasks and the merger. Batch tasks use
/// it to quantize tiles on the blocking pool; the merger only copies bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlacement {
    out_width: usize,
    out_height: usize,
    canvas_width: usize,
    canvas_height: usize,
    out_scale: usize,
    margin: usize,
    tile_edge: usize,
    value_range: ValueRange,
}

/// One tile's owned output region, already clipped, scaled and truncated to
/// bytes. Each plane holds `dest.width * dest.height` row-major samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizedTile {
    pub dest: Region,
    pub rgb: [Vec<u8>; 3],
}

impl TilePlacement {
    /// `width x height` is the true source size; `canvas_*` is the size the
    /// tiles were computed over (larger when the source was pre-expanded).
    pub fn new(
        width: usize,
        height: usize,
        canvas_width: usize,
        canvas_height: usize,
        descriptor: &ModelDescriptor,
    ) -> Result<Self> {
        let scaled = |v: usize| {
            v.checked_mul(descriptor.out_scale).ok_or_else(|| {
                reassembly_failed(format!(
                    "output size {v} x {} overflows",
                    descriptor.out_scale
                ))
            })
        };
        let out_width = scaled(width)?;
        let out_height = scaled(height)?;
        out_width
            .checked_mul(out_height)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| {
                reassembly_failed(format!("output {out_width}x{out_height} overflows"))
            })?;
        Ok(Self {
            out_width,
            out_height,
            canvas_width,
            canvas_height,
            out_scale: descriptor.out_scale,
            margin: descriptor.output_margin(),
            tile_edge: descriptor.output_tile_size(),
            value_range: descriptor.value_range,
        })
    }

    pub fn out_width(&self) -> usize {
        self.out_width
    }

    pub fn out_height(&self) -> usize {
        self.out_height
    }

    /// Output-space region `rect` writes, after clipping to the true output
    /// bounds. Regions of distinct tiles from one coverage never overlap.
    pub fn destination(&self, rect: &TileRect) -> Region {
        let owned = rect.owned_region(self.canvas_width, self.canvas_height);
        let x = owned.x * self.out_scale;
        let y = owned.y * self.out_scale;
        Region {
            x,
            y,
            width: (owned.width * self.out_scale).min(self.out_width.saturating_sub(x)),
            height: (owned.height * self.out_scale).min(self.out_height.saturating_sub(y)),
        }
    }

    /// Cut the owned part out of a planar `[3,T,T]` tile output.
    ///
    /// Values are scaled to `[0,255]`, clipped and truncated to bytes.
    pub fn quantize(&self, rect: &TileRect, block: &Array3<f32>) -> Result<QuantizedTile> {
        let edge = self.tile_edge;
        if block.shape() != &[3, edge, edge] {
            return Err(reassembly_failed(format!(
                "tile output shape {:?}, expected [3, {edge}, {edge}]",
                block.shape()
            )));
        }

        let dest = self.destination(rect);
        let src_x = dest.x + self.margin - rect.x * self.out_scale;
        let src_y = dest.y + self.margin - rect.y * self.out_scale;
        let multiplier = self.value_range.multiplier();

        let rgb = [0, 1, 2].map(|c| {
            let mut plane = Vec::with_capacity(dest.width * dest.height);
            for row in 0..dest.height {
                for col in 0..dest.width {
                    let value = block[[c, src_y + row, src_x + col]] * multiplier;
                    plane.push(value.clamp(0.0, 255.0) as u8);
                }
            }
            plane
        });
        Ok(QuantizedTile { dest, rgb })
    }
}

pub struct ResultMerger {
    placement: TilePlacement,
    r: Vec<u8>,
    g: Vec<u8>,
    b: Vec<u8>,
    a: Vec<u8>,
    tiles_merged: usize,
}

fn plane(len: usize, fill: u8) -> Result<Vec<u8>> {
    let mut plane = Vec::new();
    plane
        .try_reserve_exact(len)
        .map_err(|e| reassembly_failed(format!("cannot allocate {len} byte plane: {e}")))?;
    plane.resize(len, fill);
    Ok(plane)
}

impl ResultMerger {
    pub fn new(placement: TilePlacement) -> Result<Self> {
        let size = placement.out_width * placement.out_height;
        Ok(Self {
            placement,
            r: plane(size, 0)?,
            g: plane(size, 0)?,
            b: plane(size, 0)?,
            a: plane(size, u8::MAX)?,
            tiles_merged: 0,
        })
    }

    pub fn placement(&self) -> TilePlacement {
        self.placement
    }

    pub fn out_width(&self) -> usize {
        self.placement.out_width
    }

    pub fn out_height(&self) -> usize {
        self.placement.out_height
    }

    pub fn tiles_merged(&self) -> usize {
        self.tiles_merged
    }

    pub fn destination(&self, rect: &TileRect) -> Region {
        self.placement.destination(rect)
    }

    /// Quantize and copy a planar `[3,T,T]` tile output in one step.
    pub fn merge_rgb(&mut self, rect: &TileRect, block: &Array3<f32>) -> Result<()> {
        let tile = self.placement.quantize(rect, block)?;
        self.place(tile)
    }

    /// Copy a quantized tile into the planes.
    pub fn place(&mut self, tile: QuantizedTile) -> Result<()> {
        let QuantizedTile { dest, rgb } = tile;
        let out_width = self.placement.out_width;
        if dest.x + dest.width > out_width || dest.y + dest.height > self.placement.out_height {
            return Err(reassembly_failed(format!(
                "tile region {dest:?} outside {out_width}x{} output",
                self.placement.out_height
            )));
        }
        let samples = dest.width * dest.height;
        if rgb.iter().any(|p| p.len() != samples) {
            return Err(reassembly_failed(format!(
                "tile planes do not hold {samples} samples"
            )));
        }
        if dest.is_empty() {
            return Ok(());
        }

        for (plane, src) in [&mut self.r, &mut self.g, &mut self.b].into_iter().zip(&rgb) {
            for (row, src_row) in src.chunks_exact(dest.width).enumerate() {
                let start = (dest.y + row) * out_width + dest.x;
                plane[start..start + dest.width].copy_from_slice(src_row);
            }
        }
        self.tiles_merged += 1;
        Ok(())
    }

    /// Replace the alpha plane. Leaves R/G/B untouched.
    pub fn merge_alpha(&mut self, alpha: Vec<u8>) -> Result<()> {
        if alpha.len() != self.a.len() {
            return Err(reassembly_failed(format!(
                "alpha plane has {} samples, expected {}",
                alpha.len(),
                self.a.len()
            )));
        }
        self.a = alpha;
        Ok(())
    }

    /// Interleave the planes into packed RGBA8.
    pub fn freeze(self) -> Result<Vec<u8>> {
        let pixels = self.placement.out_width * self.placement.out_height;
        if [&self.r, &self.g, &self.b, &self.a]
            .iter()
            .any(|plane| plane.len() != pixels)
        {
            return Err(reassembly_failed("plane sizes diverged"));
        }

        let mut packed = plane(pixels * 4, 0)?;
        for (i, px) in packed.chunks_exact_mut(4).enumerate() {
            px.copy_from_slice(&[self.r[i], self.g[i], self.b[i], self.a[i]]);
        }
        Ok(packed)
    }
}

/// Work item for the merge task.
#[derive(Debug)]
pub enum MergeCommand {
    Rgb(QuantizedTile),
    Alpha(Vec<u8>),
}

/// Move `merger` into its own task and return the channel feeding it.
///
/// The task drains the channel until every sender is dropped and then hands
/// the merger back. The first merge error is kept and returned; later
/// commands are drained without being applied.
pub fn spawn_merger(
    mut merger: ResultMerger,
    capacity: usize,
) -> (mpsc::Sender<MergeCommand>, JoinHandle<Result<ResultMerger>>) {
    let (tx, mut rx) = mpsc::channel::<MergeCommand>(capacity.max(1));
    let handle = tokio::spawn(async move {
        let mut first_error: Option<Waifu2xError> = None;
        while let Some(command) = rx.recv().await {
            if first_error.is_some() {
                continue;
            }
            let applied = match command {
                MergeCommand::Rgb(tile) => merger.place(tile),
                MergeCommand::Alpha(alpha) => merger.merge_alpha(alpha),
            };
            if let Err(error) = applied {
                warn!(%error, "Merge failed, discarding remaining tiles");
                first_error = Some(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => {
                debug!(tiles = merger.tiles_merged(), "Merge task finished");
                Ok(merger)
            }
        }
    });
    (tx, handle)
}
