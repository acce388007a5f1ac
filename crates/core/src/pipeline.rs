//! Per-batch inference stage: extract tile inputs, run one predictor call,
//! pair every output with the tile it came from.

use ndarray::{s, Array3, ArrayD, Axis, Ix3};
use tracing::debug;

use crate::error::{inference_error, Result};
use crate::expand::ExpandedPlanes;
use crate::model::{InputLayout, ModelDescriptor};
use crate::types::TileRect;

/// One model input, tagged with its position in the submitted batch.
#[derive(Debug, Clone)]
pub struct TileInput {
    pub index: usize,
    pub data: ArrayD<f32>,
}

/// One model output. `index` must echo the [`TileInput::index`] it answers.
#[derive(Debug, Clone)]
pub struct TileOutput {
    pub index: usize,
    pub data: ArrayD<f32>,
}

/// External inference collaborator.
///
/// Implementations may reorder outputs freely but must return exactly one
/// output per input carrying the input's index. Calls are blocking and run on
/// the blocking thread pool.
pub trait Predictor: Send + Sync {
    fn predict(&self, batch: Vec<TileInput>) -> Result<Vec<TileOutput>>;
}

impl<F> Predictor for F
where
    F: Fn(Vec<TileInput>) -> Result<Vec<TileOutput>> + Send + Sync,
{
    fn predict(&self, batch: Vec<TileInput>) -> Result<Vec<TileOutput>> {
        self(batch)
    }
}

/// A model output routed back to its tile, normalized to planar `[3,T,T]`.
#[derive(Debug)]
pub struct RoutedTile {
    pub rect: TileRect,
    pub block: Array3<f32>,
}

/// Copy the model input for `rect` out of the expanded planes.
///
/// The tile's input window starts at `(rect.x, rect.y)` in expanded
/// coordinates, which is `rect` shifted left/up by the margin.
pub fn extract_tile(planes: &ExpandedPlanes, rect: &TileRect, layout: InputLayout) -> ArrayD<f32> {
    let side = rect.size + 2 * planes.shrink;
    let window = planes
        .data
        .slice(s![.., rect.y..rect.y + side, rect.x..rect.x + side]);
    match layout {
        InputLayout::Planar => window.to_owned().into_dyn(),
        InputLayout::Interleaved => window
            .permuted_axes([1, 2, 0])
            .as_standard_layout()
            .into_owned()
            .into_dyn(),
    }
}

/// Run one batch through the predictor and route every output to its tile.
pub fn run_batch(
    planes: &ExpandedPlanes,
    descriptor: &ModelDescriptor,
    rects: &[TileRect],
    predictor: &dyn Predictor,
) -> Result<Vec<RoutedTile>> {
    let inputs: Vec<TileInput> = rects
        .iter()
        .enumerate()
        .map(|(index, rect)| TileInput {
            index,
            data: extract_tile(planes, rect, descriptor.layout),
        })
        .collect();

    let outputs = predictor.predict(inputs)?;
    if outputs.len() != rects.len() {
        return Err(inference_error(format!(
            "predictor returned {} outputs for {} inputs",
            outputs.len(),
            rects.len()
        )));
    }

    let expected = descriptor.tile_output_shape();
    let mut slots: Vec<Option<Array3<f32>>> = vec![None; rects.len()];
    for output in outputs {
        let slot = slots.get_mut(output.index).ok_or_else(|| {
            inference_error(format!(
                "output index {} outside batch of {}",
                output.index,
                rects.len()
            ))
        })?;
        if slot.is_some() {
            return Err(inference_error(format!(
                "duplicate output for index {}",
                output.index
            )));
        }
        *slot = Some(to_planar(output.data, &expected, descriptor.layout)?);
    }

    debug!(tiles = rects.len(), "Batch inference complete");

    rects
        .iter()
        .zip(slots)
        .map(|(rect, slot)| {
            let block = slot.ok_or_else(|| inference_error("missing output for a tile"))?;
            Ok(RoutedTile { rect: *rect, block })
        })
        .collect()
}

/// Strip a leading batch dimension of 1, check the shape and return `[3,T,T]`.
fn to_planar(data: ArrayD<f32>, expected: &[usize], layout: InputLayout) -> Result<Array3<f32>> {
    let data = if data.ndim() == expected.len() + 1 && data.shape()[0] == 1 {
        data.index_axis_move(Axis(0), 0)
    } else {
        data
    };
    if data.shape() != expected {
        return Err(inference_error(format!(
            "output shape {:?} does not match expected {:?}",
            data.shape(),
            expected
        )));
    }
    let block = data
        .into_dimensionality::<Ix3>()
        .map_err(|e| inference_error(format!("output rank: {e}")))?;
    Ok(match layout {
        InputLayout::Planar => block,
        InputLayout::Interleaved => block.permuted_axes([2, 0, 1]).as_standard_layout().into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Waifu2xError;
    use crate::expand::expand;
    use crate::model::ValueRange;
    use crate::types::Image;

    fn descriptor(layout: InputLayout) -> ModelDescriptor {
        let side = 4 + 2 * 2;
        ModelDescriptor {
            name: "test".into(),
            input_shape: match layout {
                InputLayout::Planar => vec![3, side, side],
                InputLayout::Interleaved => vec![side, side, 3],
            },
            shrink_size: 2,
            out_scale: 1,
            block_size: 4,
            shrink_after_handled: false,
            input_name: "in".into(),
            output_name: "out".into(),
            layout,
            value_range: ValueRange::Unit,
        }
    }

    fn ramp(width: usize, height: usize) -> Image {
        let mut rgb = Vec::new();
        for y in 0..height {
            for x in 0..width {
                rgb.extend_from_slice(&[(x + 10 * y) as u8, 0, 255]);
            }
        }
        Image::from_rgb(width, height, &rgb)
    }

    /// Returns each input's center block, in reverse order.
    fn crop_center(batch: Vec<TileInput>) -> Result<Vec<TileOutput>> {
        Ok(batch
            .into_iter()
            .rev()
            .map(|input| TileOutput {
                index: input.index,
                data: input.data.slice(s![.., 2..6, 2..6]).to_owned().into_dyn(),
            })
            .collect())
    }

    #[test]
    fn test_extract_tile_window() {
        let image = ramp(8, 8);
        let planes = expand(&image, 2).unwrap();
        let rect = TileRect { x: 4, y: 0, size: 4 };
        let tile = extract_tile(&planes, &rect, InputLayout::Planar);
        assert_eq!(tile.shape(), &[3, 8, 8]);
        // window row 2 col 2 is source pixel (4, 0)
        let expected = f32::from(image.r[4]) / 255.0 + crate::expand::CLIP_ETA8;
        assert!((tile[[0, 2, 2]] - expected).abs() < 1e-6);
        // window row 0 is the replicated top margin
        assert_eq!(tile[[0, 0, 3]], f32::from(image.r[5]) / 255.0);
    }

    #[test]
    fn test_extract_every_tile_of_large_ramp() {
        let (w, h, shrink) = (300usize, 300usize, 7usize);
        let mut rgb = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                rgb.extend_from_slice(&[
                    ((x + y) % 256) as u8,
                    ((x * 3) % 256) as u8,
                    ((y * 5 + 17) % 256) as u8,
                ]);
            }
        }
        let image = Image::from_rgb(w, h, &rgb);
        let planes = expand(&image, shrink).unwrap();
        let rects = crate::tiling::crop_rects(w, h, 128);
        assert_eq!(rects.len(), 9);

        let source = image.planes();
        for rect in &rects {
            let tile = extract_tile(&planes, rect, InputLayout::Planar);
            assert_eq!(tile.shape(), &[3, 142, 142], "{rect:?}");
            for wy in 0..142 {
                for wx in 0..142 {
                    // window coordinates relative to the unexpanded image
                    let iy = (rect.y + wy) as isize - shrink as isize;
                    let ix = (rect.x + wx) as isize - shrink as isize;
                    let inside = (0..h as isize).contains(&iy) && (0..w as isize).contains(&ix);
                    let sy = iy.clamp(0, h as isize - 1) as usize;
                    let sx = ix.clamp(0, w as isize - 1) as usize;
                    let bias = if inside { crate::expand::CLIP_ETA8 } else { 0.0 };
                    for c in 0..3 {
                        let expected = f32::from(source[c][sy * w + sx]) / 255.0 + bias;
                        let got = tile[[c, wy, wx]];
                        assert!(
                            (got - expected).abs() < 1e-6,
                            "{rect:?} c={c} window ({wx}, {wy}): {got} != {expected}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_extract_tile_interleaved() {
        let planes = expand(&ramp(4, 4), 2).unwrap();
        let rect = TileRect { x: 0, y: 0, size: 4 };
        let planar = extract_tile(&planes, &rect, InputLayout::Planar);
        let packed = extract_tile(&planes, &rect, InputLayout::Interleaved);
        assert_eq!(packed.shape(), &[8, 8, 3]);
        assert_eq!(packed[[3, 5, 2]], planar[[2, 3, 5]]);
        assert!(packed.is_standard_layout());
    }

    #[test]
    fn test_run_batch_pairs_reordered_outputs() {
        let image = ramp(8, 8);
        let planes = expand(&image, 2).unwrap();
        let rects = crate::tiling::crop_rects(8, 8, 4);
        let routed = run_batch(&planes, &descriptor(InputLayout::Planar), &rects, &crop_center).unwrap();
        assert_eq!(routed.len(), 4);
        for tile in routed {
            let src = image.r[tile.rect.y * 8 + tile.rect.x];
            let expected = f32::from(src) / 255.0 + crate::expand::CLIP_ETA8;
            assert!((tile.block[[0, 0, 0]] - expected).abs() < 1e-6, "{:?}", tile.rect);
        }
    }

    #[test]
    fn test_run_batch_interleaved_outputs_become_planar() {
        let planes = expand(&ramp(4, 4), 2).unwrap();
        let rects = [TileRect { x: 0, y: 0, size: 4 }];
        let predictor = |batch: Vec<TileInput>| -> Result<Vec<TileOutput>> {
            Ok(batch
                .into_iter()
                .map(|input| TileOutput {
                    index: input.index,
                    data: input.data.slice(s![2..6, 2..6, ..]).to_owned().into_dyn(),
                })
                .collect())
        };
        let routed =
            run_batch(&planes, &descriptor(InputLayout::Interleaved), &rects, &predictor).unwrap();
        assert_eq!(routed[0].block.shape(), &[3, 4, 4]);
        assert_eq!(routed[0].block[[2, 1, 1]], planes.data[[2, 3, 3]]);
    }

    #[test]
    fn test_run_batch_accepts_leading_unit_dim() {
        let planes = expand(&ramp(4, 4), 2).unwrap();
        let rects = [TileRect { x: 0, y: 0, size: 4 }];
        let predictor = |batch: Vec<TileInput>| -> Result<Vec<TileOutput>> {
            Ok(batch
                .into_iter()
                .map(|input| TileOutput {
                    index: input.index,
                    data: input
                        .data
                        .slice(s![.., 2..6, 2..6])
                        .to_owned()
                        .insert_axis(Axis(0))
                        .into_dyn(),
                })
                .collect())
        };
        let routed = run_batch(&planes, &descriptor(InputLayout::Planar), &rects, &predictor).unwrap();
        assert_eq!(routed[0].block.shape(), &[3, 4, 4]);
    }

    #[test]
    fn test_run_batch_rejects_bad_indices() {
        let planes = expand(&ramp(8, 4), 2).unwrap();
        let rects = crate::tiling::crop_rects(8, 4, 4);
        let duplicate = |batch: Vec<TileInput>| -> Result<Vec<TileOutput>> {
            Ok(batch
                .into_iter()
                .map(|input| TileOutput {
                    index: 0,
                    data: input.data.slice(s![.., 2..6, 2..6]).to_owned().into_dyn(),
                })
                .collect())
        };
        let err = run_batch(&planes, &descriptor(InputLayout::Planar), &rects, &duplicate).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");

        let short = |_: Vec<TileInput>| -> Result<Vec<TileOutput>> { Ok(Vec::new()) };
        let err = run_batch(&planes, &descriptor(InputLayout::Planar), &rects, &short).unwrap_err();
        assert!(matches!(err, Waifu2xError::InferenceError(_)));
    }

    #[test]
    fn test_run_batch_rejects_wrong_shape() {
        let planes = expand(&ramp(4, 4), 2).unwrap();
        let rects = [TileRect { x: 0, y: 0, size: 4 }];
        let passthrough = |batch: Vec<TileInput>| -> Result<Vec<TileOutput>> {
            Ok(batch
                .into_iter()
                .map(|input| TileOutput {
                    index: input.index,
                    data: input.data,
                })
                .collect())
        };
        let err = run_batch(&planes, &descriptor(InputLayout::Planar), &rects, &passthrough).unwrap_err();
        assert!(err.to_string().contains("shape"), "{err}");
    }

    #[test]
    fn test_predictor_error_propagates() {
        let planes = expand(&ramp(4, 4), 2).unwrap();
        let rects = [TileRect { x: 0, y: 0, size: 4 }];
        let failing = |_: Vec<TileInput>| -> Result<Vec<TileOutput>> {
            Err(inference_error("device lost"))
        };
        let err = run_batch(&planes, &descriptor(InputLayout::Planar), &rects, &failing).unwrap_err();
        assert_eq!(err.to_string(), "inference failed: device lost");
    }
}
