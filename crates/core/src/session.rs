//! ONNX Runtime predictor: one `session.run` per tile batch.

use std::path::Path;
use std::sync::{Arc, Mutex};

use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use crate::backend::{build_session, trt_cache_dir_for, InferenceBackend, SessionConfig};
use crate::error::{inference_error, Result, Waifu2xError};
use crate::model::ModelDescriptor;
use crate::pipeline::{Predictor, TileInput, TileOutput};

pub struct OrtPredictor {
    session: Arc<Mutex<Session>>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    /// Model input carries its own batch axis (`[1,C,H,W]`), replaced by N.
    has_batch_dim: bool,
}

impl OrtPredictor {
    /// Load `model_path` for `descriptor` on the requested backend.
    pub fn load(
        descriptor: &ModelDescriptor,
        model_path: &Path,
        backend: InferenceBackend,
        trt_cache_root: Option<&Path>,
    ) -> Result<Self> {
        descriptor.validate()?;
        let trt_cache_dir = trt_cache_root
            .map(|root| trt_cache_dir_for(root, model_path, descriptor.input_block_size()));

        debug!(
            model = %model_path.display(),
            name = %descriptor.name,
            %backend,
            "Loading ONNX model"
        );

        let session = build_session(&SessionConfig {
            model_path,
            backend,
            trt_cache_dir: trt_cache_dir.as_deref(),
        })
        .map_err(|e| Waifu2xError::LoadModelFailed(format!("{e:#}")))?;

        let is_fp16 = match session.inputs().first().map(|input| input.dtype()) {
            Some(ort::value::ValueType::Tensor { ty, .. }) => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        debug!(
            input_name = %descriptor.input_name,
            output_name = %descriptor.output_name,
            is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            input_name: descriptor.input_name.clone(),
            output_name: descriptor.output_name.clone(),
            is_fp16,
            has_batch_dim: descriptor.has_batch_dim(),
        })
    }

    fn run(&self, batch: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("session mutex poisoned"))?;
        let input_name = self.input_name.as_str();
        let output_name = self.output_name.as_str();

        if !self.is_fp16 {
            let input_tensor = Tensor::from_array(batch)?;
            let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
            let output_view = outputs[output_name].try_extract_array::<f32>()?;
            return Ok(output_view.to_owned());
        }

        let f32_batch = batch.as_standard_layout();
        let f32_slice = f32_batch
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("input batch is not contiguous"))?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);

        let fp16_array = ArrayD::from_shape_vec(batch.shape().to_vec(), fp16_data)?;
        let input_tensor = Tensor::from_array(fp16_array)?;
        let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
        let output_view = outputs[output_name].try_extract_array::<f16>()?;

        let fp16_owned = output_view.as_standard_layout().into_owned();
        let fp16_slice = fp16_owned
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("output is not contiguous"))?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);
        Ok(ArrayD::from_shape_vec(fp16_owned.shape().to_vec(), f32_data)?)
    }
}

/// Stack per-tile arrays into one `[N, ...]` batch. With `replace_unit_axis`
/// the tiles already carry a leading axis of 1 and are concatenated along it.
pub(crate) fn stack_batch(tiles: &[TileInput], replace_unit_axis: bool) -> Result<ArrayD<f32>> {
    let views: Vec<ArrayViewD<'_, f32>> = tiles
        .iter()
        .map(|tile| {
            if replace_unit_axis {
                tile.data.view()
            } else {
                tile.data.view().insert_axis(Axis(0))
            }
        })
        .collect();
    concatenate(Axis(0), &views).map_err(|e| inference_error(format!("failed to stack batch: {e}")))
}

/// Split a batched output along axis 0 and tag each slice with the index of
/// the input at the same position.
pub(crate) fn split_batch(output: ArrayD<f32>, indices: &[usize]) -> Result<Vec<TileOutput>> {
    let count = output.shape().first().copied().unwrap_or(0);
    if count != indices.len() {
        return Err(inference_error(format!(
            "model returned batch of {count} for {} inputs",
            indices.len()
        )));
    }
    Ok(output
        .axis_iter(Axis(0))
        .zip(indices)
        .map(|(slice, index)| TileOutput {
            index: *index,
            data: slice.to_owned(),
        })
        .collect())
}

impl Predictor for OrtPredictor {
    fn predict(&self, batch: Vec<TileInput>) -> Result<Vec<TileOutput>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let indices: Vec<usize> = batch.iter().map(|tile| tile.index).collect();
        let stacked = if self.has_batch_dim {
            let with_axis: Vec<TileInput> = batch
                .into_iter()
                .map(|tile| TileInput {
                    index: tile.index,
                    data: tile.data.insert_axis(Axis(0)),
                })
                .collect();
            stack_batch(&with_axis, true)?
        } else {
            stack_batch(&batch, false)?
        };

        let output = self
            .run(stacked)
            .map_err(|e| inference_error(format!("{e:#}")))?;
        split_batch(output, &indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn tile(index: usize, value: f32) -> TileInput {
        TileInput {
            index,
            data: Array3::from_elem((3, 4, 4), value).into_dyn(),
        }
    }

    #[test]
    fn test_stack_batch_prepends_axis() {
        let stacked = stack_batch(&[tile(0, 1.0), tile(1, 2.0)], false).unwrap();
        assert_eq!(stacked.shape(), &[2, 3, 4, 4]);
        assert_eq!(stacked[[1, 2, 3, 3]], 2.0);
    }

    #[test]
    fn test_stack_batch_replaces_unit_axis() {
        let with_axis: Vec<TileInput> = [tile(0, 1.0), tile(1, 2.0), tile(2, 3.0)]
            .into_iter()
            .map(|t| TileInput {
                index: t.index,
                data: t.data.insert_axis(Axis(0)),
            })
            .collect();
        let stacked = stack_batch(&with_axis, true).unwrap();
        assert_eq!(stacked.shape(), &[3, 3, 4, 4]);
        assert_eq!(stacked[[2, 0, 0, 0]], 3.0);
    }

    #[test]
    fn test_split_batch_tags_indices() {
        let stacked = stack_batch(&[tile(5, 1.0), tile(9, 2.0)], false).unwrap();
        let outputs = split_batch(stacked, &[5, 9]).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].index, 5);
        assert_eq!(outputs[1].index, 9);
        assert_eq!(outputs[1].data.shape(), &[3, 4, 4]);
        assert_eq!(outputs[1].data[[0, 0, 0]], 2.0);
    }

    #[test]
    fn test_split_batch_count_mismatch() {
        let stacked = stack_batch(&[tile(0, 1.0)], false).unwrap();
        let err = split_batch(stacked, &[0, 1]).unwrap_err();
        assert!(matches!(err, Waifu2xError::InferenceError(_)));
    }

    #[test]
    #[ignore] // requires ONNX Runtime and models/anime_noise0_model.onnx
    fn test_ort_predictor_runs_srcnn_batch() {
        let preset = crate::model::preset("anime_noise0").unwrap();
        let predictor = OrtPredictor::load(
            &preset.descriptor,
            &preset.model_path(Path::new("models")),
            InferenceBackend::Cpu,
            None,
        )
        .unwrap();
        let outputs = predictor
            .predict(vec![
                TileInput {
                    index: 0,
                    data: Array3::from_elem((3, 142, 142), 0.5).into_dyn(),
                },
                TileInput {
                    index: 1,
                    data: Array3::from_elem((3, 142, 142), 0.25).into_dyn(),
                },
            ])
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].data.shape(), &[3, 128, 128]);
    }
}
