//! Model descriptors: the only per-model knowledge the tiling and merge
//! stages consume.
//!
//! Descriptors come from one of three sources: the bundled waifu2x SRCNN
//! table, the bundled Anime4K table, or a model directory carrying a
//! `manifest.json`. All three produce the same plain [`ModelDescriptor`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, Waifu2xError};

/// Array layout of the model input and output tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    /// Channel-major `[C,H,W]`.
    #[default]
    Planar,
    /// Pixel-major `[H,W,C]`.
    Interleaved,
}

/// Numeric range of the values the model emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueRange {
    /// `[0,1]`, scaled by 255 before clipping.
    #[default]
    Unit,
    /// `[0,255]`, clipped as-is.
    Byte,
}

impl ValueRange {
    pub fn multiplier(self) -> f32 {
        match self {
            Self::Unit => 255.0,
            Self::Byte => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub input_shape: Vec<usize>,
    /// Context margin consumed by the model on each side of a tile.
    pub shrink_size: usize,
    pub out_scale: usize,
    /// Edge of the source region one tile covers, excluding the margin.
    pub block_size: usize,
    /// The model keeps its context margin in the output and the merger has to
    /// skip `shrink_size * out_scale` rows and columns.
    pub shrink_after_handled: bool,
    pub input_name: String,
    pub output_name: String,
    #[serde(default)]
    pub layout: InputLayout,
    #[serde(default)]
    pub value_range: ValueRange,
}

impl ModelDescriptor {
    /// Edge of one input tile: `block_size + 2 * shrink_size`.
    pub fn input_block_size(&self) -> usize {
        self.block_size + 2 * self.shrink_size
    }

    /// Edge of the useful output block: `block_size * out_scale`.
    pub fn output_block_size(&self) -> usize {
        self.block_size * self.out_scale
    }

    /// Margin the merger skips on each side of an output tile.
    pub fn output_margin(&self) -> usize {
        if self.shrink_after_handled {
            self.shrink_size * self.out_scale
        } else {
            0
        }
    }

    /// Edge of the array the model actually returns per tile.
    pub fn output_tile_size(&self) -> usize {
        self.output_block_size() + 2 * self.output_margin()
    }

    /// Expected per-tile input shape with any leading batch dimension removed.
    pub fn tile_input_shape(&self) -> Vec<usize> {
        let side = self.input_block_size();
        match self.layout {
            InputLayout::Planar => vec![3, side, side],
            InputLayout::Interleaved => vec![side, side, 3],
        }
    }

    /// Expected per-tile output shape with any leading batch dimension removed.
    pub fn tile_output_shape(&self) -> Vec<usize> {
        let side = self.output_tile_size();
        match self.layout {
            InputLayout::Planar => vec![3, side, side],
            InputLayout::Interleaved => vec![side, side, 3],
        }
    }

    /// True when `input_shape` carries a leading batch dimension.
    pub fn has_batch_dim(&self) -> bool {
        self.input_shape.len() == 4
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> {
            Err(Waifu2xError::InvalidModel(format!("{}: {msg}", self.name)))
        };

        if self.block_size == 0 {
            return invalid("block size must be positive".into());
        }
        if self.out_scale == 0 {
            return invalid("output scale must be positive".into());
        }

        let shape = &self.input_shape;
        let spatial = match (self.layout, shape.len()) {
            (InputLayout::Planar, 3) => (shape[0], shape[1], shape[2]),
            (InputLayout::Planar, 4) => (shape[1], shape[2], shape[3]),
            (InputLayout::Interleaved, 3) => (shape[2], shape[0], shape[1]),
            (InputLayout::Interleaved, 4) => (shape[3], shape[1], shape[2]),
            (_, rank) => return invalid(format!("input shape rank {rank} is not 3 or 4")),
        };
        let (channels, height, width) = spatial;

        if shape.len() == 4 && shape[0] != 1 {
            return invalid(format!("batch dimension must be 1, got {}", shape[0]));
        }
        if channels != 3 {
            return invalid(format!("only RGB input is supported, got {channels} channels"));
        }
        if height != width {
            return invalid(format!("input must be square, got {height}x{width}"));
        }
        if width != self.input_block_size() {
            return invalid(format!(
                "input edge {width} does not equal block {} + 2 * shrink {}",
                self.block_size, self.shrink_size
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}x, block {}, shrink {})",
            self.name, self.out_scale, self.block_size, self.shrink_size
        )
    }
}

// ---------------------------------------------------------------------------
// Bundled presets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Srcnn,
    Anime4k,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Srcnn => write!(f, "waifu2x"),
            Self::Anime4k => write!(f, "anime4k"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPreset {
    pub id: String,
    pub family: ModelFamily,
    /// ONNX file name without extension, looked up under the models dir.
    pub file_stem: String,
    pub descriptor: ModelDescriptor,
}

impl ModelPreset {
    pub fn model_path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(format!("{}.onnx", self.file_stem))
    }
}

const SRCNN_SHRINK: usize = 7;
const ANIME4K_SHRINK: usize = 10;
const ANIME4K_BLOCK: usize = 108;

fn srcnn_preset(style: &str, noise: Option<u8>, scale2x: bool) -> ModelPreset {
    let id = match (noise, scale2x) {
        (Some(level), false) => format!("{style}_noise{level}"),
        (None, true) => format!("{style}_scale2x"),
        (Some(level), true) => format!("{style}_noise{level}_scale2x"),
        (None, false) => style.to_string(),
    };
    let file_stem = if scale2x {
        format!("up_{id}_model")
    } else {
        format!("{id}_model")
    };
    let (block_size, out_scale) = if scale2x { (142, 2) } else { (128, 1) };
    let side = block_size + 2 * SRCNN_SHRINK;

    ModelPreset {
        id,
        family: ModelFamily::Srcnn,
        descriptor: ModelDescriptor {
            name: file_stem.clone(),
            input_shape: vec![3, side, side],
            shrink_size: SRCNN_SHRINK,
            out_scale,
            block_size,
            shrink_after_handled: false,
            input_name: "input".into(),
            output_name: "conv7".into(),
            layout: InputLayout::Planar,
            value_range: ValueRange::Unit,
        },
        file_stem,
    }
}

/// `(file stem suffix, display name, scale)` for every bundled Anime4K model.
const ANIME4K_MODELS: &[(&str, &str, usize)] = &[
    ("restore_l", "Restore CNN L", 1),
    ("restore_m", "Restore CNN M", 1),
    ("restore_s", "Restore CNN S", 1),
    ("restore_ul", "Restore CNN UL", 1),
    ("restore_vl", "Restore CNN VL", 1),
    ("restore_soft_l", "Restore CNN Soft L", 1),
    ("restore_soft_m", "Restore CNN Soft M", 1),
    ("restore_soft_s", "Restore CNN Soft S", 1),
    ("restore_soft_ul", "Restore CNN Soft UL", 1),
    ("restore_soft_vl", "Restore CNN Soft VL", 1),
    ("sr_denoise_l", "Upscale Denoise CNN L", 2),
    ("sr_denoise_m", "Upscale Denoise CNN M", 2),
    ("sr_denoise_s", "Upscale Denoise CNN S", 2),
    ("sr_denoise_ul", "Upscale Denoise CNN UL", 2),
    ("sr_denoise_vl", "Upscale Denoise CNN VL", 2),
    ("sr_l", "Upscale CNN L", 2),
    ("sr_m", "Upscale CNN M", 2),
    ("sr_s", "Upscale CNN S", 2),
    ("sr_ul", "Upscale CNN UL", 2),
    ("sr_vl", "Upscale CNN VL", 2),
    ("sr_l_gan", "Upscale GAN L", 3),
    ("sr_m_gan", "Upscale GAN M", 2),
    ("sr_s_gan", "Upscale GAN S", 2),
    ("sr_ul_gan", "Upscale GAN UL", 4),
    ("sr_vl_gan", "Upscale GAN VL", 3),
    ("sr_uul_gan", "Upscale GAN UUL", 4),
];

fn anime4k_preset(suffix: &str, display: &str, out_scale: usize) -> ModelPreset {
    let side = ANIME4K_BLOCK + 2 * ANIME4K_SHRINK;
    ModelPreset {
        id: format!("anime4k_{suffix}"),
        family: ModelFamily::Anime4k,
        file_stem: format!("model_{suffix}"),
        descriptor: ModelDescriptor {
            name: format!("Anime4K: {display}"),
            input_shape: vec![1, 3, side, side],
            shrink_size: ANIME4K_SHRINK,
            out_scale,
            block_size: ANIME4K_BLOCK,
            shrink_after_handled: true,
            input_name: "input_MAIN".into(),
            output_name: "Identity".into(),
            layout: InputLayout::Planar,
            value_range: ValueRange::Unit,
        },
    }
}

/// Every bundled preset, waifu2x SRCNN first.
pub fn presets() -> Vec<ModelPreset> {
    let mut out = Vec::with_capacity(18 + ANIME4K_MODELS.len());
    for style in ["anime", "photo"] {
        for level in 0..=3 {
            out.push(srcnn_preset(style, Some(level), false));
        }
        out.push(srcnn_preset(style, None, true));
        for level in 0..=3 {
            out.push(srcnn_preset(style, Some(level), true));
        }
    }
    for (suffix, display, scale) in ANIME4K_MODELS {
        out.push(anime4k_preset(suffix, display, *scale));
    }
    out
}

/// Preset lookup by id, case-insensitive.
pub fn preset(id: &str) -> Option<ModelPreset> {
    let wanted = id.trim().to_ascii_lowercase();
    presets().into_iter().find(|p| p.id == wanted)
}

// ---------------------------------------------------------------------------
// Manifest-described model directories
// ---------------------------------------------------------------------------

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    version: u32,
    name: String,
    sub_models: std::collections::HashMap<String, SubModel>,
    data_format: DataFormat,
    input_shape: Vec<usize>,
    shrink_size: usize,
    scale: usize,
    #[serde(default)]
    shrink_after_handled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubModel {
    file: String,
    input_name: String,
    output_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DataFormat {
    Nchw,
    Chw,
}

impl Manifest {
    fn block_size(&self) -> Result<usize> {
        let shape = &self.input_shape;
        let rank_ok = matches!(
            (self.data_format, shape.len()),
            (DataFormat::Chw, 3) | (DataFormat::Nchw, 4)
        );
        if !rank_ok {
            return Err(load_failed("dataFormat and inputShape do not match"));
        }
        let rank = shape.len();
        if shape[rank - 2] != shape[rank - 1] {
            return Err(load_failed("inputShape width and height must be equal"));
        }
        if shape[rank - 3] != 3 {
            return Err(load_failed("only RGB input models are supported"));
        }
        if self.data_format == DataFormat::Nchw && shape[0] != 1 {
            return Err(load_failed("only batch 1 input models are supported"));
        }
        shape[rank - 1]
            .checked_sub(2 * self.shrink_size)
            .filter(|block| *block > 0)
            .ok_or_else(|| load_failed("shrinkSize leaves no block inside inputShape"))
    }
}

fn load_failed(msg: impl Into<String>) -> Waifu2xError {
    Waifu2xError::LoadModelFailed(msg.into())
}

/// A descriptor loaded from a model directory, plus the model file it names.
#[derive(Debug, Clone)]
pub struct ModelPackage {
    pub descriptor: ModelDescriptor,
    pub model_path: PathBuf,
}

/// Load `<dir>/manifest.json` and resolve the main sub-model file.
pub fn load_manifest(dir: &Path) -> Result<ModelPackage> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&manifest_path)
        .map_err(|e| load_failed(format!("failed to read {}: {e}", manifest_path.display())))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .map_err(|e| load_failed(format!("failed to parse {}: {e}", manifest_path.display())))?;

    if manifest.version != MANIFEST_VERSION {
        return Err(load_failed(format!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }
    let block_size = manifest.block_size()?;
    let main = manifest
        .sub_models
        .get("main")
        .ok_or_else(|| load_failed("manifest missing main model"))?;

    let model_path = dir.join(&main.file);
    if !model_path.is_file() {
        return Err(load_failed(format!(
            "model file not found: {}",
            model_path.display()
        )));
    }

    let descriptor = ModelDescriptor {
        name: manifest.name.clone(),
        input_shape: manifest.input_shape.clone(),
        shrink_size: manifest.shrink_size,
        out_scale: manifest.scale,
        block_size,
        shrink_after_handled: manifest.shrink_after_handled,
        input_name: main.input_name.clone(),
        output_name: main.output_name.clone(),
        layout: InputLayout::Planar,
        value_range: ValueRange::Unit,
    };
    descriptor.validate()?;

    debug!(
        name = %descriptor.name,
        model = %model_path.display(),
        block_size,
        "Loaded model manifest"
    );

    Ok(ModelPackage {
        descriptor,
        model_path,
    })
}
