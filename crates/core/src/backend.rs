//! Execution provider selection and `ort::Session` construction.
//!
//! [`build_session`] turns an [`InferenceBackend`] into a committed session,
//! registering TensorRT engine caching or CUDA where requested.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Inference backend selection.
///
/// `Tensorrt` needs the TensorRT runtime libraries; when they are missing the
/// session falls back to CUDA, and from there to the CPU provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Per-model engine cache directory: TensorRT engines are shape specific, so
/// each model and input edge gets its own folder.
pub fn trt_cache_dir_for(base_dir: &Path, model_path: &Path, input_edge: usize) -> PathBuf {
    let stem = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    base_dir.join(format!("{stem}_{input_edge}x{input_edge}"))
}

fn cache_file_count(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.metadata().map(|m| m.is_file()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

/// Build an `ort::Session` for the requested backend.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("Failed to load ONNX model: {}", config.model_path.display());

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            let cache_path = cache_dir.to_string_lossy().to_string();
            let before = cache_file_count(cache_dir);
            let started = Instant::now();

            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before,
                "Initializing TensorRT session (first run builds the engine)"
            );

            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_context);

            let elapsed_secs = started.elapsed().as_secs_f64();
            match result {
                Ok(session) => {
                    info!(
                        elapsed_secs,
                        cache_files_before = before,
                        cache_files_after = cache_file_count(cache_dir),
                        "TensorRT session ready"
                    );
                    session
                }
                Err(e) => {
                    error!(elapsed_secs, error = %e, "TensorRT session initialization failed");
                    return Err(e);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");
            builder
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
    };

    Ok(session)
}
