//! Public entry point: wires expansion, tiling, batched inference, alpha and
//! merging for one image per call.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::alpha;
use crate::codec;
use crate::error::{inference_error, reassembly_failed, Result, Waifu2xError};
use crate::expand::{expand, pre_expand, ExpandedPlanes};
use crate::merger::{spawn_merger, MergeCommand, QuantizedTile, ResultMerger, TilePlacement};
use crate::model::ModelDescriptor;
use crate::pipeline::{run_batch, Predictor};
use crate::tiling::crop_rects;
use crate::types::{Image, TileRect, Waifu2xOutput};

/// Tiles per predictor call unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Upscaler bound to one model and one predictor. Cheap to clone; every
/// `run` call owns its buffers and shares nothing with other calls.
#[derive(Clone)]
pub struct Waifu2x {
    descriptor: Arc<ModelDescriptor>,
    predictor: Arc<dyn Predictor>,
    batch_size: usize,
}

impl std::fmt::Debug for Waifu2x {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waifu2x")
            .field("descriptor", &self.descriptor)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl Waifu2x {
    pub fn new(descriptor: ModelDescriptor, predictor: Arc<dyn Predictor>) -> Result<Self> {
        descriptor.validate()?;
        Ok(Self {
            descriptor: Arc::new(descriptor),
            predictor,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Tiles per predictor call; values below 1 are treated as 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Decode `bytes` and run the pipeline on the result.
    pub async fn run_bytes(&self, bytes: &[u8]) -> Result<Waifu2xOutput> {
        let image = codec::decode(bytes)?;
        self.run(image).await
    }

    /// Upscale one image.
    ///
    /// Batches are dispatched concurrently; the alpha channel is processed
    /// alongside them. The first failure aborts all in-flight work and no
    /// partial output is returned.
    pub async fn run(&self, image: Image) -> Result<Waifu2xOutput> {
        image.check_planes().map_err(Waifu2xError::ExpandFailed)?;
        alpha::check_depth(&image)?;

        let started = Instant::now();
        let descriptor = Arc::clone(&self.descriptor);
        let (width, height) = (image.width, image.height);
        let block = descriptor.block_size;
        let (canvas_width, canvas_height) = (width.max(block), height.max(block));

        let placement = TilePlacement::new(width, height, canvas_width, canvas_height, &descriptor)?;
        let merger = ResultMerger::new(placement)?;
        let (out_width, out_height) = (merger.out_width(), merger.out_height());
        let (merge_tx, merge_handle) = spawn_merger(merger, self.batch_size * 2);

        let image = Arc::new(image);
        let mut alpha_task = spawn_alpha(Arc::clone(&image), descriptor.out_scale, merge_tx.clone());

        let prepared = {
            let descriptor = Arc::clone(&descriptor);
            tokio::task::spawn_blocking(move || prepare(&image, &descriptor)).await
        };
        let (planes, rects) = match prepared {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => return Err(abandon(e, None, &alpha_task, &merge_handle)),
            Err(e) => {
                let e = Waifu2xError::ExpandFailed(format!("expand task failed: {e}"));
                return Err(abandon(e, None, &alpha_task, &merge_handle));
            }
        };

        debug!(
            width,
            height,
            canvas_width,
            canvas_height,
            tiles = rects.len(),
            batch_size = self.batch_size,
            "Dispatching tile batches"
        );

        let mut batches = JoinSet::new();
        for chunk in rects.chunks(self.batch_size) {
            batches.spawn(run_batch_task(
                Arc::clone(&planes),
                Arc::clone(&descriptor),
                placement,
                chunk.to_vec(),
                Arc::clone(&self.predictor),
                merge_tx.clone(),
            ));
        }
        drop(merge_tx);

        // Alpha runs alongside the batches; whichever stage fails first
        // cancels the rest.
        let mut has_alpha: Option<bool> = None;
        loop {
            tokio::select! {
                joined = batches.join_next() => {
                    let failure = match joined {
                        None => break,
                        Some(Ok(Ok(()))) => continue,
                        Some(Ok(Err(e))) => e,
                        Some(Err(e)) if e.is_cancelled() => continue,
                        Some(Err(e)) => inference_error(format!("batch task failed: {e}")),
                    };
                    return Err(abandon(failure, Some(&mut batches), &alpha_task, &merge_handle));
                }
                finished = &mut alpha_task, if has_alpha.is_none() => {
                    match alpha_outcome(finished) {
                        Ok(value) => has_alpha = Some(value),
                        Err(e) => {
                            return Err(abandon(e, Some(&mut batches), &alpha_task, &merge_handle));
                        }
                    }
                }
            }
        }

        let has_alpha = match has_alpha {
            Some(value) => value,
            None => match alpha_outcome(alpha_task.await) {
                Ok(value) => value,
                Err(e) => {
                    merge_handle.abort();
                    return Err(e);
                }
            },
        };

        let merger = merge_handle
            .await
            .map_err(|e| reassembly_failed(format!("merge task failed: {e}")))??;
        let pixels = tokio::task::spawn_blocking(move || merger.freeze())
            .await
            .map_err(|e| reassembly_failed(format!("freeze task failed: {e}")))??;

        info!(
            width,
            height,
            out_width,
            out_height,
            tiles = rects.len(),
            has_alpha,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscale complete"
        );

        Ok(Waifu2xOutput {
            pixels,
            width: out_width,
            height: out_height,
            has_alpha,
        })
    }

    /// Blocking variant of [`run`](Self::run) for non-async callers.
    ///
    /// Builds a private runtime and drives the async pipeline to completion.
    /// Must not be called from inside a tokio runtime; that is reported as
    /// `BlockingRunFailed` instead of deadlocking.
    pub fn run_blocking(&self, image: Image) -> Result<Waifu2xOutput> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Waifu2xError::BlockingRunFailed(
                "run_blocking called from within an async runtime; await run instead".into(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Waifu2xError::BlockingRunFailed(format!("failed to start runtime: {e}")))?;
        runtime.block_on(self.run(image))
    }
}

/// Pre-expand undersized input, border-expand the planes and compute tiles.
fn prepare(image: &Image, descriptor: &ModelDescriptor) -> Result<(Arc<ExpandedPlanes>, Vec<TileRect>)> {
    let canvas = pre_expand(image, descriptor.block_size)?;
    let planes = expand(&canvas, descriptor.shrink_size)?;
    let rects = crop_rects(canvas.width, canvas.height, descriptor.block_size);
    Ok((Arc::new(planes), rects))
}

fn spawn_alpha(
    image: Arc<Image>,
    out_scale: usize,
    merge_tx: mpsc::Sender<MergeCommand>,
) -> JoinHandle<Result<bool>> {
    tokio::spawn(async move {
        let plane = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            match alpha::detect(&image)? {
                Some(plane) => {
                    alpha::rescale(plane, image.width, image.height, out_scale).map(Some)
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| Waifu2xError::AlphaRescaleFailed(format!("alpha task failed: {e}")))??;

        let Some(plane) = plane else {
            return Ok(false);
        };
        merge_tx
            .send(MergeCommand::Alpha(plane))
            .await
            .map_err(|_| reassembly_failed("merge task stopped before alpha arrived"))?;
        Ok(true)
    })
}

/// Extract, predict and quantize one batch on the blocking pool, then hand
/// the finished bytes to the merge task.
async fn run_batch_task(
    planes: Arc<ExpandedPlanes>,
    descriptor: Arc<ModelDescriptor>,
    placement: TilePlacement,
    rects: Vec<TileRect>,
    predictor: Arc<dyn Predictor>,
    merge_tx: mpsc::Sender<MergeCommand>,
) -> Result<()> {
    let quantized = tokio::task::spawn_blocking(move || -> Result<Vec<QuantizedTile>> {
        run_batch(&planes, &descriptor, &rects, predictor.as_ref())?
            .iter()
            .map(|tile| placement.quantize(&tile.rect, &tile.block))
            .collect()
    })
    .await
    .map_err(|e| inference_error(format!("inference task failed: {e}")))??;

    for tile in quantized {
        merge_tx
            .send(MergeCommand::Rgb(tile))
            .await
            .map_err(|_| reassembly_failed("merge task stopped"))?;
    }
    Ok(())
}

fn alpha_outcome(
    joined: std::result::Result<Result<bool>, tokio::task::JoinError>,
) -> Result<bool> {
    joined.map_err(|e| Waifu2xError::AlphaRescaleFailed(format!("alpha task failed: {e}")))?
}

/// Cancel everything still in flight and hand back `error`.
fn abandon(
    error: Waifu2xError,
    batches: Option<&mut JoinSet<Result<()>>>,
    alpha_task: &JoinHandle<Result<bool>>,
    merge_handle: &JoinHandle<Result<ResultMerger>>,
) -> Waifu2xError {
    warn!(%error, "Upscale failed, cancelling in-flight work");
    if let Some(batches) = batches {
        batches.abort_all();
    }
    alpha_task.abort();
    merge_handle.abort();
    error
}
