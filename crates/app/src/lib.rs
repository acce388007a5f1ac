use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use waifu2x_core::backend::InferenceBackend;
use waifu2x_core::codec;
use waifu2x_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use waifu2x_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use waifu2x_core::model::{self, ModelDescriptor};
use waifu2x_core::session::OrtPredictor;
use waifu2x_core::types::{Image, OutputFormat, Waifu2xOutput};
use waifu2x_core::Waifu2x;

#[derive(Parser, Debug)]
#[command(name = "waifu2x", about = "Block-based image super-resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale or denoise a single PNG/JPEG image.
    Upscale(UpscaleArgs),
    /// List the built-in model presets.
    Models,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["model", "model_dir"])))]
struct UpscaleArgs {
    #[arg(help = "Input image path")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output path (default: <input>_waifu2x.<ext>)")]
    output: Option<PathBuf>,
    #[arg(short = 'm', long, value_name = "PRESET", help = "Built-in model preset id")]
    model: Option<String>,
    #[arg(long, value_name = "DIR", help = "Model directory containing manifest.json")]
    model_dir: Option<PathBuf>,
    #[arg(short = 'b', long, help = "Tiles per inference batch")]
    batch_size: Option<usize>,
    #[arg(long, value_parser = parse_backend, help = "cpu, cuda or tensorrt")]
    backend: Option<InferenceBackend>,
    #[arg(long, value_parser = parse_format, help = "png or jpeg")]
    format: Option<OutputFormat>,
    #[arg(short = 'q', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: Option<u8>,
    #[arg(long, help = "Drive the pipeline through the blocking entry point")]
    blocking: bool,
}

fn parse_backend(value: &str) -> std::result::Result<InferenceBackend, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "cpu" | "cuda" | "gpu" | "tensorrt" | "trt" => Ok(InferenceBackend::from_str_lossy(value)),
        other => Err(format!("unknown backend '{other}'")),
    }
}

fn parse_format(value: &str) -> std::result::Result<OutputFormat, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "png" | "jpeg" | "jpg" => Ok(OutputFormat::from_str_lossy(value)),
        other => Err(format!("unknown output format '{other}'")),
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    waifu2x_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    waifu2x_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Upscale(args) => {
            let config = load_config(&resolved_data_dir);
            run_upscale(args, &config, &resolved_data_dir).await
        }
        Commands::Models => {
            print_presets();
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Model descriptor and ONNX file for the requested preset or manifest dir.
fn resolve_model(
    args: &UpscaleArgs,
    config: &AppConfig,
    data_dir: &Path,
) -> Result<(ModelDescriptor, PathBuf)> {
    if let Some(dir) = &args.model_dir {
        let package = model::load_manifest(dir)?;
        return Ok((package.descriptor, package.model_path));
    }
    let Some(id) = args.model.as_deref() else {
        bail!("either --model or --model-dir is required");
    };
    let preset = model::preset(id)
        .with_context(|| format!("unknown model preset '{id}' (see `waifu2x models`)"))?;
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let path = preset.model_path(&models_dir);
    Ok((preset.descriptor, path))
}

/// Explicit `--format` wins, then the output path's extension, then config.
fn resolve_format(explicit: Option<OutputFormat>, output: Option<&Path>, fallback: OutputFormat) -> OutputFormat {
    if let Some(format) = explicit {
        return format;
    }
    output
        .and_then(|path| path.extension())
        .and_then(|ext| ext.to_str())
        .and_then(|ext| parse_format(ext).ok())
        .unwrap_or(fallback)
}

fn default_output_path(input: &Path, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}_waifu2x.{}", format.extension()))
}

async fn run_upscale(args: UpscaleArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    if !args.input.is_file() {
        bail!("Input image does not exist: {}", args.input.display());
    }

    let format = resolve_format(args.format, args.output.as_deref(), config.output.format);
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input, format));
    let quality = args.quality.unwrap_or(config.output.jpeg_quality);
    let backend = args.backend.unwrap_or(config.inference.backend);
    let batch_size = args.batch_size.unwrap_or(config.inference.batch_size);

    let (descriptor, model_path) = resolve_model(&args, config, data_dir)?;
    info!(model = %descriptor, path = %model_path.display(), %backend, "Loading model");
    let trt_cache = resolve_relative_to(data_dir, &config.paths.trt_cache_dir);
    let load_descriptor = descriptor.clone();
    let predictor = tokio::task::spawn_blocking(move || {
        OrtPredictor::load(&load_descriptor, &model_path, backend, Some(&trt_cache))
    })
    .await
    .context("model loading task panicked")??;

    let engine = Waifu2x::new(descriptor, Arc::new(predictor))?.with_batch_size(batch_size);

    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read input image: {}", args.input.display()))?;

    info!(input = %args.input.display(), batch_size = engine.batch_size(), "Processing image");
    let started = Instant::now();
    let output = if args.blocking {
        let image = codec::decode(&bytes)?;
        run_on_plain_thread(engine, image).await?
    } else {
        engine.run_bytes(&bytes).await?
    };
    let elapsed = started.elapsed().as_secs_f64();
    info!(
        width = output.width,
        height = output.height,
        has_alpha = output.has_alpha,
        elapsed = %format_duration(elapsed),
        "Image processed"
    );

    let encoded = codec::encode(&output, format, quality)?;
    tokio::fs::write(&output_path, encoded)
        .await
        .with_context(|| format!("Failed to write output image: {}", output_path.display()))?;
    info!(output = %output_path.display(), %format, "Output written");
    Ok(())
}

/// `run_blocking` refuses to run on a runtime thread, so it gets a thread of
/// its own and the result comes back over a oneshot.
async fn run_on_plain_thread(engine: Waifu2x, image: Image) -> Result<Waifu2xOutput> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("waifu2x-blocking".into())
        .spawn(move || {
            let _ = tx.send(engine.run_blocking(image));
        })
        .context("failed to spawn blocking worker thread")?;
    let output = rx.await.context("blocking worker exited without a result")??;
    debug!("Blocking run finished");
    Ok(output)
}

fn print_presets() {
    for preset in model::presets() {
        let d = &preset.descriptor;
        println!(
            "{:<28} {:<8} scale {}x  block {:>3}  margin {:>2}  {}.onnx",
            preset.id,
            preset.family.to_string(),
            d.out_scale,
            d.block_size,
            d.shrink_size,
            preset.file_stem
        );
    }
}

fn format_duration(secs: f64) -> String {
    let total_ms = (secs * 1000.0).round() as u64;
    let m = total_ms / 60_000;
    let s = (total_ms % 60_000) / 1000;
    let ms = total_ms % 1000;
    format!("{:02}:{:02}.{:03}", m, s, ms)
}
