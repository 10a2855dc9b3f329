//! Face Restoration CLI
//!
//! `restore` runs the online pipeline over a directory of images.
//! `export`, `build` and `inspect` are the offline engine conversion phase.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use facerestore::config::Config;
use facerestore::convert::builder::{default_layers_path, default_log_path};
use facerestore::convert::{build_engine, export_graph, BuildIdentity, BuildOptions, EngineFile, Precision};
use facerestore::engine::{
    DeviceContext, EngineRestorer, ModelUpsampler, NetworkRestorer, Restorer, ScrfdDetector,
};
use facerestore::error::InputError;
use facerestore::service::{run, OutputExt, PipelineOptions, RestorePipeline, RunOptions};
use facerestore::utils::image::list_images;

#[derive(Parser, Debug)]
#[command(name = "facerestore", about = "Blind face restoration")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore every face in a directory of images
    Restore(RestoreArgs),
    /// Export a network as a graph artifact with static shapes
    Export(ExportArgs),
    /// Compile a graph artifact into an engine file
    Build(BuildArgs),
    /// Print the manifest of an engine file
    Inspect(InspectArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelVersion {
    #[value(name = "1.2")]
    V1_2,
    #[value(name = "1.3")]
    V1_3,
    #[value(name = "1.4")]
    V1_4,
    #[value(name = "RestoreFormer")]
    RestoreFormer,
}

impl ModelVersion {
    fn file_name(self) -> &'static str {
        match self {
            ModelVersion::V1_2 => "GFPGANv1.2.onnx",
            ModelVersion::V1_3 => "GFPGANv1.3.onnx",
            ModelVersion::V1_4 => "GFPGANv1.4.onnx",
            ModelVersion::RestoreFormer => "RestoreFormer.onnx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BgUpsampler {
    Realesrgan,
    None,
}

#[derive(clap::Args, Debug)]
struct RestoreArgs {
    /// Input image or directory
    #[arg(short, long, default_value = "inputs/whole_imgs")]
    input: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Restoration model version
    #[arg(short = 'v', long = "version", value_enum, default_value = "1.4")]
    model_version: ModelVersion,

    /// Final upsampling scale of the image
    #[arg(short = 's', long)]
    upscale: Option<u32>,

    /// Background upsampler
    #[arg(long, value_enum, default_value = "realesrgan")]
    bg_upsampler: BgUpsampler,

    /// Run from a compiled engine instead of the network
    #[arg(long)]
    engine: Option<PathBuf>,

    #[arg(long)]
    only_center_face: bool,

    /// Inputs are already aligned face crops
    #[arg(long)]
    aligned: bool,

    /// Also write cropped and restored faces
    #[arg(long)]
    save_faces: bool,

    #[arg(long, value_enum, default_value = "auto")]
    ext: OutputExt,

    /// Suffix of the restored images
    #[arg(long)]
    suffix: Option<String>,

    /// Abort the run on the first failing image
    #[arg(long)]
    stop_on_error: bool,
}

#[derive(clap::Args, Debug)]
struct ExportArgs {
    /// Source network
    #[arg(long)]
    onnx: PathBuf,

    /// Graph artifact to write
    #[arg(long)]
    output: PathBuf,

    #[arg(long)]
    batch: Option<usize>,

    #[arg(long)]
    size: Option<usize>,

    /// Convert float64 tensors and casts to float32
    #[arg(long)]
    cast_fp32: bool,
}

#[derive(clap::Args, Debug)]
struct BuildArgs {
    /// Graph artifact
    #[arg(short = 'o', long)]
    graph: PathBuf,

    /// Engine file to write
    #[arg(short, long)]
    engine: PathBuf,

    /// fp32, fp16 or int8
    #[arg(short, long, default_value = "fp16")]
    precision: String,

    /// Directory of calibration images (int8)
    #[arg(long)]
    calib_input: Option<PathBuf>,

    #[arg(long)]
    calib_cache: Option<PathBuf>,

    #[arg(long)]
    calib_num_images: Option<usize>,

    /// Node name fragment kept in fp32 (repeatable)
    #[arg(long = "keep-fp32")]
    keep_fp32: Vec<String>,

    /// Build log, defaults to the graph path with `.log`
    #[arg(long)]
    log: Option<PathBuf>,

    /// Layer listing, defaults to the graph path with `.layers`
    #[arg(long)]
    layers: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct InspectArgs {
    #[arg(long)]
    engine: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref());

    match cli.command {
        Command::Restore(args) => restore(&config, args),
        Command::Export(args) => export(&config, args),
        Command::Build(args) => build(&config, args),
        Command::Inspect(args) => inspect(args),
    }
}

fn load_config(path: Option<&Path>) -> Config {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(Config::default_path()));
    match Config::load(&path.to_string_lossy()) {
        Ok(config) => {
            info!("Configuration loaded from {}", path.display());
            config
        }
        Err(e) => {
            info!("Using default config ({})", e);
            Config::default()
        }
    }
}

fn restore(config: &Config, args: RestoreArgs) -> Result<()> {
    info!("Face Restoration v{}", env!("CARGO_PKG_VERSION"));
    let start = Instant::now();

    // Checked before any network is loaded
    if list_images(&args.input)?.is_empty() {
        return Err(InputError::EmptyInputDirectory(args.input.clone()).into());
    }

    let restorer: Box<dyn Restorer> = match &args.engine {
        Some(engine) => Box::new(EngineRestorer::load(engine)?),
        None => {
            let model = config.models.dir.join(args.model_version.file_name());
            Box::new(NetworkRestorer::load(
                &model,
                config.restore.batch_capacity,
                config.restore.canonical_size as usize,
            )?)
        }
    };
    let ctx = DeviceContext::new(restorer);

    let pipeline = if args.aligned {
        RestorePipeline::aligned(&ctx)
    } else {
        let detector = ScrfdDetector::load(&config.models.detector, &config.detection)?;
        let options = PipelineOptions {
            upscale: args.upscale.unwrap_or(config.restore.upscale),
            only_center_face: args.only_center_face,
        };
        let pipeline = RestorePipeline::new(&ctx, Box::new(detector), options);
        match args.bg_upsampler {
            BgUpsampler::None => pipeline,
            BgUpsampler::Realesrgan => match ModelUpsampler::load(
                &config.models.background,
                config.models.background_scale,
                config.background.tile,
                config.background.tile_pad,
            ) {
                Ok(upsampler) => pipeline.with_upsampler(Box::new(upsampler)),
                Err(e) => {
                    warn!("Background upsampler unavailable, resizing instead: {}", e);
                    pipeline
                }
            },
        }
    };

    let options = RunOptions {
        input: args.input,
        output: args.output,
        ext: args.ext,
        suffix: args.suffix,
        save_faces: args.save_faces,
        stop_on_error: args.stop_on_error,
    };
    let report = run(&pipeline, &options)?;
    ctx.release();

    if report.is_failure() {
        bail!("no image restored out of {} input(s)", report.processed());
    }
    info!(
        "Results are in {} ({} image(s) in {:?})",
        options.output.display(),
        report.written(),
        start.elapsed()
    );
    Ok(())
}

fn export(config: &Config, args: ExportArgs) -> Result<()> {
    let batch = args.batch.unwrap_or(config.restore.batch_capacity);
    let size = args.size.unwrap_or(config.restore.canonical_size as usize);
    export_graph(&args.onnx, &args.output, batch, size, args.cast_fp32)
        .with_context(|| format!("exporting {}", args.onnx.display()))?;
    Ok(())
}

fn build(config: &Config, args: BuildArgs) -> Result<()> {
    // Rejected before the graph is read or anything is allocated
    let precision: Precision = args.precision.parse()?;
    let start = Instant::now();
    let mut options = BuildOptions::from_config(precision, &config.build);
    if !args.keep_fp32.is_empty() {
        options.keep_fp32 = args.keep_fp32;
    }
    options.calib_input = args.calib_input;
    if let Some(cache) = args.calib_cache {
        options.calib_cache = cache;
    }
    if let Some(n) = args.calib_num_images {
        options.calib_num_images = n;
    }
    options.log_path = Some(args.log.unwrap_or_else(|| default_log_path(&args.graph)));
    options.layers_path = Some(args.layers.unwrap_or_else(|| default_layers_path(&args.graph)));

    let manifest = build_engine(&args.graph, &args.engine, options)
        .with_context(|| format!("building {} from {}", args.engine.display(), args.graph.display()))?;

    info!(
        "Engine {} ready in {:?} ({}, input {:?})",
        args.engine.display(),
        start.elapsed(),
        manifest.precision,
        manifest.input_shape
    );
    Ok(())
}

fn inspect(args: InspectArgs) -> Result<()> {
    let engine = EngineFile::read(&args.engine)?;
    println!("{}", serde_json::to_string_pretty(&engine.manifest)?);

    let host = BuildIdentity::detect();
    match engine.manifest.identity.check_compatible(&host) {
        Ok(()) => info!("Engine is compatible with this host ({})", host),
        Err(reason) => warn!("Engine is not loadable on this host: {}", reason),
    }
    Ok(())
}
