use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use training::dataset::InMemoryLoader;
use training::util::{validate_backend_choice, BackendKind};
use training::{evaluate, load_checkpoint, TrainBackend, TrainConfig};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Score a landmark checkpoint on a manifest (loss and mean peak error)"
)]
struct Args {
    /// Checkpoint written by `train` (`<epoch>.bin`).
    #[arg(long)]
    checkpoint: PathBuf,
    /// Run configuration the checkpoint was trained with.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Manifest to score; defaults to the configured one.
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let mut cfg = match &args.config {
        Some(path) => TrainConfig::from_path(path)?,
        None => TrainConfig::default(),
    };
    if let Some(manifest) = args.manifest {
        cfg.data.manifest = manifest;
    }
    cfg.validate()?;

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let model = load_checkpoint::<TrainBackend>(&cfg.model, &args.checkpoint, &device)?;
    let samples = cfg.dataset().load()?;
    let loader = InMemoryLoader::new(samples, cfg.data.batch_size)?;
    let report = evaluate(&model, &loader, &cfg.loss.kind, &device)?;

    info!(
        "eval complete: {} samples, loss = {:.6}, mean error = {:.2} px",
        report.items, report.loss, report.mean_error_px
    );
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
