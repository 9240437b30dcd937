use burn::backend::Autodiff;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, AdamWConfig, RmsPropConfig, SgdConfig};
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use models::FaceAlignmentNet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::{OptimizerKind, TrainConfig};
use crate::dataset::{split, InMemoryLoader};
use crate::trainer::{fit, FitOptions, LossHistory};
use crate::TrainBackend;

pub type ADBackend = Autodiff<TrainBackend>;

/// Environment override for the run seed.
pub const SEED_ENV: &str = "FAN_SEED";

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train a stacked hourglass facial landmark network"
)]
pub struct TrainArgs {
    /// TOML run configuration; built-in defaults when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Override the number of epochs.
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Override the checkpoint directory.
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Override the landmark manifest path.
    #[arg(long)]
    pub manifest: Option<PathBuf>,
    /// Override the seed (also settable through FAN_SEED).
    #[arg(long)]
    pub seed: Option<u64>,
}

impl TrainArgs {
    pub fn resolve_config(&self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_path(path)?,
            None => TrainConfig::default(),
        };
        if let Some(epochs) = self.epochs {
            cfg.epochs = epochs;
        }
        if let Some(dir) = &self.checkpoint_dir {
            cfg.checkpoint_dir = dir.clone();
        }
        if let Some(manifest) = &self.manifest {
            cfg.data.manifest = manifest.clone();
        }
        cfg.seed = resolve_seed(self.seed, cfg.seed);
        cfg.validate()?;
        Ok(cfg)
    }
}

/// CLI seed, then `FAN_SEED`, then the configured seed.
pub fn resolve_seed(cli: Option<u64>, configured: u64) -> u64 {
    cli.or_else(|| {
        std::env::var(SEED_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    })
    .unwrap_or(configured)
}

/// Seeds the backend RNG and returns a host RNG for shuffling and splitting.
pub fn fix_seed<B: Backend>(seed: u64) -> StdRng {
    B::seed(seed);
    StdRng::seed_from_u64(seed)
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let cfg = args.resolve_config()?;
    let (_, history) = train_from_config(&cfg)?;
    if let Some((epoch, best)) = history
        .valid
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
    {
        info!(
            "best validation loss {best:.6} at epoch {}; checkpoints in {}",
            epoch + 1,
            cfg.checkpoint_dir.display()
        );
    }
    Ok(())
}

/// Loads and splits the dataset, builds model, schedule and optimizer, then fits.
pub fn train_from_config(
    cfg: &TrainConfig,
) -> anyhow::Result<(FaceAlignmentNet<ADBackend>, LossHistory)> {
    let device = <ADBackend as Backend>::Device::default();
    let mut rng = fix_seed::<ADBackend>(cfg.seed);

    let samples = cfg.dataset().load()?;
    info!(
        "loaded {} samples from {}",
        samples.len(),
        cfg.data.manifest.display()
    );
    let (train_samples, valid_samples) = split(samples, cfg.data.split_ratio, rng.random())?;
    info!(
        "split into {} training / {} validation samples",
        train_samples.len(),
        valid_samples.len()
    );
    let mut train = InMemoryLoader::new(train_samples, cfg.data.batch_size)?;
    if cfg.data.shuffle {
        train = train.with_shuffle(rng.random());
    }
    let valid = InMemoryLoader::new(valid_samples, cfg.data.batch_size)?;

    let model = cfg.model.init::<ADBackend>(&device)?;
    info!(
        "model: {} stacks, depth {}, {} features, {} landmarks, {} blocks, {} attention",
        cfg.model.num_stacks,
        cfg.model.hourglass_depth,
        cfg.model.num_features,
        cfg.model.num_classes,
        cfg.model.residual,
        cfg.model.attention
    );
    let mut scheduler = cfg.schedule.build()?;
    let opts = FitOptions::new(cfg.epochs, cfg.checkpoint_dir.clone());
    let criterion = cfg.loss.kind;
    let decay = cfg.optim.weight_decay;
    info!("optimizer {:?}, loss {criterion}", cfg.optim.kind);

    let result = match cfg.optim.kind {
        OptimizerKind::RmsProp => {
            let mut optim = RmsPropConfig::new()
                .with_weight_decay(decay.map(WeightDecayConfig::new))
                .init::<ADBackend, FaceAlignmentNet<ADBackend>>();
            fit(model, &train, &valid, &criterion, scheduler.as_mut(), &mut optim, &opts, &device)
        }
        OptimizerKind::Sgd => {
            let mut optim = SgdConfig::new()
                .with_weight_decay(decay.map(WeightDecayConfig::new))
                .init::<ADBackend, FaceAlignmentNet<ADBackend>>();
            fit(model, &train, &valid, &criterion, scheduler.as_mut(), &mut optim, &opts, &device)
        }
        OptimizerKind::Adam => {
            let mut optim = AdamConfig::new()
                .with_weight_decay(decay.map(WeightDecayConfig::new))
                .init::<ADBackend, FaceAlignmentNet<ADBackend>>();
            fit(model, &train, &valid, &criterion, scheduler.as_mut(), &mut optim, &opts, &device)
        }
        OptimizerKind::AdamW => {
            let mut optim = AdamWConfig::new()
                .with_weight_decay(decay.unwrap_or(1e-4))
                .init::<ADBackend, FaceAlignmentNet<ADBackend>>();
            fit(model, &train, &valid, &criterion, scheduler.as_mut(), &mut optim, &opts, &device)
        }
    };
    Ok(result?)
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_take_precedence() {
        let args = TrainArgs::parse_from([
            "train",
            "--epochs",
            "4",
            "--checkpoint-dir",
            "out/ckpt",
            "--seed",
            "5",
        ]);
        let cfg = args.resolve_config().unwrap();
        assert_eq!(cfg.epochs, 4);
        assert_eq!(cfg.checkpoint_dir, PathBuf::from("out/ckpt"));
        assert_eq!(cfg.seed, 5);
    }

    #[test]
    fn zero_epochs_is_rejected() {
        let args = TrainArgs::parse_from(["train", "--epochs", "0"]);
        assert!(args.resolve_config().is_err());
    }

    #[test]
    fn explicit_seed_wins() {
        assert_eq!(resolve_seed(Some(1), 987), 1);
    }

    #[test]
    fn ndarray_backend_is_always_available() {
        assert!(validate_backend_choice(BackendKind::NdArray).is_ok());
    }
}
