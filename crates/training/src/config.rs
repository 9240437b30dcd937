//! TOML run configuration. Every field has a default; a missing file section
//! means "use the defaults for that section".

use models::{FanConfig, Selector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::dataset::LandmarkDatasetConfig;
use crate::error::{TrainError, TrainResult};
use crate::loss::HeatmapLoss;
use crate::scheduler::{PlateauConfig, RateSchedule, ReduceOnPlateau, WarmupPlateau};

/// Written in config files as a name (`"rmsprop"`, `"adam_w"`, ...) or an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "Selector")]
pub enum OptimizerKind {
    #[default]
    RmsProp,
    Sgd,
    Adam,
    AdamW,
}

impl OptimizerKind {
    pub const ALL: [OptimizerKind; 4] = [
        OptimizerKind::RmsProp,
        OptimizerKind::Sgd,
        OptimizerKind::Adam,
        OptimizerKind::AdamW,
    ];

    pub fn from_index(index: usize) -> TrainResult<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| TrainError::Config(format!("unknown optimizer index {index}")))
    }
}

impl TryFrom<Selector> for OptimizerKind {
    type Error = TrainError;

    fn try_from(selector: Selector) -> TrainResult<Self> {
        match selector {
            Selector::Index(index) => Self::from_index(index),
            Selector::Name(name) => name.parse(),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            _ => Err(TrainError::Config(format!("unknown optimizer `{s}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    WarmupPlateau,
    Plateau,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub kind: ScheduleKind,
    pub lr: f64,
    pub warmup_epochs: usize,
    pub patience: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            kind: ScheduleKind::WarmupPlateau,
            lr: 1e-4,
            warmup_epochs: 2,
            patience: 3,
        }
    }
}

impl ScheduleConfig {
    pub fn build(&self) -> TrainResult<Box<dyn RateSchedule>> {
        let plateau = PlateauConfig::default().with_patience(self.patience);
        Ok(match self.kind {
            ScheduleKind::WarmupPlateau => {
                Box::new(WarmupPlateau::new(vec![self.lr], self.warmup_epochs, plateau)?)
            }
            ScheduleKind::Plateau => Box::new(ReduceOnPlateau::new(vec![self.lr], plateau)?),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub kind: OptimizerKind,
    pub weight_decay: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub kind: HeatmapLoss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub manifest: PathBuf,
    pub root: Option<PathBuf>,
    pub input_size: usize,
    pub sigma: f32,
    pub split_ratio: f32,
    pub batch_size: usize,
    pub shuffle: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("data/landmarks.json"),
            root: None,
            input_size: 256,
            sigma: 1.5,
            split_ratio: 0.9,
            batch_size: 8,
            shuffle: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub seed: u64,
    pub checkpoint_dir: PathBuf,
    pub model: FanConfig,
    pub schedule: ScheduleConfig,
    pub optim: OptimConfig,
    pub loss: LossConfig,
    pub data: DataConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            seed: 987,
            checkpoint_dir: PathBuf::from("checkpoints"),
            model: FanConfig::default(),
            schedule: ScheduleConfig::default(),
            optim: OptimConfig::default(),
            loss: LossConfig::default(),
            data: DataConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_toml_str(raw: &str) -> TrainResult<Self> {
        toml::from_str(raw).map_err(|e| TrainError::Config(format!("invalid config: {e}")))
    }

    pub fn from_path(path: &Path) -> TrainResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        toml::from_str(&raw)
            .map_err(|e| TrainError::Config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn validate(&self) -> TrainResult<()> {
        if self.epochs == 0 {
            return Err(TrainError::Config("epochs must be positive".into()));
        }
        self.model.validate()?;
        let multiple = self.model.spatial_multiple();
        if self.data.input_size == 0 || self.data.input_size % multiple != 0 {
            return Err(TrainError::Config(format!(
                "input_size {} must be a positive multiple of {multiple} for hourglass depth {}",
                self.data.input_size, self.model.hourglass_depth
            )));
        }
        if self.data.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be positive".into()));
        }
        if !(self.data.sigma > 0.0) {
            return Err(TrainError::Config("heatmap sigma must be positive".into()));
        }
        if !(self.data.split_ratio > 0.0 && self.data.split_ratio < 1.0) {
            return Err(TrainError::Config(format!(
                "split_ratio {} must lie in (0, 1)",
                self.data.split_ratio
            )));
        }
        // Surfaces bad rates, patience or warmup before any data is read.
        self.schedule.build()?;
        Ok(())
    }

    pub fn dataset(&self) -> LandmarkDatasetConfig {
        LandmarkDatasetConfig {
            manifest: self.data.manifest.clone(),
            root: self.data.root.clone(),
            input_size: self.data.input_size,
            sigma: self.data.sigma,
            num_classes: self.model.num_classes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{AttentionKind, ResidualKind};

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = TrainConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.epochs, 20);
        assert_eq!(cfg.seed, 987);
        assert_eq!(cfg.model, FanConfig::default());
        assert_eq!(cfg.optim.kind, OptimizerKind::RmsProp);
        assert_eq!(cfg.loss.kind, HeatmapLoss::WeightedL2);
        assert_eq!(cfg.schedule.warmup_epochs, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn sections_override_fields() {
        let cfg = TrainConfig::from_toml_str(
            r#"
            epochs = 3
            checkpoint_dir = "runs/fan"

            [model]
            num_stacks = 4
            residual = "inverted_residual"
            attention = "coordinate"

            [schedule]
            kind = "plateau"
            lr = 0.001

            [optim]
            kind = "adam_w"

            [loss]
            kind = "adaptive_wing"

            [data]
            batch_size = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.checkpoint_dir, PathBuf::from("runs/fan"));
        assert_eq!(cfg.model.num_stacks, 4);
        assert_eq!(cfg.model.hourglass_depth, 4);
        assert_eq!(cfg.model.residual, ResidualKind::InvertedResidual);
        assert_eq!(cfg.model.attention, AttentionKind::Coordinate);
        assert_eq!(cfg.schedule.kind, ScheduleKind::Plateau);
        assert_eq!(cfg.optim.kind, OptimizerKind::AdamW);
        assert_eq!(cfg.loss.kind, HeatmapLoss::AdaptiveWing);
        assert_eq!(cfg.data.batch_size, 2);
        assert_eq!(cfg.data.input_size, 256);
        cfg.validate().unwrap();
    }

    #[test]
    fn selectors_accept_indices() {
        let cfg = TrainConfig::from_toml_str(
            r#"
            [model]
            residual = 2
            attention = 0

            [optim]
            kind = 1

            [loss]
            kind = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.residual, ResidualKind::InvertedResidual);
        assert_eq!(cfg.model.attention, AttentionKind::None);
        assert_eq!(cfg.optim.kind, OptimizerKind::Sgd);
        assert_eq!(cfg.loss.kind, HeatmapLoss::Wing);
        assert!(TrainConfig::from_toml_str("[model]\nresidual = 3").is_err());
        assert!(TrainConfig::from_toml_str("[loss]\nkind = 6").is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut cfg = TrainConfig::default();
        cfg.data.input_size = 200;
        assert!(cfg.validate().unwrap_err().is_configuration());

        let mut cfg = TrainConfig::default();
        cfg.schedule.patience = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = TrainConfig::default();
        cfg.model.num_features = 0;
        assert!(matches!(cfg.validate(), Err(TrainError::Model(_))));

        assert!(TrainConfig::from_toml_str("[model]\nresidual = \"dense\"").is_err());
        assert!(OptimizerKind::from_index(4).is_err());
        assert!(TrainConfig::from_toml_str("[optim]\nkind = 4").is_err());
        assert!(TrainConfig::from_toml_str("[model]\nattention = -1").is_err());
        assert_eq!("RMSprop".parse::<OptimizerKind>().unwrap(), OptimizerKind::RmsProp);
        assert_eq!("adam-w".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert!("lamb".parse::<OptimizerKind>().is_err());
    }
}
