//! Training for stacked hourglass landmark networks: data loading, heatmap losses,
//! warmup + reduce-on-plateau rate control, gradient clipping, the epoch loop and
//! per-epoch checkpoints.

#![recursion_limit = "256"]

pub mod checkpoint;
pub mod clip;
pub mod config;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod loss;
pub mod scheduler;
pub mod trainer;
pub mod util;

pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use config::{OptimizerKind, ScheduleKind, TrainConfig};
pub use dataset::{HeatmapBatch, HeatmapLoader, HeatmapSample, InMemoryLoader};
pub use error::{TrainError, TrainResult};
pub use eval::{evaluate, EvalReport};
pub use loss::{HeatmapCriterion, HeatmapLoss};
pub use scheduler::{PlateauConfig, RateSchedule, ReduceOnPlateau, WarmupPlateau};
pub use trainer::{fit, FitOptions, LossHistory};
pub use util::{run_train, TrainArgs};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
