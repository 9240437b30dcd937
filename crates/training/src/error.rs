//! Error taxonomy for training runs.

use burn::record::RecorderError;
use models::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid model configuration: {0}")]
    Model(#[from] ConfigError),
    #[error("epoch {epoch} is past the {warmup}-epoch warmup but no validation metric was provided")]
    MissingMetric { epoch: usize, warmup: usize },
    #[error("checkpoint directory {path} is not a directory")]
    CheckpointDir { path: PathBuf },
    #[error("non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NumericInstability {
        epoch: usize,
        batch: usize,
        value: f32,
    },
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] RecorderError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl TrainError {
    /// Fatal-at-startup errors caused by bad settings rather than bad data or I/O.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TrainError::Model(_)
                | TrainError::MissingMetric { .. }
                | TrainError::CheckpointDir { .. }
                | TrainError::Config(_)
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }
}
