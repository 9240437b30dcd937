//! Per-epoch checkpoint files (`<dir>/<epoch>.bin`, full precision).

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use models::{FaceAlignmentNet, FanConfig};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{TrainError, TrainResult};

pub const CHECKPOINT_EXTENSION: &str = "bin";

/// Creates `dir` if missing; fails when the path exists but is not a directory.
pub fn prepare_dir(dir: &Path) -> TrainResult<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(TrainError::CheckpointDir {
            path: dir.to_path_buf(),
        });
    }
    fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))
}

pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{epoch}.{CHECKPOINT_EXTENSION}"))
}

/// Writes the full parameter record for `epoch`, replacing any earlier file.
pub fn save_checkpoint<B: Backend>(
    model: &FaceAlignmentNet<B>,
    dir: &Path,
    epoch: usize,
) -> TrainResult<PathBuf> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let path = checkpoint_path(dir, epoch);
    model.clone().save_file(path.clone(), &recorder)?;
    Ok(path)
}

/// Rebuilds the architecture from `cfg` and loads the saved parameters into it.
pub fn load_checkpoint<B: Backend>(
    cfg: &FanConfig,
    path: &Path,
    device: &B::Device,
) -> TrainResult<FaceAlignmentNet<B>> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = cfg.init::<B>(device)?;
    Ok(model.load_file(path.to_path_buf(), &recorder, device)?)
}
