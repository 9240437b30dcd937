//! Epoch loop: train, validate, step the rate schedule, checkpoint.

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use models::FaceAlignmentNet;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::checkpoint;
use crate::clip::{clip_grad_norm, MAX_GRAD_NORM};
use crate::dataset::HeatmapLoader;
use crate::error::{TrainError, TrainResult};
use crate::loss::HeatmapCriterion;
use crate::scheduler::RateSchedule;

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub checkpoint_dir: PathBuf,
    pub max_grad_norm: f32,
}

impl FitOptions {
    pub fn new(epochs: usize, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            epochs,
            checkpoint_dir: checkpoint_dir.into(),
            max_grad_norm: MAX_GRAD_NORM,
        }
    }
}

/// Per-epoch mean losses, index 0 is epoch 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LossHistory {
    pub train: Vec<f32>,
    pub valid: Vec<f32>,
}

/// One line of `metrics.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f32,
    pub valid_loss: f32,
    pub learning_rate: f64,
    pub epoch_secs: f64,
    pub total_secs: f64,
    pub checkpoint: PathBuf,
}

/// Sum of `criterion` over every stage output against the same target.
pub fn stage_loss<B: Backend, C: HeatmapCriterion>(
    criterion: &C,
    outputs: Vec<Tensor<B, 4>>,
    target: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let device = target.device();
    outputs
        .into_iter()
        .map(|out| criterion.loss(out, target.clone()))
        .reduce(|acc, loss| acc + loss)
        .unwrap_or_else(|| Tensor::zeros([1], &device))
}

/// Whole minutes and leftover seconds.
pub fn split_minutes(elapsed: Duration) -> (u64, f64) {
    let secs = elapsed.as_secs_f64();
    ((secs / 60.0).floor() as u64, secs % 60.0)
}

/// Target heatmaps must match the shape of every stage output.
pub(crate) fn check_targets<B: Backend>(
    outputs: &[Tensor<B, 4>],
    target: [usize; 4],
) -> TrainResult<()> {
    match outputs.first().map(|out| out.dims()) {
        Some(out) if out != target => Err(TrainError::Dataset(format!(
            "target heatmaps {target:?} do not match model output {out:?}"
        ))),
        _ => Ok(()),
    }
}

fn scalar<B: Backend>(loss: Tensor<B, 1>) -> f32 {
    loss.into_scalar().elem::<f32>()
}

fn finite(value: f32, epoch: usize, batch: usize) -> TrainResult<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TrainError::NumericInstability {
            epoch,
            batch,
            value,
        })
    }
}

fn append_report(dir: &Path, report: &EpochReport) -> TrainResult<()> {
    let path = dir.join(METRICS_FILE);
    let line = serde_json::to_string(report).map_err(|source| TrainError::Json {
        path: path.clone(),
        source,
    })?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| TrainError::io(&path, e))?;
    writeln!(file, "{line}").map_err(|e| TrainError::io(&path, e))
}

/// Runs `opts.epochs` epochs and returns the trained model with its loss history.
///
/// Each training batch sums the loss of every stage, clips the global gradient
/// norm and takes one optimizer step at the schedule's current rate. Epoch losses
/// are the summed batch losses divided by the number of examples. After
/// validation the schedule is stepped with the validation loss and the model is
/// written to `<checkpoint_dir>/<epoch>.bin`. Epochs are numbered from 1.
#[allow(clippy::too_many_arguments)]
pub fn fit<B, T, V, C, O>(
    mut model: FaceAlignmentNet<B>,
    train: &T,
    valid: &V,
    criterion: &C,
    scheduler: &mut dyn RateSchedule,
    optim: &mut O,
    opts: &FitOptions,
    device: &B::Device,
) -> TrainResult<(FaceAlignmentNet<B>, LossHistory)>
where
    B: AutodiffBackend,
    T: HeatmapLoader<B>,
    V: HeatmapLoader<B>,
    C: HeatmapCriterion,
    O: Optimizer<FaceAlignmentNet<B>, B>,
{
    checkpoint::prepare_dir(&opts.checkpoint_dir)?;
    let train_items = train.num_items();
    let valid_items = valid.num_items();
    if train_items == 0 || valid_items == 0 {
        return Err(TrainError::Dataset(format!(
            "empty split: {train_items} training / {valid_items} validation examples"
        )));
    }

    let mut history = LossHistory::default();
    let run_started = Instant::now();

    for epoch in 1..=opts.epochs {
        let started = Instant::now();
        let lr = scheduler.rate();

        let mut train_total = 0.0f64;
        for (batch_idx, batch) in train.batches(epoch, device).enumerate() {
            model.check_input(batch.images.dims())?;
            let outputs = model.forward(batch.images);
            check_targets(&outputs, batch.heatmaps.dims())?;
            let loss = stage_loss(criterion, outputs, batch.heatmaps);
            let value = finite(scalar(loss.clone().detach()), epoch, batch_idx)?;

            let mut grads = GradientsParams::from_grads(loss.backward(), &model);
            let norm = clip_grad_norm::<B, _>(&model, &mut grads, opts.max_grad_norm);
            model = optim.step(lr, model, grads);

            debug!(epoch, batch = batch_idx, loss = value, grad_norm = norm, "train step");
            train_total += value as f64;
        }
        let train_loss = (train_total / train_items as f64) as f32;

        let eval_model = model.valid();
        let mut valid_total = 0.0f64;
        for (batch_idx, batch) in valid.batches(epoch, device).enumerate() {
            eval_model.check_input(batch.images.dims())?;
            let outputs = eval_model.forward(batch.images.inner());
            check_targets(&outputs, batch.heatmaps.dims())?;
            let loss = stage_loss(criterion, outputs, batch.heatmaps.inner());
            valid_total += finite(scalar(loss), epoch, batch_idx)? as f64;
        }
        let valid_loss = (valid_total / valid_items as f64) as f32;

        scheduler.step(Some(valid_loss as f64))?;
        let saved = checkpoint::save_checkpoint(&model, &opts.checkpoint_dir, epoch)?;

        let epoch_time = started.elapsed();
        let total_time = run_started.elapsed();
        let (m, s) = split_minutes(epoch_time);
        let (tm, ts) = split_minutes(total_time);
        info!(
            "epoch {epoch}/{}: train loss = {train_loss:.6}, valid loss = {valid_loss:.6}, lr = {lr:.3e}",
            opts.epochs
        );
        info!("epoch time = {m} min {s:.1} sec, total time = {tm} min {ts:.1} sec");

        append_report(
            &opts.checkpoint_dir,
            &EpochReport {
                epoch,
                train_loss,
                valid_loss,
                learning_rate: lr,
                epoch_secs: epoch_time.as_secs_f64(),
                total_secs: total_time.as_secs_f64(),
                checkpoint: saved,
            },
        )?;
        history.train.push(train_loss);
        history.valid.push(valid_loss);
    }

    Ok((model, history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn minutes_and_seconds() {
        let (m, s) = split_minutes(Duration::from_secs_f64(125.5));
        assert_eq!(m, 2);
        assert!((s - 5.5).abs() < 1e-9);
    }

    #[test]
    fn stage_losses_add_up() {
        struct Constant(f32);
        impl HeatmapCriterion for Constant {
            fn loss<B: Backend>(&self, pred: Tensor<B, 4>, _target: Tensor<B, 4>) -> Tensor<B, 1> {
                pred.sum().mul_scalar(0.0).add_scalar(self.0)
            }
        }
        let device = Default::default();
        let target = Tensor::<NdArray<f32>, 4>::zeros([1, 1, 2, 2], &device);
        let outputs = vec![target.clone(); 3];
        let total = scalar(stage_loss(&Constant(0.5), outputs, target.clone()));
        assert!((total - 1.5).abs() < 1e-6);
        assert_eq!(scalar(stage_loss(&Constant(0.5), vec![], target)), 0.0);
    }

    #[test]
    fn target_shape_must_match_outputs() {
        let device = Default::default();
        let out = Tensor::<NdArray<f32>, 4>::zeros([2, 3, 4, 4], &device);
        assert!(check_targets(&[out.clone()], [2, 3, 4, 4]).is_ok());
        assert!(matches!(
            check_targets(&[out], [2, 5, 4, 4]),
            Err(TrainError::Dataset(_))
        ));
        assert!(check_targets::<NdArray<f32>>(&[], [1, 1, 1, 1]).is_ok());
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert_eq!(finite(1.0, 1, 0).unwrap(), 1.0);
        assert!(matches!(
            finite(f32::NAN, 2, 5),
            Err(TrainError::NumericInstability {
                epoch: 2,
                batch: 5,
                ..
            })
        ));
    }
}
