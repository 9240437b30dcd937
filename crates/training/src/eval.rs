//! Checkpoint scoring: mean loss and landmark error decoded from heatmap peaks.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use models::{FaceAlignmentNet, STEM_STRIDE};
use serde::Serialize;

use crate::dataset::HeatmapLoader;
use crate::error::{TrainError, TrainResult};
use crate::loss::HeatmapCriterion;
use crate::trainer::{check_targets, stage_loss};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub items: usize,
    /// Summed stage losses divided by `items`.
    pub loss: f32,
    /// Mean Euclidean distance between predicted and target peaks, in input pixels.
    pub mean_error_px: f32,
}

/// Peak location `[x, y]` of every heatmap channel, row-major per sample.
pub fn decode_peaks<B: Backend>(heatmaps: Tensor<B, 4>) -> Vec<Vec<[f32; 2]>> {
    let [batch, classes, height, width] = heatmaps.dims();
    let flat = heatmaps.reshape([batch, classes, height * width]);
    let idx: Vec<i64> = flat
        .argmax(2)
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .unwrap_or_default();
    idx.chunks(classes.max(1))
        .map(|sample| {
            sample
                .iter()
                .map(|&i| {
                    let i = i.max(0) as usize;
                    [(i % width) as f32, (i / width) as f32]
                })
                .collect()
        })
        .collect()
}

/// Mean peak distance between two batches of heatmaps, scaled to input pixels.
pub fn peak_error<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> (f32, usize) {
    let pred = decode_peaks(pred);
    let target = decode_peaks(target);
    let mut total = 0.0f32;
    let mut count = 0usize;
    for (p, t) in pred.iter().flatten().zip(target.iter().flatten()) {
        let dx = p[0] - t[0];
        let dy = p[1] - t[1];
        total += (dx * dx + dy * dy).sqrt() * STEM_STRIDE as f32;
        count += 1;
    }
    (total, count)
}

pub fn evaluate<B, L, C>(
    model: &FaceAlignmentNet<B>,
    loader: &L,
    criterion: &C,
    device: &B::Device,
) -> TrainResult<EvalReport>
where
    B: Backend,
    L: HeatmapLoader<B>,
    C: HeatmapCriterion,
{
    let items = loader.num_items();
    if items == 0 {
        return Err(TrainError::Dataset("nothing to evaluate".into()));
    }
    let mut loss_total = 0.0f64;
    let mut error_total = 0.0f64;
    let mut points = 0usize;
    for batch in loader.batches(0, device) {
        model.check_input(batch.images.dims())?;
        let outputs = model.forward(batch.images);
        check_targets(&outputs, batch.heatmaps.dims())?;
        let Some(last) = outputs.last().cloned() else {
            continue;
        };
        let (err, n) = peak_error(last, batch.heatmaps.clone());
        error_total += err as f64;
        points += n;
        loss_total += stage_loss(criterion, outputs, batch.heatmaps).into_scalar().elem::<f64>();
    }
    Ok(EvalReport {
        items,
        loss: (loss_total / items as f64) as f32,
        mean_error_px: if points == 0 {
            0.0
        } else {
            (error_total / points as f64) as f32
        },
    })
}
