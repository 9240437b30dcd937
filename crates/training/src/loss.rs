//! Heatmap regression losses.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::Selector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TrainError;

/// Scalar loss between one predicted heatmap stack and its target.
///
/// Called once per stage per batch; the trainer sums the results.
pub trait HeatmapCriterion {
    fn loss<B: Backend>(&self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "Selector")]
pub enum HeatmapLoss {
    L2,
    L1,
    SmoothL1,
    Wing,
    AdaptiveWing,
    #[default]
    WeightedL2,
}

const WING_WIDTH: f32 = 10.0;
const WING_CURVATURE: f32 = 2.0;

const AWING_OMEGA: f32 = 14.0;
const AWING_THETA: f32 = 0.5;
const AWING_EPSILON: f32 = 1.0;
const AWING_ALPHA: f32 = 2.1;

/// Foreground pixels weigh up to this much more than background in `WeightedL2`.
const FOREGROUND_WEIGHT: f32 = 9.0;

impl HeatmapLoss {
    pub const ALL: [HeatmapLoss; 6] = [
        HeatmapLoss::L2,
        HeatmapLoss::L1,
        HeatmapLoss::SmoothL1,
        HeatmapLoss::Wing,
        HeatmapLoss::AdaptiveWing,
        HeatmapLoss::WeightedL2,
    ];

    pub fn from_index(index: usize) -> Result<Self, TrainError> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| TrainError::Config(format!("unknown loss index {index}")))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HeatmapLoss::L2 => "l2",
            HeatmapLoss::L1 => "l1",
            HeatmapLoss::SmoothL1 => "smooth_l1",
            HeatmapLoss::Wing => "wing",
            HeatmapLoss::AdaptiveWing => "adaptive_wing",
            HeatmapLoss::WeightedL2 => "weighted_l2",
        }
    }
}

impl fmt::Display for HeatmapLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<Selector> for HeatmapLoss {
    type Error = TrainError;

    fn try_from(selector: Selector) -> Result<Self, Self::Error> {
        match selector {
            Selector::Index(index) => Self::from_index(index),
            Selector::Name(name) => name.parse(),
        }
    }
}

impl FromStr for HeatmapLoss {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == key)
            .ok_or_else(|| TrainError::Config(format!("unknown loss `{s}`")))
    }
}

impl HeatmapCriterion for HeatmapLoss {
    fn loss<B: Backend>(&self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            HeatmapLoss::L2 => (pred - target).powf_scalar(2.0).mean(),
            HeatmapLoss::L1 => (pred - target).abs().mean(),
            HeatmapLoss::SmoothL1 => smooth_l1(pred, target),
            HeatmapLoss::Wing => wing(pred, target),
            HeatmapLoss::AdaptiveWing => adaptive_wing(pred, target),
            HeatmapLoss::WeightedL2 => {
                let weight = target.clone().mul_scalar(FOREGROUND_WEIGHT).add_scalar(1.0);
                ((pred - target).powf_scalar(2.0) * weight).mean()
            }
        }
    }
}

fn smooth_l1<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    // 0.5 d^2 below 1, |d| - 0.5 above.
    let abs = (pred - target).abs();
    let inner = abs.clone().clamp_max(1.0);
    ((inner.clone() * inner.clone()).mul_scalar(0.5) + abs - inner).mean()
}

fn wing<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let w = WING_WIDTH;
    let offset = w - w * (1.0 + w / WING_CURVATURE).ln();
    let abs = (pred - target).abs();
    let small = abs
        .clone()
        .div_scalar(WING_CURVATURE)
        .add_scalar(1.0)
        .log()
        .mul_scalar(w);
    let large = abs.clone().sub_scalar(offset);
    large.mask_where(abs.lower_elem(w), small).mean()
}

fn adaptive_wing<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let omega = AWING_OMEGA;
    let ratio = AWING_THETA / AWING_EPSILON;
    let abs = (pred - target.clone()).abs();
    let exponent = target.neg().add_scalar(AWING_ALPHA);

    let small = abs
        .clone()
        .div_scalar(AWING_EPSILON)
        .powf(exponent.clone())
        .add_scalar(1.0)
        .log()
        .mul_scalar(omega);

    // ratio^(alpha - y) and the linear continuation past theta.
    let ratio_pow = exponent.clone().mul_scalar(ratio.ln()).exp();
    let slope = ratio_pow
        .clone()
        .add_scalar(1.0)
        .recip()
        .mul(exponent)
        .mul(ratio_pow.clone().div_scalar(ratio))
        .mul_scalar(omega / AWING_EPSILON);
    let offset = slope.clone().mul_scalar(AWING_THETA)
        - ratio_pow.add_scalar(1.0).log().mul_scalar(omega);
    let large = slope * abs.clone() - offset;

    large.mask_where(abs.lower_elem(AWING_THETA), small).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn tensor(values: Vec<f32>) -> Tensor<TestBackend, 4> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [1, 1, 1, n]), &Default::default())
    }

    fn value(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn identical_maps_cost_nothing() {
        let target = tensor(vec![0.0, 0.25, 0.5, 1.0]);
        for kind in HeatmapLoss::ALL {
            let loss = value(kind.loss(target.clone(), target.clone()));
            assert!(loss.abs() < 1e-6, "{kind}: {loss}");
        }
    }

    #[test]
    fn closed_form_values() {
        let pred = tensor(vec![0.5, 3.0]);
        let target = tensor(vec![0.0, 0.0]);
        let l2 = value(HeatmapLoss::L2.loss(pred.clone(), target.clone()));
        assert!((l2 - (0.25 + 9.0) / 2.0).abs() < 1e-6);
        let l1 = value(HeatmapLoss::L1.loss(pred.clone(), target.clone()));
        assert!((l1 - 1.75).abs() < 1e-6);
        let smooth = value(HeatmapLoss::SmoothL1.loss(pred.clone(), target.clone()));
        assert!((smooth - (0.125 + 2.5) / 2.0).abs() < 1e-6);
        let weighted = value(HeatmapLoss::WeightedL2.loss(tensor(vec![0.0]), tensor(vec![1.0])));
        assert!((weighted - 10.0).abs() < 1e-6);
    }

    #[test]
    fn wing_is_continuous_at_its_width() {
        let target = tensor(vec![0.0]);
        let below = value(HeatmapLoss::Wing.loss(tensor(vec![WING_WIDTH - 1e-3]), target.clone()));
        let above = value(HeatmapLoss::Wing.loss(tensor(vec![WING_WIDTH + 1e-3]), target));
        assert!((below - above).abs() < 1e-2);
    }

    #[test]
    fn adaptive_wing_is_continuous_at_theta() {
        let target = tensor(vec![0.3]);
        let below =
            value(HeatmapLoss::AdaptiveWing.loss(tensor(vec![0.3 + AWING_THETA - 1e-4]), target.clone()));
        let above =
            value(HeatmapLoss::AdaptiveWing.loss(tensor(vec![0.3 + AWING_THETA + 1e-4]), target));
        assert!(below > 0.0);
        assert!((below - above).abs() < 1e-2);
    }

    #[test]
    fn parses_names_and_indices() {
        assert_eq!("weighted_L2".parse::<HeatmapLoss>().unwrap(), HeatmapLoss::WeightedL2);
        assert_eq!("smooth-l1".parse::<HeatmapLoss>().unwrap(), HeatmapLoss::SmoothL1);
        assert_eq!(HeatmapLoss::from_index(3).unwrap(), HeatmapLoss::Wing);
        assert!(HeatmapLoss::from_index(6).unwrap_err().is_configuration());
        assert!("huber".parse::<HeatmapLoss>().is_err());
    }
}
