//! Channel reweighting gates applied on top of residual unit outputs.

use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::blocks::pointwise;
use crate::error::{positive, ConfigError, Result};
use crate::selector::Selector;

const SE_REDUCTION: usize = 4;

/// Which gate (if any) follows the outbound unit of each hourglass level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "Selector")]
pub enum AttentionKind {
    None,
    #[default]
    SqueezeExcite,
    Coordinate,
}

impl AttentionKind {
    pub const ALL: [AttentionKind; 3] = [
        AttentionKind::None,
        AttentionKind::SqueezeExcite,
        AttentionKind::Coordinate,
    ];

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| ConfigError::UnknownVariant {
                kind: "attention",
                value: index.to_string(),
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionKind::None => "none",
            AttentionKind::SqueezeExcite => "squeeze_excite",
            AttentionKind::Coordinate => "coordinate",
        }
    }

    /// Builds the gate for `channels`, or `None` for [`AttentionKind::None`].
    pub fn init<B: Backend>(
        &self,
        channels: usize,
        device: &B::Device,
    ) -> Result<Option<AttentionGate<B>>> {
        positive("attention channels", channels)?;
        Ok(match self {
            AttentionKind::None => None,
            AttentionKind::SqueezeExcite => Some(AttentionGate::SqueezeExcite(
                SqueezeExcite::new(channels, device),
            )),
            AttentionKind::Coordinate => Some(AttentionGate::Coordinate(CoordAttention::new(
                channels, device,
            ))),
        })
    }
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<Selector> for AttentionKind {
    type Error = ConfigError;

    fn try_from(selector: Selector) -> Result<Self> {
        match selector {
            Selector::Index(index) => Self::from_index(index),
            Selector::Name(name) => name.parse(),
        }
    }
}

impl FromStr for AttentionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AttentionKind::None),
            "squeeze_excite" | "se" | "selayer" => Ok(AttentionKind::SqueezeExcite),
            "coordinate" | "ca" | "ca_block" => Ok(AttentionKind::Coordinate),
            other => Err(ConfigError::UnknownVariant {
                kind: "attention",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Module, Debug)]
pub enum AttentionGate<B: Backend> {
    SqueezeExcite(SqueezeExcite<B>),
    Coordinate(CoordAttention<B>),
}

impl<B: Backend> AttentionGate<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            AttentionGate::SqueezeExcite(gate) => gate.forward(x),
            AttentionGate::Coordinate(gate) => gate.forward(x),
        }
    }
}

/// Global-pool squeeze followed by a two-layer excitation MLP.
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let hidden = (channels / SE_REDUCTION).max(1);
        let init = Initializer::Normal {
            mean: 0.0,
            std: 0.01,
        };
        let fc1 = LinearConfig::new(channels, hidden)
            .with_initializer(init.clone())
            .init(device);
        let fc2 = LinearConfig::new(hidden, channels)
            .with_initializer(init)
            .init(device);
        Self { fc1, fc2 }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, _, _] = x.dims();
        let pooled = x.clone().mean_dim(3).mean_dim(2).reshape([batch, channels]);
        let weights = relu(self.fc1.forward(pooled));
        let weights = sigmoid(self.fc2.forward(weights)).reshape([batch, channels, 1, 1]);
        x * weights
    }
}

/// Coordinate attention: separate gates along the height and width axes.
#[derive(Module, Debug)]
pub struct CoordAttention<B: Backend> {
    reduce: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    gate_h: Conv2d<B>,
    gate_w: Conv2d<B>,
}

impl<B: Backend> CoordAttention<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let mip = (channels / 32).max(8);
        Self {
            reduce: pointwise([channels, mip], true, device),
            bn: BatchNormConfig::new(mip).init(device),
            gate_h: pointwise([mip, channels], true, device),
            gate_w: pointwise([mip, channels], true, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        // [b, c, h, 1] and [b, c, w, 1] share one 1x1 reduction.
        let pooled_h = x.clone().mean_dim(3);
        let pooled_w = x.clone().mean_dim(2).swap_dims(2, 3);
        let y = Tensor::cat(vec![pooled_h, pooled_w], 2);
        let y = hard_swish(self.bn.forward(self.reduce.forward(y)));

        let y_h = y.clone().narrow(2, 0, height);
        let y_w = y.narrow(2, height, width).swap_dims(2, 3);
        let a_h = sigmoid(self.gate_h.forward(y_h));
        let a_w = sigmoid(self.gate_w.forward(y_w));
        x * a_w * a_h
    }
}

fn hard_swish<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let gate = x.clone().add_scalar(3.0).clamp(0.0, 6.0).div_scalar(6.0);
    x * gate
}
