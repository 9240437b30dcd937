//! Residual building blocks shared by the stem, the hourglasses and the stage heads.
//!
//! Every unit maps `[B, in, H, W]` to `[B, out, H, W]`. The variant is chosen once,
//! at construction, through [`ResidualKind`].

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::attention::SqueezeExcite;
use crate::error::{multiple_of, positive, ConfigError, Result};
use crate::selector::Selector;

/// Kaiming-normal in fan-out mode with the ReLU gain.
pub(crate) fn fan_out_init() -> Initializer {
    Initializer::KaimingNormal {
        gain: std::f64::consts::SQRT_2,
        fan_out_only: true,
    }
}

/// Square convolution with "same" padding for odd kernels.
pub(crate) fn conv(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    bias: bool,
) -> Conv2dConfig {
    let pad = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(pad, pad))
        .with_bias(bias)
        .with_initializer(fan_out_init())
}

pub(crate) fn pointwise<B: Backend>(
    channels: [usize; 2],
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    conv(channels, 1, 1, bias).init(device)
}

/// Residual unit selector; indices follow the order of the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "Selector")]
pub enum ResidualKind {
    #[default]
    ConvBlock,
    Bottleneck,
    InvertedResidual,
}

impl ResidualKind {
    pub const ALL: [ResidualKind; 3] = [
        ResidualKind::ConvBlock,
        ResidualKind::Bottleneck,
        ResidualKind::InvertedResidual,
    ];

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| ConfigError::UnknownVariant {
                kind: "residual block",
                value: index.to_string(),
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResidualKind::ConvBlock => "conv_block",
            ResidualKind::Bottleneck => "bottleneck",
            ResidualKind::InvertedResidual => "inverted_residual",
        }
    }

    /// Smallest channel granularity the variant can split its output into.
    pub fn channel_multiple(&self) -> usize {
        match self {
            ResidualKind::ConvBlock | ResidualKind::Bottleneck => 4,
            ResidualKind::InvertedResidual => 1,
        }
    }

    pub fn init<B: Backend>(
        &self,
        in_channels: usize,
        out_channels: usize,
        device: &B::Device,
    ) -> Result<ResidualUnit<B>> {
        positive("in_channels", in_channels)?;
        multiple_of("out_channels", out_channels, self.channel_multiple())?;
        Ok(match self {
            ResidualKind::ConvBlock => {
                ResidualUnit::ConvBlock(ConvBlock::new(in_channels, out_channels, device))
            }
            ResidualKind::Bottleneck => {
                ResidualUnit::Bottleneck(Bottleneck::new(in_channels, out_channels, device))
            }
            ResidualKind::InvertedResidual => ResidualUnit::InvertedResidual(
                InvertedResidual::new(in_channels, out_channels, 1, device),
            ),
        })
    }
}

impl fmt::Display for ResidualKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<Selector> for ResidualKind {
    type Error = ConfigError;

    fn try_from(selector: Selector) -> Result<Self> {
        match selector {
            Selector::Index(index) => Self::from_index(index),
            Selector::Name(name) => name.parse(),
        }
    }
}

impl FromStr for ResidualKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conv_block" | "hpm_convblock" => Ok(ResidualKind::ConvBlock),
            "bottleneck" => Ok(ResidualKind::Bottleneck),
            "inverted_residual" | "invertedresidual" => Ok(ResidualKind::InvertedResidual),
            other => Err(ConfigError::UnknownVariant {
                kind: "residual block",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Module, Debug)]
pub enum ResidualUnit<B: Backend> {
    ConvBlock(ConvBlock<B>),
    Bottleneck(Bottleneck<B>),
    InvertedResidual(InvertedResidual<B>),
}

impl<B: Backend> ResidualUnit<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ResidualUnit::ConvBlock(unit) => unit.forward(x),
            ResidualUnit::Bottleneck(unit) => unit.forward(x),
            ResidualUnit::InvertedResidual(unit) => unit.forward(x),
        }
    }
}

/// BN -> ReLU -> conv, used as the projection shortcut of [`ConvBlock`].
#[derive(Module, Debug)]
pub struct PreActProjection<B: Backend> {
    bn: BatchNorm<B, 2>,
    conv: Conv2d<B>,
}

impl<B: Backend> PreActProjection<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(relu(self.bn.forward(x)))
    }
}

/// Conv -> BN, used as the projection shortcut of [`Bottleneck`].
#[derive(Module, Debug)]
pub struct Projection<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Projection<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Hourglass-style multi-scale block: three pre-activated 3x3 convs whose
/// outputs (out/2, out/4, out/4 channels) are concatenated.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    bn1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    shortcut: Option<PreActProjection<B>>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let half = out_channels / 2;
        let quarter = out_channels / 4;
        let shortcut = (in_channels != out_channels).then(|| PreActProjection {
            bn: BatchNormConfig::new(in_channels).init(device),
            conv: pointwise([in_channels, out_channels], false, device),
        });
        Self {
            bn1: BatchNormConfig::new(in_channels).init(device),
            conv1: conv([in_channels, half], 3, 1, false).init(device),
            bn2: BatchNormConfig::new(half).init(device),
            conv2: conv([half, quarter], 3, 1, false).init(device),
            bn3: BatchNormConfig::new(quarter).init(device),
            conv3: conv([quarter, quarter], 3, 1, false).init(device),
            shortcut,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out1 = self.conv1.forward(relu(self.bn1.forward(x.clone())));
        let out2 = self.conv2.forward(relu(self.bn2.forward(out1.clone())));
        let out3 = self.conv3.forward(relu(self.bn3.forward(out2.clone())));
        let out = Tensor::cat(vec![out1, out2, out3], 1);
        let residual = match &self.shortcut {
            Some(proj) => proj.forward(x),
            None => x,
        };
        out + residual
    }
}

/// ResNet bottleneck with a 4x channel squeeze in the middle.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    shortcut: Option<Projection<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let mid = out_channels / 4;
        let shortcut = (in_channels != out_channels).then(|| Projection {
            conv: pointwise([in_channels, out_channels], false, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });
        Self {
            conv1: pointwise([in_channels, mid], false, device),
            bn1: BatchNormConfig::new(mid).init(device),
            conv2: conv([mid, mid], 3, 1, false).init(device),
            bn2: BatchNormConfig::new(mid).init(device),
            conv3: pointwise([mid, out_channels], false, device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            shortcut,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = relu(self.bn1.forward(self.conv1.forward(x.clone())));
        let out = relu(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));
        let residual = match &self.shortcut {
            Some(proj) => proj.forward(x),
            None => x,
        };
        relu(out + residual)
    }
}

/// MobileNetV2-style block: expand 2x, depthwise 3x3 with squeeze-excite, project back.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    depthwise: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    se: SqueezeExcite<B>,
    project: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    identity: bool,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let hidden = in_channels * 2;
        Self {
            expand: pointwise([in_channels, hidden], false, device),
            bn1: BatchNormConfig::new(hidden).init(device),
            depthwise: conv([hidden, hidden], 3, stride, false)
                .with_groups(hidden)
                .init(device),
            bn2: BatchNormConfig::new(hidden).init(device),
            se: SqueezeExcite::new(hidden, device),
            project: pointwise([hidden, out_channels], false, device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            identity: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = relu(self.bn1.forward(self.expand.forward(x.clone())));
        let out = self.bn2.forward(self.depthwise.forward(out));
        let out = relu(self.se.forward(out));
        let out = self.bn3.forward(self.project.forward(out));
        if self.identity {
            x + out
        } else {
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn every_variant_maps_channels_and_keeps_spatial_size() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 6, 6], &device);
        for kind in ResidualKind::ALL {
            let same = kind.init::<TestBackend>(8, 8, &device).unwrap();
            assert_eq!(same.forward(x.clone()).dims(), [1, 8, 6, 6], "{kind}");
            let wider = kind.init::<TestBackend>(8, 16, &device).unwrap();
            assert_eq!(wider.forward(x.clone()).dims(), [1, 16, 6, 6], "{kind}");
        }
    }

    #[test]
    fn invalid_channels_are_configuration_errors() {
        let device = Default::default();
        assert_eq!(
            ResidualKind::ConvBlock
                .init::<TestBackend>(0, 8, &device)
                .unwrap_err(),
            ConfigError::Zero {
                field: "in_channels"
            }
        );
        assert!(matches!(
            ResidualKind::Bottleneck.init::<TestBackend>(8, 6, &device),
            Err(ConfigError::Indivisible { divisor: 4, .. })
        ));
        assert!(ResidualKind::InvertedResidual
            .init::<TestBackend>(8, 6, &device)
            .is_ok());
        assert!(matches!(
            ResidualKind::from_index(3),
            Err(ConfigError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!(
            "HPM_ConvBlock".parse::<ResidualKind>().unwrap(),
            ResidualKind::ConvBlock
        );
        assert_eq!(
            "InvertedResidual".parse::<ResidualKind>().unwrap(),
            ResidualKind::InvertedResidual
        );
        assert!("resnext".parse::<ResidualKind>().is_err());
    }
}
