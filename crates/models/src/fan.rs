//! Stacked hourglass network with intermediate supervision.
//!
//! A fixed stem brings a 3-channel image to `num_features` channels at a quarter of
//! its resolution. Each following stage runs one [`Hourglass`], emits a heatmap with
//! one channel per landmark, and (except the last) feeds
//! `remap(heatmap) + stage_input + project(features)` into the next stage.

use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::pool::MaxPool2dConfig;
use burn::nn::{BatchNorm, BatchNormConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::attention::AttentionKind;
use crate::blocks::{conv, pointwise, ResidualKind, ResidualUnit};
use crate::error::{multiple_of, positive, ConfigError, Result};
use crate::hourglass::{Hourglass, HourglassConfig};

/// Channels of the RGB input expected by the stem.
pub const INPUT_CHANNELS: usize = 3;
/// Spatial reduction applied by the stem (stride-2 conv + 2x2 max pool).
pub const STEM_STRIDE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanConfig {
    pub num_stacks: usize,
    pub hourglass_depth: usize,
    pub num_features: usize,
    pub num_classes: usize,
    pub residual: ResidualKind,
    pub attention: AttentionKind,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            num_stacks: 2,
            hourglass_depth: 4,
            num_features: 128,
            num_classes: 68,
            residual: ResidualKind::ConvBlock,
            attention: AttentionKind::SqueezeExcite,
        }
    }
}

impl FanConfig {
    pub fn validate(&self) -> Result<()> {
        positive("num_stacks", self.num_stacks)?;
        positive("hourglass_depth", self.hourglass_depth)?;
        positive("num_classes", self.num_classes)?;
        // The stem splits features into quarters, and conv blocks split those again.
        multiple_of("num_features", self.num_features, 8)?;
        Ok(())
    }

    /// Input side lengths must be a multiple of this value.
    pub fn spatial_multiple(&self) -> usize {
        STEM_STRIDE << self.hourglass_depth
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FaceAlignmentNet<B>> {
        self.validate()?;
        let feats = self.num_features;
        let classes = self.num_classes;
        let kind = self.residual;

        let stem = Stem {
            conv: conv([INPUT_CHANNELS, feats / 4], 7, 2, true).init(device),
            bn: BatchNormConfig::new(feats / 4).init(device),
            unit1: kind.init(feats / 4, feats / 2, device)?,
            unit2: kind.init(feats / 2, feats / 2, device)?,
            unit3: kind.init(feats / 2, feats, device)?,
        };

        let hourglass = HourglassConfig {
            depth: self.hourglass_depth,
            num_features: feats,
            residual: kind,
            attention: self.attention,
        };
        let mut stages = Vec::with_capacity(self.num_stacks);
        for idx in 0..self.num_stacks {
            let last = idx + 1 == self.num_stacks;
            stages.push(Stage {
                hourglass: hourglass.init(device)?,
                post: kind.init(feats, feats, device)?,
                post_proj: pointwise([feats, feats], true, device),
                bn: BatchNormConfig::new(feats).init(device),
                head: pointwise([feats, classes], true, device),
                remap: (!last).then(|| Reinjection {
                    features: pointwise([feats, feats], true, device),
                    heatmap: pointwise([classes, feats], true, device),
                }),
            });
        }

        Ok(FaceAlignmentNet {
            stem,
            stages,
            num_classes: classes,
            spatial_multiple: self.spatial_multiple(),
        })
    }
}

#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    unit1: ResidualUnit<B>,
    unit2: ResidualUnit<B>,
    unit3: ResidualUnit<B>,
}

impl<B: Backend> Stem<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn.forward(self.conv.forward(images)));
        let x = self.unit1.forward(x);
        let x = MaxPool2dConfig::new([2, 2])
            .with_strides([2, 2])
            .init()
            .forward(x);
        let x = self.unit2.forward(x);
        self.unit3.forward(x)
    }
}

/// 1x1 projections that carry a stage's output back into the feature stream.
#[derive(Module, Debug)]
pub struct Reinjection<B: Backend> {
    features: Conv2d<B>,
    heatmap: Conv2d<B>,
}

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    hourglass: Hourglass<B>,
    post: ResidualUnit<B>,
    post_proj: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    head: Conv2d<B>,
    remap: Option<Reinjection<B>>,
}

impl<B: Backend> Stage<B> {
    /// Refined features and the stage heatmap.
    fn refine(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let x = self.hourglass.forward(x);
        let x = self.post.forward(x);
        let x = relu(self.bn.forward(self.post_proj.forward(x)));
        let heatmap = self.head.forward(x.clone());
        (x, heatmap)
    }

    /// Returns the heatmap and, for every stage but the last, the next stage's input.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Option<Tensor<B, 4>>) {
        match &self.remap {
            Some(remap) => {
                let (features, heatmap) = self.refine(x.clone());
                let next =
                    remap.heatmap.forward(heatmap.clone()) + x + remap.features.forward(features);
                (heatmap, Some(next))
            }
            None => {
                let (_, heatmap) = self.refine(x);
                (heatmap, None)
            }
        }
    }
}

#[derive(Module, Debug)]
pub struct FaceAlignmentNet<B: Backend> {
    stem: Stem<B>,
    stages: Vec<Stage<B>>,
    num_classes: usize,
    spatial_multiple: usize,
}

impl<B: Backend> FaceAlignmentNet<B> {
    pub fn num_stacks(&self) -> usize {
        self.stages.len()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Rejects image batches the stem and hourglasses cannot resample symmetrically.
    pub fn check_input(&self, dims: [usize; 4]) -> Result<()> {
        if dims[1] != INPUT_CHANNELS {
            return Err(ConfigError::UnknownVariant {
                kind: "input channel count",
                value: dims[1].to_string(),
            });
        }
        for (field, value) in [("image height", dims[2]), ("image width", dims[3])] {
            if value == 0 || value % self.spatial_multiple != 0 {
                return Err(ConfigError::Indivisible {
                    field,
                    value,
                    divisor: self.spatial_multiple,
                });
            }
        }
        Ok(())
    }

    /// One heatmap per stage, in stage order. The last one is the prediction.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = self.stem.forward(images);
        let mut heatmaps = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let (heatmap, next) = stage.forward(x);
            heatmaps.push(heatmap);
            match next {
                Some(next) => x = next,
                None => break,
            }
        }
        heatmaps
    }

    /// Heatmap of the final stage.
    pub fn predict(&self, images: Tensor<B, 4>) -> Option<Tensor<B, 4>> {
        self.forward(images).pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn small_config(num_stacks: usize) -> FanConfig {
        FanConfig {
            num_stacks,
            hourglass_depth: 2,
            num_features: 16,
            num_classes: 5,
            ..Default::default()
        }
    }

    #[test]
    fn second_stage_receives_reinjected_sum() {
        let device = Default::default();
        TestBackend::seed(7);
        let net = small_config(2).init::<TestBackend>(&device).unwrap();
        let images = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);

        let x0 = net.stem.forward(images);
        let first = &net.stages[0];
        let (features, heatmap) = first.refine(x0.clone());
        let remap = first.remap.as_ref().unwrap();
        let expected =
            remap.features.forward(features) + x0.clone() + remap.heatmap.forward(heatmap.clone());

        let (stage_heatmap, next) = first.forward(x0);
        stage_heatmap
            .into_data()
            .assert_approx_eq(&heatmap.into_data(), 5);
        next.unwrap()
            .into_data()
            .assert_approx_eq(&expected.into_data(), 4);
        assert!(net.stages[1].remap.is_none());
    }

    #[test]
    fn config_validation() {
        assert!(FanConfig::default().validate().is_ok());
        assert_eq!(
            FanConfig {
                num_stacks: 0,
                ..Default::default()
            }
            .validate()
            .unwrap_err(),
            ConfigError::Zero {
                field: "num_stacks"
            }
        );
        assert!(matches!(
            FanConfig {
                num_features: 12,
                ..Default::default()
            }
            .validate(),
            Err(ConfigError::Indivisible { divisor: 8, .. })
        ));
        assert_eq!(small_config(1).spatial_multiple(), 16);
    }

    #[test]
    fn input_checks() {
        let device = Default::default();
        let net = small_config(1).init::<TestBackend>(&device).unwrap();
        assert!(net.check_input([2, 3, 32, 48]).is_ok());
        assert!(net.check_input([2, 1, 32, 32]).is_err());
        assert!(net.check_input([2, 3, 24, 32]).is_err());
    }
}
