//! Recursive encoder-decoder ("hourglass") over `depth` resolution levels.

use burn::module::Module;
use burn::nn::pool::AvgPool2dConfig;
use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Tensor;

use crate::attention::{AttentionGate, AttentionKind};
use crate::blocks::{ResidualKind, ResidualUnit};
use crate::error::{positive, ConfigError, Result};

/// Halves height and width with a 2x2 average pool.
pub fn downsample<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    AvgPool2dConfig::new([2, 2])
        .with_strides([2, 2])
        .init()
        .forward(x)
}

/// Doubles height and width with nearest-neighbour interpolation.
pub fn upsample<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    interpolate(
        x,
        [height * 2, width * 2],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

#[derive(Debug, Clone)]
pub struct HourglassConfig {
    pub depth: usize,
    pub num_features: usize,
    pub residual: ResidualKind,
    pub attention: AttentionKind,
}

impl Default for HourglassConfig {
    fn default() -> Self {
        Self {
            depth: 4,
            num_features: 128,
            residual: ResidualKind::ConvBlock,
            attention: AttentionKind::None,
        }
    }
}

impl HourglassConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Hourglass<B>> {
        positive("hourglass_depth", self.depth)?;
        let feats = positive("num_features", self.num_features)?;
        let unit = |device: &B::Device| self.residual.init::<B>(feats, feats, device);

        let mut levels = Vec::with_capacity(self.depth);
        for _ in 0..self.depth {
            levels.push(HourglassLevel {
                shortcut: unit(device)?,
                down: unit(device)?,
                up: unit(device)?,
                attention: self.attention.init(feats, device)?,
            });
        }
        Ok(Hourglass {
            levels,
            middle: unit(device)?,
        })
    }
}

/// One resolution level: an upper skip branch and the two lower-branch units
/// wrapped around the next level (or the middle unit at the bottom).
#[derive(Module, Debug)]
pub struct HourglassLevel<B: Backend> {
    shortcut: ResidualUnit<B>,
    down: ResidualUnit<B>,
    up: ResidualUnit<B>,
    attention: Option<AttentionGate<B>>,
}

#[derive(Module, Debug)]
pub struct Hourglass<B: Backend> {
    levels: Vec<HourglassLevel<B>>,
    /// Only the deepest level owns this unit.
    middle: ResidualUnit<B>,
}

impl<B: Backend> Hourglass<B> {
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Smallest side length divisor an input must satisfy.
    pub fn spatial_multiple(&self) -> usize {
        1 << self.depth()
    }

    pub fn check_input(&self, dims: [usize; 4]) -> Result<()> {
        let multiple = self.spatial_multiple();
        for (field, value) in [("input height", dims[2]), ("input width", dims[3])] {
            if value == 0 || value % multiple != 0 {
                return Err(ConfigError::Indivisible {
                    field,
                    value,
                    divisor: multiple,
                });
            }
        }
        Ok(())
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_level(x, 0)
    }

    fn forward_level(&self, x: Tensor<B, 4>, level: usize) -> Tensor<B, 4> {
        let stage = &self.levels[level];
        let residual = stage.shortcut.forward(x.clone());

        let lower = stage.down.forward(downsample(x));
        let lower = if level + 1 == self.levels.len() {
            self.middle.forward(lower)
        } else {
            self.forward_level(lower, level + 1)
        };
        let mut lower = stage.up.forward(lower);
        if let Some(gate) = &stage.attention {
            lower = gate.forward(lower);
        }

        upsample(lower) + residual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn preserves_shape_for_every_depth() {
        let device = Default::default();
        for depth in 1..=3 {
            let hg = HourglassConfig {
                depth,
                num_features: 8,
                residual: ResidualKind::ConvBlock,
                attention: AttentionKind::SqueezeExcite,
            }
            .init::<TestBackend>(&device)
            .unwrap();
            assert_eq!(hg.depth(), depth);
            let x = Tensor::<TestBackend, 4>::random([2, 8, 16, 16], Distribution::Default, &device);
            assert_eq!(hg.forward(x).dims(), [2, 8, 16, 16], "depth {depth}");
        }
    }

    #[test]
    fn single_level_matches_manual_composition() {
        let device = Default::default();
        let hg = HourglassConfig {
            depth: 1,
            num_features: 4,
            residual: ResidualKind::ConvBlock,
            attention: AttentionKind::None,
        }
        .init::<TestBackend>(&device)
        .unwrap();
        let x = Tensor::<TestBackend, 4>::random([1, 4, 8, 8], Distribution::Default, &device);

        let level = &hg.levels[0];
        let lower = level.down.forward(downsample(x.clone()));
        let lower = level.up.forward(hg.middle.forward(lower));
        let expected = upsample(lower) + level.shortcut.forward(x.clone());

        let out = hg.forward(x);
        assert_eq!(out.dims(), [1, 4, 8, 8]);
        out.into_data().assert_approx_eq(&expected.into_data(), 5);
    }

    #[test]
    fn rejects_zero_depth_and_odd_inputs() {
        let device = Default::default();
        let err = HourglassConfig {
            depth: 0,
            ..Default::default()
        }
        .init::<TestBackend>(&device)
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Zero {
                field: "hourglass_depth"
            }
        );

        let hg = HourglassConfig {
            depth: 2,
            num_features: 4,
            ..Default::default()
        }
        .init::<TestBackend>(&device)
        .unwrap();
        assert!(hg.check_input([1, 4, 8, 8]).is_ok());
        assert!(hg.check_input([1, 4, 6, 8]).is_err());
    }

    #[test]
    fn resampling_round_trips_constant_maps() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 2, 4, 4], &device);
        let down = downsample(x.clone());
        assert_eq!(down.dims(), [1, 2, 2, 2]);
        let up = upsample(down);
        up.into_data().assert_approx_eq(&x.into_data(), 6);
    }
}
