//! Burn modules for facial landmark heatmap regression.
//!
//! - [`ResidualUnit`]: the closed family of residual blocks (conv block, bottleneck,
//!   inverted residual), picked with [`ResidualKind`].
//! - [`AttentionGate`]: optional squeeze-excite or coordinate attention, picked with
//!   [`AttentionKind`].
//!   Both selectors deserialize from a variant index or name ([`Selector`]).
//! - [`Hourglass`]: recursive multi-resolution encoder-decoder.
//! - [`FaceAlignmentNet`]: stem plus stacked hourglasses, one heatmap per stage.
//!
//! These are pure Burn modules; training, data and checkpoint files live in the
//! `training` crate.

pub mod attention;
pub mod blocks;
pub mod error;
pub mod fan;
pub mod hourglass;
pub mod selector;

pub use attention::{AttentionGate, AttentionKind, CoordAttention, SqueezeExcite};
pub use blocks::{Bottleneck, ConvBlock, InvertedResidual, ResidualKind, ResidualUnit};
pub use error::{ConfigError, Result};
pub use fan::{FaceAlignmentNet, FanConfig, Stage, Stem, INPUT_CHANNELS, STEM_STRIDE};
pub use hourglass::{downsample, upsample, Hourglass, HourglassConfig, HourglassLevel};
pub use selector::Selector;

pub mod prelude {
    pub use super::{
        AttentionKind, ConfigError, FaceAlignmentNet, FanConfig, Hourglass, HourglassConfig,
        ResidualKind, ResidualUnit,
    };
}
