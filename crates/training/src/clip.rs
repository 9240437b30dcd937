//! Global L2-norm gradient clipping over every float parameter of a module.

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use std::marker::PhantomData;

pub const MAX_GRAD_NORM: f32 = 5.0;
const NORM_EPS: f32 = 1e-6;

/// Sums squared gradients on the device; the host reads the total once.
struct SquaredNorm<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    total: Option<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let sq = grad.powf_scalar(2.0).sum();
            self.total = Some(match self.total.take() {
                Some(total) => total + sq,
                None => sq,
            });
        }
    }
}

struct Rescale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    scale: f32,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Rescale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

/// Total gradient norm of `module`'s parameters.
pub fn grad_norm<B, M>(module: &M, grads: &GradientsParams) -> f32
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorm::<B> { grads, total: None };
    module.visit(&mut visitor);
    visitor
        .total
        .map_or(0.0, |total| total.sqrt().into_scalar().elem::<f32>())
}

/// Scales all gradients by `max_norm / (norm + 1e-6)` when their joint norm exceeds
/// `max_norm`. Returns the norm measured before clipping.
pub fn clip_grad_norm<B, M>(module: &M, grads: &mut GradientsParams, max_norm: f32) -> f32
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = grad_norm::<B, M>(module, grads);
    let scale = max_norm / (norm + NORM_EPS);
    if scale < 1.0 {
        let mut visitor = Rescale::<B> {
            grads,
            scale,
            _backend: PhantomData,
        };
        module.visit(&mut visitor);
    }
    norm
}
