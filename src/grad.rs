//! Gradient accumulation keyed by parameter identity.

use burn::module::ParamId;
use burn::optim::GradientsParams;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Sums gradients for module parameters across any number of backward passes.
///
/// Entries are keyed by [`ParamId`], so gradients for the same parameter coming
/// from different timesteps (or from different lanes seeded by the same start
/// value) add up in one slot. The finished map can be handed to any burn
/// optimizer with [`GradAccumulator::into_params`].
#[derive(Debug, Default)]
pub struct GradAccumulator {
    grads: GradientsParams,
}

impl GradAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` into the slot for `id`, creating the slot if needed.
    pub fn add<B: Backend, const D: usize>(&mut self, id: ParamId, grad: Tensor<B, D>) {
        let total = match self.grads.remove::<B, D>(id) {
            Some(current) => current + grad,
            None => grad,
        };
        self.grads.register(id, total);
    }

    /// Current total for `id`, if anything was accumulated.
    pub fn get<B: Backend, const D: usize>(&self, id: ParamId) -> Option<Tensor<B, D>> {
        self.grads.get::<B, D>(id)
    }

    /// Number of parameters holding a gradient
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand the accumulated gradients to an optimizer.
    pub fn into_params(self) -> GradientsParams {
        self.grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_add_sums_into_same_slot() {
        let device = Default::default();
        let id = ParamId::new();
        let mut acc = GradAccumulator::new();
        assert!(acc.is_empty());

        acc.add(id, Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device));
        acc.add(id, Tensor::<TestBackend, 1>::from_floats([0.5, -1.0], &device));

        let total = acc.get::<TestBackend, 1>(id).unwrap();
        assert_eq!(total.into_data().to_vec::<f32>().unwrap(), vec![1.5, 1.0]);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_separate_ids_stay_separate() {
        let device = Default::default();
        let (a, b) = (ParamId::new(), ParamId::new());
        let mut acc = GradAccumulator::new();

        acc.add(a, Tensor::<TestBackend, 2>::ones([2, 2], &device));
        acc.add(b, Tensor::<TestBackend, 1>::zeros([3], &device));

        assert_eq!(acc.len(), 2);
        assert_eq!(acc.get::<TestBackend, 2>(a).unwrap().dims(), [2, 2]);
        assert_eq!(acc.get::<TestBackend, 1>(b).unwrap().dims(), [3]);
        assert!(acc.get::<TestBackend, 1>(ParamId::new()).is_none());
    }

    #[test]
    fn test_len_follows_optimizer_params() {
        let device = Default::default();
        let id = ParamId::new();
        let mut acc = GradAccumulator::new();
        for _ in 0..3 {
            acc.add(id, Tensor::<TestBackend, 1>::ones([2], &device));
        }
        acc.add(ParamId::new(), Tensor::<TestBackend, 1>::ones([4], &device));

        assert_eq!(acc.len(), 2);
        assert_eq!(acc.into_params().len(), 2);
    }
}
