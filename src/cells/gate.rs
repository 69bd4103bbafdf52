use burn::module::{Ignored, Module, Param};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;

/// What a gate does with its linear map's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Squash {
    /// Leave the output as is
    Identity,
    /// Apply an activation (tanh bounds training targets to the inner
    /// network's output range)
    Activation(Activation),
    /// Exponentiate, making the output strictly positive
    Exp,
}

/// A learned map from the block input to one control signal for the
/// inner network: `squash(x W + b)`.
#[derive(Module, Debug)]
pub struct Gate<B: Backend> {
    pub(crate) linear: Linear<B>,
    squash: Ignored<Squash>,
}

impl<B: Backend> Gate<B> {
    pub fn new(input_size: usize, output_size: usize, squash: Squash, device: &B::Device) -> Self {
        let linear = LinearConfig::new(input_size, output_size)
            .with_bias(true)
            .init(device);
        Self::from_linear(linear, squash)
    }

    pub(crate) fn from_linear(linear: Linear<B>, squash: Squash) -> Self {
        Self {
            linear,
            squash: Ignored(squash),
        }
    }

    /// Replace the bias with a constant, e.g. a log step size.
    pub fn with_bias_value(mut self, value: f64, device: &B::Device) -> Self {
        let size = self.output_size();
        self.linear.bias = Some(Param::from_tensor(Tensor::full([size], value, device)));
        self
    }

    pub fn input_size(&self) -> usize {
        self.linear.weight.dims()[0]
    }

    pub fn output_size(&self) -> usize {
        self.linear.weight.dims()[1]
    }

    pub fn squash(&self) -> Squash {
        self.squash.0
    }

    /// `[batch, input_size] -> [batch, output_size]`
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let out = self.linear.forward(input);
        match self.squash.0 {
            Squash::Identity => out,
            Squash::Activation(activation) => activation.forward(out),
            Squash::Exp => out.exp(),
        }
    }
}

impl<B: AutodiffBackend> Gate<B> {
    /// Copy whose parameters are new graph leaves with the same ids.
    pub(crate) fn fresh_leaves(&self) -> Self {
        let mut linear = self.linear.clone();
        linear.weight = fresh_leaf(&self.linear.weight);
        linear.bias = self.linear.bias.as_ref().map(fresh_leaf);
        Self::from_linear(linear, self.squash.0)
    }
}

/// Detach `param` from any graph it is part of, keeping its id.
pub(crate) fn fresh_leaf<B: AutodiffBackend, const D: usize>(
    param: &Param<Tensor<B, D>>,
) -> Param<Tensor<B, D>> {
    Param::initialized(param.id, param.val().detach().require_grad())
}
