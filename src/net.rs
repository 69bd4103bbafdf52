//! Dynamic feed-forward networks whose parameters are ordinary tensors.
//!
//! A [`Net`] does not own its weights the way a [`burn::module::Module`] does.
//! Its weights are whatever tensors it was built from, typically the output of
//! a previous gradient-descent step, so the network can be trained inside a
//! forward pass and still be differentiated by the outer autodiff backend.
//!
//! A single `Net` value can hold several independent networks ("lanes") with
//! identical layouts. Lanes are evaluated together through batched matrix
//! multiplies but never interact: every result for lane `i` depends only on
//! lane `i`'s parameters and lane `i`'s slice of the inputs.
//!
//! ## Layouts
//!
//! | Tensor | Shape | Layout |
//! |--------|-------|--------|
//! | flat weight (per lane) | `[out * in]` | row-major `out x in` |
//! | flat bias (per lane) | `[out]` | |
//! | input batch | `[num * batch * in]` | lane-major, then sample-major |
//! | target batch | `[num * batch * out]` | lane-major, then sample-major |
//! | step sizes | `[num]` | one per lane |

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::trace;

use crate::activation::Activation;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Layer<B: Backend> {
    /// `[num, out, in]`
    weight: Tensor<B, 3>,
    /// `[num, 1, out]`
    bias: Tensor<B, 3>,
}

impl<B: Backend> Layer<B> {
    fn affine(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        input.matmul(self.weight.clone().swap_dims(1, 2)) + self.bias.clone()
    }

    fn in_size(&self) -> usize {
        self.weight.dims()[2]
    }

    fn out_size(&self) -> usize {
        self.weight.dims()[1]
    }
}

/// A (batch of) multi-layer perceptron(s) with tensor-valued parameters.
///
/// Every layer is followed by the network's [`Activation`] (tanh by default).
/// The final layer can be made linear with [`Net::with_linear_output`].
#[derive(Debug, Clone)]
pub struct Net<B: Backend> {
    layers: Vec<Layer<B>>,
    num: usize,
    activation: Activation,
    linear_output: bool,
}

impl<B: Backend> Net<B> {
    /// Build a single network from a flat parameter list.
    ///
    /// Even indices are row-major weight matrices, odd indices are bias
    /// vectors. The input size of each layer is inferred from
    /// `weight.len() / bias.len()`.
    pub fn from_params(params: Vec<Tensor<B, 1>>) -> Result<Self> {
        Self::from_lanes(vec![params])
    }

    /// Build a batched network holding one independent network per lane.
    ///
    /// All lanes must share the layout of lane 0.
    pub fn from_lanes(lanes: Vec<Vec<Tensor<B, 1>>>) -> Result<Self> {
        let num = lanes.len();
        let first = lanes.first().ok_or(Error::EmptyNetwork)?;
        let shapes = layer_shapes(first)?;
        let lengths: Vec<usize> = first.iter().map(|p| p.dims()[0]).collect();

        let mut columns: Vec<Vec<Tensor<B, 3>>> = vec![Vec::with_capacity(num); lengths.len()];
        for (lane, params) in lanes.into_iter().enumerate() {
            if params.len() != lengths.len() {
                return Err(Error::LaneMismatch { lane });
            }
            for (index, param) in params.into_iter().enumerate() {
                if param.dims()[0] != lengths[index] {
                    return Err(Error::LaneMismatch { lane });
                }
                let (in_size, out_size) = shapes[index / 2];
                let shaped = if index % 2 == 0 {
                    param.reshape([1, out_size, in_size])
                } else {
                    param.reshape([1, 1, out_size])
                };
                columns[index].push(shaped);
            }
        }

        let mut columns = columns.into_iter();
        let mut layers = Vec::with_capacity(shapes.len());
        while let (Some(weights), Some(biases)) = (columns.next(), columns.next()) {
            layers.push(Layer {
                weight: Tensor::cat(weights, 0),
                bias: Tensor::cat(biases, 0),
            });
        }

        Ok(Self {
            layers,
            num,
            activation: Activation::Tanh,
            linear_output: false,
        })
    }

    /// Set the activation used after each layer
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Skip the activation after the final layer
    pub fn with_linear_output(mut self, linear_output: bool) -> Self {
        self.linear_output = linear_output;
        self
    }

    /// Number of independent networks held by this value
    pub fn num(&self) -> usize {
        self.num
    }

    /// Number of layers in each network
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Input size of each network, taken from the first layer
    pub fn in_size(&self) -> usize {
        self.layers[0].in_size()
    }

    /// Output size of each network, taken from the last layer
    pub fn out_size(&self) -> usize {
        self.layers[self.layers.len() - 1].out_size()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Flat parameter lengths in layer order: `[w0, b0, w1, b1, ...]`
    pub fn param_sizes(&self) -> Vec<usize> {
        self.layers
            .iter()
            .flat_map(|l| [l.in_size() * l.out_size(), l.out_size()])
            .collect()
    }

    /// Apply the network(s) to a flat input batch.
    ///
    /// `input` holds `num * batch_size * in_size` values; the result holds
    /// `num * batch_size * out_size` values in the same lane-major order.
    pub fn apply(&self, input: Tensor<B, 1>, batch_size: usize) -> Result<Tensor<B, 1>> {
        let mut x = self.batch(input, batch_size, self.in_size(), "network input")?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = self.activate(i == last, layer.affine(x));
        }
        Ok(flatten(x))
    }

    /// Take one step of gradient descent on the mean squared error between the
    /// network's output for `input` and `target`.
    ///
    /// Each lane is updated as `param + step_size[lane] * grad`, where `grad` is
    /// the negative loss gradient, and the updated network is returned. The
    /// update is written entirely in tensor operations, so the outer backend
    /// can differentiate the new parameters with respect to the old ones and
    /// with respect to `input`, `target` and `step_size`.
    pub fn step(
        &self,
        input: Tensor<B, 1>,
        target: Tensor<B, 1>,
        step_size: Tensor<B, 1>,
        batch_size: usize,
    ) -> Result<Self> {
        let example = self.example(input, target, step_size, batch_size)?;
        Ok(self.descend(&example))
    }

    /// Run [`Net::step`] `num_steps` times on the same example.
    ///
    /// `num_steps == 0` returns the network unchanged.
    pub fn train(
        &self,
        input: Tensor<B, 1>,
        target: Tensor<B, 1>,
        step_size: Tensor<B, 1>,
        batch_size: usize,
        num_steps: usize,
    ) -> Result<Self> {
        let example = self.example(input, target, step_size, batch_size)?;
        trace!(
            lanes = self.num,
            batch_size,
            num_steps,
            "training dynamic network"
        );
        let mut net = self.clone();
        for _ in 0..num_steps {
            net = net.descend(&example);
        }
        Ok(net)
    }

    /// Split the network back into per-lane flat parameter lists.
    pub fn into_lanes(self) -> Vec<Vec<Tensor<B, 1>>> {
        let mut lanes: Vec<Vec<Tensor<B, 1>>> =
            vec![Vec::with_capacity(self.layers.len() * 2); self.num];
        for layer in self.layers {
            let weight_len = layer.in_size() * layer.out_size();
            let bias_len = layer.out_size();
            let weights = layer.weight.chunk(self.num, 0);
            let biases = layer.bias.chunk(self.num, 0);
            for ((lane, weight), bias) in lanes.iter_mut().zip(weights).zip(biases) {
                lane.push(weight.reshape([weight_len]));
                lane.push(bias.reshape([bias_len]));
            }
        }
        lanes
    }

    /// Flat parameters of one lane, or `None` if the net has no such lane.
    pub fn lane_params(&self, lane: usize) -> Option<Vec<Tensor<B, 1>>> {
        if lane >= self.num {
            return None;
        }
        let params = self
            .layers
            .iter()
            .flat_map(|layer| {
                let weight_len = layer.in_size() * layer.out_size();
                let bias_len = layer.out_size();
                [
                    layer.weight.clone().narrow(0, lane, 1).reshape([weight_len]),
                    layer.bias.clone().narrow(0, lane, 1).reshape([bias_len]),
                ]
            })
            .collect();
        Some(params)
    }

    fn activate(&self, last: bool, x: Tensor<B, 3>) -> Tensor<B, 3> {
        if last && self.linear_output {
            x
        } else {
            self.activation.forward(x)
        }
    }

    fn derive(&self, last: bool, out: Tensor<B, 3>, upstream: Tensor<B, 3>) -> Tensor<B, 3> {
        if last && self.linear_output {
            upstream
        } else {
            self.activation.backward(out, upstream)
        }
    }

    fn batch(
        &self,
        flat: Tensor<B, 1>,
        batch_size: usize,
        size: usize,
        what: &'static str,
    ) -> Result<Tensor<B, 3>> {
        if batch_size == 0 {
            return Err(Error::InvalidBatchSize);
        }
        let expected = self.num * batch_size * size;
        let actual = flat.dims()[0];
        if actual != expected {
            return Err(Error::ShapeMismatch {
                what,
                expected,
                actual,
            });
        }
        Ok(flat.reshape([self.num, batch_size, size]))
    }

    fn example(
        &self,
        input: Tensor<B, 1>,
        target: Tensor<B, 1>,
        step_size: Tensor<B, 1>,
        batch_size: usize,
    ) -> Result<Example<B>> {
        let input = self.batch(input, batch_size, self.in_size(), "training input")?;
        let target = self.batch(target, batch_size, self.out_size(), "training target")?;
        let lanes = step_size.dims()[0];
        if lanes != self.num {
            return Err(Error::ShapeMismatch {
                what: "step size",
                expected: self.num,
                actual: lanes,
            });
        }
        Ok(Example {
            input,
            target,
            step_size: step_size.reshape([self.num, 1, 1]),
        })
    }

    /// One descent step: forward pass keeping every layer's input and output,
    /// then the closed-form MSE gradient pushed back layer by layer.
    fn descend(&self, example: &Example<B>) -> Self {
        let last = self.layers.len() - 1;
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut outputs = Vec::with_capacity(self.layers.len());
        let mut x = example.input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            inputs.push(x.clone());
            x = self.activate(i == last, layer.affine(x));
            outputs.push(x.clone());
        }

        // d(-mse)/d(out), averaged per lane over batch and output units.
        let [_, batch_size, out_size] = example.target.dims();
        let scale = 2.0 / (batch_size * out_size) as f64;
        let mut upstream = (example.target.clone() - x).mul_scalar(scale);

        let mut layers = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let product_grad = self.derive(i == last, outputs[i].clone(), upstream);
            let weight_grad = product_grad
                .clone()
                .swap_dims(1, 2)
                .matmul(inputs[i].clone());
            let bias_grad = product_grad.clone().sum_dim(1);
            upstream = product_grad.matmul(layer.weight.clone());

            layers.push(Layer {
                weight: layer.weight.clone() + weight_grad * example.step_size.clone(),
                bias: layer.bias.clone() + bias_grad * example.step_size.clone(),
            });
        }
        layers.reverse();

        Self {
            layers,
            num: self.num,
            activation: self.activation,
            linear_output: self.linear_output,
        }
    }
}

/// A training example reshaped for the batched layout.
struct Example<B: Backend> {
    /// `[num, batch, in]`
    input: Tensor<B, 3>,
    /// `[num, batch, out]`
    target: Tensor<B, 3>,
    /// `[num, 1, 1]`
    step_size: Tensor<B, 3>,
}

/// Infer `(in, out)` for every layer of a flat parameter list.
fn layer_shapes<B: Backend>(params: &[Tensor<B, 1>]) -> Result<Vec<(usize, usize)>> {
    if params.is_empty() {
        return Err(Error::EmptyNetwork);
    }
    if params.len() % 2 != 0 {
        return Err(Error::UnpairedParameters(params.len()));
    }
    let mut shapes = Vec::with_capacity(params.len() / 2);
    for (layer, pair) in params.chunks(2).enumerate() {
        let weight_len = pair[0].dims()[0];
        let out_size = pair[1].dims()[0];
        if out_size == 0 || weight_len == 0 || weight_len % out_size != 0 {
            return Err(Error::NotMultiple {
                what: "layer weights",
                unit: out_size,
                actual: weight_len,
            });
        }
        let in_size = weight_len / out_size;
        if let Some(&(_, prev_out)) = shapes.last() {
            if prev_out != in_size {
                return Err(Error::LayerMismatch {
                    layer,
                    expected: in_size,
                    actual: prev_out,
                });
            }
        }
        shapes.push((in_size, out_size));
    }
    Ok(shapes)
}

fn flatten<B: Backend>(x: Tensor<B, 3>) -> Tensor<B, 1> {
    let len = x.dims().iter().product::<usize>();
    x.reshape([len])
}
