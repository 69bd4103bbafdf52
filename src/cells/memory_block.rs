//! SGD-trained memory block.
//!
//! The block's recurrent state is the parameter set of a small tanh MLP, one
//! per lane. At every timestep four gates read the block input and produce:
//!
//! ```text
//! train_in  = x W_i + b_i                      [train_batch * layer_0]
//! target    = tanh(x W_t + b_t)                [train_batch * layer_last]
//! step      = exp(x W_s + b_s)                 [1]
//! query     = x W_q + b_q                      [query_batch * layer_0]
//! ```
//!
//! The lane's network is trained on `(train_in, target)` for `steps` rounds of
//! gradient descent with step size `step`, then queried with `query`. The
//! query result is the block output and the trained parameters are the next
//! state. Training is differentiable, so the gates learn what to store.

use burn::config::Config;
use burn::module::{Module, Param};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, Tensor};
use tracing::{debug, trace};

use super::gate::{fresh_leaf, Gate, Squash};
use super::state::MemoryState;
use crate::activation::Activation;
use crate::error::{self, Error};
use crate::grad::GradAccumulator;
use crate::net::Net;
use crate::rnn::{BlockState, PresentMap, RecurrentBlock, StepOutput};

/// Configuration for a [`MemoryBlock`].
///
/// The block output size is `query_batch * layer_sizes.last()`.
#[derive(Config, Debug)]
pub struct MemoryBlockConfig {
    /// Size of the block input
    pub input_size: usize,
    /// Layer sizes of the inner network, input first, output last
    pub layer_sizes: Vec<usize>,
    /// Training samples produced per timestep
    #[config(default = 1)]
    pub train_batch: usize,
    /// Query samples produced per timestep
    #[config(default = 1)]
    pub query_batch: usize,
    /// Gradient-descent steps per timestep
    #[config(default = 1)]
    pub steps: usize,
    /// Approximate initial step size of the inner training
    #[config(default = 0.1)]
    pub learning_rate: f64,
}

impl MemoryBlockConfig {
    /// Initialize a new memory block.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<MemoryBlock<B>> {
        self.validate()?;
        let first = self.layer_sizes[0];
        let last = self.layer_sizes[self.layer_sizes.len() - 1];

        let mut init_params = Vec::with_capacity(2 * (self.layer_sizes.len() - 1));
        for pair in self.layer_sizes.windows(2) {
            let (in_size, out_size) = (pair[0], pair[1]);
            let std = 1.0 / (in_size as f64).sqrt();
            init_params.push(Param::from_tensor(Tensor::random(
                [out_size * in_size],
                Distribution::Normal(0.0, std),
                device,
            )));
            init_params.push(Param::from_tensor(Tensor::zeros([out_size], device)));
        }

        debug!(
            input_size = self.input_size,
            layer_sizes = ?self.layer_sizes,
            steps = self.steps,
            "initialized memory block"
        );

        Ok(MemoryBlock {
            init_params,
            train_input: Gate::new(
                self.input_size,
                self.train_batch * first,
                Squash::Identity,
                device,
            ),
            train_target: Gate::new(
                self.input_size,
                self.train_batch * last,
                Squash::Activation(Activation::Tanh),
                device,
            ),
            step_size: Gate::new(self.input_size, 1, Squash::Exp, device)
                .with_bias_value(self.learning_rate.ln(), device),
            query: Gate::new(
                self.input_size,
                self.query_batch * first,
                Squash::Identity,
                device,
            ),
            steps: self.steps,
        })
    }

    fn validate(&self) -> error::Result<()> {
        if self.layer_sizes.len() < 2 {
            return Err(Error::InvalidConfig(format!(
                "need at least two layer sizes, got {}",
                self.layer_sizes.len()
            )));
        }
        if self.input_size == 0 || self.layer_sizes.contains(&0) {
            return Err(Error::InvalidConfig("sizes must be positive".to_string()));
        }
        if self.train_batch == 0 || self.query_batch == 0 {
            return Err(Error::InvalidConfig("invalid batch size".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// A recurrent block whose memory is a neural network trained by SGD.
///
/// Field order matches the saved layout, see [`crate::serialize`].
#[derive(Module, Debug)]
pub struct MemoryBlock<B: Backend> {
    /// Inner network parameters every lane starts from, `[w0, b0, w1, b1, ...]`
    pub(crate) init_params: Vec<Param<Tensor<B, 1>>>,
    pub(crate) train_input: Gate<B>,
    pub(crate) train_target: Gate<B>,
    pub(crate) step_size: Gate<B>,
    pub(crate) query: Gate<B>,
    pub(crate) steps: usize,
}

impl<B: Backend> MemoryBlock<B> {
    /// Registry key for saved blocks
    pub const KIND: &'static str = "sgdstore::MemoryBlock";

    pub fn input_size(&self) -> usize {
        self.train_input.input_size()
    }

    /// Number of values per lane in the block output
    pub fn output_size(&self) -> usize {
        let layers = self.layer_sizes();
        let first = layers[0];
        let last = layers[layers.len() - 1];
        self.query.output_size() / first * last
    }

    /// Layer sizes of the inner network, input first
    pub fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(self.init_params.len() / 2 + 1);
        for pair in self.init_params.chunks(2) {
            let weight_len = pair[0].dims()[0];
            let out_size = pair[1].dims()[0];
            if sizes.is_empty() {
                sizes.push(weight_len / out_size);
            }
            sizes.push(out_size);
        }
        sizes
    }

    /// Flat lengths of the inner network parameters
    pub fn param_sizes(&self) -> Vec<usize> {
        self.init_params.iter().map(|p| p.dims()[0]).collect()
    }

    /// Gradient-descent steps per timestep
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn gates(&self) -> [&Gate<B>; 4] {
        [
            &self.train_input,
            &self.train_target,
            &self.step_size,
            &self.query,
        ]
    }

    /// Start state: `width` lanes, each seeded with the initial parameters.
    pub fn start_state(&self, width: usize) -> MemoryState<B> {
        let params: Vec<Tensor<B, 1>> = self.init_params.iter().map(|p| p.val()).collect();
        let device = params[0].device();
        MemoryState::seeded(&params, width, &device)
    }

    /// Evaluate one timestep without recording anything for back-propagation.
    ///
    /// `input` is packed: one row per present lane of `state`.
    pub fn evaluate(
        &self,
        state: &MemoryState<B>,
        input: Tensor<B, 2>,
    ) -> error::Result<(Tensor<B, 2>, MemoryState<B>)> {
        self.run(state.packed(), &state.present(), input, state.device())
    }

    fn run(
        &self,
        lanes: Vec<Vec<Tensor<B, 1>>>,
        present: &PresentMap,
        input: Tensor<B, 2>,
        device: &B::Device,
    ) -> error::Result<(Tensor<B, 2>, MemoryState<B>)> {
        let n = present.num_present();
        if n == 0 {
            return Err(Error::NoPresentLanes);
        }
        let [rows, features] = input.dims();
        if rows != n {
            return Err(Error::ShapeMismatch {
                what: "packed input rows",
                expected: n,
                actual: rows,
            });
        }
        if features != self.input_size() {
            return Err(Error::ShapeMismatch {
                what: "block input",
                expected: self.input_size(),
                actual: features,
            });
        }

        let net = Net::from_lanes(lanes)?;
        let (in_size, out_size) = (net.in_size(), net.out_size());

        let train_input = self.train_input.forward(input.clone());
        let train_target = self.train_target.forward(input.clone());
        let step_size = self.step_size.forward(input.clone());
        let query = self.query.forward(input);

        let train_batch = per_lane_batch(&train_input, in_size, "train input gate")?;
        expect_width(&train_target, train_batch * out_size, "train target gate")?;
        expect_width(&step_size, 1, "step size gate")?;
        let query_batch = per_lane_batch(&query, in_size, "query gate")?;

        trace!(lanes = n, train_batch, query_batch, "memory block step");
        let trained = net.train(
            flatten(train_input),
            flatten(train_target),
            flatten(step_size),
            train_batch,
            self.steps,
        )?;
        let output = trained
            .apply(flatten(query), query_batch)?
            .reshape([n, query_batch * out_size]);
        let state =
            MemoryState::from_packed(trained.into_lanes(), present, self.param_sizes(), device)?;
        Ok((output, state))
    }
}

impl<B: AutodiffBackend> MemoryBlock<B> {
    /// Copy of the block whose parameters are new leaves with the same ids.
    ///
    /// Unrolled steps stay alive together and each runs its own backward
    /// pass, so they must not share leaves.
    fn fresh_leaves(&self) -> Self {
        Self {
            init_params: self.init_params.iter().map(fresh_leaf).collect(),
            train_input: self.train_input.fresh_leaves(),
            train_target: self.train_target.fresh_leaves(),
            step_size: self.step_size.fresh_leaves(),
            query: self.query.fresh_leaves(),
            steps: self.steps,
        }
    }

    /// Move the gradients of the gate parameters out of `gradients`.
    fn collect_grads(&self, gradients: &mut B::Gradients, grads: &mut GradAccumulator) {
        for gate in self.gates() {
            let weight = &gate.linear.weight;
            if let Some(grad) = weight.val().grad_remove(gradients) {
                grads.add(weight.id, grad);
            }
            if let Some(bias) = &gate.linear.bias {
                if let Some(grad) = bias.val().grad_remove(gradients) {
                    grads.add(bias.id, grad);
                }
            }
        }
    }
}

impl<B: AutodiffBackend> RecurrentBlock<B> for MemoryBlock<B> {
    type State = MemoryState<B>;
    type StateGrad = MemoryState<B::InnerBackend>;
    type Output = MemoryStep<B>;

    fn start(&self, width: usize) -> MemoryState<B> {
        self.start_state(width)
    }

    fn step(&self, state: &MemoryState<B>, input: Tensor<B, 2>) -> error::Result<MemoryStep<B>> {
        let present = state.present();
        // Fresh leaves, so this step back-propagates on its own.
        let input_pool = input.detach().require_grad();
        let lane_pools: Vec<Vec<Tensor<B, 1>>> = state
            .packed()
            .into_iter()
            .map(|lane| lane.into_iter().map(|p| p.detach().require_grad()).collect())
            .collect();

        let block = self.fresh_leaves();

        let (output, next) = block.run(
            lane_pools.clone(),
            &present,
            input_pool.clone(),
            state.device(),
        )?;

        Ok(MemoryStep {
            block,
            present,
            input_pool,
            lane_pools,
            output,
            state: next,
        })
    }

    fn propagate_start(
        &self,
        state_grad: &MemoryState<B::InnerBackend>,
        grads: &mut GradAccumulator,
    ) -> error::Result<()> {
        // Every lane started from the same tensors, so lane gradients add up.
        for (lane, params) in state_grad.present().lanes().zip(state_grad.packed()) {
            if params.len() != self.init_params.len() {
                return Err(Error::LaneMismatch { lane });
            }
            for (init, grad) in self.init_params.iter().zip(params) {
                grads.add(init.id, grad);
            }
        }
        Ok(())
    }
}

/// One evaluated timestep of a [`MemoryBlock`], holding what back-propagation
/// needs.
#[derive(Debug)]
pub struct MemoryStep<B: AutodiffBackend> {
    block: MemoryBlock<B>,
    present: PresentMap,
    input_pool: Tensor<B, 2>,
    lane_pools: Vec<Vec<Tensor<B, 1>>>,
    output: Tensor<B, 2>,
    state: MemoryState<B>,
}

impl<B: AutodiffBackend> StepOutput<B> for MemoryStep<B> {
    type State = MemoryState<B>;
    type StateGrad = MemoryState<B::InnerBackend>;

    fn output(&self) -> Tensor<B, 2> {
        self.output.clone()
    }

    fn state(&self) -> &MemoryState<B> {
        &self.state
    }

    fn propagate(
        self,
        upstream: Tensor<B::InnerBackend, 2>,
        state_grad: Option<MemoryState<B::InnerBackend>>,
        grads: &mut GradAccumulator,
    ) -> error::Result<(Tensor<B::InnerBackend, 2>, MemoryState<B::InnerBackend>)> {
        if upstream.dims() != self.output.dims() {
            let [rows, cols] = self.output.dims();
            let [up_rows, up_cols] = upstream.dims();
            return Err(Error::ShapeMismatch {
                what: "output gradient",
                expected: rows * cols,
                actual: up_rows * up_cols,
            });
        }

        let mut objective = (self.output * Tensor::from_inner(upstream)).sum();
        if let Some(state_grad) = state_grad {
            if state_grad.present() != self.present {
                return Err(Error::ShapeMismatch {
                    what: "state gradient lanes",
                    expected: self.present.num_present(),
                    actual: state_grad.present().num_present(),
                });
            }
            for (params, lane_grads) in self.state.packed().into_iter().zip(state_grad.packed()) {
                for (param, grad) in params.into_iter().zip(lane_grads) {
                    objective = objective + (param * Tensor::from_inner(grad)).sum();
                }
            }
        }

        let mut gradients = objective.backward();

        // The pools only live for this call; take their slots out before the
        // gradient container goes away.
        let input_grad = match self.input_pool.grad_remove(&mut gradients) {
            Some(grad) => grad,
            None => self.input_pool.inner().zeros_like(),
        };
        let mut lane_grads = Vec::with_capacity(self.lane_pools.len());
        for lane in self.lane_pools {
            let mut grads_of_lane = Vec::with_capacity(lane.len());
            for pool in lane {
                let grad = match pool.grad_remove(&mut gradients) {
                    Some(grad) => grad,
                    None => pool.inner().zeros_like(),
                };
                grads_of_lane.push(grad);
            }
            lane_grads.push(grads_of_lane);
        }
        self.block.collect_grads(&mut gradients, grads);

        let device = input_grad.device();
        let state_grad = MemoryState::from_packed(
            lane_grads,
            &self.present,
            self.block.param_sizes(),
            &device,
        )?;
        Ok((input_grad, state_grad))
    }
}

/// Samples per lane encoded in a gate output of shape `[lanes, batch * size]`.
fn per_lane_batch<B: Backend>(gate_out: &Tensor<B, 2>, size: usize, what: &'static str) -> error::Result<usize> {
    let width = gate_out.dims()[1];
    if width == 0 || width % size != 0 {
        return Err(Error::NotMultiple {
            what,
            unit: size,
            actual: width,
        });
    }
    Ok(width / size)
}

fn expect_width<B: Backend>(gate_out: &Tensor<B, 2>, expected: usize, what: &'static str) -> error::Result<()> {
    let actual = gate_out.dims()[1];
    if actual != expected {
        return Err(Error::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn flatten<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 1> {
    let [rows, cols] = x.dims();
    x.reshape([rows * cols])
}
