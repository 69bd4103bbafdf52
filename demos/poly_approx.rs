//! Polynomial Approximation - Meta-Learning Demo
//!
//! Every episode draws a random cubic polynomial in three variables. At each
//! timestep the model sees a random point `(x, y, z)` plus the polynomial's
//! value at the previous point, and must predict the value at the current
//! point. Doing well means memorizing the polynomial as the episode goes on,
//! which the memory block does by training its inner network.
//!
//! Run with `RUST_LOG=debug` to see block construction and step logs.

use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, Tensor, TensorData};
use sgdstore::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Plain = NdArray<f32>;
type Train = Autodiff<Plain>;

const EPISODE_LEN: usize = 16;
const BATCH: usize = 8;
const ITERATIONS: usize = 200;
const HIDDEN: usize = 32;
const STEP_SIZE: f64 = 1e-3;

/// Powers `(x, y, z)` of every monomial of degree at most three
fn monomials() -> Vec<[i32; 3]> {
    let mut terms = Vec::new();
    for x in 0..=3 {
        for y in 0..=3 - x {
            for z in 0..=3 - x - y {
                terms.push([x, y, z]);
            }
        }
    }
    terms
}

struct Poly {
    terms: Vec<([i32; 3], f32)>,
}

impl Poly {
    fn eval(&self, point: &[f32]) -> f32 {
        self.terms
            .iter()
            .map(|(powers, coeff)| {
                coeff
                    * point
                        .iter()
                        .zip(powers)
                        .map(|(v, &p)| v.powi(p))
                        .product::<f32>()
            })
            .sum()
    }
}

fn normal(len: usize, std: f64, device: &<Plain as Backend>::Device) -> Vec<f32> {
    Tensor::<Plain, 1>::random([len], Distribution::Normal(0.0, std), device)
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

/// Inputs `[BATCH, 4]` and targets `[BATCH, 1]` for every timestep.
fn sample_batch(device: &<Plain as Backend>::Device) -> (Vec<Tensor<Train, 2>>, Vec<Tensor<Plain, 2>>) {
    let powers = monomials();
    let coeffs = normal(BATCH * powers.len(), 0.2, device);
    let polys: Vec<Poly> = coeffs
        .chunks(powers.len())
        .map(|c| Poly {
            terms: powers.iter().copied().zip(c.iter().copied()).collect(),
        })
        .collect();
    let points = normal(EPISODE_LEN * BATCH * 3, 1.0, device);

    let mut last = vec![0.0f32; BATCH];
    let mut inputs = Vec::with_capacity(EPISODE_LEN);
    let mut targets = Vec::with_capacity(EPISODE_LEN);
    for t in 0..EPISODE_LEN {
        let mut input = Vec::with_capacity(BATCH * 4);
        let mut target = Vec::with_capacity(BATCH);
        for (b, poly) in polys.iter().enumerate() {
            let offset = (t * BATCH + b) * 3;
            let point = &points[offset..offset + 3];
            input.push(last[b]);
            input.extend_from_slice(point);
            last[b] = poly.eval(point);
            target.push(last[b]);
        }
        inputs.push(Tensor::from_data(TensorData::new(input, [BATCH, 4]), device));
        targets.push(Tensor::from_data(TensorData::new(target, [BATCH, 1]), device));
    }
    (inputs, targets)
}

#[derive(Module, Debug)]
struct PolyModel<B: Backend> {
    encoder: Linear<B>,
    block: MemoryBlock<B>,
    readout: Linear<B>,
}

impl<B: Backend> PolyModel<B> {
    fn new(device: &B::Device) -> sgdstore::Result<Self> {
        let block = MemoryBlockConfig::new(HIDDEN, vec![16, 32, 16])
            .with_train_batch(2)
            .with_query_batch(2)
            .with_steps(2)
            .with_learning_rate(1.0)
            .init(device)?;
        Ok(Self {
            encoder: LinearConfig::new(4, HIDDEN).init(device),
            readout: LinearConfig::new(block.output_size(), 1).init(device),
            block,
        })
    }
}

fn collect_linear<B: AutodiffBackend>(
    linear: &Linear<B>,
    gradients: &mut B::Gradients,
    grads: &mut GradAccumulator,
) {
    if let Some(grad) = linear.weight.val().grad_remove(gradients) {
        grads.add(linear.weight.id, grad);
    }
    if let Some(bias) = &linear.bias {
        if let Some(grad) = bias.val().grad_remove(gradients) {
            grads.add(bias.id, grad);
        }
    }
}

/// Mean cost over the episode, and the gradient of the summed per-step cost.
fn train_step(
    model: &PolyModel<Train>,
    inputs: &[Tensor<Train, 2>],
    targets: &[Tensor<Plain, 2>],
) -> sgdstore::Result<(f32, GradAccumulator)> {
    let encoded: Vec<Tensor<Train, 2>> = inputs
        .iter()
        .map(|x| model.encoder.forward(x.clone()).tanh())
        .collect();
    let present = PresentMap::all(BATCH);
    let batches = encoded
        .iter()
        .map(|e| SeqBatch::new(e.clone(), present.clone()))
        .collect();
    let unrolled = unroll(&model.block, batches)?;

    let mut grads = GradAccumulator::new();
    let mut upstream = Vec::with_capacity(EPISODE_LEN);
    let mut cost = 0.0;
    for (output, target) in unrolled.outputs().into_iter().zip(targets) {
        // The readout gets its own graph, the block is propagated separately.
        let features = output.detach().require_grad();
        let diff = model.readout.forward(features.clone()) - Tensor::from_inner(target.clone());
        let loss = (diff.clone() * diff).mean();
        cost += loss.clone().into_scalar();

        let mut gradients = loss.backward();
        let upstream_grad = match features.grad_remove(&mut gradients) {
            Some(grad) => grad,
            None => features.inner().zeros_like(),
        };
        upstream.push(upstream_grad);
        collect_linear(&model.readout, &mut gradients, &mut grads);
    }

    let input_grads = unrolled.backward(&model.block, upstream, &mut grads)?;

    let mut surrogate = Tensor::<Train, 1>::zeros([1], &Default::default());
    for (encoded, grad) in encoded.into_iter().zip(input_grads) {
        surrogate = surrogate + (encoded * Tensor::from_inner(grad)).sum();
    }
    let mut gradients = surrogate.backward();
    collect_linear(&model.encoder, &mut gradients, &mut grads);

    Ok((cost / EPISODE_LEN as f32, grads))
}

fn main() -> sgdstore::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let device = Default::default();
    let mut model = PolyModel::<Train>::new(&device)?;
    let mut optim = AdamConfig::new().init();

    info!(
        episode_len = EPISODE_LEN,
        batch = BATCH,
        layers = ?model.block.layer_sizes(),
        "training polynomial approximator"
    );

    for iter in 0..ITERATIONS {
        let (inputs, targets) = sample_batch(&device);
        let (cost, grads) = train_step(&model, &inputs, &targets)?;
        model = optim.step(STEP_SIZE, model, grads.into_params());
        info!(iter, cost, "trained batch");
    }

    let bytes = model.block.to_bytes()?;
    let restored = MemoryBlock::<Plain>::from_bytes(&bytes, &device)?;
    info!(
        bytes = bytes.len(),
        steps = restored.steps(),
        "saved and reloaded memory block"
    );
    Ok(())
}
