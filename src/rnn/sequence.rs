//! Running a recurrent block over a padded batch of sequences.
//!
//! Lanes may drop out (their sequence ended) and come back (a new sequence
//! started in that lane). A lane that comes back begins again from the block's
//! start state, exactly like a lane at timestep zero.

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use tracing::trace;

use super::{BlockState, PresentMap, RecurrentBlock, StepOutput};
use crate::error::{Error, Result};
use crate::grad::GradAccumulator;

/// One timestep of packed input for a batch of sequences.
#[derive(Debug, Clone)]
pub struct SeqBatch<B: AutodiffBackend> {
    /// `[present.num_present(), input_size]`
    pub packed: Tensor<B, 2>,
    pub present: PresentMap,
}

impl<B: AutodiffBackend> SeqBatch<B> {
    pub fn new(packed: Tensor<B, 2>, present: PresentMap) -> Self {
        Self { packed, present }
    }
}

struct Frame<O> {
    step: O,
    /// Lanes carried over from the previous timestep
    continuing: PresentMap,
    /// Lanes seeded from the start state at this timestep
    restarted: PresentMap,
}

/// A forward pass over a sequence batch, kept for back-propagation.
pub struct Unrolled<B: AutodiffBackend, R: RecurrentBlock<B>> {
    frames: Vec<Frame<R::Output>>,
    width: usize,
}

/// Run `block` over `batches`, one timestep per batch.
///
/// Every batch must have the same width and at least one present lane.
pub fn unroll<B, R>(block: &R, batches: Vec<SeqBatch<B>>) -> Result<Unrolled<B, R>>
where
    B: AutodiffBackend,
    R: RecurrentBlock<B>,
{
    let width = batches
        .first()
        .map(|b| b.present.width())
        .unwrap_or_default();
    let start = block.start(width);
    let mut state = start.clone();
    let mut frames = Vec::with_capacity(batches.len());

    for (t, batch) in batches.into_iter().enumerate() {
        batch.present.check_width(width)?;
        if batch.present.num_present() == 0 {
            return Err(Error::NoPresentLanes);
        }
        let live = state.present();
        let continuing = batch.present.intersect(&live)?;
        let restarted = batch.present.difference(&live)?;
        trace!(
            t,
            present = batch.present.num_present(),
            restarted = restarted.num_present(),
            "unrolling timestep"
        );

        let mut input_state = state.reduce(&continuing)?;
        if restarted.num_present() > 0 {
            input_state = input_state.merge(start.reduce(&restarted)?)?;
        }
        let step = block.step(&input_state, batch.packed)?;
        state = step.state().clone();
        frames.push(Frame {
            step,
            continuing,
            restarted,
        });
    }

    Ok(Unrolled { frames, width })
}

impl<B, R> Unrolled<B, R>
where
    B: AutodiffBackend,
    R: RecurrentBlock<B>,
{
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Packed outputs, one per timestep
    pub fn outputs(&self) -> Vec<Tensor<B, 2>> {
        self.frames.iter().map(|f| f.step.output()).collect()
    }

    /// States after each timestep
    pub fn states(&self) -> Vec<&R::State> {
        self.frames.iter().map(|f| f.step.state()).collect()
    }

    /// Back-propagate the whole pass.
    ///
    /// `upstream[t]` is the gradient of the loss with respect to output `t`.
    /// Block parameter gradients are added into `grads`; the gradients with
    /// respect to each timestep's packed input are returned in order.
    pub fn backward(
        self,
        block: &R,
        upstream: Vec<Tensor<B::InnerBackend, 2>>,
        grads: &mut GradAccumulator,
    ) -> Result<Vec<Tensor<B::InnerBackend, 2>>> {
        if upstream.len() != self.frames.len() {
            return Err(Error::ShapeMismatch {
                what: "upstream gradients",
                expected: self.frames.len(),
                actual: upstream.len(),
            });
        }

        let mut input_grads = Vec::with_capacity(self.frames.len());
        let mut carried: Option<R::StateGrad> = None;
        for (frame, upstream) in self.frames.into_iter().zip(upstream).rev() {
            let state_grad = match carried.take() {
                Some(grad) => Some(grad.expand(&frame.step.state().present())?),
                None => None,
            };
            let (input_grad, grad) = frame.step.propagate(upstream, state_grad, grads)?;
            if frame.restarted.num_present() > 0 {
                block.propagate_start(&grad.reduce(&frame.restarted)?, grads)?;
            }
            carried = Some(grad.reduce(&frame.continuing)?);
            input_grads.push(input_grad);
        }

        // Whatever is left flowed out of the start state at timestep zero.
        if let Some(grad) = carried {
            block.propagate_start(&grad, grads)?;
        }

        input_grads.reverse();
        Ok(input_grads)
    }
}
