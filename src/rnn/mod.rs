//! # Recurrent Blocks over Variable-Length Batches
//!
//! This module defines the contract between a recurrent block (such as
//! [`MemoryBlock`](crate::cells::MemoryBlock)) and the driver that threads its
//! state through time, plus a small driver ([`unroll`]) implementing it.
//!
//! ## Lanes and present maps
//!
//! A batch of `width` sequences is processed in lockstep. Each sequence owns
//! a *lane*. Sequences have different lengths, so at every timestep some lanes
//! may be absent; a [`PresentMap`] records which ones are active. Inputs and
//! outputs are *packed*: only present lanes get a row, in lane order.
//!
//! | Tensor | Shape |
//! |--------|-------|
//! | packed input | `[num_present, input_size]` |
//! | packed output | `[num_present, output_size]` |
//!
//! States keep `width` slots and change their active set only through
//! [`BlockState::reduce`], [`BlockState::expand`] and [`BlockState::merge`].
//!
//! ## Gradients
//!
//! Blocks are evaluated on an autodiff backend. [`StepOutput::propagate`]
//! back-propagates one timestep given the gradient of the loss with respect to
//! the step's output and (optionally) its new state. Block parameter gradients
//! are added into a [`GradAccumulator`]; input and state gradients are
//! returned to the caller so it can continue the chain.
//!
//! ```ignore
//! let unrolled = unroll(&block, batches)?;
//! let mut grads = GradAccumulator::new();
//! let input_grads = unrolled.backward(&block, upstream, &mut grads)?;
//! ```

pub mod sequence;

use std::fmt;

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

use crate::error::{Error, Result};
use crate::grad::GradAccumulator;

pub use sequence::{unroll, SeqBatch, Unrolled};

/// Per-lane record of which sequences are active at a timestep.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PresentMap(Vec<bool>);

impl PresentMap {
    pub fn new(present: Vec<bool>) -> Self {
        Self(present)
    }

    /// A map of `width` lanes, all present
    pub fn all(width: usize) -> Self {
        Self(vec![true; width])
    }

    /// A map of `width` lanes, none present
    pub fn none(width: usize) -> Self {
        Self(vec![false; width])
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn num_present(&self) -> usize {
        self.0.iter().filter(|&&p| p).count()
    }

    pub fn is_present(&self, lane: usize) -> bool {
        self.0.get(lane).copied().unwrap_or(false)
    }

    /// Indices of the present lanes, in order
    pub fn lanes(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, &p)| p.then_some(i))
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    /// Lanes present in both maps
    pub fn intersect(&self, other: &PresentMap) -> Result<PresentMap> {
        self.zip_with(other, |a, b| a && b)
    }

    /// Lanes present here but not in `other`
    pub fn difference(&self, other: &PresentMap) -> Result<PresentMap> {
        self.zip_with(other, |a, b| a && !b)
    }

    /// Lanes present in either map
    pub fn union(&self, other: &PresentMap) -> Result<PresentMap> {
        self.zip_with(other, |a, b| a || b)
    }

    pub fn is_subset_of(&self, other: &PresentMap) -> bool {
        self.width() == other.width() && self.0.iter().zip(&other.0).all(|(&a, &b)| !a || b)
    }

    pub(crate) fn check_width(&self, expected: usize) -> Result<()> {
        if self.width() != expected {
            return Err(Error::WidthMismatch {
                expected,
                actual: self.width(),
            });
        }
        Ok(())
    }

    fn zip_with(&self, other: &PresentMap, f: impl Fn(bool, bool) -> bool) -> Result<PresentMap> {
        other.check_width(self.width())?;
        Ok(PresentMap(
            self.0.iter().zip(&other.0).map(|(&a, &b)| f(a, b)).collect(),
        ))
    }
}

impl From<Vec<bool>> for PresentMap {
    fn from(present: Vec<bool>) -> Self {
        Self(present)
    }
}

impl fmt::Debug for PresentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, &p) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(if p { "T" } else { "F" })?;
        }
        f.write_str("}")
    }
}

/// A recurrent state (or state gradient) spread over `width` lanes.
pub trait BlockState: Clone + Sized {
    /// Which lanes currently hold a value
    fn present(&self) -> PresentMap;

    /// Keep only the lanes in `present`, which must all be present already.
    fn reduce(&self, present: &PresentMap) -> Result<Self>;

    /// Grow to the lanes in `present`, which must include every present lane.
    /// Newly added lanes hold zeros.
    fn expand(&self, present: &PresentMap) -> Result<Self>;

    /// Combine two states of equal width whose present lanes do not overlap.
    fn merge(self, other: Self) -> Result<Self>;
}

/// One timestep of a recurrent block, ready to be back-propagated.
pub trait StepOutput<B: AutodiffBackend> {
    type State: BlockState;
    type StateGrad: BlockState;

    /// Packed output, `[num_present, output_size]`
    fn output(&self) -> Tensor<B, 2>;

    /// State after this step
    fn state(&self) -> &Self::State;

    /// Back-propagate this step.
    ///
    /// `upstream` is the gradient with respect to [`StepOutput::output`];
    /// `state_grad` the gradient with respect to [`StepOutput::state`], or
    /// `None` if the state was not used. Parameter gradients go into `grads`.
    /// Returns the gradients with respect to the step's input and input state.
    fn propagate(
        self,
        upstream: Tensor<B::InnerBackend, 2>,
        state_grad: Option<Self::StateGrad>,
        grads: &mut GradAccumulator,
    ) -> Result<(Tensor<B::InnerBackend, 2>, Self::StateGrad)>;
}

/// A recurrent block: a pure function `(state, input) -> (output, state)`.
pub trait RecurrentBlock<B: AutodiffBackend> {
    type State: BlockState;
    type StateGrad: BlockState;
    type Output: StepOutput<B, State = Self::State, StateGrad = Self::StateGrad>;

    /// Start state with `width` lanes, all present
    fn start(&self, width: usize) -> Self::State;

    /// Apply one timestep of packed input to `state`.
    fn step(&self, state: &Self::State, input: Tensor<B, 2>) -> Result<Self::Output>;

    /// Add the gradient of states that came straight from [`RecurrentBlock::start`]
    /// into the block's start parameters.
    fn propagate_start(&self, state_grad: &Self::StateGrad, grads: &mut GradAccumulator)
        -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_map_counts() {
        let map = PresentMap::new(vec![true, false, true, false]);
        assert_eq!(map.width(), 4);
        assert_eq!(map.num_present(), 2);
        assert_eq!(map.lanes().collect::<Vec<_>>(), vec![0, 2]);
        assert!(map.is_present(2));
        assert!(!map.is_present(3));
        assert!(!map.is_present(10));
        assert_eq!(format!("{map:?}"), "{T,F,T,F}");
    }

    #[test]
    fn test_present_map_set_ops() {
        let a = PresentMap::new(vec![true, true, false, false]);
        let b = PresentMap::new(vec![true, false, true, false]);

        assert_eq!(a.intersect(&b).unwrap().as_slice(), &[true, false, false, false]);
        assert_eq!(a.difference(&b).unwrap().as_slice(), &[false, true, false, false]);
        assert_eq!(a.union(&b).unwrap().as_slice(), &[true, true, true, false]);
        assert!(a.intersect(&b).unwrap().is_subset_of(&a));
        assert!(!a.is_subset_of(&b));
        assert!(PresentMap::none(4).is_subset_of(&a));
    }

    #[test]
    fn test_present_map_width_mismatch() {
        let a = PresentMap::all(3);
        let b = PresentMap::all(4);
        assert!(matches!(
            a.intersect(&b),
            Err(Error::WidthMismatch { expected: 3, actual: 4 })
        ));
        assert!(!a.is_subset_of(&b));
    }
}
