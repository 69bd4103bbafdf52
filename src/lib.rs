//! # sgdstore - Memory by Gradient Descent (Rust)
//!
//! Recurrent memory cells whose hidden state is a small neural network. At
//! every timestep the cell writes to its memory by training that network for a
//! few steps of SGD, then reads from it by running the trained network on a
//! query. The whole procedure is differentiable, so the cell learns what to
//! store and how to recall it. Built on the Burn framework.
//!
//! ## Features
//!
//! - **Dynamic networks**: batched MLPs whose weights are plain tensors, with a
//!   differentiable gradient-descent step ([`net::Net`])
//! - **Memory block**: the recurrent cell with its four gates
//!   ([`cells::MemoryBlock`])
//! - **Variable-length sequences**: lanes may end and restart at any timestep
//!   ([`rnn::unroll`])
//! - **Persistence**: tagged, validated binary save format ([`serialize`])
//!
//! ## Quick Start
//!
//! ```rust
//! use burn::backend::NdArray;
//! use burn::tensor::Tensor;
//! use sgdstore::prelude::*;
//!
//! type Backend = NdArray<f32>;
//! let device = Default::default();
//!
//! let block = MemoryBlockConfig::new(6, vec![8, 16, 8])
//!     .with_train_batch(2)
//!     .init::<Backend>(&device)
//!     .unwrap();
//!
//! let state = block.start_state(3);
//! let input = Tensor::<Backend, 2>::zeros([3, 6], &device);
//! let (output, state) = block.evaluate(&state, input).unwrap();
//!
//! assert_eq!(output.dims(), [3, 8]);
//! assert_eq!(state.width(), 3);
//! ```
//!
//! ## Training
//!
//! On an autodiff backend, [`rnn::unroll`] runs a block over a padded batch of
//! sequences and [`rnn::Unrolled::backward`] back-propagates it, collecting
//! parameter gradients in a [`grad::GradAccumulator`] that any burn optimizer
//! accepts:
//!
//! ```ignore
//! let unrolled = unroll(&block, batches)?;
//! let mut grads = GradAccumulator::new();
//! unrolled.backward(&block, upstream, &mut grads)?;
//! block = optimizer.step(lr, block, grads.into_params());
//! ```

pub mod activation;
pub mod cells;
pub mod error;
pub mod grad;
pub mod net;
pub mod rnn;
pub mod serialize;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::activation::Activation;
    pub use crate::cells::{Gate, MemoryBlock, MemoryBlockConfig, MemoryState, Squash};
    pub use crate::error::{Error, Result};
    pub use crate::grad::GradAccumulator;
    pub use crate::net::Net;
    pub use crate::rnn::{unroll, BlockState, PresentMap, RecurrentBlock, SeqBatch, StepOutput};
    pub use crate::serialize::{decode_block, SavedBlock};
}
