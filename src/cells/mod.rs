//! # Memory Cells
//!
//! Single-timestep building blocks. A [`MemoryBlock`] is the recurrent cell;
//! its state is a [`MemoryState`] and its control signals come from four
//! [`Gate`]s. The driver in [`crate::rnn`] runs blocks over whole sequences.
//!
//! ## Per-timestep data flow
//!
//! ```text
//!            ┌────────────┐ train_in, target, step
//!  x ───────►│   gates    ├──────────────────────┐
//!            └─────┬──────┘                      ▼
//!                  │ query          ┌────────────────────────┐
//!                  │                │ net_t = SGD^steps(net) │◄── state (net)
//!                  ▼                └───────────┬────────────┘
//!            ┌────────────┐                     │
//!            │ net_t(query)│◄───────────────────┤
//!            └─────┬──────┘                     ▼
//!                  ▼                       next state
//!               output
//! ```
//!
//! ## Shapes
//!
//! | Tensor | Shape |
//! |--------|-------|
//! | input | `[num_present, input_size]` |
//! | output | `[num_present, query_batch * layer_sizes.last()]` |
//! | state lane | `[w0, b0, w1, b1, ...]`, flat |

mod gate;
mod memory_block;
mod state;

pub use gate::{Gate, Squash};
pub use memory_block::{MemoryBlock, MemoryBlockConfig, MemoryStep};
pub use state::MemoryState;
