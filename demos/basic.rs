//! Basic Usage Example
//!
//! Runs a memory block over a short batch of sequences of different lengths
//! without training, printing what happens to the per-lane state.

use burn::backend::NdArray;
use burn::tensor::{Distribution, Tensor};
use sgdstore::prelude::*;

fn main() {
    println!("=== sgdstore Basic Example ===\n");

    type Backend = NdArray<f32>;
    let device = Default::default();

    let block = MemoryBlockConfig::new(6, vec![8, 16, 8])
        .with_train_batch(4)
        .with_query_batch(2)
        .with_steps(2)
        .init::<Backend>(&device)
        .unwrap();

    println!("Memory block:");
    println!("  Input size:   {}", block.input_size());
    println!("  Output size:  {}", block.output_size());
    println!("  Inner layers: {:?}", block.layer_sizes());
    println!("  SGD steps:    {}", block.steps());
    println!();

    // Three sequences of lengths 4, 2 and 3.
    let presents = [
        PresentMap::all(3),
        PresentMap::all(3),
        PresentMap::new(vec![true, false, true]),
        PresentMap::new(vec![true, false, false]),
    ];

    let mut state = block.start_state(3);
    for (t, present) in presents.iter().enumerate() {
        state = state.reduce(present).unwrap();
        let input = Tensor::<Backend, 2>::random(
            [present.num_present(), block.input_size()],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let (output, next) = block.evaluate(&state, input).unwrap();
        state = next;
        println!(
            "t={}  present={:?}  output={:?}",
            t,
            state.present(),
            output.dims()
        );
    }
    println!();

    // Lane 0's memory has been trained four times; its first-layer weights
    // have moved away from the shared initial values.
    let start = block.start_state(1);
    let initial = start.lane(0).unwrap()[0].clone();
    let trained = state.lane(0).unwrap()[0].clone();
    let moved = (trained - initial).abs().max().into_scalar();
    println!("Largest change in lane 0's first weight matrix: {:.4}", moved);
}
