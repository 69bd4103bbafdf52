//! Saving and loading memory blocks.
//!
//! A saved block is an envelope naming the block kind plus a bincode payload.
//! The payload of a [`MemoryBlock`] lists its fields in a fixed order:
//!
//! ```text
//! [init_params..., train_input, train_target, step_size, query, steps]
//! ```
//!
//! Tensors are stored as `f32` values with their shape, so a block saved from
//! one backend loads into any other.
//!
//! ```ignore
//! let bytes = block.to_bytes()?;
//! let block = MemoryBlock::<Backend>::from_bytes(&bytes, &device)?;
//!
//! // Or, when the kind is not known up front:
//! match decode_block::<Backend>(&bytes, &device)? {
//!     SavedBlock::Memory(block) => { /* ... */ }
//! }
//! ```

use burn::module::Param;
use burn::nn::LinearConfig;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cells::{Gate, MemoryBlock, Squash};
use crate::error::{DecodeError, Error, Result};

const ENVELOPE: &str = "block envelope";
const MEMORY_BLOCK: &str = "memory block";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SavedTensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SavedGate {
    weight: SavedTensor,
    bias: Option<SavedTensor>,
    squash: Squash,
}

// Field order is the on-disk layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SavedMemoryBlock {
    init_params: Vec<SavedTensor>,
    train_input: SavedGate,
    train_target: SavedGate,
    step_size: SavedGate,
    query: SavedGate,
    steps: usize,
}

/// Any block that can be read back from bytes.
#[derive(Debug)]
pub enum SavedBlock<B: Backend> {
    Memory(MemoryBlock<B>),
}

impl<B: Backend> SavedBlock<B> {
    pub fn kind(&self) -> &'static str {
        match self {
            SavedBlock::Memory(_) => MemoryBlock::<B>::KIND,
        }
    }
}

/// Decode a saved block of any registered kind.
pub fn decode_block<B: Backend>(bytes: &[u8], device: &B::Device) -> Result<SavedBlock<B>> {
    let envelope = read_envelope(bytes)?;
    match envelope.kind.as_str() {
        kind if kind == MemoryBlock::<B>::KIND => {
            decode_memory_block(&envelope.payload, device).map(SavedBlock::Memory)
        }
        other => Err(Error::decode(
            ENVELOPE,
            DecodeError::UnknownKind(other.to_string()),
        )),
    }
}

impl<B: Backend> MemoryBlock<B> {
    /// Serialize the block, tagged with [`MemoryBlock::KIND`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let saved = SavedMemoryBlock {
            init_params: self
                .init_params
                .iter()
                .map(|p| save_tensor(p.val()))
                .collect::<Result<_>>()?,
            train_input: save_gate(&self.train_input)?,
            train_target: save_gate(&self.train_target)?,
            step_size: save_gate(&self.step_size)?,
            query: save_gate(&self.query)?,
            steps: self.steps,
        };
        let payload = bincode::serialize(&saved).map_err(|source| Error::Encode {
            context: MEMORY_BLOCK,
            source,
        })?;
        let envelope = Envelope {
            kind: Self::KIND.to_string(),
            payload,
        };
        bincode::serialize(&envelope).map_err(|source| Error::Encode {
            context: ENVELOPE,
            source,
        })
    }

    /// Read a block written by [`MemoryBlock::to_bytes`].
    pub fn from_bytes(bytes: &[u8], device: &B::Device) -> Result<Self> {
        match decode_block(bytes, device)? {
            SavedBlock::Memory(block) => Ok(block),
        }
    }
}

fn read_envelope(bytes: &[u8]) -> Result<Envelope> {
    bincode::deserialize(bytes).map_err(|e| Error::decode(ENVELOPE, e))
}

fn decode_memory_block<B: Backend>(payload: &[u8], device: &B::Device) -> Result<MemoryBlock<B>> {
    let saved: SavedMemoryBlock =
        bincode::deserialize(payload).map_err(|e| Error::decode(MEMORY_BLOCK, e))?;
    let layers = check_layers(&saved.init_params)?;
    check_gates(&saved, &layers)?;

    let init_params = saved
        .init_params
        .into_iter()
        .map(|t| load_tensor::<B, 1>(t, device).map(Param::from_tensor))
        .collect::<Result<Vec<_>>>()?;

    debug!(
        layer_sizes = ?layers,
        steps = saved.steps,
        "decoded memory block"
    );

    Ok(MemoryBlock {
        init_params,
        train_input: load_gate(saved.train_input, device)?,
        train_target: load_gate(saved.train_target, device)?,
        step_size: load_gate(saved.step_size, device)?,
        query: load_gate(saved.query, device)?,
        steps: saved.steps,
    })
}

/// Layer sizes implied by the saved initial parameters.
fn check_layers(params: &[SavedTensor]) -> Result<Vec<usize>> {
    if params.is_empty() || params.len() % 2 != 0 {
        return Err(Error::structure(
            MEMORY_BLOCK,
            "an even, non-zero number of parameter tensors",
            format!("{} tensors", params.len()),
        ));
    }
    let mut sizes = Vec::with_capacity(params.len() / 2 + 1);
    for (layer, pair) in params.chunks(2).enumerate() {
        let (weight, bias) = (&pair[0], &pair[1]);
        if weight.shape.len() != 1 || bias.shape.len() != 1 {
            return Err(Error::structure(
                MEMORY_BLOCK,
                "one-dimensional parameter tensors",
                format!("shapes {:?} and {:?}", weight.shape, bias.shape),
            ));
        }
        let out_size = bias.values.len();
        if out_size == 0 || weight.values.is_empty() || weight.values.len() % out_size != 0 {
            return Err(Error::structure(
                MEMORY_BLOCK,
                format!("layer {layer} weights to be a non-zero multiple of {out_size} values"),
                format!("{} values", weight.values.len()),
            ));
        }
        let in_size = weight.values.len() / out_size;
        match sizes.last() {
            None => sizes.push(in_size),
            Some(&prev) if prev != in_size => {
                return Err(Error::structure(
                    MEMORY_BLOCK,
                    format!("layer {layer} to take {prev} inputs"),
                    format!("{in_size} inputs"),
                ));
            }
            Some(_) => {}
        }
        sizes.push(out_size);
    }
    Ok(sizes)
}

fn check_gates(saved: &SavedMemoryBlock, layers: &[usize]) -> Result<()> {
    let first = layers[0];
    let last = layers[layers.len() - 1];
    let input_size = gate_dims(&saved.train_input)?.0;

    let gates = [
        ("train input", &saved.train_input),
        ("train target", &saved.train_target),
        ("step size", &saved.step_size),
        ("query", &saved.query),
    ];
    for (name, gate) in gates {
        let (in_size, _) = gate_dims(gate)?;
        if in_size != input_size {
            return Err(Error::structure(
                MEMORY_BLOCK,
                format!("{name} gate with {input_size} inputs"),
                format!("{in_size} inputs"),
            ));
        }
    }

    let train_width = gate_dims(&saved.train_input)?.1;
    if train_width % first != 0 {
        return Err(Error::structure(
            MEMORY_BLOCK,
            format!("train input gate width to be a multiple of {first}"),
            train_width.to_string(),
        ));
    }
    let train_batch = train_width / first;
    let target_width = gate_dims(&saved.train_target)?.1;
    if train_batch.checked_mul(last) != Some(target_width) {
        return Err(Error::structure(
            MEMORY_BLOCK,
            format!("train target gate width {train_batch} * {last}"),
            target_width.to_string(),
        ));
    }
    let step_width = gate_dims(&saved.step_size)?.1;
    if step_width != 1 {
        return Err(Error::structure(
            MEMORY_BLOCK,
            "step size gate width 1",
            step_width.to_string(),
        ));
    }
    let query_width = gate_dims(&saved.query)?.1;
    if query_width % first != 0 {
        return Err(Error::structure(
            MEMORY_BLOCK,
            format!("query gate width to be a multiple of {first}"),
            query_width.to_string(),
        ));
    }
    Ok(())
}

/// `(input_size, output_size)` of a saved gate.
fn gate_dims(gate: &SavedGate) -> Result<(usize, usize)> {
    let shape = &gate.weight.shape;
    let len = match shape.as_slice() {
        &[rows, cols] if rows > 0 && cols > 0 => rows.checked_mul(cols),
        _ => None,
    };
    if len != Some(gate.weight.values.len()) {
        return Err(Error::structure(
            MEMORY_BLOCK,
            "a non-empty two-dimensional gate weight",
            format!("shape {:?} holding {} values", shape, gate.weight.values.len()),
        ));
    }
    if let Some(bias) = &gate.bias {
        if bias.shape != [shape[1]] {
            return Err(Error::structure(
                MEMORY_BLOCK,
                format!("a gate bias of shape [{}]", shape[1]),
                format!("{:?}", bias.shape),
            ));
        }
    }
    Ok((shape[0], shape[1]))
}

fn save_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<SavedTensor> {
    let shape = tensor.dims().to_vec();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::TensorData(format!("{e:?}")))?;
    Ok(SavedTensor { shape, values })
}

fn load_tensor<B: Backend, const D: usize>(
    saved: SavedTensor,
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    let len = saved
        .shape
        .iter()
        .try_fold(1usize, |len, &dim| len.checked_mul(dim));
    if saved.shape.len() != D || len != Some(saved.values.len()) {
        return Err(Error::structure(
            MEMORY_BLOCK,
            format!("a {D}-dimensional tensor"),
            format!("shape {:?} holding {} values", saved.shape, saved.values.len()),
        ));
    }
    Ok(Tensor::from_data(
        TensorData::new(saved.values, saved.shape),
        device,
    ))
}

fn save_gate<B: Backend>(gate: &Gate<B>) -> Result<SavedGate> {
    Ok(SavedGate {
        weight: save_tensor(gate.linear.weight.val())?,
        bias: gate
            .linear
            .bias
            .as_ref()
            .map(|b| save_tensor(b.val()))
            .transpose()?,
        squash: gate.squash(),
    })
}

fn load_gate<B: Backend>(saved: SavedGate, device: &B::Device) -> Result<Gate<B>> {
    let (in_size, out_size) = gate_dims(&saved)?;
    let mut linear = LinearConfig::new(in_size, out_size)
        .with_bias(saved.bias.is_some())
        .init(device);
    linear.weight = Param::from_tensor(load_tensor(saved.weight, device)?);
    linear.bias = match saved.bias {
        Some(bias) => Some(Param::from_tensor(load_tensor(bias, device)?)),
        None => None,
    };
    Ok(Gate::from_linear(linear, saved.squash))
}
