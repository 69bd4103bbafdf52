use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::{Error, Result};
use crate::rnn::{BlockState, PresentMap};

/// Recurrent state of a [`MemoryBlock`](super::MemoryBlock): the current inner
/// network parameters of every lane.
///
/// Each present lane holds a flat parameter list `[w0, b0, w1, b1, ...]` whose
/// lengths equal [`MemoryState::param_sizes`]. Absent lanes hold nothing. The
/// same type carries state gradients (on the inner backend) during
/// back-propagation.
#[derive(Debug, Clone)]
pub struct MemoryState<B: Backend> {
    lanes: Vec<Option<Vec<Tensor<B, 1>>>>,
    param_sizes: Vec<usize>,
    device: B::Device,
}

impl<B: Backend> MemoryState<B> {
    /// `width` lanes, each a copy of `params`.
    pub fn seeded(params: &[Tensor<B, 1>], width: usize, device: &B::Device) -> Self {
        Self {
            lanes: vec![Some(params.to_vec()); width],
            param_sizes: params.iter().map(|p| p.dims()[0]).collect(),
            device: device.clone(),
        }
    }

    /// Assemble a state from the parameter lists of the present lanes, given in
    /// lane order.
    pub fn from_packed(
        packed: Vec<Vec<Tensor<B, 1>>>,
        present: &PresentMap,
        param_sizes: Vec<usize>,
        device: &B::Device,
    ) -> Result<Self> {
        if packed.len() != present.num_present() {
            return Err(Error::ShapeMismatch {
                what: "packed lanes",
                expected: present.num_present(),
                actual: packed.len(),
            });
        }
        let mut lanes = vec![None; present.width()];
        for (lane, params) in present.lanes().zip(packed) {
            check_lane(lane, &params, &param_sizes)?;
            lanes[lane] = Some(params);
        }
        Ok(Self {
            lanes,
            param_sizes,
            device: device.clone(),
        })
    }

    pub fn width(&self) -> usize {
        self.lanes.len()
    }

    pub fn param_sizes(&self) -> &[usize] {
        &self.param_sizes
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Parameters of one lane, if present
    pub fn lane(&self, lane: usize) -> Option<&[Tensor<B, 1>]> {
        self.lanes.get(lane).and_then(|l| l.as_deref())
    }

    /// Parameter lists of the present lanes, in lane order
    pub fn packed(&self) -> Vec<Vec<Tensor<B, 1>>> {
        self.lanes.iter().flatten().cloned().collect()
    }

    fn check_present(&self, present: &PresentMap) -> Result<()> {
        present.check_width(self.width())
    }
}

impl<B: Backend> BlockState for MemoryState<B> {
    fn present(&self) -> PresentMap {
        PresentMap::new(self.lanes.iter().map(Option::is_some).collect())
    }

    fn reduce(&self, present: &PresentMap) -> Result<Self> {
        self.check_present(present)?;
        let mut lanes = vec![None; self.width()];
        for lane in present.lanes() {
            let params = self.lanes[lane].as_ref().ok_or(Error::LaneAbsent(lane))?;
            lanes[lane] = Some(params.clone());
        }
        Ok(Self {
            lanes,
            param_sizes: self.param_sizes.clone(),
            device: self.device.clone(),
        })
    }

    fn expand(&self, present: &PresentMap) -> Result<Self> {
        self.check_present(present)?;
        let mut lanes = self.lanes.clone();
        for (lane, slot) in lanes.iter_mut().enumerate() {
            match (slot.is_some(), present.is_present(lane)) {
                (true, false) => return Err(Error::LaneAbsent(lane)),
                (false, true) => {
                    let zeros = self
                        .param_sizes
                        .iter()
                        .map(|&size| Tensor::zeros([size], &self.device))
                        .collect();
                    *slot = Some(zeros);
                }
                _ => {}
            }
        }
        Ok(Self {
            lanes,
            param_sizes: self.param_sizes.clone(),
            device: self.device.clone(),
        })
    }

    fn merge(self, other: Self) -> Result<Self> {
        other.check_present(&self.present())?;
        if other.param_sizes != self.param_sizes {
            return Err(Error::ShapeMismatch {
                what: "merged state layout",
                expected: self.param_sizes.len(),
                actual: other.param_sizes.len(),
            });
        }
        let mut lanes = self.lanes;
        for (lane, (slot, theirs)) in lanes.iter_mut().zip(other.lanes).enumerate() {
            if let Some(params) = theirs {
                if slot.is_some() {
                    return Err(Error::LaneConflict(lane));
                }
                *slot = Some(params);
            }
        }
        Ok(Self {
            lanes,
            param_sizes: self.param_sizes,
            device: self.device,
        })
    }
}

fn check_lane<B: Backend>(lane: usize, params: &[Tensor<B, 1>], sizes: &[usize]) -> Result<()> {
    if params.len() != sizes.len()
        || params.iter().zip(sizes).any(|(p, &size)| p.dims()[0] != size)
    {
        return Err(Error::LaneMismatch { lane });
    }
    Ok(())
}
