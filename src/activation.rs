//! Activation functions usable inside a dynamic [`Net`](crate::net::Net).
//!
//! Every activation here comes with an analytic derivative expressed in terms of
//! its own output, which is what the hand-written backward pass in
//! [`Net::step`](crate::net::Net::step) needs. Anything without such a derivative
//! cannot be used in the inner network.

use std::fmt;
use std::str::FromStr;

use burn::tensor::{activation, backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Nonlinearity applied after a layer of the inner network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    /// Hyperbolic tangent. Bounded, which keeps repeated descent steps stable.
    #[default]
    Tanh,
    /// Rectified linear unit.
    ReLU,
}

impl Activation {
    /// Applies the activation element-wise.
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn::backend::NdArray;
    /// use burn::tensor::Tensor;
    /// use sgdstore::activation::Activation;
    ///
    /// type Backend = NdArray<f32>;
    /// let device = Default::default();
    ///
    /// let x = Tensor::<Backend, 1>::from_floats([-1.0, 0.0, 2.0], &device);
    /// let y = Activation::ReLU.forward(x);
    /// assert_eq!(y.into_data().to_vec::<f32>().unwrap(), vec![0.0, 0.0, 2.0]);
    /// ```
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::ReLU => activation::relu(x),
        }
    }

    /// Back-propagates `upstream` through the activation, given the forward
    /// output `out`.
    ///
    /// - tanh: `upstream * (1 - out^2)`
    /// - relu: `upstream` where `out > 0`, zero elsewhere
    pub fn backward<B: Backend, const D: usize>(
        &self,
        out: Tensor<B, D>,
        upstream: Tensor<B, D>,
    ) -> Tensor<B, D> {
        match self {
            Activation::Tanh => {
                let complement = (out.clone() * out).neg().add_scalar(1.0);
                upstream * complement
            }
            Activation::ReLU => upstream.mask_fill(out.lower_equal_elem(0.0), 0.0),
        }
    }

    /// Stable lowercase name, as accepted by [`FromStr`].
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::ReLU => "relu",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::ReLU),
            _ => Err(Error::UnknownActivation(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type Backend = NdArray<f32>;

    fn values(t: Tensor<Backend, 1>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_tanh_forward_matches_std() {
        let device = Default::default();
        let inputs = [-3.0f32, -0.5, 0.0, 0.25, 4.0];
        let x = Tensor::<Backend, 1>::from_floats(inputs, &device);

        let y = values(Activation::Tanh.forward(x));
        for (got, x) in y.iter().zip(inputs) {
            assert!((got - x.tanh()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_tanh_backward_uses_output() {
        let device = Default::default();
        let out = Tensor::<Backend, 1>::from_floats([0.5, -0.9, 0.0], &device);
        let upstream = Tensor::<Backend, 1>::from_floats([2.0, 1.0, -3.0], &device);

        let grad = values(Activation::Tanh.backward(out, upstream));
        let expected = [2.0 * 0.75, 1.0 * (1.0 - 0.81), -3.0];
        for (g, e) in grad.iter().zip(expected) {
            assert!((g - e).abs() < 1e-6, "got {g}, expected {e}");
        }
    }

    #[test]
    fn test_relu_backward_masks_inactive_units() {
        let device = Default::default();
        let out = Activation::ReLU.forward(Tensor::<Backend, 1>::from_floats(
            [-1.0, 2.0, 0.0, 3.0],
            &device,
        ));
        let upstream = Tensor::<Backend, 1>::from_floats([5.0, 6.0, 7.0, 8.0], &device);

        assert_eq!(
            values(Activation::ReLU.backward(out, upstream)),
            vec![0.0, 6.0, 0.0, 8.0]
        );
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("tanh".parse::<Activation>().unwrap(), Activation::Tanh);
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::ReLU);
        assert!("gelu".parse::<Activation>().is_err());
        assert_eq!(Activation::ReLU.to_string(), "relu");
    }
}
