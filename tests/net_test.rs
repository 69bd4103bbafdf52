#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::backend::Backend;
    use burn::tensor::{Tensor, TensorData};
    use ndarray::{Array1, Array2, Axis};
    use rand::prelude::*;
    use sgdstore::activation::Activation;
    use sgdstore::error::Error;
    use sgdstore::net::Net;

    type Backend0 = NdArray<f32>;
    type AdBackend = Autodiff<NdArray<f32>>;

    const LAYERS: [usize; 4] = [5, 7, 6, 3];

    fn random_values(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
    }

    /// Flat `[w0, b0, w1, b1, ...]` for the given layer sizes.
    fn random_params(rng: &mut StdRng, layers: &[usize]) -> Vec<Vec<f32>> {
        layers
            .windows(2)
            .flat_map(|pair| [random_values(rng, pair[0] * pair[1]), random_values(rng, pair[1])])
            .collect()
    }

    fn tensor<B: Backend>(values: &[f32]) -> Tensor<B, 1> {
        Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), &Default::default())
    }

    fn to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    /// Plain ndarray MLP used as the reference evaluator.
    fn reference_apply(
        params: &[Vec<f32>],
        input: &[f32],
        batch: usize,
        activation: Activation,
        linear_output: bool,
    ) -> Vec<f32> {
        let in_size = params[0].len() / params[1].len();
        let mut x = Array2::from_shape_vec((batch, in_size), input.to_vec()).unwrap();
        let layers = params.len() / 2;
        for (i, pair) in params.chunks(2).enumerate() {
            let out_size = pair[1].len();
            let w = Array2::from_shape_vec((out_size, x.len_of(Axis(1))), pair[0].clone()).unwrap();
            let b = Array1::from_vec(pair[1].clone());
            x = x.dot(&w.t()) + &b;
            if !(linear_output && i == layers - 1) {
                x.mapv_inplace(|v| match activation {
                    Activation::Tanh => v.tanh(),
                    Activation::ReLU => v.max(0.0),
                });
            }
        }
        x.iter().copied().collect()
    }

    /// The same MLP on the autodiff backend, trained through its MSE loss.
    fn reference_train(
        params: &[Vec<f32>],
        input: &[f32],
        target: &[f32],
        step_size: f32,
        batch: usize,
        num_steps: usize,
    ) -> Vec<Vec<f32>> {
        let device = Default::default();
        let in_size = params[0].len() / params[1].len();
        let out_size = params[params.len() - 1].len();
        let x = Tensor::<AdBackend, 2>::from_data(
            TensorData::new(input.to_vec(), [batch, in_size]),
            &device,
        );
        let y = Tensor::<AdBackend, 2>::from_data(
            TensorData::new(target.to_vec(), [batch, out_size]),
            &device,
        );

        let mut current: Vec<Vec<f32>> = params.to_vec();
        for _ in 0..num_steps {
            let leaves: Vec<Tensor<AdBackend, 1>> =
                current.iter().map(|p| tensor::<AdBackend>(p).require_grad()).collect();
            let mut out = x.clone();
            for pair in leaves.chunks(2) {
                let out_len = pair[1].dims()[0];
                let in_len = pair[0].dims()[0] / out_len;
                let w = pair[0].clone().reshape([out_len, in_len]);
                let b = pair[1].clone().reshape([1, out_len]);
                out = (out.matmul(w.transpose()) + b).tanh();
            }
            let diff = out - y.clone();
            let loss = (diff.clone() * diff).mean();
            let grads = loss.backward();
            current = leaves
                .iter()
                .map(|leaf| {
                    let grad = leaf.grad(&grads).unwrap();
                    to_vec(leaf.clone().inner() - grad.mul_scalar(step_size))
                })
                .collect();
        }
        current
    }

    fn net_from(params: &[Vec<f32>]) -> Net<Backend0> {
        Net::from_params(params.iter().map(|p| tensor(p)).collect()).unwrap()
    }

    #[test]
    fn test_apply_matches_reference() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = random_params(&mut rng, &LAYERS);
        let net = net_from(&params);
        let batch = 4;
        let input = random_values(&mut rng, batch * LAYERS[0]);

        assert_eq!(net.in_size(), 5);
        assert_eq!(net.out_size(), 3);
        let actual = to_vec(net.apply(tensor(&input), batch).unwrap());
        let expected = reference_apply(&params, &input, batch, Activation::Tanh, false);
        assert!(max_abs_diff(&actual, &expected) < 1e-4);
    }

    #[test]
    fn test_relu_linear_output_matches_reference() {
        let mut rng = StdRng::seed_from_u64(2);
        let params = random_params(&mut rng, &LAYERS);
        let net = net_from(&params)
            .with_activation(Activation::ReLU)
            .with_linear_output(true);
        let batch = 3;
        let input = random_values(&mut rng, batch * LAYERS[0]);

        let actual = to_vec(net.apply(tensor(&input), batch).unwrap());
        let expected = reference_apply(&params, &input, batch, Activation::ReLU, true);
        assert!(max_abs_diff(&actual, &expected) < 1e-4);
        assert_eq!(net.activation(), Activation::ReLU);
    }

    #[test]
    fn test_train_matches_reference() {
        let mut rng = StdRng::seed_from_u64(3);
        let params = random_params(&mut rng, &LAYERS);
        let batch = 2;
        let input = random_values(&mut rng, batch * LAYERS[0]);
        let target = random_values(&mut rng, batch * LAYERS[3]);
        let step_size = 0.37;

        for num_steps in 0..=2 {
            let trained = net_from(&params)
                .train(
                    tensor(&input),
                    tensor(&target),
                    tensor(&[step_size]),
                    batch,
                    num_steps,
                )
                .unwrap();
            let expected = reference_train(&params, &input, &target, step_size, batch, num_steps);
            let actual = trained.lane_params(0).unwrap();
            assert_eq!(actual.len(), expected.len());
            for (i, (a, e)) in actual.into_iter().zip(&expected).enumerate() {
                let diff = max_abs_diff(&to_vec(a), e);
                assert!(diff < 1e-4, "steps {num_steps}, param {i}: diff {diff}");
            }
        }
    }

    #[test]
    fn test_batched_apply_decomposes() {
        let mut rng = StdRng::seed_from_u64(4);
        let a = random_params(&mut rng, &LAYERS);
        let b = random_params(&mut rng, &LAYERS);
        let batch = 3;
        let input_a = random_values(&mut rng, batch * LAYERS[0]);
        let input_b = random_values(&mut rng, batch * LAYERS[0]);

        let joined = Net::<Backend0>::from_lanes(vec![
            a.iter().map(|p| tensor(p)).collect(),
            b.iter().map(|p| tensor(p)).collect(),
        ])
        .unwrap();
        assert_eq!(joined.num(), 2);

        let input: Vec<f32> = input_a.iter().chain(&input_b).copied().collect();
        let actual = to_vec(joined.apply(tensor(&input), batch).unwrap());

        let mut expected = to_vec(net_from(&a).apply(tensor(&input_a), batch).unwrap());
        expected.extend(to_vec(net_from(&b).apply(tensor(&input_b), batch).unwrap()));
        assert!(max_abs_diff(&actual, &expected) < 1e-5);
    }

    #[test]
    fn test_batched_train_decomposes() {
        let mut rng = StdRng::seed_from_u64(5);
        let a = random_params(&mut rng, &LAYERS);
        let b = random_params(&mut rng, &LAYERS);
        let batch = 2;
        let inputs = [
            random_values(&mut rng, batch * LAYERS[0]),
            random_values(&mut rng, batch * LAYERS[0]),
        ];
        let targets = [
            random_values(&mut rng, batch * LAYERS[3]),
            random_values(&mut rng, batch * LAYERS[3]),
        ];
        let steps = [0.5f32, 0.05];

        let joined = Net::<Backend0>::from_lanes(vec![
            a.iter().map(|p| tensor(p)).collect(),
            b.iter().map(|p| tensor(p)).collect(),
        ])
        .unwrap();
        let input: Vec<f32> = inputs.concat();
        let target: Vec<f32> = targets.concat();
        let lanes = joined
            .train(tensor(&input), tensor(&target), tensor(&steps), batch, 2)
            .unwrap()
            .into_lanes();

        for (lane, params) in [a, b].iter().enumerate() {
            let alone = net_from(params)
                .train(
                    tensor(&inputs[lane]),
                    tensor(&targets[lane]),
                    tensor(&steps[lane..lane + 1]),
                    batch,
                    2,
                )
                .unwrap()
                .into_lanes()
                .remove(0);
            for (x, y) in lanes[lane].iter().zip(alone) {
                assert!(max_abs_diff(&to_vec(x.clone()), &to_vec(y)) < 1e-5);
            }
        }
    }

    #[test]
    fn test_malformed_networks_are_rejected() {
        let device = Default::default();
        let odd = vec![Tensor::<Backend0, 1>::zeros([6], &device)];
        assert!(matches!(Net::from_params(odd), Err(Error::UnpairedParameters(1))));

        // Layer 1 expects 4 inputs, layer 0 produces 3.
        let unchained = vec![
            Tensor::<Backend0, 1>::zeros([6], &device),
            Tensor::zeros([3], &device),
            Tensor::zeros([8], &device),
            Tensor::zeros([2], &device),
        ];
        assert!(matches!(
            Net::from_params(unchained),
            Err(Error::LayerMismatch { layer: 1, .. })
        ));

        assert!(matches!(
            Net::<Backend0>::from_lanes(Vec::new()),
            Err(Error::EmptyNetwork)
        ));
    }

    #[test]
    fn test_input_must_fill_batch() {
        let mut rng = StdRng::seed_from_u64(6);
        let net = net_from(&random_params(&mut rng, &LAYERS));
        let input = random_values(&mut rng, 2 * LAYERS[0] + 1);
        assert!(matches!(
            net.apply(tensor(&input), 2),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
