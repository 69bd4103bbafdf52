#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, Tensor};
    use sgdstore::cells::{MemoryBlock, MemoryBlockConfig};
    use sgdstore::error::{DecodeError, Error};
    use sgdstore::rnn::BlockState;
    use sgdstore::serialize::{decode_block, SavedBlock};

    type Backend = NdArray<f32>;

    fn create_test_block() -> MemoryBlock<Backend> {
        let device = Default::default();
        MemoryBlockConfig::new(7, vec![4, 9, 3])
            .with_train_batch(3)
            .with_query_batch(2)
            .with_steps(2)
            .init(&device)
            .unwrap()
    }

    #[test]
    fn test_round_trip_preserves_behaviour() {
        let device = Default::default();
        let block = create_test_block();
        let bytes = block.to_bytes().unwrap();
        let loaded = MemoryBlock::<Backend>::from_bytes(&bytes, &device).unwrap();

        assert_eq!(loaded.input_size(), 7);
        assert_eq!(loaded.layer_sizes(), vec![4, 9, 3]);
        assert_eq!(loaded.output_size(), 6);
        assert_eq!(loaded.steps(), 2);

        let input = Tensor::<Backend, 2>::random([3, 7], Distribution::Uniform(-1.0, 1.0), &device);
        let (expected, expected_state) =
            block.evaluate(&block.start_state(3), input.clone()).unwrap();
        let (actual, actual_state) = loaded.evaluate(&loaded.start_state(3), input).unwrap();

        let diff = (actual - expected).abs().max().into_scalar();
        assert!(diff < 1e-6);
        assert_eq!(actual_state.present(), expected_state.present());
    }

    #[test]
    fn test_decode_block_dispatches_on_kind() {
        let bytes = create_test_block().to_bytes().unwrap();
        let saved = decode_block::<Backend>(&bytes, &Default::default()).unwrap();
        assert_eq!(saved.kind(), "sgdstore::MemoryBlock");
        match saved {
            SavedBlock::Memory(block) => assert_eq!(block.steps(), 2),
        }
    }

    #[test]
    fn test_truncated_bytes_fail_to_decode() {
        let bytes = create_test_block().to_bytes().unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        let err = MemoryBlock::<Backend>::from_bytes(truncated, &Default::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Decode {
                source: DecodeError::Bincode(_),
                ..
            }
        ));
        assert!(err.to_string().starts_with("while decoding"));
    }
}
