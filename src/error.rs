//! Error types shared by the network, state and block modules.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while building or evaluating a memory cell.
///
/// All variants describe caller mistakes (wrong shapes, wrong lane sets,
/// invalid configuration, corrupt saved data). None of them are transient.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{what}: expected {expected} values, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{what}: {actual} values is not a multiple of {unit}")]
    NotMultiple {
        what: &'static str,
        unit: usize,
        actual: usize,
    },

    #[error("network parameters must come in weight/bias pairs, got {0} tensors")]
    UnpairedParameters(usize),

    #[error("layer {layer} takes {expected} inputs but the previous layer produces {actual}")]
    LayerMismatch {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("lane {lane} does not match the network layout of lane 0")]
    LaneMismatch { lane: usize },

    #[error("network cannot be empty")]
    EmptyNetwork,

    #[error("batch size must be positive")]
    InvalidBatchSize,

    #[error("no lanes are present")]
    NoPresentLanes,

    #[error("present map has width {actual}, expected {expected}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("lane {0} is not present in the state")]
    LaneAbsent(usize),

    #[error("lane {0} is present in both states")]
    LaneConflict(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown activation {0:?}")]
    UnknownActivation(String),

    #[error("unreadable tensor data: {0}")]
    TensorData(String),

    #[error("while encoding {context}: {source}")]
    Encode {
        context: &'static str,
        #[source]
        source: bincode::Error,
    },

    #[error("while decoding {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: DecodeError,
    },
}

/// Failures while reading a saved block back.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error("unknown block kind {0:?}")]
    UnknownKind(String),

    #[error("expected {expected}, got {actual}")]
    Structure { expected: String, actual: String },
}

impl Error {
    pub(crate) fn decode(context: &'static str, source: impl Into<DecodeError>) -> Self {
        Error::Decode {
            context,
            source: source.into(),
        }
    }

    pub(crate) fn structure(
        context: &'static str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Error::Decode {
            context,
            source: DecodeError::Structure {
                expected: expected.into(),
                actual: actual.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_carries_context() {
        let err = Error::structure("memory block", "an even number of tensors", "3 tensors");
        assert_eq!(
            err.to_string(),
            "while decoding memory block: expected an even number of tensors, got 3 tensors"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_encode_error_is_not_a_decode_error() {
        let err = Error::Encode {
            context: "memory block",
            source: Box::new(bincode::ErrorKind::SizeLimit),
        };
        assert!(err.to_string().starts_with("while encoding memory block: "));
        assert!(!matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = Error::ShapeMismatch {
            what: "network input",
            expected: 12,
            actual: 10,
        };
        assert_eq!(err.to_string(), "network input: expected 12 values, got 10");
    }
}
