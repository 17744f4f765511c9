//! Error types for gradbridge.

use thiserror::Error;

/// Errors that can occur in tensor kernels.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    /// Data length does not match the number of elements implied by a shape.
    #[error("length mismatch: shape {shape:?} needs {expected} elements, got {actual}")]
    LengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// Two operands of an element-wise or matrix operation have incompatible shapes.
    #[error("shape mismatch: {lhs:?} vs {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    /// Operation requires specific tensor rank.
    #[error("expected tensor of rank {expected}, got rank {actual}")]
    RankMismatch { expected: usize, actual: usize },

    /// The element count of a shape does not fit in `usize`.
    #[error("shape {shape:?} has too many elements")]
    ShapeOverflow { shape: Vec<usize> },

    /// Storage for a tensor could not be reserved.
    #[error("cannot allocate storage for {len} elements")]
    AllocationFailed { len: usize },

    /// Linear index out of bounds.
    #[error("index {index} is out of bounds for tensor with {len} elements")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// Errors raised by the autograd engine and the custom-function bridge.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutogradError {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// A custom backward returned the wrong number of gradients.
    #[error("function {function} returned {actual} gradients, expected {expected}")]
    ArityMismatch {
        function: String,
        expected: usize,
        actual: usize,
    },

    /// A scratch-map value was read with the wrong type (or was never written).
    #[error("saved data {key:?} holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Hook removal with a token that is unknown or already removed.
    #[error("no registered hook at position {token}")]
    InvalidHookToken { token: usize },

    /// Tensor-list access beyond its length.
    #[error("index {index} out of range for list of length {len}")]
    OutOfRange { index: usize, len: usize },

    /// An operation needed tensor data but got the undefined sentinel.
    #[error("tensor is undefined")]
    UndefinedTensor,

    /// Hook registration or backward on a tensor outside the graph.
    #[error("tensor does not require grad and does not have a grad_fn")]
    DoesNotRequireGrad,

    /// Implicit gradient requested for a non-scalar root.
    #[error("grad can be implicitly created only for single-element outputs, got {len} elements")]
    NonScalarRoot { len: usize },

    /// Backward reached a node whose saved state was already freed.
    #[error(
        "trying to backward through node {node} a second time; pass retain_graph = true on the first backward"
    )]
    GraphReleased { node: usize },

    /// A gradient does not have the shape of the tensor it belongs to.
    #[error("{origin} produced a gradient of shape {actual:?}, expected {expected:?}")]
    GradShapeMismatch {
        origin: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The autograd context is already borrowed by a running callback.
    #[error("autograd context of {function} is already in use")]
    ContextBusy { function: String },

    /// A foreign callback reported failure.
    #[error("callback failed: {message}")]
    Callback { message: String },
}
