//! Error types for the differentiation engine.

use thiserror::Error;

use crate::graph::NodeId;

/// Errors that can occur while recording or differentiating a graph.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A node was asked to run backward after a non-retaining backward
    /// already released its saved values.
    #[error(
        "Trying to backward through node {node} a second time after its saved values were freed; \
         pass retain_graph = true on the first backward"
    )]
    GraphReleased {
        /// Identifier of the released node
        node: NodeId,
    },

    /// A backward root neither requires grad nor has a producing node.
    #[error("Tensor does not require grad and has no grad_fn")]
    NoGradFn,

    /// A requested gradient input is not reachable from the outputs.
    #[error("Input {index} was not used in the graph of the outputs")]
    UnusedInput {
        /// Position of the unused input in the request
        index: usize,
    },

    /// A saved slot index is outside the node's saved values.
    #[error("Saved value index {index} is out of range (node has {len} saved values)")]
    SavedIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of saved slots on the node
        len: usize,
    },

    /// A custom backward returned the wrong number of gradients.
    #[error("Custom backward '{name}' returned {got} gradients, expected {expected}")]
    GradientArity {
        /// Name of the custom operation
        name: &'static str,
        /// Number of inputs of the operation
        expected: usize,
        /// Number of gradients returned
        got: usize,
    },

    /// Seed gradients do not line up with the outputs.
    #[error("Got {seeds} seed gradients for {outputs} outputs")]
    SeedMismatch {
        /// Number of seeds supplied
        seeds: usize,
        /// Number of outputs supplied
        outputs: usize,
    },

    /// Error raised by a saved-value hook or a custom backward owned by a
    /// higher layer.
    #[error("{0}")]
    Extension(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl EngineError {
    /// Wraps an error from a higher layer so it can cross the engine.
    pub fn extension<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EngineError::Extension(Box::new(error))
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
