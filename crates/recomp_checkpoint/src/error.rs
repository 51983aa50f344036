//! Error types for activation recomputation.

use recomp_core::EngineError;
use thiserror::Error;

use crate::frame::FrameId;

/// Errors that can occur while checkpointing or recomputing a region.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A discarded value was restored twice without a recomputation in
    /// between.
    #[error(
        "Saved value of frame {frame} was already consumed in this backward; \
         restore each saved value only once per backward"
    )]
    DoubleConsumption {
        /// Frame that owns the saved value
        frame: FrameId,
    },

    /// Recomputation finished without producing the requested value.
    #[error(
        "Recomputation of frame {frame} did not produce the requested saved value; \
         the region must perform the same saves in the same order on every run"
    )]
    MissingRecomputedValue {
        /// Frame whose recomputation diverged
        frame: FrameId,
    },

    /// Internal signal ending a recomputation once every recorded position
    /// has been produced. Caught by the driver that started the frame.
    #[error("Recomputation of frame {frame} stopped early")]
    StopRecomputation {
        /// Frame whose recomputation is being stopped
        frame: FrameId,
    },

    /// A save was intercepted with no checkpoint region active.
    #[error("Saved value intercepted outside of any checkpoint region")]
    NoActiveFrame,

    /// A nested frame could not find its input in the parent's recomputed
    /// values.
    #[error("Input at position {position} of parent frame {parent} is unavailable for recomputation")]
    ParentInputUnavailable {
        /// Parent frame
        parent: FrameId,
        /// Position in the parent's saved-value list
        position: usize,
    },

    /// The nested-input adapter observed a different number of saves than
    /// tracked inputs.
    #[error("Nested input adapter expected {expected} saves but observed {observed}")]
    AdapterMismatch {
        /// Number of tracked inputs
        expected: usize,
        /// Number of saves recorded on the parent
        observed: usize,
    },

    /// Invalid segment count for sequential checkpointing.
    #[error("Cannot split {stages} stages into {segments} segments")]
    InvalidSegments {
        /// Number of stages
        stages: usize,
        /// Requested number of segments
        segments: usize,
    },

    /// A replayed region returned fewer outputs than the original run.
    #[error("Replayed region returned no output at index {index}")]
    MissingOutput {
        /// Output index that is missing
        index: usize,
    },

    /// Error raised by the differentiation engine.
    #[error(transparent)]
    Engine(EngineError),
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

impl From<EngineError> for CheckpointError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Extension(inner) => match inner.downcast::<CheckpointError>() {
                Ok(checkpoint) => *checkpoint,
                Err(other) => CheckpointError::Engine(EngineError::Extension(other)),
            },
            other => CheckpointError::Engine(other),
        }
    }
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Engine(inner) => inner,
            other => EngineError::extension(other),
        }
    }
}

impl CheckpointError {
    /// Returns true for the early-stop signal addressed to `frame`.
    pub(crate) fn is_stop_for(&self, frame: FrameId) -> bool {
        matches!(self, CheckpointError::StopRecomputation { frame: target } if *target == frame)
    }
}
