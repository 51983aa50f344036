//! Checkpointing a chain of stages in segments.
//!
//! The chain is cut into `segments` contiguous groups of
//! `stages / segments` stages. Every group but the last runs as one
//! checkpointed region; the last group, together with any remainder, runs
//! normally since its values are needed right away by the backward.

use std::rc::Rc;

use recomp_core::{Context, Tensor};
use tracing::debug;

use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, CheckpointResult};
use crate::region::checkpoint;

/// One stage of a sequential model.
pub type Stage = Rc<dyn Fn(&Context, &[Tensor]) -> CheckpointResult<Vec<Tensor>>>;

fn run_stages(ctx: &Context, stages: &[Stage], inputs: &[Tensor]) -> CheckpointResult<Vec<Tensor>> {
    let mut values = inputs.to_vec();
    for stage in stages {
        values = stage(ctx, &values)?;
    }
    Ok(values)
}

/// Runs `stages` in order, checkpointing all but the last segment.
///
/// # Errors
///
/// [`CheckpointError::InvalidSegments`] if `segments` is zero or there are
/// no stages, and any error of the stages themselves.
///
/// # Example
///
/// ```rust
/// use std::rc::Rc;
/// use recomp_checkpoint::{checkpoint_sequential, CheckpointConfig, Stage};
/// use recomp_core::{Context, Tensor};
///
/// let ctx = Context::seeded(0);
/// let stage: Stage = Rc::new(|ctx: &Context, x: &[Tensor]| Ok(vec![ctx.sin(&x[0])?]));
/// let stages = vec![stage; 4];
///
/// let x = Tensor::leaf(0.5);
/// let out = checkpoint_sequential(&ctx, &CheckpointConfig::default(), &stages, 2, &[x.clone()]).unwrap();
/// ctx.backward(&out[0], false).unwrap();
/// assert!(x.grad().is_some());
/// ```
pub fn checkpoint_sequential(
    ctx: &Context,
    config: &CheckpointConfig,
    stages: &[Stage],
    segments: usize,
    inputs: &[Tensor],
) -> CheckpointResult<Vec<Tensor>> {
    if segments == 0 || stages.is_empty() {
        return Err(CheckpointError::InvalidSegments {
            stages: stages.len(),
            segments,
        });
    }

    let segment_size = stages.len() / segments;
    let checkpointed = segment_size * (segments - 1);
    debug!(stages = stages.len(), segments, segment_size, "running sequential checkpoint");

    let mut values = inputs.to_vec();
    for group in stages[..checkpointed].chunks(segment_size.max(1)) {
        let group: Vec<Stage> = group.to_vec();
        values = checkpoint(ctx, config, move |ctx, x| run_stages(ctx, &group, x), &values)?;
    }
    run_stages(ctx, &stages[checkpointed..], &values)
}
