//! Nested-input adapter.
//!
//! A region entered inside another region hands its inputs to the parent
//! as ordinary saved values: each tracked input goes through an identity
//! operation whose save is intercepted like any other. Recomputing the
//! child later then only requires recomputing the parent and reading the
//! inputs back from the parent's recomputed values.

use recomp_core::{Context, Tensor};
use tracing::trace;

use crate::error::{CheckpointError, CheckpointResult};
use crate::frame::{DelegatedInput, Frame};

fn is_tracked(ctx: &Context, input: &Tensor) -> bool {
    ctx.is_grad_enabled() && input.requires_grad()
}

/// Passes `inputs` through the save-producing identity.
///
/// Tracked inputs come back as identity outputs; the others are detached so
/// that the adapter never turns tracking on.
pub(crate) fn save_inputs(ctx: &Context, inputs: &[Tensor]) -> CheckpointResult<Vec<Tensor>> {
    inputs
        .iter()
        .map(|input| {
            if is_tracked(ctx, input) {
                Ok(ctx.identity(input)?)
            } else {
                Ok(input.detach())
            }
        })
        .collect()
}

/// Saves `inputs` onto `parent` and records where they landed.
///
/// Returns the adapted inputs for the child's forward together with the
/// child's delegated provenance. The parent's positions are tagged as child
/// positions so that its replay keeps them graph-connected.
pub(crate) fn save_to_parent(
    ctx: &Context,
    parent: &Frame,
    inputs: &[Tensor],
) -> CheckpointResult<(Vec<Tensor>, Vec<DelegatedInput>)> {
    let start = parent.holder_count();
    let adapted = save_inputs(ctx, inputs)?;
    let end = parent.holder_count();

    let tracked = inputs.iter().filter(|input| is_tracked(ctx, input)).count();
    if end - start != tracked {
        return Err(CheckpointError::AdapterMismatch {
            expected: tracked,
            observed: end - start,
        });
    }
    parent.mark_child_positions(start..end);
    trace!(parent = %parent.id(), start, end, "saved nested inputs on parent");

    let mut next = start;
    let delegated = inputs
        .iter()
        .zip(&adapted)
        .map(|(input, adapted)| {
            if is_tracked(ctx, input) {
                let position = next;
                next += 1;
                DelegatedInput::Saved { position }
            } else {
                DelegatedInput::Untracked(adapted.clone())
            }
        })
        .collect();
    Ok((adapted, delegated))
}
