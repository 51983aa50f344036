//! Nestable checkpointing.
//!
//! Entering a region pushes a [`Frame`] onto the top region-stack entry and
//! installs the [`OuterInterceptor`] for the duration of the forward, so
//! every value the body saves is discarded. How the frame gets its inputs
//! back later depends on where the region was entered:
//!
//! | Entered | Inputs |
//! |---------|--------|
//! | inside another region | saved on the parent through the adapter |
//! | at the top level during a recomputation | saved through the adapter *and* kept on the frame |
//! | at the top level | kept on the frame |
//!
//! The middle case mirrors how the region was entered when its ancestor
//! first ran: its inputs were saves of that ancestor then, so they have to
//! be saves again to keep the ancestor's replay positions aligned.

use std::rc::Rc;

use recomp_core::{Context, Tensor};
use tracing::debug;

use crate::adapter;
use crate::config::CheckpointConfig;
use crate::error::CheckpointResult;
use crate::frame::{Frame, InputProvenance, RecomputeFn};
use crate::interceptor::OuterInterceptor;
use crate::preserve::CapturedState;
use crate::stack::RegionStacks;

/// Runs `forward` as a checkpointed region.
///
/// `recompute` must perform the same saves in the same order as `forward`
/// when given the same inputs; it is invoked with grad enabled whenever a
/// discarded value is needed. Returns whatever `forward` returns.
///
/// # Errors
///
/// Propagates errors of `forward`, and
/// [`CheckpointError::AdapterMismatch`](crate::CheckpointError::AdapterMismatch)
/// if the inputs of a nested region could not be saved on its parent.
pub fn checkpoint_with_recompute<R, F>(
    ctx: &Context,
    forward: F,
    recompute: RecomputeFn,
    inputs: &[Tensor],
) -> CheckpointResult<R>
where
    F: FnOnce(&Context, &[Tensor]) -> CheckpointResult<R>,
{
    let stacks = RegionStacks::of(ctx);
    let (args, provenance) = match stacks.innermost() {
        Some(parent) => {
            let (args, delegated) = adapter::save_to_parent(ctx, &parent, inputs)?;
            (args, InputProvenance::Delegated(delegated))
        }
        None if stacks.is_recomputing() => {
            let args = adapter::save_inputs(ctx, inputs)?;
            (args.clone(), InputProvenance::Owned(args))
        }
        None => (inputs.to_vec(), InputProvenance::Owned(inputs.to_vec())),
    };

    let frame = Frame::new(recompute, provenance);
    debug!(
        frame = %frame.id(),
        delegated = frame.is_delegated(),
        recomputing = stacks.is_recomputing(),
        inputs = args.len(),
        "entering checkpoint region"
    );

    let _frame = stacks.push_frame(Rc::clone(&frame));
    let _hooks = ctx.saved_value_hooks(Rc::new(OuterInterceptor));
    forward(ctx, &args)
}

/// Checkpoints `f` with the nestable engine, using `f` for both the forward
/// and the replay.
pub fn checkpoint_nestable<F>(
    ctx: &Context,
    config: &CheckpointConfig,
    f: F,
    inputs: &[Tensor],
) -> CheckpointResult<Vec<Tensor>>
where
    F: Fn(&Context, &[Tensor]) -> CheckpointResult<Vec<Tensor>> + 'static,
{
    let f = Rc::new(f);
    let captured = CapturedState::capture(ctx, config.preserve_rng_state());
    let body = Rc::clone(&f);
    let recompute: RecomputeFn = Rc::new(move |ctx: &Context, args: &[Tensor]| {
        captured.replay(ctx, || body(ctx, args)).map(drop)
    });
    checkpoint_with_recompute(ctx, |ctx, args| f(ctx, args), recompute, inputs)
}
