//! Saved-value interceptors driving discard and recomputation.
//!
//! - [`OuterInterceptor`] is active while a region body runs for the first
//!   time. It stores a [`HeldValue`] (a holder plus a snapshot of the active
//!   frames) instead of the value.
//! - [`InnerInterceptor`] is active while a frame's body is replayed. It
//!   publishes each replayed save into the frame's recomputed values under
//!   the handle of the holder recorded at the same position.
//!
//! Restoring a [`HeldValue`] first recomputes, outermost first, every frame
//! of its snapshot that has not been recomputed for the current backward
//! invocation, then consumes the published value.

use std::any::Any;
use std::rc::Rc;

use recomp_core::{BackwardId, Context, EngineError, EngineResult, PackedValue, RetainedValue, SavedValueHooks, Tensor};
use tracing::{debug, trace};

use crate::error::{CheckpointError, CheckpointResult};
use crate::frame::Frame;
use crate::identity::Holder;
use crate::stack::RegionStacks;

// ============================================================================
// Outer interceptor
// ============================================================================

/// Discards saved values while a region body runs for the first time.
#[derive(Debug, Default)]
pub struct OuterInterceptor;

impl SavedValueHooks for OuterInterceptor {
    fn pack(&self, ctx: &Context, _value: &Tensor) -> EngineResult<Rc<dyn PackedValue>> {
        let frames = RegionStacks::of(ctx).current_frames();
        let top = frames
            .last()
            .ok_or_else(|| EngineError::from(CheckpointError::NoActiveFrame))?;
        let holder = Holder::new();
        let position = top.record_holder(&holder);
        trace!(frame = %top.id(), position, depth = frames.len(), "discarding saved value");
        Ok(Rc::new(HeldValue { holder, frames }))
    }
}

/// What a checkpointed graph stores in place of a saved value.
pub struct HeldValue {
    holder: Rc<Holder>,
    frames: Vec<Rc<Frame>>,
}

impl HeldValue {
    /// Returns the holder identifying the discarded value.
    pub fn holder(&self) -> &Holder {
        &self.holder
    }

    /// Frames that were active when the value was saved, outermost first.
    pub fn frames(&self) -> &[Rc<Frame>] {
        &self.frames
    }
}

impl PackedValue for HeldValue {
    fn unpack(&self, ctx: &Context) -> EngineResult<Tensor> {
        restore(ctx, &self.holder, &self.frames).map_err(EngineError::from)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Recomputes the frames behind `holder` if needed and consumes its value.
///
/// Outside of a backward a fresh identifier is used for this one restore,
/// and the state recorded under it is dropped again before returning.
pub(crate) fn restore(ctx: &Context, holder: &Holder, frames: &[Rc<Frame>]) -> CheckpointResult<Tensor> {
    match ctx.current_backward_id() {
        Some(gid) => restore_for(ctx, holder, frames, gid),
        None => {
            let gid = BackwardId::fresh();
            trace!(backward = %gid, "restoring outside of a backward");
            let result = restore_for(ctx, holder, frames, gid);
            for frame in frames {
                frame.forget(gid);
            }
            result
        }
    }
}

fn restore_for(ctx: &Context, holder: &Holder, frames: &[Rc<Frame>], gid: BackwardId) -> CheckpointResult<Tensor> {
    for (index, frame) in frames.iter().enumerate() {
        if frame.is_recomputed(gid) {
            continue;
        }
        let parent = index.checked_sub(1).map(|p| frames[p].as_ref());
        recompute_frame(ctx, frame, parent, gid)?;
    }

    let top = frames.last().ok_or(CheckpointError::NoActiveFrame)?;
    let handle = holder
        .handle()
        .ok_or(CheckpointError::DoubleConsumption { frame: top.id() })?;
    let value = top
        .take(gid, &handle)
        .ok_or(CheckpointError::MissingRecomputedValue { frame: top.id() })?;
    holder.clear();
    Ok(value)
}

fn recompute_frame(ctx: &Context, frame: &Rc<Frame>, parent: Option<&Frame>, gid: BackwardId) -> CheckpointResult<()> {
    let args = frame.resolve_inputs(parent, gid)?;
    debug!(frame = %frame.id(), backward = %gid, inputs = args.len(), "recomputing checkpoint region");

    // Pass state of a running backward is dropped when that backward ends.
    if ctx.current_backward_id() == Some(gid) {
        let weak = Rc::downgrade(frame);
        ctx.on_backward_exit(move |gid| {
            if let Some(frame) = weak.upgrade() {
                frame.forget(gid);
            }
        });
    }

    let stacks = RegionStacks::of(ctx);
    let outcome = {
        let _entry = stacks.push_recompute_entry();
        let _hooks = ctx.saved_value_hooks(Rc::new(InnerInterceptor {
            frame: Rc::clone(frame),
            gid,
        }));
        let _grad = ctx.enable_grad();
        frame.run_recompute(ctx, &args)
    };

    match outcome {
        Ok(()) => trace!(frame = %frame.id(), "recomputation finished"),
        Err(err) if err.is_stop_for(frame.id()) => {
            debug!(frame = %frame.id(), "recomputation stopped early")
        }
        Err(err) => return Err(err),
    }
    let pruned = frame.prune(gid);
    if pruned > 0 {
        trace!(frame = %frame.id(), pruned, "dropped values of released holders");
    }
    frame.mark_recomputed(gid);
    Ok(())
}

// ============================================================================
// Inner interceptor
// ============================================================================

/// Publishes replayed saves of one frame for one backward invocation.
pub(crate) struct InnerInterceptor {
    frame: Rc<Frame>,
    gid: BackwardId,
}

impl SavedValueHooks for InnerInterceptor {
    fn pack(&self, ctx: &Context, value: &Tensor) -> EngineResult<Rc<dyn PackedValue>> {
        let frame = &self.frame;
        let (position, replayed) = frame.advance(self.gid);

        // Positions whose holder died were consumed for good.
        if let Some(holder) = frame.holder_at(position) {
            let handle = holder.handle_or_refresh();
            let published = if frame.is_child_position(position) {
                value.clone()
            } else {
                value.detach()
            };
            trace!(frame = %frame.id(), position, "publishing recomputed value");
            frame.publish(self.gid, &handle, published);
        }

        if RegionStacks::of(ctx).early_stop() && replayed == frame.holder_count() {
            return Err(CheckpointError::StopRecomputation { frame: frame.id() }.into());
        }
        Ok(Rc::new(RetainedValue::new(value.detach())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{InputProvenance, RecomputeFn};
    use approx::assert_relative_eq;
    use std::cell::{Cell, RefCell};

    /// A frame whose body is `sin(x)` and whose recompute calls are counted.
    fn sin_frame(x: &Tensor, calls: Rc<Cell<usize>>) -> Rc<Frame> {
        let recompute: RecomputeFn = Rc::new(move |ctx: &Context, args: &[Tensor]| {
            calls.set(calls.get() + 1);
            ctx.sin(&args[0])?;
            Ok(())
        });
        Frame::new(recompute, InputProvenance::Owned(vec![x.clone()]))
    }

    #[test]
    fn test_outer_pack_requires_active_frame() {
        let ctx = Context::seeded(0);
        let err = OuterInterceptor.pack(&ctx, &Tensor::new(1.0)).err().unwrap();
        assert!(matches!(
            CheckpointError::from(err),
            CheckpointError::NoActiveFrame
        ));
    }

    #[test]
    fn test_outer_pack_stores_no_value() {
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.3);
        let frame = sin_frame(&x, Rc::new(Cell::new(0)));
        let stacks = RegionStacks::of(&ctx);
        let _guard = stacks.push_frame(Rc::clone(&frame));

        let packed = OuterInterceptor.pack(&ctx, &x).unwrap();
        let held = packed.as_any().downcast_ref::<HeldValue>().unwrap();
        assert!(held.holder().is_armed());
        assert_eq!(held.frames().len(), 1);
        assert_eq!(frame.holder_count(), 1);
        assert!(packed.as_any().downcast_ref::<RetainedValue>().is_none());
    }

    #[test]
    fn test_restore_recomputes_and_consumes() {
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.3);
        let calls = Rc::new(Cell::new(0));
        let frame = sin_frame(&x, calls.clone());
        let stacks = RegionStacks::of(&ctx);

        let packed = {
            let _guard = stacks.push_frame(Rc::clone(&frame));
            OuterInterceptor.pack(&ctx, &x).unwrap()
        };

        let restored = packed.unpack(&ctx).unwrap();
        assert_eq!(restored.value(), 0.3);
        assert!(!restored.requires_grad());
        assert_eq!(calls.get(), 1);

        // Outside a backward every restore uses its own identifier, which
        // is forgotten afterwards.
        assert_eq!(frame.tracked_passes(), 0);
        let again = packed.unpack(&ctx).unwrap();
        assert_eq!(again.value(), 0.3);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_restore_twice_in_one_pass_fails() {
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.3);
        let frame = sin_frame(&x, Rc::new(Cell::new(0)));
        let stacks = RegionStacks::of(&ctx);
        let holder = Holder::new();
        {
            let _guard = stacks.push_frame(Rc::clone(&frame));
            frame.record_holder(&holder);
        }

        let gid = BackwardId::fresh();
        let frames = vec![Rc::clone(&frame)];
        restore_for(&ctx, &holder, &frames, gid).unwrap();
        let err = restore_for(&ctx, &holder, &frames, gid).unwrap_err();
        assert!(matches!(err, CheckpointError::DoubleConsumption { .. }));
        assert_eq!(frame.pending_values(gid), 0);
    }

    #[test]
    fn test_diverging_replay_is_reported() {
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.3);
        // The replay performs no saves at all.
        let recompute: RecomputeFn = Rc::new(|_: &Context, _: &[Tensor]| Ok(()));
        let frame = Frame::new(recompute, InputProvenance::Owned(vec![x]));
        let holder = Holder::new();
        frame.record_holder(&holder);

        let frames = vec![Rc::clone(&frame)];
        let err = restore_for(&ctx, &holder, &frames, BackwardId::fresh()).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingRecomputedValue { .. }));
    }

    #[test]
    fn test_replay_prunes_values_of_released_holders() {
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.3);
        let kept = Holder::new();
        let released = Rc::new(RefCell::new(Some(Holder::new())));

        // The second holder goes away in the middle of the replay, after its
        // value was published.
        let slot = Rc::clone(&released);
        let recompute: RecomputeFn = Rc::new(move |ctx: &Context, args: &[Tensor]| {
            ctx.sin(&args[0])?;
            ctx.sin(&args[0])?;
            slot.borrow_mut().take();
            Ok(())
        });
        let frame = Frame::new(recompute, InputProvenance::Owned(vec![x]));
        frame.record_holder(&kept);
        if let Some(holder) = released.borrow().as_ref() {
            frame.record_holder(holder);
        }

        let gid = BackwardId::fresh();
        recompute_frame(&ctx, &frame, None, gid).unwrap();
        assert!(released.borrow().is_none());
        assert_eq!(frame.pending_values(gid), 1);
        assert!(frame.take(gid, &kept.handle().unwrap()).is_some());
    }

    #[test]
    fn test_backward_end_drops_pass_state() {
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.3);
        let frame = sin_frame(&x, Rc::new(Cell::new(0)));
        let stacks = RegionStacks::of(&ctx);
        let y = {
            let _guard = stacks.push_frame(Rc::clone(&frame));
            let _hooks = ctx.saved_value_hooks(Rc::new(OuterInterceptor));
            ctx.sin(&x).unwrap()
        };

        ctx.backward(&y, true).unwrap();
        assert_eq!(frame.tracked_passes(), 0);
        assert_eq!(frame.cached_values(), 0);
        assert_relative_eq!(x.grad().unwrap(), 0.3_f64.cos(), epsilon = 1e-15);
    }

    #[test]
    fn test_inner_pack_skips_dead_and_out_of_range_positions() {
        let ctx = Context::seeded(0);
        let frame = sin_frame(&Tensor::leaf(1.0), Rc::new(Cell::new(0)));
        let dead = Holder::new();
        frame.record_holder(&dead);
        drop(dead);

        let gid = BackwardId::fresh();
        let inner = InnerInterceptor {
            frame: Rc::clone(&frame),
            gid,
        };
        let x = Tensor::leaf(2.0);
        inner.pack(&ctx, &x).unwrap();
        inner.pack(&ctx, &x).unwrap();
        assert_eq!(frame.pending_values(gid), 0);
    }

    #[test]
    fn test_inner_pack_detaches_unless_child_position() {
        let ctx = Context::seeded(0);
        let frame = sin_frame(&Tensor::leaf(1.0), Rc::new(Cell::new(0)));
        let own = Holder::new();
        let child = Holder::new();
        frame.record_holder(&own);
        let child_position = frame.record_holder(&child);
        frame.mark_child_positions(child_position..child_position + 1);

        let gid = BackwardId::fresh();
        let inner = InnerInterceptor {
            frame: Rc::clone(&frame),
            gid,
        };
        let x = Tensor::leaf(2.0);
        let y = ctx.sin(&x).unwrap();

        let packed = inner.pack(&ctx, &y).unwrap();
        inner.pack(&ctx, &y).unwrap();
        // The graph being replayed always receives a detached copy.
        assert!(!packed.unpack(&ctx).unwrap().requires_grad());

        let own_value = frame.take(gid, &own.handle().unwrap()).unwrap();
        let child_value = frame.take(gid, &child.handle().unwrap()).unwrap();
        assert!(!own_value.requires_grad());
        assert!(child_value.ptr_eq(&y));
    }

    #[test]
    fn test_inner_pack_refreshes_consumed_handle() {
        let ctx = Context::seeded(0);
        let frame = sin_frame(&Tensor::leaf(1.0), Rc::new(Cell::new(0)));
        let holder = Holder::new();
        frame.record_holder(&holder);
        holder.clear();

        let gid = BackwardId::fresh();
        let inner = InnerInterceptor {
            frame: Rc::clone(&frame),
            gid,
        };
        inner.pack(&ctx, &Tensor::new(5.0)).unwrap();
        assert!(holder.is_armed());
        assert_eq!(frame.pending_values(gid), 1);
    }

    #[test]
    fn test_inner_pack_signals_early_stop() {
        let ctx = Context::seeded(0);
        let frame = sin_frame(&Tensor::leaf(1.0), Rc::new(Cell::new(0)));
        let holder = Holder::new();
        frame.record_holder(&holder);

        let inner = InnerInterceptor {
            frame: Rc::clone(&frame),
            gid: BackwardId::fresh(),
        };
        let _early = crate::stack::set_early_stop(&ctx, true);
        let err = inner.pack(&ctx, &Tensor::new(1.0)).err().unwrap();
        let err = CheckpointError::from(err);
        assert!(err.is_stop_for(frame.id()));
    }
}
