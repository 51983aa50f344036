//! Reentrant checkpointing.
//!
//! The region runs once without recording. Each output is then attached to
//! a replay node whose inputs are the region inputs; when the backward
//! reaches that node it reruns the region from its saved inputs with grad
//! enabled and differentiates the replayed output with the incoming
//! gradient as seed.
//!
//! Unlike the nestable engine this variant runs a whole backward of its own
//! inside the outer one, and it replays the region once per output that
//! receives a gradient.

use std::rc::Rc;

use recomp_core::{Context, CustomBackward, EngineError, EngineResult, GradOptions, SavedTensors, Tensor};
use tracing::{trace, warn};

use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, CheckpointResult};
use crate::preserve::CapturedState;

/// Name of the node each reentrant output is attached to.
pub const REPLAY_NODE: &str = "CheckpointReplay";

/// Checkpoints `f` with the reentrant variant.
///
/// Outputs are returned with the same values `f` produced. They are tracked
/// if grad is enabled and at least one input requires grad.
pub fn checkpoint_reentrant<F>(
    ctx: &Context,
    config: &CheckpointConfig,
    f: F,
    inputs: &[Tensor],
) -> CheckpointResult<Vec<Tensor>>
where
    F: Fn(&Context, &[Tensor]) -> CheckpointResult<Vec<Tensor>> + 'static,
{
    if !inputs.iter().any(Tensor::requires_grad) {
        warn!("None of the checkpoint inputs require grad; the outputs will not be tracked");
    }

    let captured = Rc::new(CapturedState::capture(ctx, config.preserve_rng_state()));
    let outputs = {
        let _no_grad = ctx.no_grad();
        f(ctx, inputs)?
    };

    let f = Rc::new(f);
    let tracked: Rc<[bool]> = inputs.iter().map(Tensor::requires_grad).collect();
    outputs
        .iter()
        .enumerate()
        .map(|(index, output)| {
            let backward = replay_backward(Rc::clone(&f), Rc::clone(&captured), Rc::clone(&tracked), index);
            Ok(ctx.custom(REPLAY_NODE, inputs, output.value(), inputs, backward)?)
        })
        .collect()
}

fn replay_backward<F>(f: Rc<F>, captured: Rc<CapturedState>, tracked: Rc<[bool]>, index: usize) -> CustomBackward
where
    F: Fn(&Context, &[Tensor]) -> CheckpointResult<Vec<Tensor>> + 'static,
{
    Rc::new(move |ctx: &Context, saved: &SavedTensors<'_>, grad: f64| -> EngineResult<Vec<f64>> {
        let leaves = (0..saved.len())
            .map(|i| {
                let value = saved.unpack(ctx, i)?.value();
                Ok(if tracked[i] {
                    Tensor::leaf(value)
                } else {
                    Tensor::new(value)
                })
            })
            .collect::<EngineResult<Vec<Tensor>>>()?;

        trace!(output = index, inputs = leaves.len(), "replaying reentrant checkpoint");
        let replayed = captured
            .replay(ctx, || {
                let _grad = ctx.enable_grad();
                f(ctx, &leaves)
            })
            .map_err(EngineError::from)?;
        let output = replayed
            .get(index)
            .cloned()
            .ok_or_else(|| EngineError::from(CheckpointError::MissingOutput { index }))?;

        if !output.requires_grad() {
            return Ok(vec![0.0; leaves.len()]);
        }
        let options = GradOptions::default().with_allow_unused(true);
        let grads = ctx.grad_with(&[output], &[grad], &leaves, options)?;
        Ok(grads.into_iter().map(|g| g.unwrap_or(0.0)).collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    fn body(ctx: &Context, x: &[Tensor]) -> CheckpointResult<Vec<Tensor>> {
        let p = ctx.mul(&x[0], &x[1])?;
        Ok(vec![ctx.tanh(&p)?, ctx.cos(&x[0])?])
    }

    #[test]
    fn test_outputs_are_attached_to_replay_nodes() {
        let ctx = Context::seeded(0);
        let x = [Tensor::leaf(0.3), Tensor::leaf(-0.8)];
        let out = checkpoint_reentrant(&ctx, &CheckpointConfig::default(), body, &x).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(Tensor::requires_grad));
        assert_eq!(out[0].saved_len(), 2);
        assert_relative_eq!(out[0].value(), (0.3_f64 * -0.8).tanh(), epsilon = 1e-15);
    }

    #[test]
    fn test_gradients_match_direct_evaluation() {
        let ctx = Context::seeded(0);
        let x = [Tensor::leaf(0.3), Tensor::leaf(-0.8)];
        let out = checkpoint_reentrant(&ctx, &CheckpointConfig::default(), body, &x).unwrap();
        let total = ctx.add(&out[0], &out[1]).unwrap();
        let grads = ctx.grad(&[total], &x, false).unwrap();

        let direct = [Tensor::leaf(0.3), Tensor::leaf(-0.8)];
        let reference = body(&ctx, &direct).unwrap();
        let total = ctx.add(&reference[0], &reference[1]).unwrap();
        let expected = ctx.grad(&[total], &direct, false).unwrap();

        assert_relative_eq!(grads[0], expected[0], epsilon = 1e-12);
        assert_relative_eq!(grads[1], expected[1], epsilon = 1e-12);
    }

    #[test]
    fn test_constant_inputs_get_no_gradient() {
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.3);
        let c = Tensor::new(2.0);
        let out = checkpoint_reentrant(&ctx, &CheckpointConfig::default(), body, &[x.clone(), c]).unwrap();
        ctx.backward(&out[0], false).unwrap();
        let expected = 2.0 * (1.0 - (0.6_f64).tanh().powi(2));
        assert_relative_eq!(x.grad().unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_untracked_inputs_give_untracked_outputs() {
        let ctx = Context::seeded(0);
        let out = checkpoint_reentrant(
            &ctx,
            &CheckpointConfig::default(),
            body,
            &[Tensor::new(0.3), Tensor::new(0.2)],
        )
        .unwrap();
        assert!(!out[0].requires_grad());
    }

    #[test]
    fn test_replay_runs_once_per_output_backward() {
        let ctx = Context::seeded(0);
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        let x = Tensor::leaf(1.2);
        let out = checkpoint_reentrant(
            &ctx,
            &CheckpointConfig::default(),
            move |ctx: &Context, x: &[Tensor]| {
                counter.set(counter.get() + 1);
                Ok(vec![ctx.sin(&x[0])?])
            },
            &[x.clone()],
        )
        .unwrap();
        assert_eq!(runs.get(), 1);

        ctx.backward(&out[0], true).unwrap();
        ctx.backward(&out[0], false).unwrap();
        assert_eq!(runs.get(), 3);
        assert_relative_eq!(x.grad().unwrap(), 2.0 * 1.2_f64.cos(), epsilon = 1e-12);
    }

    #[test]
    fn test_rng_is_replayed() {
        let ctx = Context::seeded(3);
        let x = Tensor::leaf(2.0);
        let out = checkpoint_reentrant(
            &ctx,
            &CheckpointConfig::default(),
            |ctx: &Context, x: &[Tensor]| {
                let j = ctx.jitter(&x[0], 0.3)?;
                Ok(vec![ctx.mul(&j, &j)?])
            },
            &[x.clone()],
        )
        .unwrap();
        // out = (x * k)^2 for the drawn factor k, so d out / dx = 2 out / x.
        ctx.backward(&out[0], false).unwrap();
        assert_relative_eq!(x.grad().unwrap(), 2.0 * out[0].value() / 2.0, epsilon = 1e-12);
    }
}
