//! Integration tests for state preservation and the checkpoint variants.
//!
//! Covers RNG and precision replay for both variants, reentrant regions
//! inside nestable ones, sequential checkpointing and stack resets.

use std::cell::Cell;
use std::rc::Rc;

use approx::assert_relative_eq;
use recomp_checkpoint::{
    checkpoint, checkpoint_sequential, reset_region_stacks, set_early_stop, CheckpointConfig, CheckpointError,
    CheckpointResult, RegionStacks, Stage,
};
use recomp_core::{Context, Precision, Tensor};

fn noisy_square(ctx: &Context, x: &[Tensor]) -> CheckpointResult<Vec<Tensor>> {
    let j = ctx.jitter(&x[0], 0.3)?;
    Ok(vec![ctx.mul(&j, &j)?])
}

/// Gradient of a jittered square and its analytic value `2 * out / x`.
fn jitter_gradient(config: CheckpointConfig) -> (f64, f64) {
    let ctx = Context::seeded(42);
    let x = Tensor::leaf(1.3);
    let out = checkpoint(&ctx, &config, noisy_square, &[x.clone()]).unwrap();
    // Advance the RNG between forward and backward.
    let _ = ctx.normal();
    ctx.backward(&out[0], false).unwrap();
    (x.grad().unwrap(), 2.0 * out[0].value() / 1.3)
}

// ============================================================================
// RNG Preservation Tests
// ============================================================================

#[test]
fn test_nestable_replay_repeats_random_draws() {
    let (grad, expected) = jitter_gradient(CheckpointConfig::default());
    assert_relative_eq!(grad, expected, epsilon = 1e-12);
}

#[test]
fn test_reentrant_replay_repeats_random_draws() {
    let (grad, expected) = jitter_gradient(CheckpointConfig::default().with_use_reentrant(true));
    assert_relative_eq!(grad, expected, epsilon = 1e-12);
}

#[test]
fn test_replay_without_rng_preservation_diverges() {
    for reentrant in [false, true] {
        let config = CheckpointConfig::default()
            .with_use_reentrant(reentrant)
            .with_preserve_rng_state(false);
        let (grad, expected) = jitter_gradient(config);
        assert!((grad - expected).abs() > 1e-9, "reentrant = {reentrant}");
    }
}

#[test]
fn test_replay_leaves_caller_rng_untouched() {
    let draws_after = |checkpointed: bool| {
        let ctx = Context::seeded(3);
        let x = Tensor::leaf(0.5);
        let out = if checkpointed {
            checkpoint(&ctx, &CheckpointConfig::default(), noisy_square, &[x]).unwrap()
        } else {
            noisy_square(&ctx, &[x]).unwrap()
        };
        ctx.backward(&out[0], false).unwrap();
        ctx.normal()
    };
    assert_eq!(draws_after(true), draws_after(false));
}

// ============================================================================
// Precision Preservation Tests
// ============================================================================

fn precision_body(ctx: &Context, x: &[Tensor]) -> CheckpointResult<Vec<Tensor>> {
    let e = ctx.exp(&ctx.sin(&x[0])?)?;
    Ok(vec![ctx.mul(&e, &x[0])?])
}

fn gradient_under(precision: Precision, config: Option<&CheckpointConfig>) -> f64 {
    let ctx = Context::seeded(0);
    let x = Tensor::leaf(0.1);
    let out = {
        let _precision = ctx.precision_scope(precision);
        match config {
            Some(config) => checkpoint(&ctx, config, precision_body, &[x.clone()]).unwrap(),
            None => precision_body(&ctx, &[x.clone()]).unwrap(),
        }
    };
    // Backward runs at the default precision.
    ctx.backward(&out[0], false).unwrap();
    x.grad().unwrap()
}

#[test]
fn test_replay_uses_forward_precision() {
    let single = gradient_under(Precision::Single, None);
    let double = gradient_under(Precision::Double, None);
    assert!((single - double).abs() > 1e-12);

    for reentrant in [false, true] {
        let config = CheckpointConfig::default().with_use_reentrant(reentrant);
        let replayed = gradient_under(Precision::Single, Some(&config));
        assert_relative_eq!(replayed, single, epsilon = 1e-15);
    }
}

// ============================================================================
// Mixed Variant Tests
// ============================================================================

#[test]
fn test_reentrant_region_inside_nestable_region() {
    let ctx = Context::seeded(0);
    let x = Tensor::leaf(0.6);
    let reentrant = CheckpointConfig::default().with_use_reentrant(true);

    let out = checkpoint(
        &ctx,
        &CheckpointConfig::default(),
        move |ctx, v| {
            let a = ctx.sin(&v[0])?;
            let inner = checkpoint(ctx, &reentrant, |ctx, w| Ok(vec![ctx.exp(&w[0])?]), &[a])?;
            Ok(vec![ctx.mul(&inner[0], &v[0])?])
        },
        &[x.clone()],
    )
    .unwrap();
    ctx.backward(&out[0], false).unwrap();

    let e = 0.6_f64.sin().exp();
    assert_relative_eq!(x.grad().unwrap(), e + 0.6 * e * 0.6_f64.cos(), epsilon = 1e-12);
}

#[test]
fn test_sequential_with_remainder_matches_plain_chain() {
    let runs = Rc::new(Cell::new(0));
    let stage: Stage = {
        let runs = Rc::clone(&runs);
        Rc::new(move |ctx: &Context, x: &[Tensor]| {
            runs.set(runs.get() + 1);
            Ok(vec![ctx.tanh(&ctx.scale(&x[0], 1.5)?)?])
        })
    };
    let stages = vec![stage; 5];

    let plain = {
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.2);
        let mut value = x.clone();
        for _ in 0..5 {
            value = ctx.tanh(&ctx.scale(&value, 1.5).unwrap()).unwrap();
        }
        ctx.backward(&value, false).unwrap();
        x.grad().unwrap()
    };

    for reentrant in [false, true] {
        runs.set(0);
        let ctx = Context::seeded(0);
        let x = Tensor::leaf(0.2);
        let config = CheckpointConfig::default().with_use_reentrant(reentrant);
        let out = checkpoint_sequential(&ctx, &config, &stages, 2, &[x.clone()]).unwrap();
        assert_eq!(runs.get(), 5);

        ctx.backward(&out[0], false).unwrap();
        // One checkpointed segment of two stages is replayed.
        assert_eq!(runs.get(), 7, "reentrant = {reentrant}");
        assert_relative_eq!(x.grad().unwrap(), plain, epsilon = 1e-12);
    }
}

#[test]
fn test_sequential_rejects_empty_chain() {
    let ctx = Context::seeded(0);
    let err = checkpoint_sequential(&ctx, &CheckpointConfig::default(), &[], 2, &[Tensor::leaf(1.0)]).unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidSegments { stages: 0, segments: 2 }));
}

// ============================================================================
// Stack State Tests
// ============================================================================

#[test]
fn test_failed_region_leaves_stacks_balanced() {
    let ctx = Context::seeded(0);
    let err = checkpoint(
        &ctx,
        &CheckpointConfig::default(),
        |ctx, v| {
            let _ = ctx.sin(&v[0])?;
            Err(CheckpointError::MissingOutput { index: 0 })
        },
        &[Tensor::leaf(1.0)],
    )
    .unwrap_err();
    assert!(matches!(err, CheckpointError::MissingOutput { index: 0 }));

    let stacks = RegionStacks::of(&ctx);
    assert_eq!(stacks.depth(), 1);
    assert!(stacks.innermost().is_none());
    assert_eq!(ctx.hook_depth(), 0);
}

#[test]
fn test_reset_region_stacks_restores_defaults() {
    let ctx = Context::seeded(0);
    let _early = set_early_stop(&ctx, true);
    assert!(RegionStacks::of(&ctx).early_stop());

    reset_region_stacks(&ctx);
    let stacks = RegionStacks::of(&ctx);
    assert!(!stacks.early_stop());
    assert_eq!(stacks.depth(), 1);
    assert!(!stacks.is_recomputing());
}
