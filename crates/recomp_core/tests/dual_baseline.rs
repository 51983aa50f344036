//! Engine gradients checked against forward-mode dual numbers.
//!
//! num-dual's `Dual64` propagates exact first derivatives, so it is an
//! independent baseline for the reverse-mode engine.

use approx::assert_relative_eq;
use num_dual::{Dual64, DualNum};
use proptest::prelude::*;
use recomp_core::{Context, EngineResult, GradOptions, Tensor};

/// f(x, y) = exp(sin(x) * y) / (1 + y^2) + tanh(x - y) * ln(1 + x^2)
fn f_tensor(ctx: &Context, x: &Tensor, y: &Tensor) -> EngineResult<Tensor> {
    let one = Tensor::new(1.0);
    let a = ctx.exp(&ctx.mul(&ctx.sin(x)?, y)?)?;
    let b = ctx.add(&one, &ctx.powf(y, 2.0)?)?;
    let c = ctx.tanh(&ctx.sub(x, y)?)?;
    let d = ctx.ln(&ctx.add(&one, &ctx.mul(x, x)?)?)?;
    ctx.add(&ctx.div(&a, &b)?, &ctx.mul(&c, &d)?)
}

fn f_dual(x: Dual64, y: Dual64) -> Dual64 {
    let one = Dual64::from(1.0);
    let a = (x.sin() * y).exp();
    let b = one + y * y;
    let c = (x - y).tanh();
    let d = (one + x * x).ln();
    a / b + c * d
}

fn dual_gradient(x: f64, y: f64) -> (f64, f64) {
    let dx = f_dual(Dual64::new(x, 1.0), Dual64::new(y, 0.0));
    let dy = f_dual(Dual64::new(x, 0.0), Dual64::new(y, 1.0));
    (dx.eps, dy.eps)
}

#[test]
fn test_reverse_matches_dual_numbers() {
    let ctx = Context::seeded(5);
    let x = Tensor::leaf(0.7);
    let y = Tensor::leaf(-1.3);

    let out = f_tensor(&ctx, &x, &y).unwrap();
    assert_relative_eq!(
        out.value(),
        f_dual(Dual64::from(0.7), Dual64::from(-1.3)).re,
        epsilon = 1e-12
    );

    ctx.backward(&out, false).unwrap();
    let (gx, gy) = dual_gradient(0.7, -1.3);
    assert_relative_eq!(x.grad().unwrap(), gx, epsilon = 1e-10);
    assert_relative_eq!(y.grad().unwrap(), gy, epsilon = 1e-10);
}

#[test]
fn test_grad_with_allow_unused_mixes_inputs() {
    let ctx = Context::seeded(5);
    let x = Tensor::leaf(0.7);
    let y = Tensor::leaf(-1.3);
    let z = Tensor::leaf(4.0);

    let out = f_tensor(&ctx, &x, &y).unwrap();
    let options = GradOptions::default().with_allow_unused(true);
    let grads = ctx.grad_with(&[out], &[1.0], &[x, z, y], options).unwrap();

    let (gx, gy) = dual_gradient(0.7, -1.3);
    assert_relative_eq!(grads[0].unwrap(), gx, epsilon = 1e-10);
    assert_eq!(grads[1], None);
    assert_relative_eq!(grads[2].unwrap(), gy, epsilon = 1e-10);
}

proptest! {
    #[test]
    fn prop_reverse_matches_dual(x in -2.0f64..2.0, y in -2.0f64..2.0) {
        let ctx = Context::seeded(0);
        let tx = Tensor::leaf(x);
        let ty = Tensor::leaf(y);
        let out = f_tensor(&ctx, &tx, &ty).unwrap();
        let grads = ctx.grad(&[out], &[tx, ty], false).unwrap();

        let (gx, gy) = dual_gradient(x, y);
        prop_assert!((grads[0] - gx).abs() <= 1e-9 * (1.0 + gx.abs()));
        prop_assert!((grads[1] - gy).abs() <= 1e-9 * (1.0 + gy.abs()));
    }
}
