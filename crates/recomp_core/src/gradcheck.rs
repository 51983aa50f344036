//! Finite-difference verification of engine gradients.
//!
//! Compares gradients obtained from the engine against central differences
//! of the same function evaluated without recording.
//!
//! # Example
//!
//! ```rust
//! use recomp_core::gradcheck::{gradcheck, GradcheckConfig};
//! use recomp_core::Context;
//!
//! let ctx = Context::seeded(1);
//! let report = gradcheck(
//!     &ctx,
//!     |ctx, x| {
//!         let s = ctx.sin(&x[0])?;
//!         ctx.mul(&s, &x[1])
//!     },
//!     &[0.3, 1.7],
//!     GradcheckConfig::default(),
//! )
//! .unwrap();
//! assert!(report.passed());
//! ```

use crate::context::Context;
use crate::error::EngineResult;
use crate::tensor::Tensor;

/// Configuration for [`gradcheck`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradcheckConfig {
    /// Central-difference step.
    pub step: f64,
    /// Absolute tolerance.
    pub atol: f64,
    /// Relative tolerance.
    pub rtol: f64,
}

impl Default for GradcheckConfig {
    fn default() -> Self {
        Self {
            step: 1e-6,
            atol: 1e-5,
            rtol: 1e-4,
        }
    }
}

impl GradcheckConfig {
    /// Sets the difference step.
    #[inline]
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    /// Sets the tolerances.
    #[inline]
    pub fn with_tolerances(mut self, atol: f64, rtol: f64) -> Self {
        self.atol = atol;
        self.rtol = rtol;
        self
    }
}

/// Outcome of a gradient check.
#[derive(Clone, Debug, PartialEq)]
pub struct GradcheckReport {
    /// Gradients computed by the engine.
    pub analytical: Vec<f64>,
    /// Gradients estimated by central differences.
    pub numerical: Vec<f64>,
    config: GradcheckConfig,
}

impl GradcheckReport {
    /// Returns true if every component is within tolerance.
    pub fn passed(&self) -> bool {
        self.analytical
            .iter()
            .zip(&self.numerical)
            .all(|(a, n)| (a - n).abs() <= self.config.atol + self.config.rtol * n.abs())
    }

    /// Largest absolute difference between the two estimates.
    pub fn max_abs_error(&self) -> f64 {
        self.analytical
            .iter()
            .zip(&self.numerical)
            .map(|(a, n)| (a - n).abs())
            .fold(0.0, f64::max)
    }
}

/// Checks the gradient of a scalar function at `point`.
///
/// `f` is invoked once with tracked leaves and `2 * point.len()` times under
/// `no_grad` with perturbed constants.
pub fn gradcheck<F>(ctx: &Context, f: F, point: &[f64], config: GradcheckConfig) -> EngineResult<GradcheckReport>
where
    F: Fn(&Context, &[Tensor]) -> EngineResult<Tensor>,
{
    let leaves: Vec<Tensor> = point.iter().map(|&v| Tensor::leaf(v)).collect();
    let output = f(ctx, &leaves)?;
    let analytical = ctx.grad(&[output], &leaves, false)?;

    let _no_grad = ctx.no_grad();
    let mut numerical = Vec::with_capacity(point.len());
    for i in 0..point.len() {
        let shifted = |delta: f64| -> EngineResult<f64> {
            let args: Vec<Tensor> = point
                .iter()
                .enumerate()
                .map(|(j, &v)| Tensor::new(if i == j { v + delta } else { v }))
                .collect();
            Ok(f(ctx, &args)?.value())
        };
        let plus = shifted(config.step)?;
        let minus = shifted(-config.step)?;
        numerical.push((plus - minus) / (2.0 * config.step));
    }

    Ok(GradcheckReport {
        analytical,
        numerical,
        config,
    })
}
