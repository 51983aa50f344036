//! Checkpoint entry point.

use recomp_core::{Context, Tensor};

use crate::config::CheckpointConfig;
use crate::error::CheckpointResult;
use crate::nested::checkpoint_nestable;
use crate::reentrant::checkpoint_reentrant;

/// Runs `f` on `inputs` as a checkpointed region.
///
/// Values `f` would keep for the backward are discarded and recomputed by
/// running `f` again when the backward needs them. The variant is chosen by
/// [`CheckpointConfig::use_reentrant`]; the default nestable variant allows
/// regions inside regions and gradient queries from inside a region.
///
/// # Example
///
/// ```rust
/// use recomp_checkpoint::{checkpoint, CheckpointConfig};
/// use recomp_core::{Context, Tensor};
///
/// let ctx = Context::seeded(7);
/// let x = Tensor::leaf(0.3);
/// let y = Tensor::leaf(1.1);
///
/// let out = checkpoint(
///     &ctx,
///     &CheckpointConfig::default(),
///     |ctx, v| {
///         let s = ctx.sin(&v[0])?;
///         Ok(vec![ctx.mul(&s, &v[1])?])
///     },
///     &[x.clone(), y.clone()],
/// )
/// .unwrap();
///
/// ctx.backward(&out[0], false).unwrap();
/// assert!((x.grad().unwrap() - 1.1 * 0.3_f64.cos()).abs() < 1e-12);
/// assert!((y.grad().unwrap() - 0.3_f64.sin()).abs() < 1e-12);
/// ```
pub fn checkpoint<F>(
    ctx: &Context,
    config: &CheckpointConfig,
    f: F,
    inputs: &[Tensor],
) -> CheckpointResult<Vec<Tensor>>
where
    F: Fn(&Context, &[Tensor]) -> CheckpointResult<Vec<Tensor>> + 'static,
{
    if config.use_reentrant() {
        checkpoint_reentrant(ctx, config, f, inputs)
    } else {
        checkpoint_nestable(ctx, config, f, inputs)
    }
}
