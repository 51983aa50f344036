//! Random and numeric-precision state owned by a [`Context`](crate::Context).
//!
//! Both pieces of state influence the values produced by recorded
//! operations, so anything that replays a computation must be able to
//! snapshot and reinstate them.

use std::cell::RefMut;

use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::context::Context;

/// Snapshot of the context RNG.
///
/// Restoring a snapshot makes the context draw exactly the same sequence of
/// random numbers as it did after the snapshot was taken.
#[derive(Clone, Debug)]
pub struct RngState {
    pub(crate) inner: StdRng,
}

/// Arithmetic precision applied to the results of recorded operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Precision {
    /// Full `f64` results
    #[default]
    Double,
    /// Results rounded through `f32`
    Single,
}

impl Precision {
    /// Rounds a computed value to this precision.
    #[inline]
    pub fn round(self, value: f64) -> f64 {
        match self {
            Precision::Double => value,
            Precision::Single => value as f32 as f64,
        }
    }
}

pub(crate) fn sample_normal(mut rng: RefMut<'_, StdRng>) -> f64 {
    StandardNormal.sample(&mut *rng)
}

/// Restores the RNG state captured by [`Context::fork_rng`] when dropped.
#[must_use = "the RNG state is restored as soon as the guard is dropped"]
pub struct RngForkGuard<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) saved: Option<RngState>,
}

impl Drop for RngForkGuard<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.saved.take() {
            self.ctx.set_rng_state(&state);
        }
    }
}

/// Restores the previous precision mode when dropped.
#[must_use = "the precision mode is restored as soon as the guard is dropped"]
pub struct PrecisionGuard<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) previous: Precision,
}

impl Drop for PrecisionGuard<'_> {
    fn drop(&mut self) {
        self.ctx.set_precision(self.previous);
    }
}
