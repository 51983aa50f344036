//! Capture and replay of the state a region's values depend on.
//!
//! A replay must draw the same random numbers and round to the same
//! precision as the original run, otherwise its saves would not match the
//! discarded values.

use recomp_core::{Context, Precision, RngState};

/// RNG and precision state captured before a region's first run.
#[derive(Clone, Debug)]
pub(crate) struct CapturedState {
    rng: Option<RngState>,
    precision: Precision,
}

impl CapturedState {
    /// Captures the precision mode, and the RNG state if `preserve_rng`.
    pub(crate) fn capture(ctx: &Context, preserve_rng: bool) -> Self {
        Self {
            rng: preserve_rng.then(|| ctx.rng_state()),
            precision: ctx.precision(),
        }
    }

    /// Runs `f` with the captured state reinstated.
    ///
    /// The caller's RNG state is restored afterwards, so a replay does not
    /// disturb the draws of the surrounding computation.
    pub(crate) fn replay<T>(&self, ctx: &Context, f: impl FnOnce() -> T) -> T {
        let _fork = self.rng.as_ref().map(|state| {
            let fork = ctx.fork_rng();
            ctx.set_rng_state(state);
            fork
        });
        let _precision = ctx.precision_scope(self.precision);
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_repeats_draws_and_restores_caller_rng() {
        let ctx = Context::seeded(11);
        let captured = CapturedState::capture(&ctx, true);
        let original = ctx.normal();
        let caller_next = {
            let state = ctx.rng_state();
            let next = ctx.normal();
            ctx.set_rng_state(&state);
            next
        };

        let replayed = captured.replay(&ctx, || ctx.normal());
        assert_eq!(replayed, original);
        assert_eq!(ctx.normal(), caller_next);
    }

    #[test]
    fn test_replay_without_rng_uses_live_state() {
        let ctx = Context::seeded(11);
        let captured = CapturedState::capture(&ctx, false);
        let original = ctx.normal();
        let replayed = captured.replay(&ctx, || ctx.normal());
        assert_ne!(replayed, original);
    }

    #[test]
    fn test_replay_restores_precision() {
        let ctx = Context::seeded(0);
        let captured = {
            let _single = ctx.precision_scope(Precision::Single);
            CapturedState::capture(&ctx, false)
        };
        assert_eq!(ctx.precision(), Precision::Double);
        let inside = captured.replay(&ctx, || ctx.precision());
        assert_eq!(inside, Precision::Single);
        assert_eq!(ctx.precision(), Precision::Double);
    }
}
