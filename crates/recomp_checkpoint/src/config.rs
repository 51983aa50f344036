//! Configuration for checkpointed regions.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Options controlling how a region is checkpointed.
///
/// # Default Values
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `use_reentrant` | false | Replay through a custom node instead of intercepting saves |
/// | `preserve_rng_state` | true | Replay with the RNG state of the original run |
///
/// # Examples
///
/// ```rust
/// use recomp_checkpoint::CheckpointConfig;
///
/// let config = CheckpointConfig::default();
/// assert!(!config.use_reentrant());
/// assert!(config.preserve_rng_state());
///
/// let reentrant = CheckpointConfig::new()
///     .with_use_reentrant(true)
///     .with_preserve_rng_state(false);
/// assert!(reentrant.use_reentrant());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CheckpointConfig {
    use_reentrant: bool,
    preserve_rng_state: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            use_reentrant: false,
            preserve_rng_state: true,
        }
    }
}

impl CheckpointConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the reentrant variant.
    pub fn with_use_reentrant(mut self, use_reentrant: bool) -> Self {
        self.use_reentrant = use_reentrant;
        self
    }

    /// Sets whether replays reuse the RNG state of the original run.
    pub fn with_preserve_rng_state(mut self, preserve_rng_state: bool) -> Self {
        self.preserve_rng_state = preserve_rng_state;
        self
    }

    /// Returns true if the reentrant variant is selected.
    #[inline]
    pub fn use_reentrant(&self) -> bool {
        self.use_reentrant
    }

    /// Returns true if replays reuse the original RNG state.
    #[inline]
    pub fn preserve_rng_state(&self) -> bool {
        self.preserve_rng_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CheckpointConfig::default();
        assert!(!config.use_reentrant());
        assert!(config.preserve_rng_state());
        assert_eq!(config, CheckpointConfig::new());
    }

    #[test]
    fn test_builder_pattern() {
        let config = CheckpointConfig::new()
            .with_use_reentrant(true)
            .with_preserve_rng_state(false);
        assert!(config.use_reentrant());
        assert!(!config.preserve_rng_state());
    }
}
