//! # Recomp Checkpoint (Layer 2: Activation Recomputation)
//!
//! ## Layer 2 Role
//!
//! recomp_checkpoint trades compute for memory on top of the `recomp_core`
//! engine:
//! - Checkpointed regions discard every value their operations save for the
//!   backward and keep only a placeholder
//! - The first restore of a placeholder replays the region body, outermost
//!   region first, and every later restore in the same backward reads the
//!   replayed value
//! - Regions nest to any depth, also while being replayed
//! - A reentrant variant and segment-wise checkpointing of stage chains
//!
//! ## Guarantees
//!
//! - A region is replayed at most once per backward invocation
//! - A replayed value is released the moment it is consumed
//! - Restoring the same placeholder twice within one backward is an error
//! - Gradients are identical to those of the same computation without
//!   checkpointing, as long as the replay performs the same saves in the
//!   same order as the first run
//!
//! ## Usage Example
//!
//! ```rust
//! use recomp_checkpoint::{checkpoint, CheckpointConfig};
//! use recomp_core::{Context, Tensor};
//!
//! let ctx = Context::seeded(0);
//! let config = CheckpointConfig::default();
//! let x = Tensor::leaf(0.8);
//!
//! let out = checkpoint(
//!     &ctx,
//!     &config,
//!     |ctx, v| {
//!         // Nested region: its inputs are saved on the outer region.
//!         let inner = checkpoint(
//!             ctx,
//!             &CheckpointConfig::default(),
//!             |ctx, w| Ok(vec![ctx.tanh(&w[0])?]),
//!             &[ctx.sin(&v[0])?],
//!         )?;
//!         Ok(vec![ctx.mul(&inner[0], &v[0])?])
//!     },
//!     &[x.clone()],
//! )
//! .unwrap();
//!
//! ctx.backward(&out[0], false).unwrap();
//! let t = 0.8_f64.sin().tanh();
//! let expected = t + 0.8 * (1.0 - t * t) * 0.8_f64.cos();
//! assert!((x.grad().unwrap() - expected).abs() < 1e-12);
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(unknown_lints)]

mod adapter;
pub mod config;
pub mod error;
pub mod frame;
pub mod identity;
pub mod interceptor;
pub mod nested;
mod preserve;
pub mod reentrant;
pub mod region;
pub mod sequential;
pub mod stack;

pub use config::CheckpointConfig;
pub use error::{CheckpointError, CheckpointResult};
pub use frame::{Frame, FrameId, RecomputeFn};
pub use identity::{Handle, Holder};
pub use interceptor::{HeldValue, OuterInterceptor};
pub use nested::{checkpoint_nestable, checkpoint_with_recompute};
pub use reentrant::{checkpoint_reentrant, REPLAY_NODE};
pub use region::checkpoint;
pub use sequential::{checkpoint_sequential, Stage};
pub use stack::{reset_region_stacks, set_early_stop, EarlyStopGuard, RegionStacks};
