//! # Recomp Core (Layer 1: Differentiation Engine)
//!
//! ## Layer 1 Role
//!
//! recomp_core is the differentiation engine the recomputation layer
//! (`recomp_checkpoint`) is built on:
//! - Scalar reverse-mode automatic differentiation over reference-counted
//!   graph nodes
//! - Saved-value interception: every value an operation keeps for its
//!   backward is routed through a scoped, nestable hook
//! - Per-invocation backward identifiers
//! - RNG and precision state that replays can snapshot and restore
//!
//! ## Explicit Context
//!
//! There is no global state. A [`Context`] owns the grad mode, the hook
//! stack, the backward-identifier stack, the RNG, the precision mode and a
//! typed extension store. Operations are methods on the context, and hooks
//! receive it by reference.
//!
//! ## Usage Example
//!
//! ```rust
//! use recomp_core::{Context, Tensor};
//!
//! let ctx = Context::seeded(42);
//! let x = Tensor::leaf(0.5);
//! let y = Tensor::leaf(2.0);
//!
//! let s = ctx.sin(&x).unwrap();
//! let out = ctx.mul(&s, &y).unwrap();
//!
//! let grads = ctx.grad(&[out], &[x, y], false).unwrap();
//! assert!((grads[0] - 2.0 * 0.5_f64.cos()).abs() < 1e-12);
//! assert!((grads[1] - 0.5_f64.sin()).abs() < 1e-12);
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(unknown_lints)]

pub mod context;
pub mod error;
pub mod gradcheck;
pub mod graph;
pub mod hooks;
mod ops;
pub mod random;
pub mod tensor;

pub use context::{BackwardId, Context, GradModeGuard};
pub use error::{EngineError, EngineResult};
pub use graph::{CustomBackward, GradOptions, Node, NodeId, SavedTensors};
pub use hooks::{HooksGuard, PackedValue, RetainedValue, SavedValueHooks};
pub use random::{Precision, PrecisionGuard, RngForkGuard, RngState};
pub use tensor::{Tensor, TensorId};
