//! Execution context for recording and differentiating computations.
//!
//! The [`Context`] owns all state that would otherwise be process-global:
//! the grad mode flag, the stack of saved-value hooks, the stack of active
//! backward invocations, the RNG, the precision mode and a typed extension
//! store for higher layers. Every operation and every hook receives the
//! context explicitly.
//!
//! The context is single-threaded (`!Send`). At most one forward or backward
//! pass is expected to make progress at a time, although passes may nest
//! (a backward started from within a hook, for instance).

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::hooks::{HooksGuard, PackedValue, RetainedValue, SavedValueHooks};
use crate::random::{sample_normal, Precision, PrecisionGuard, RngForkGuard, RngState};
use crate::tensor::Tensor;

/// Identifier of one backward invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackwardId(Uuid);

impl BackwardId {
    /// Generates a fresh, globally unique identifier.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for BackwardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback run when a backward invocation ends.
type ExitCallback = Box<dyn FnOnce(BackwardId)>;

/// Differentiation context.
///
/// # Example
///
/// ```rust
/// use recomp_core::{Context, Tensor};
///
/// let ctx = Context::seeded(42);
/// let x = Tensor::leaf(0.3);
///
/// let y = {
///     let _no_grad = ctx.no_grad();
///     ctx.sin(&x).unwrap()
/// };
/// assert!(!y.requires_grad());
/// assert!(ctx.sin(&x).unwrap().requires_grad());
/// ```
pub struct Context {
    grad_enabled: Cell<bool>,
    hooks: RefCell<Vec<Rc<dyn SavedValueHooks>>>,
    backward_ids: RefCell<Vec<BackwardId>>,
    exit_callbacks: RefCell<HashMap<BackwardId, Vec<ExitCallback>>>,
    rng: RefCell<StdRng>,
    precision: Cell<Precision>,
    extensions: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
}

impl Context {
    /// Creates a context with an entropy-seeded RNG.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates a context whose RNG is seeded deterministically.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            grad_enabled: Cell::new(true),
            hooks: RefCell::new(Vec::new()),
            backward_ids: RefCell::new(Vec::new()),
            exit_callbacks: RefCell::new(HashMap::new()),
            rng: RefCell::new(rng),
            precision: Cell::new(Precision::Double),
            extensions: RefCell::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Grad mode
    // ========================================================================

    /// Returns true if operations are currently recorded.
    #[inline]
    pub fn is_grad_enabled(&self) -> bool {
        self.grad_enabled.get()
    }

    /// Disables recording until the guard is dropped.
    pub fn no_grad(&self) -> GradModeGuard<'_> {
        self.set_grad_mode(false)
    }

    /// Enables recording until the guard is dropped.
    pub fn enable_grad(&self) -> GradModeGuard<'_> {
        self.set_grad_mode(true)
    }

    fn set_grad_mode(&self, enabled: bool) -> GradModeGuard<'_> {
        let previous = self.grad_enabled.replace(enabled);
        GradModeGuard {
            ctx: self,
            previous,
        }
    }

    // ========================================================================
    // Saved-value hooks
    // ========================================================================

    /// Registers `hooks` as the innermost saved-value interceptor.
    pub fn saved_value_hooks(&self, hooks: Rc<dyn SavedValueHooks>) -> HooksGuard<'_> {
        let mut stack = self.hooks.borrow_mut();
        stack.push(hooks);
        HooksGuard {
            ctx: self,
            depth: stack.len(),
        }
    }

    pub(crate) fn pop_hooks(&self, depth: usize) {
        let mut stack = self.hooks.borrow_mut();
        debug_assert_eq!(stack.len(), depth, "saved-value hooks dropped out of order");
        stack.truncate(depth.saturating_sub(1));
    }

    /// Returns the number of registered hooks.
    pub fn hook_depth(&self) -> usize {
        self.hooks.borrow().len()
    }

    /// Packs a value through the innermost hook, or retains it as-is.
    pub(crate) fn pack(&self, value: &Tensor) -> EngineResult<Rc<dyn PackedValue>> {
        let active = self.hooks.borrow().last().cloned();
        match active {
            Some(hooks) => hooks.pack(self, value),
            None => Ok(Rc::new(RetainedValue::new(value.clone()))),
        }
    }

    // ========================================================================
    // Backward invocations
    // ========================================================================

    /// Returns the identifier of the innermost running backward, if any.
    pub fn current_backward_id(&self) -> Option<BackwardId> {
        self.backward_ids.borrow().last().copied()
    }

    /// Runs `callback` once the innermost running backward ends, whether it
    /// succeeds or fails.
    ///
    /// Returns false, dropping the callback, if no backward is running.
    pub fn on_backward_exit(&self, callback: impl FnOnce(BackwardId) + 'static) -> bool {
        let Some(id) = self.current_backward_id() else {
            return false;
        };
        self.exit_callbacks
            .borrow_mut()
            .entry(id)
            .or_default()
            .push(Box::new(callback));
        true
    }

    pub(crate) fn enter_backward(&self) -> BackwardGuard<'_> {
        let id = BackwardId::fresh();
        self.backward_ids.borrow_mut().push(id);
        BackwardGuard { ctx: self, id }
    }

    // ========================================================================
    // RNG and precision
    // ========================================================================

    /// Draws a standard normal variate from the context RNG.
    pub fn normal(&self) -> f64 {
        sample_normal(self.rng.borrow_mut())
    }

    /// Captures the current RNG state.
    pub fn rng_state(&self) -> RngState {
        RngState {
            inner: self.rng.borrow().clone(),
        }
    }

    /// Replaces the RNG state.
    pub fn set_rng_state(&self, state: &RngState) {
        *self.rng.borrow_mut() = state.inner.clone();
    }

    /// Captures the RNG state and restores it when the guard is dropped.
    pub fn fork_rng(&self) -> RngForkGuard<'_> {
        RngForkGuard {
            ctx: self,
            saved: Some(self.rng_state()),
        }
    }

    /// Returns the active precision mode.
    #[inline]
    pub fn precision(&self) -> Precision {
        self.precision.get()
    }

    pub(crate) fn set_precision(&self, precision: Precision) {
        self.precision.set(precision);
    }

    /// Switches precision until the guard is dropped.
    pub fn precision_scope(&self, precision: Precision) -> PrecisionGuard<'_> {
        let previous = self.precision.replace(precision);
        PrecisionGuard {
            ctx: self,
            previous,
        }
    }

    // ========================================================================
    // Extensions
    // ========================================================================

    /// Returns the context-owned instance of `T`, creating it on first use.
    ///
    /// Higher layers keep their per-context state here instead of in
    /// globals.
    pub fn extension<T: Default + 'static>(&self) -> Rc<T> {
        let entry = Rc::clone(
            self.extensions
                .borrow_mut()
                .entry(TypeId::of::<T>())
                .or_insert_with(|| Rc::new(T::default()) as Rc<dyn Any>),
        );
        match entry.downcast::<T>() {
            Ok(state) => state,
            // Entries are keyed by their own TypeId.
            Err(_) => unreachable!("extension entry stored under a foreign TypeId"),
        }
    }

    /// Replaces the context-owned instance of `T` with a fresh default.
    pub fn reset_extension<T: Default + 'static>(&self) {
        self.extensions
            .borrow_mut()
            .insert(TypeId::of::<T>(), Rc::new(T::default()));
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("grad_enabled", &self.is_grad_enabled())
            .field("hook_depth", &self.hook_depth())
            .field("backward", &self.current_backward_id())
            .field("precision", &self.precision())
            .finish()
    }
}

/// Restores the previous grad mode when dropped.
#[must_use = "grad mode is restored as soon as the guard is dropped"]
pub struct GradModeGuard<'a> {
    ctx: &'a Context,
    previous: bool,
}

impl Drop for GradModeGuard<'_> {
    fn drop(&mut self) {
        self.ctx.grad_enabled.set(self.previous);
    }
}

/// Marks a running backward invocation.
pub(crate) struct BackwardGuard<'a> {
    ctx: &'a Context,
    id: BackwardId,
}

impl BackwardGuard<'_> {
    pub(crate) fn id(&self) -> BackwardId {
        self.id
    }
}

impl Drop for BackwardGuard<'_> {
    fn drop(&mut self) {
        let popped = self.ctx.backward_ids.borrow_mut().pop();
        debug_assert_eq!(popped, Some(self.id), "backward invocations ended out of order");

        let callbacks = self.ctx.exit_callbacks.borrow_mut().remove(&self.id);
        for callback in callbacks.into_iter().flatten() {
            callback(self.id);
        }
    }
}
