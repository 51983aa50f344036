//! Saved-value interception.
//!
//! Whenever a recorded operation keeps a value for its backward, the value
//! is routed through the innermost registered [`SavedValueHooks`]. The hook
//! decides what is actually stored (a [`PackedValue`]), and the packed value
//! decides how the original is reconstructed when the backward needs it.
//!
//! Hooks are scoped: [`Context::saved_value_hooks`](crate::Context::saved_value_hooks)
//! returns a guard, and dropping the guard reinstates the previously active
//! hook. Packed values remember how to unpack themselves, so a value saved
//! under a hook is restored by that hook even after its scope has ended.

use std::any::Any;
use std::rc::Rc;

use crate::context::Context;
use crate::error::EngineResult;
use crate::tensor::Tensor;

/// Interceptor invoked for every value a recorded operation saves.
pub trait SavedValueHooks {
    /// Replaces `value` by whatever should be stored in the graph.
    fn pack(&self, ctx: &Context, value: &Tensor) -> EngineResult<Rc<dyn PackedValue>>;
}

/// A value as stored in a graph node's saved slot.
pub trait PackedValue {
    /// Reconstructs the saved value.
    fn unpack(&self, ctx: &Context) -> EngineResult<Tensor>;

    /// Enables inspection of concrete packed types.
    fn as_any(&self) -> &dyn Any;
}

/// Stores the value itself. Used when no hook is active.
#[derive(Clone, Debug)]
pub struct RetainedValue {
    value: Tensor,
}

impl RetainedValue {
    /// Wraps a value to be returned unchanged by [`PackedValue::unpack`].
    pub fn new(value: Tensor) -> Self {
        Self { value }
    }

    /// Returns the retained value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }
}

impl PackedValue for RetainedValue {
    fn unpack(&self, _ctx: &Context) -> EngineResult<Tensor> {
        Ok(self.value.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Restores the previous hook when dropped.
#[must_use = "the hook is unregistered as soon as the guard is dropped"]
pub struct HooksGuard<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) depth: usize,
}

impl Drop for HooksGuard<'_> {
    fn drop(&mut self) {
        self.ctx.pop_hooks(self.depth);
    }
}
