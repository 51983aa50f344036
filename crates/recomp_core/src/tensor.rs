//! Scalar tensors tracked by the differentiation engine.
//!
//! A [`Tensor`] is a cheap, reference-counted handle. Cloning it shares the
//! same value, graph history and gradient slot, so identity comparisons use
//! [`Tensor::ptr_eq`] or [`Tensor::id`] rather than value equality.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::graph::{Edge, Node, NodeId};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique identifier for tensors and graph nodes.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Unique identity of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

struct TensorInner {
    id: TensorId,
    value: f64,
    requires_grad: bool,
    grad_fn: Option<Rc<Node>>,
    grad: Cell<Option<f64>>,
}

/// A scalar value participating in differentiation.
///
/// Three kinds of tensor exist:
///
/// - constants ([`Tensor::new`]): no gradient tracking
/// - leaves ([`Tensor::leaf`]): tracked inputs that accumulate gradients
/// - results of recorded operations: carry the node that produced them
///
/// # Example
///
/// ```rust
/// use recomp_core::{Context, Tensor};
///
/// let ctx = Context::seeded(7);
/// let x = Tensor::leaf(2.0);
/// let y = ctx.mul(&x, &x).unwrap();
///
/// ctx.backward(&y, false).unwrap();
/// assert_eq!(x.grad(), Some(4.0));
/// ```
#[derive(Clone)]
pub struct Tensor {
    inner: Rc<TensorInner>,
}

impl Tensor {
    fn build(value: f64, requires_grad: bool, grad_fn: Option<Rc<Node>>) -> Self {
        Self {
            inner: Rc::new(TensorInner {
                id: TensorId(next_id()),
                value,
                requires_grad,
                grad_fn,
                grad: Cell::new(None),
            }),
        }
    }

    /// Creates a constant that does not require grad.
    pub fn new(value: f64) -> Self {
        Self::build(value, false, None)
    }

    /// Creates a leaf that requires grad and accumulates gradients.
    pub fn leaf(value: f64) -> Self {
        Self::build(value, true, None)
    }

    pub(crate) fn from_node(value: f64, node: Rc<Node>) -> Self {
        Self::build(value, true, Some(node))
    }

    /// Returns the unique identity of this tensor.
    #[inline]
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// Returns the scalar value.
    #[inline]
    pub fn value(&self) -> f64 {
        self.inner.value
    }

    /// Returns true if gradients flow into this tensor.
    #[inline]
    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Returns true if this tensor was not produced by a recorded operation.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.inner.grad_fn.is_none()
    }

    /// Returns the identifier of the producing node, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        self.inner.grad_fn.as_ref().map(|node| node.id())
    }

    pub(crate) fn grad_fn(&self) -> Option<&Rc<Node>> {
        self.inner.grad_fn.as_ref()
    }

    /// Returns the gradient accumulated by [`Context::backward`].
    pub fn grad(&self) -> Option<f64> {
        self.inner.grad.get()
    }

    /// Clears the accumulated gradient.
    pub fn zero_grad(&self) {
        self.inner.grad.set(None);
    }

    pub(crate) fn accumulate_grad(&self, grad: f64) {
        let current = self.inner.grad.get().unwrap_or(0.0);
        self.inner.grad.set(Some(current + grad));
    }

    /// Returns a constant with the same value and no graph history.
    pub fn detach(&self) -> Tensor {
        Tensor::new(self.value())
    }

    /// Returns a fresh leaf with the same value, tracked only if this tensor
    /// is tracked.
    pub fn detach_as_leaf(&self) -> Tensor {
        if self.requires_grad() {
            Tensor::leaf(self.value())
        } else {
            Tensor::new(self.value())
        }
    }

    /// Returns true if both handles refer to the same tensor.
    #[inline]
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn edge(&self) -> Option<Edge> {
        match (&self.inner.grad_fn, self.requires_grad()) {
            (Some(node), _) => Some(Edge::Node(Rc::clone(node))),
            (None, true) => Some(Edge::Leaf(self.clone())),
            (None, false) => None,
        }
    }

    /// Returns the number of values saved by the producing node.
    ///
    /// Zero for leaves, constants, and nodes released by a backward.
    pub fn saved_len(&self) -> usize {
        self.grad_fn().map_or(0, |node| node.saved_len())
    }

    /// Restores a value saved by the producing node outside of a backward.
    ///
    /// This goes through the same interception path as a backward would, so
    /// values saved under a hook are reconstructed by that hook.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoGradFn`] for tensors without a producing node,
    /// [`EngineError::GraphReleased`] once the node freed its saved values,
    /// and any error raised by the hook that packed the value.
    pub fn unpack_saved(&self, ctx: &Context, index: usize) -> EngineResult<Tensor> {
        let node = self.grad_fn().ok_or(EngineError::NoGradFn)?;
        node.unpack(ctx, index)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id())
            .field("value", &self.value())
            .field("requires_grad", &self.requires_grad())
            .field("node", &self.node_id())
            .finish()
    }
}
