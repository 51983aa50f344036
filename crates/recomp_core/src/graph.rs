//! Graph nodes and the reverse-mode executor.
//!
//! Each recorded operation produces one [`Node`] with one optional edge per
//! input and the values it saved for backward. A backward walks the nodes
//! reachable from its roots in dependency order, so every node runs once
//! after all of its consumers have contributed their gradients.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::hooks::PackedValue;
use crate::tensor::{next_id, Tensor, TensorId};

/// Unique identity of a graph node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Returns the raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Backward of a custom operation.
///
/// Receives the context, the operation's saved values and the gradient of
/// the output, and returns one gradient per input.
pub type CustomBackward = Rc<dyn Fn(&Context, &SavedTensors<'_>, f64) -> EngineResult<Vec<f64>>>;

pub(crate) enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Scale(f64),
    Sin,
    Cos,
    Exp,
    Ln,
    Tanh,
    Powf(f64),
    Identity,
    Custom {
        name: &'static str,
        backward: CustomBackward,
    },
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Neg => "neg",
            Op::Scale(_) => "scale",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::Exp => "exp",
            Op::Ln => "ln",
            Op::Tanh => "tanh",
            Op::Powf(_) => "powf",
            Op::Identity => "identity",
            Op::Custom { name, .. } => *name,
        }
    }
}

pub(crate) enum Edge {
    Leaf(Tensor),
    Node(Rc<Node>),
}

/// One recorded operation.
pub struct Node {
    id: NodeId,
    op: Op,
    next: Vec<Option<Edge>>,
    saved: RefCell<Vec<Rc<dyn PackedValue>>>,
    released: Cell<bool>,
}

impl Node {
    pub(crate) fn new(op: Op, next: Vec<Option<Edge>>, saved: Vec<Rc<dyn PackedValue>>) -> Self {
        Self {
            id: NodeId(next_id()),
            op,
            next,
            saved: RefCell::new(saved),
            released: Cell::new(false),
        }
    }

    /// Returns the node identity.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the operation name.
    pub fn name(&self) -> &'static str {
        self.op.name()
    }

    pub(crate) fn saved_len(&self) -> usize {
        self.saved.borrow().len()
    }

    pub(crate) fn unpack(&self, ctx: &Context, index: usize) -> EngineResult<Tensor> {
        if self.released.get() {
            return Err(EngineError::GraphReleased { node: self.id });
        }
        // Clone the slot out so the hook may record new nodes freely.
        let packed = {
            let saved = self.saved.borrow();
            saved
                .get(index)
                .cloned()
                .ok_or(EngineError::SavedIndexOutOfRange {
                    index,
                    len: saved.len(),
                })?
        };
        packed.unpack(ctx)
    }

    fn release(&self) {
        self.released.set(true);
        self.saved.borrow_mut().clear();
    }

    fn needs_input_grad(&self, input: usize) -> bool {
        matches!(self.next.get(input), Some(Some(_)))
    }

    /// Computes the gradient for each input from the output gradient.
    ///
    /// Saved values are unpacked only for inputs that need a gradient.
    fn apply(&self, ctx: &Context, grad: f64) -> EngineResult<Vec<f64>> {
        let saved = SavedTensors { node: self };
        let grads = match &self.op {
            Op::Add => vec![grad, grad],
            Op::Sub => vec![grad, -grad],
            Op::Neg => vec![-grad],
            Op::Scale(factor) => vec![grad * factor],
            Op::Identity => vec![grad],
            Op::Mul => {
                let da = if self.needs_input_grad(0) {
                    grad * saved.value(ctx, 1)?
                } else {
                    0.0
                };
                let db = if self.needs_input_grad(1) {
                    grad * saved.value(ctx, 0)?
                } else {
                    0.0
                };
                vec![da, db]
            }
            Op::Div => {
                let b = saved.value(ctx, 1)?;
                let da = grad / b;
                let db = if self.needs_input_grad(1) {
                    let a = saved.value(ctx, 0)?;
                    -grad * a / (b * b)
                } else {
                    0.0
                };
                vec![da, db]
            }
            Op::Sin => vec![grad * saved.value(ctx, 0)?.cos()],
            Op::Cos => vec![-grad * saved.value(ctx, 0)?.sin()],
            Op::Exp => vec![grad * saved.value(ctx, 0)?],
            Op::Ln => vec![grad / saved.value(ctx, 0)?],
            Op::Tanh => {
                let out = saved.value(ctx, 0)?;
                vec![grad * (1.0 - out * out)]
            }
            Op::Powf(exponent) => {
                let x = saved.value(ctx, 0)?;
                vec![grad * exponent * x.powf(exponent - 1.0)]
            }
            Op::Custom { name, backward } => {
                let grads = (**backward)(ctx, &saved, grad)?;
                if grads.len() != self.next.len() {
                    return Err(EngineError::GradientArity {
                        name: *name,
                        expected: self.next.len(),
                        got: grads.len(),
                    });
                }
                grads
            }
        };
        Ok(grads)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.name())
            .field("inputs", &self.next.len())
            .field("saved", &self.saved_len())
            .field("released", &self.released.get())
            .finish()
    }
}

/// Read access to a node's saved values from a custom backward.
pub struct SavedTensors<'a> {
    node: &'a Node,
}

impl SavedTensors<'_> {
    /// Restores the saved value at `index`.
    ///
    /// Every call goes through the hook that packed the value.
    pub fn unpack(&self, ctx: &Context, index: usize) -> EngineResult<Tensor> {
        self.node.unpack(ctx, index)
    }

    /// Returns the number of saved values.
    pub fn len(&self) -> usize {
        self.node.saved_len()
    }

    /// Returns true if nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn value(&self, ctx: &Context, index: usize) -> EngineResult<f64> {
        Ok(self.unpack(ctx, index)?.value())
    }
}

/// Options for [`Context::grad_with`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GradOptions {
    /// Keep saved values alive so the graph can be differentiated again.
    pub retain_graph: bool,
    /// Return `None` instead of failing for unreachable inputs.
    pub allow_unused: bool,
}

impl GradOptions {
    /// Sets `retain_graph`.
    pub fn with_retain_graph(mut self, retain_graph: bool) -> Self {
        self.retain_graph = retain_graph;
        self
    }

    /// Sets `allow_unused`.
    pub fn with_allow_unused(mut self, allow_unused: bool) -> Self {
        self.allow_unused = allow_unused;
        self
    }
}

enum Target {
    Leaf(TensorId),
    Node(NodeId),
}

/// Gradients flowing into requested inputs, keyed by target.
#[derive(Default)]
struct Captured {
    leaves: HashMap<TensorId, f64>,
    nodes: HashMap<NodeId, f64>,
}

struct GraphTask<'a> {
    nodes: HashMap<NodeId, Rc<Node>>,
    executable: HashSet<NodeId>,
    dependencies: HashMap<NodeId, usize>,
    buffers: HashMap<NodeId, f64>,
    captured: Option<Captured>,
    leaf_targets: HashSet<TensorId>,
    node_targets: HashSet<NodeId>,
    retain_graph: bool,
    ctx: &'a Context,
}

impl<'a> GraphTask<'a> {
    fn new(ctx: &'a Context, roots: &[Rc<Node>], targets: Option<&[Target]>, retain_graph: bool) -> Self {
        let mut nodes = HashMap::new();
        let mut stack: Vec<Rc<Node>> = roots.to_vec();
        while let Some(node) = stack.pop() {
            if nodes.contains_key(&node.id) {
                continue;
            }
            for edge in node.next.iter().flatten() {
                if let Edge::Node(next) = edge {
                    stack.push(Rc::clone(next));
                }
            }
            nodes.insert(node.id, node);
        }

        let mut leaf_targets = HashSet::new();
        let mut node_targets = HashSet::new();
        for target in targets.unwrap_or_default() {
            match target {
                Target::Leaf(id) => leaf_targets.insert(*id),
                Target::Node(id) => node_targets.insert(*id),
            };
        }

        let executable = match targets {
            None => nodes.keys().copied().collect(),
            Some(_) => needed_nodes(&nodes, &leaf_targets, &node_targets),
        };

        let mut dependencies: HashMap<NodeId, usize> = HashMap::new();
        for id in &executable {
            for edge in nodes[id].next.iter().flatten() {
                if let Edge::Node(next) = edge {
                    *dependencies.entry(next.id).or_default() += 1;
                }
            }
        }

        Self {
            nodes,
            executable,
            dependencies,
            buffers: HashMap::new(),
            captured: targets.map(|_| Captured::default()),
            leaf_targets,
            node_targets,
            retain_graph,
            ctx,
        }
    }

    fn deliver_leaf(&mut self, leaf: &Tensor, grad: f64) {
        match &mut self.captured {
            Some(captured) => {
                if self.leaf_targets.contains(&leaf.id()) {
                    *captured.leaves.entry(leaf.id()).or_default() += grad;
                }
            }
            None => leaf.accumulate_grad(grad),
        }
    }

    fn execute(mut self, seeds: Vec<(Tensor, f64)>) -> EngineResult<Option<Captured>> {
        for (root, seed) in seeds {
            match root.grad_fn() {
                Some(node) => *self.buffers.entry(node.id()).or_default() += seed,
                None => self.deliver_leaf(&root, seed),
            }
        }

        let mut ready: VecDeque<NodeId> = self
            .buffers
            .keys()
            .filter(|id| self.dependencies.get(id).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        while let Some(id) = ready.pop_front() {
            let grad = self.buffers.remove(&id).unwrap_or(0.0);
            if let Some(captured) = &mut self.captured {
                if self.node_targets.contains(&id) {
                    *captured.nodes.entry(id).or_default() += grad;
                }
            }
            if !self.executable.contains(&id) {
                continue;
            }

            let node = Rc::clone(&self.nodes[&id]);
            if node.released.get() {
                return Err(EngineError::GraphReleased { node: id });
            }
            trace!(node = %id, op = node.name(), grad, "running backward node");
            let input_grads = node.apply(self.ctx, grad)?;
            if !self.retain_graph {
                node.release();
            }

            for (edge, input_grad) in node.next.iter().zip(input_grads) {
                match edge {
                    None => {}
                    Some(Edge::Leaf(leaf)) => self.deliver_leaf(leaf, input_grad),
                    Some(Edge::Node(next)) => {
                        let next_id = next.id();
                        *self.buffers.entry(next_id).or_default() += input_grad;
                        if let Some(remaining) = self.dependencies.get_mut(&next_id) {
                            *remaining -= 1;
                            if *remaining == 0 {
                                ready.push_back(next_id);
                            }
                        }
                    }
                }
            }
        }

        Ok(self.captured)
    }
}

/// Nodes lying on a path from the roots to any requested target.
///
/// Post-order walk with an explicit stack, so chain length is not bounded
/// by the call stack.
fn needed_nodes(
    nodes: &HashMap<NodeId, Rc<Node>>,
    leaf_targets: &HashSet<TensorId>,
    node_targets: &HashSet<NodeId>,
) -> HashSet<NodeId> {
    let mut needed: HashMap<NodeId, bool> = HashMap::with_capacity(nodes.len());
    for &start in nodes.keys() {
        if needed.contains_key(&start) {
            continue;
        }
        let mut stack = vec![(start, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                let hit = nodes[&id].next.iter().flatten().any(|edge| match edge {
                    Edge::Leaf(leaf) => leaf_targets.contains(&leaf.id()),
                    Edge::Node(next) => node_targets.contains(&next.id) || needed.get(&next.id).copied().unwrap_or(false),
                });
                needed.insert(id, hit);
            } else if !needed.contains_key(&id) {
                stack.push((id, true));
                for edge in nodes[&id].next.iter().flatten() {
                    if let Edge::Node(next) = edge {
                        if !needed.contains_key(&next.id) {
                            stack.push((next.id, false));
                        }
                    }
                }
            }
        }
    }

    needed
        .into_iter()
        .filter_map(|(id, hit)| hit.then_some(id))
        .collect()
}

impl Context {
    /// Accumulates the gradient of `root` into every tracked leaf.
    ///
    /// With `retain_graph = false` every executed node frees its saved
    /// values, and a second backward through the same nodes fails.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoGradFn`] if `root` is not tracked, and any
    /// error raised while restoring saved values.
    pub fn backward(&self, root: &Tensor, retain_graph: bool) -> EngineResult<()> {
        if !root.requires_grad() {
            return Err(EngineError::NoGradFn);
        }
        let task = self.enter_backward();
        trace!(backward = %task.id(), root = %root.id(), "starting backward");
        let roots: Vec<Rc<Node>> = root.grad_fn().into_iter().cloned().collect();
        GraphTask::new(self, &roots, None, retain_graph).execute(vec![(root.clone(), 1.0)])?;
        Ok(())
    }

    /// Returns `d(sum(outputs)) / d(input)` for each input.
    ///
    /// Gradients are returned rather than accumulated, and only nodes on a
    /// path to an input are executed.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::UnusedInput`] if an input is unreachable.
    pub fn grad(&self, outputs: &[Tensor], inputs: &[Tensor], retain_graph: bool) -> EngineResult<Vec<f64>> {
        let seeds = vec![1.0; outputs.len()];
        let options = GradOptions::default().with_retain_graph(retain_graph);
        let grads = self.grad_with(outputs, &seeds, inputs, options)?;
        grads
            .into_iter()
            .enumerate()
            .map(|(index, grad)| grad.ok_or(EngineError::UnusedInput { index }))
            .collect()
    }

    /// Returns the gradient of `sum(seed_i * output_i)` for each input.
    ///
    /// Inputs may be leaves or intermediate results.
    pub fn grad_with(
        &self,
        outputs: &[Tensor],
        seeds: &[f64],
        inputs: &[Tensor],
        options: GradOptions,
    ) -> EngineResult<Vec<Option<f64>>> {
        if seeds.len() != outputs.len() {
            return Err(EngineError::SeedMismatch {
                seeds: seeds.len(),
                outputs: outputs.len(),
            });
        }
        if let Some(untracked) = outputs.iter().find(|t| !t.requires_grad()) {
            trace!(output = %untracked.id(), "grad requested for untracked output");
            return Err(EngineError::NoGradFn);
        }

        let targets: Vec<Target> = inputs
            .iter()
            .map(|input| match input.node_id() {
                Some(node) => Target::Node(node),
                None => Target::Leaf(input.id()),
            })
            .collect();

        let task = self.enter_backward();
        trace!(backward = %task.id(), outputs = outputs.len(), inputs = inputs.len(), "starting grad");
        let roots: Vec<Rc<Node>> = outputs.iter().filter_map(|t| t.grad_fn().cloned()).collect();
        let seeded = outputs.iter().cloned().zip(seeds.iter().copied()).collect();
        let captured = GraphTask::new(self, &roots, Some(&targets), options.retain_graph)
            .execute(seeded)?
            .unwrap_or_default();

        inputs
            .iter()
            .zip(targets.iter())
            .enumerate()
            .map(|(index, (input, target))| {
                let grad = match target {
                    Target::Leaf(id) => captured.leaves.get(id).copied(),
                    Target::Node(id) => captured.nodes.get(id).copied(),
                };
                match grad {
                    Some(g) => Ok(Some(g)),
                    None if options.allow_unused => Ok(None),
                    None => {
                        trace!(input = %input.id(), index, "input unreachable from outputs");
                        Err(EngineError::UnusedInput { index })
                    }
                }
            })
            .collect()
    }
}
