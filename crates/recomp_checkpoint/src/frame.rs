//! Bookkeeping for one checkpoint-region invocation.
//!
//! A [`Frame`] records, in save order, a weak reference to every
//! [`Holder`] created while it was the innermost active frame. During
//! recomputation the n-th save of the replayed body is matched against the
//! n-th recorded holder, so the replay must perform the same saves in the
//! same order as the original run.
//!
//! Per-backward state (the recomputed values, the replay counter and the
//! completion flag) is keyed by [`BackwardId`], which keeps separate
//! backward passes from seeing each other's recomputations.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use recomp_core::{BackwardId, Context, Tensor};

use crate::error::{CheckpointError, CheckpointResult};
use crate::identity::{Handle, Holder};

static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);

/// Identifier of a checkpoint frame, unique per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub(crate) u64);

impl FrameId {
    fn fresh() -> Self {
        Self(NEXT_FRAME.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Callback re-executing a region body from its inputs.
///
/// Its return value is discarded; only the saves it performs matter.
pub type RecomputeFn = Rc<dyn Fn(&Context, &[Tensor]) -> CheckpointResult<()>>;

/// Where a frame gets its inputs from when it is recomputed.
pub(crate) enum InputProvenance {
    /// The frame keeps its inputs itself.
    Owned(Vec<Tensor>),
    /// The inputs were saved on the parent frame and are recovered from the
    /// parent's recomputed values.
    Delegated(Vec<DelegatedInput>),
}

/// One input of a nested frame.
#[derive(Debug)]
pub(crate) enum DelegatedInput {
    /// Saved on the parent at this position of its holder list.
    Saved { position: usize },
    /// Not tracked by the engine; no save fired for it.
    Untracked(Tensor),
}

/// Recomputation state of one frame for one backward invocation.
#[derive(Default)]
struct PassState {
    recomputed: HashMap<u64, (Weak<Handle>, Tensor)>,
    counter: usize,
    is_recomputed: bool,
}

impl PassState {
    fn insert(&mut self, handle: &Rc<Handle>, value: Tensor) {
        self.recomputed
            .insert(handle.key(), (Rc::downgrade(handle), value));
    }

    /// Drops entries whose handle died; they can never be looked up again.
    fn prune(&mut self) -> usize {
        let before = self.recomputed.len();
        self.recomputed.retain(|_, (weak, _)| weak.strong_count() > 0);
        before - self.recomputed.len()
    }

    fn take(&mut self, handle: &Handle) -> Option<Tensor> {
        self.recomputed.remove(&handle.key()).map(|(_, value)| value)
    }
}

/// One checkpoint-region invocation.
pub struct Frame {
    id: FrameId,
    recompute: RecomputeFn,
    provenance: InputProvenance,
    weak_holders: RefCell<Vec<Weak<Holder>>>,
    child_positions: RefCell<HashSet<usize>>,
    passes: RefCell<HashMap<BackwardId, PassState>>,
}

impl Frame {
    pub(crate) fn new(recompute: RecomputeFn, provenance: InputProvenance) -> Rc<Frame> {
        Rc::new(Frame {
            id: FrameId::fresh(),
            recompute,
            provenance,
            weak_holders: RefCell::new(Vec::new()),
            child_positions: RefCell::new(HashSet::new()),
            passes: RefCell::new(HashMap::new()),
        })
    }

    /// Returns the frame identifier.
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Returns the number of saves recorded while this frame was innermost.
    pub fn holder_count(&self) -> usize {
        self.weak_holders.borrow().len()
    }

    /// Returns the number of recorded holders still referenced by a graph.
    pub fn live_holders(&self) -> usize {
        self.weak_holders
            .borrow()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Returns true if the frame's inputs live on its parent.
    pub fn is_delegated(&self) -> bool {
        matches!(self.provenance, InputProvenance::Delegated(_))
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Appends a holder and returns its position.
    pub(crate) fn record_holder(&self, holder: &Rc<Holder>) -> usize {
        let mut holders = self.weak_holders.borrow_mut();
        holders.push(Rc::downgrade(holder));
        holders.len() - 1
    }

    /// Returns the holder at `position` if it is recorded and still alive.
    pub(crate) fn holder_at(&self, position: usize) -> Option<Rc<Holder>> {
        self.weak_holders
            .borrow()
            .get(position)
            .and_then(Weak::upgrade)
    }

    /// Tags positions holding a nested frame's inputs.
    pub(crate) fn mark_child_positions(&self, positions: Range<usize>) {
        self.child_positions.borrow_mut().extend(positions);
    }

    pub(crate) fn is_child_position(&self, position: usize) -> bool {
        self.child_positions.borrow().contains(&position)
    }

    // ========================================================================
    // Per-backward state
    // ========================================================================

    pub(crate) fn is_recomputed(&self, gid: BackwardId) -> bool {
        self.passes
            .borrow()
            .get(&gid)
            .is_some_and(|pass| pass.is_recomputed)
    }

    pub(crate) fn mark_recomputed(&self, gid: BackwardId) {
        self.passes.borrow_mut().entry(gid).or_default().is_recomputed = true;
    }

    /// Advances the replay counter, returning the position of the current
    /// save and the number of saves replayed so far.
    pub(crate) fn advance(&self, gid: BackwardId) -> (usize, usize) {
        let mut passes = self.passes.borrow_mut();
        let pass = passes.entry(gid).or_default();
        let position = pass.counter;
        pass.counter += 1;
        (position, pass.counter)
    }

    pub(crate) fn publish(&self, gid: BackwardId, handle: &Rc<Handle>, value: Tensor) {
        self.passes
            .borrow_mut()
            .entry(gid)
            .or_default()
            .insert(handle, value);
    }

    /// Removes and returns the recomputed value for `handle`.
    pub(crate) fn take(&self, gid: BackwardId, handle: &Handle) -> Option<Tensor> {
        self.passes.borrow_mut().get_mut(&gid)?.take(handle)
    }

    /// Drops recomputed values for `gid` whose holder is gone, returning how
    /// many were dropped.
    pub(crate) fn prune(&self, gid: BackwardId) -> usize {
        self.passes
            .borrow_mut()
            .get_mut(&gid)
            .map_or(0, PassState::prune)
    }

    /// Number of recomputed values not yet consumed for `gid`.
    pub fn pending_values(&self, gid: BackwardId) -> usize {
        self.passes
            .borrow()
            .get(&gid)
            .map_or(0, |pass| pass.recomputed.len())
    }

    /// Number of recomputed values not yet consumed, over all backward
    /// invocations.
    pub fn cached_values(&self) -> usize {
        self.passes
            .borrow()
            .values()
            .map(|pass| pass.recomputed.len())
            .sum()
    }

    /// Number of backward invocations with state on this frame.
    pub fn tracked_passes(&self) -> usize {
        self.passes.borrow().len()
    }

    pub(crate) fn forget(&self, gid: BackwardId) {
        self.passes.borrow_mut().remove(&gid);
    }

    // ========================================================================
    // Recomputation
    // ========================================================================

    /// Produces the arguments for recomputing this frame under `gid`.
    ///
    /// Delegated inputs are taken out of the parent's recomputed values, so
    /// the parent must already have been recomputed for `gid`.
    pub(crate) fn resolve_inputs(&self, parent: Option<&Frame>, gid: BackwardId) -> CheckpointResult<Vec<Tensor>> {
        let inputs = match &self.provenance {
            InputProvenance::Owned(inputs) => return Ok(inputs.clone()),
            InputProvenance::Delegated(inputs) => inputs,
        };
        let parent = parent.ok_or(CheckpointError::NoActiveFrame)?;
        inputs
            .iter()
            .map(|input| match input {
                DelegatedInput::Untracked(value) => Ok(value.clone()),
                DelegatedInput::Saved { position } => {
                    let unavailable = || CheckpointError::ParentInputUnavailable {
                        parent: parent.id,
                        position: *position,
                    };
                    let holder = parent.holder_at(*position).ok_or_else(unavailable)?;
                    let handle = holder.handle().ok_or_else(unavailable)?;
                    parent.take(gid, &handle).ok_or_else(unavailable)
                }
            })
            .collect()
    }

    pub(crate) fn run_recompute(&self, ctx: &Context, args: &[Tensor]) -> CheckpointResult<()> {
        (self.recompute)(ctx, args)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("delegated", &self.is_delegated())
            .field("holders", &self.holder_count())
            .field("child_positions", &self.child_positions.borrow().len())
            .field("passes", &self.tracked_passes())
            .finish()
    }
}
