//! Region stacks kept in the [`Context`] extension store.
//!
//! The stacks form a stack of entries, each entry being the ordered list of
//! frames active in one execution: the bottom entry belongs to the ordinary
//! forward, and every recomputation pushes a fresh entry of its own. A
//! region entered while replaying an ancestor therefore sees an empty list
//! of frames, exactly like a region entered at the top level.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use recomp_core::Context;

use crate::frame::{Frame, FrameId};

struct StackEntry {
    frames: Vec<Rc<Frame>>,
    is_recompute: bool,
}

impl StackEntry {
    fn new(is_recompute: bool) -> Self {
        Self {
            frames: Vec::new(),
            is_recompute,
        }
    }
}

/// Stack of region-stack entries plus the early-stop switch.
pub struct RegionStacks {
    entries: RefCell<Vec<StackEntry>>,
    early_stop: Cell<bool>,
}

impl Default for RegionStacks {
    fn default() -> Self {
        Self {
            entries: RefCell::new(vec![StackEntry::new(false)]),
            early_stop: Cell::new(false),
        }
    }
}

impl RegionStacks {
    /// Returns the stacks owned by `ctx`.
    pub fn of(ctx: &Context) -> Rc<RegionStacks> {
        ctx.extension::<RegionStacks>()
    }

    /// Number of entries, including the bottom forward entry.
    pub fn depth(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Frames of the top entry, outermost first.
    pub fn current_frames(&self) -> Vec<Rc<Frame>> {
        self.entries
            .borrow()
            .last()
            .map(|entry| entry.frames.clone())
            .unwrap_or_default()
    }

    /// Innermost frame of the top entry.
    pub fn innermost(&self) -> Option<Rc<Frame>> {
        self.entries
            .borrow()
            .last()
            .and_then(|entry| entry.frames.last().cloned())
    }

    /// Returns true if the top entry belongs to a recomputation.
    pub fn is_recomputing(&self) -> bool {
        self.entries
            .borrow()
            .last()
            .is_some_and(|entry| entry.is_recompute)
    }

    /// Returns true if recomputations stop once every recorded save has
    /// been replayed.
    pub fn early_stop(&self) -> bool {
        self.early_stop.get()
    }

    pub(crate) fn push_frame(self: &Rc<Self>, frame: Rc<Frame>) -> FrameGuard {
        let id = frame.id();
        let mut entries = self.entries.borrow_mut();
        match entries.last_mut() {
            Some(entry) => entry.frames.push(frame),
            None => entries.push(StackEntry {
                frames: vec![frame],
                is_recompute: false,
            }),
        }
        FrameGuard {
            stacks: Rc::clone(self),
            frame: id,
        }
    }

    pub(crate) fn push_recompute_entry(self: &Rc<Self>) -> EntryGuard {
        let mut entries = self.entries.borrow_mut();
        entries.push(StackEntry::new(true));
        EntryGuard {
            stacks: Rc::clone(self),
            depth: entries.len(),
        }
    }
}

impl fmt::Debug for RegionStacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.borrow();
        f.debug_struct("RegionStacks")
            .field("depth", &entries.len())
            .field(
                "frames",
                &entries.iter().map(|e| e.frames.len()).collect::<Vec<_>>(),
            )
            .field("early_stop", &self.early_stop.get())
            .finish()
    }
}

/// Pops a frame from the top entry when dropped.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub(crate) struct FrameGuard {
    stacks: Rc<RegionStacks>,
    frame: FrameId,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let mut entries = self.stacks.entries.borrow_mut();
        if let Some(entry) = entries.last_mut() {
            let popped = entry.frames.pop();
            debug_assert_eq!(
                popped.map(|f| f.id()),
                Some(self.frame),
                "checkpoint regions exited out of order"
            );
        }
    }
}

/// Pops a recompute entry when dropped.
#[must_use = "the entry is popped as soon as the guard is dropped"]
pub(crate) struct EntryGuard {
    stacks: Rc<RegionStacks>,
    depth: usize,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let mut entries = self.stacks.entries.borrow_mut();
        debug_assert_eq!(entries.len(), self.depth, "recompute entries popped out of order");
        entries.truncate(self.depth.saturating_sub(1));
    }
}

/// Restores the previous early-stop setting when dropped.
#[must_use = "the early-stop setting is restored as soon as the guard is dropped"]
pub struct EarlyStopGuard {
    stacks: Rc<RegionStacks>,
    previous: bool,
}

impl Drop for EarlyStopGuard {
    fn drop(&mut self) {
        self.stacks.early_stop.set(self.previous);
    }
}

/// Enables or disables early stopping of recomputations until the guard is
/// dropped. Disabled by default.
///
/// With early stop a replay ends as soon as it has produced every save the
/// original run recorded; the rest of the body is skipped. Results are the
/// same either way.
pub fn set_early_stop(ctx: &Context, enabled: bool) -> EarlyStopGuard {
    let stacks = RegionStacks::of(ctx);
    let previous = stacks.early_stop.replace(enabled);
    EarlyStopGuard { stacks, previous }
}

/// Discards all region stacks of `ctx`, leaving a single empty forward
/// entry. Useful after a failed region left the stacks in an unknown state.
pub fn reset_region_stacks(ctx: &Context) {
    ctx.reset_extension::<RegionStacks>();
}
