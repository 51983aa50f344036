//! Identity tokens correlating discarded values with their recomputations.
//!
//! A [`Handle`] carries no payload; it only has identity. A [`Holder`] is
//! what the graph actually stores in place of a discarded value and points
//! at the current handle. Recomputed values are cached per handle, so
//! clearing the holder's handle is what releases the cached value.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque identity token.
pub struct Handle {
    id: u64,
}

impl Handle {
    pub(crate) fn fresh() -> Rc<Handle> {
        Rc::new(Handle {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Key under which recomputed values for this handle are cached.
    pub(crate) fn key(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.id)
    }
}

/// Placeholder stored in the graph for a discarded value.
///
/// The holder is the sole strong owner of its handle. Frames only keep weak
/// references to holders, so a holder lives exactly as long as the graph
/// slot that stores it.
#[derive(Debug)]
pub struct Holder {
    handle: RefCell<Option<Rc<Handle>>>,
}

impl Holder {
    pub(crate) fn new() -> Rc<Holder> {
        Rc::new(Holder {
            handle: RefCell::new(Some(Handle::fresh())),
        })
    }

    /// Returns the current handle, if it has not been consumed.
    pub(crate) fn handle(&self) -> Option<Rc<Handle>> {
        self.handle.borrow().clone()
    }

    /// Returns the current handle, minting a new one if it was consumed.
    pub(crate) fn handle_or_refresh(&self) -> Rc<Handle> {
        let mut slot = self.handle.borrow_mut();
        Rc::clone(slot.get_or_insert_with(Handle::fresh))
    }

    /// Drops the handle, invalidating any cache entry keyed by it.
    pub(crate) fn clear(&self) {
        self.handle.borrow_mut().take();
    }

    /// Returns true while the holder's handle has not been consumed.
    pub fn is_armed(&self) -> bool {
        self.handle.borrow().is_some()
    }
}
