//! Membership set of every live [`ClientHandle`](crate::socket::client::ClientHandle).
//!
//! The registry only observes handles (it stores `Weak` references) and exists
//! for one purpose: tearing every connection down at once, for example after
//! the network interface is reconfigured.

use crate::socket::client::HandleCore;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Registry-assigned identity of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

#[derive(Default)]
pub struct HandleRegistry {
    next_id: Cell<u64>,
    entries: RefCell<BTreeMap<HandleId, Weak<HandleCore>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> HandleId {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        HandleId(id)
    }

    pub(crate) fn register(&self, core: &Rc<HandleCore>) {
        self.entries.borrow_mut().insert(core.id(), Rc::downgrade(core));
    }

    pub(crate) fn deregister(&self, id: HandleId) {
        self.entries.borrow_mut().remove(&id);
    }

    /// Number of handles currently alive.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Abort the connection of every registered handle and clear it.
    ///
    /// Contexts are aborted rather than closed, even when other references
    /// would keep them alive, and pending connect attempts are cancelled.
    /// Handles stay registered and reusable. Returns how many handles held a
    /// connection or a pending attempt.
    pub fn stop_all(&self) -> usize {
        // Snapshot first: aborting can run arbitrary drops, and a handle
        // created or dropped meanwhile must not touch a borrowed map.
        let snapshot: Vec<Rc<HandleCore>> =
            self.entries.borrow().values().filter_map(Weak::upgrade).collect();

        let stopped = snapshot.iter().filter(|core| core.force_abort()).count();
        tracing::debug!(handles = snapshot.len(), stopped, "stopped all client connections");
        stopped
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry").field("live", &self.len()).finish()
    }
}
