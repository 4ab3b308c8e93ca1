//! A bounded recycler for anchors.
//!
//! Every successful operation on the deque replaces its anchor, so anchors churn at the same rate
//! as operations. The pool keeps a bounded number of spare boxes around so that most operations
//! don't have to allocate one.
//!
//! An anchor may only be handed out again once no thread can still be reading it, otherwise a
//! CAS against the recycled box could succeed for an unrelated deque state. Each slot therefore
//! remembers the epoch at which its anchor was retired, and is reused only after that epoch
//! expires. Anchors that were never published (candidates that lost their CAS) are reusable
//! right away.
//!
//! The pool's own lock is never held while the deque performs its CAS.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::anchor::Anchor;
use crate::epoch::{self, Pin};

/// A recycled anchor and the epoch at which it was retired, if it was ever published.
struct Slot<T> {
    anchor: Box<Anchor<T>>,
    retired_at: Option<usize>,
}

impl<T> Slot<T> {
    fn is_reusable(&self) -> bool {
        self.retired_at.map_or(true, epoch::is_expired)
    }
}

pub struct AnchorPool<T> {
    /// Unpublished anchors sit at the front, retired ones are appended in epoch order.
    slots: RwLock<VecDeque<Slot<T>>>,
    capacity: usize,
}

// The pool only holds anchors that are unreachable from the deque.
unsafe impl<T: Send> Send for AnchorPool<T> {}
unsafe impl<T: Send> Sync for AnchorPool<T> {}

impl<T> AnchorPool<T> {
    /// Returns a new pool holding at most `capacity` spare anchors.
    pub fn new(capacity: usize) -> Self {
        AnchorPool {
            slots: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns a reusable anchor, or allocates a fresh one.
    ///
    /// The returned anchor is unpublished and may be freely overwritten.
    pub fn get(&self) -> Box<Anchor<T>> {
        let slots = self.slots.upgradable_read();

        match slots.front() {
            Some(slot) if slot.is_reusable() => {
                let mut slots = RwLockUpgradableReadGuard::upgrade(slots);
                match slots.pop_front() {
                    Some(slot) => slot.anchor,
                    None => Box::new(Anchor::empty()),
                }
            }
            _ => Box::new(Anchor::empty()),
        }
    }

    /// Returns an anchor that was never published.
    pub fn recycle(&self, anchor: Box<Anchor<T>>) {
        let mut slots = self.slots.write();
        if slots.len() < self.capacity {
            slots.push_front(Slot {
                anchor,
                retired_at: None,
            });
        }
    }

    /// Returns an anchor that was just replaced in the anchor slot.
    ///
    /// If the pool is full, the anchor is handed to the epoch collector instead.
    pub fn retire(&self, anchor: Box<Anchor<T>>, pin: &Pin) {
        let retired_at = epoch::current();

        let overflow = {
            let mut slots = self.slots.write();
            if slots.len() < self.capacity {
                slots.push_back(Slot {
                    anchor,
                    retired_at: Some(retired_at),
                });
                None
            } else {
                Some(anchor)
            }
        };

        if let Some(anchor) = overflow {
            tracing::trace!(capacity = self.capacity, "anchor pool full, deferring free");
            unsafe { epoch::defer_free(Box::into_raw(anchor), pin) }
        }
    }
}

impl<T> fmt::Debug for AnchorPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorPool")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
