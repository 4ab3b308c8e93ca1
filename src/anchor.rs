//! Nodes, links and anchors.
//!
//! The whole mutable state of a deque is captured by a single [`Anchor`]: its two end nodes and
//! a [`State`] saying whether the last push still has an inner back-link to write. Anchors are
//! swapped as a unit, so every structural change is one CAS on the anchor slot.
//!
//! Neighbour pointers between nodes go through [`Link`] cells. A link is allocated once, installed
//! at most once, and retired through the epoch collector when it is replaced. That way a thread
//! comparing against a link it observed can never be fooled by a recycled address while it is
//! still pinned.
//!
//! [`Anchor`]: struct.Anchor.html
//! [`State`]: enum.State.html
//! [`Link`]: struct.Link.html

use std::fmt;
use std::ptr;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use crate::epoch::{Atomic, Pin};

/// Whether the chain between the two ends of an anchor is consistent in both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Both directions are fully linked.
    Stable = 0,
    /// A node was pushed on the left; the old leftmost doesn't point back to it yet.
    LeftPush = 1,
    /// A node was pushed on the right; the old rightmost doesn't point back to it yet.
    RightPush = 2,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Stable,
            1 => State::LeftPush,
            _ => State::RightPush,
        }
    }
}

/// A pointer to a neighbouring node.
pub struct Link<T> {
    pub node: *mut Node<T>,
}

impl<T> Link<T> {
    pub fn new(node: *mut Node<T>) -> Box<Link<T>> {
        Box::new(Link { node })
    }
}

/// A single element of the deque.
pub struct Node<T> {
    /// The payload.
    pub value: T,
    /// The node to the left.
    pub left: Atomic<Link<T>>,
    /// The node to the right.
    pub right: Atomic<Link<T>>,
}

// Retired nodes are destroyed by whichever thread collects their bag.
unsafe impl<T: Send> Send for Node<T> {}

impl<T> Node<T> {
    pub fn new(value: T) -> Node<T> {
        Node {
            value,
            left: Atomic::null(),
            right: Atomic::null(),
        }
    }

    /// Follows the right link, returning null if there is none.
    pub fn right_node(&self, pin: &Pin) -> *mut Node<T> {
        self.right
            .load(Acquire, pin)
            .as_ref()
            .map_or(ptr::null_mut(), |l| l.node)
    }

    /// Follows the left link, returning null if there is none.
    #[cfg(any(test, feature = "internals"))]
    pub fn left_node(&self, pin: &Pin) -> *mut Node<T> {
        self.left
            .load(Acquire, pin)
            .as_ref()
            .map_or(ptr::null_mut(), |l| l.node)
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        // The links currently installed belong to this node. Replaced ones were retired by
        // whoever replaced them.
        unsafe {
            for link in &[&self.left, &self.right] {
                let raw = link.load_raw(Relaxed);
                if !raw.is_null() {
                    drop(Box::from_raw(raw));
                }
            }
        }
    }
}

/// A snapshot of both ends of the deque.
///
/// Once published an anchor is immutable, except for `state`, which may be flipped from a push
/// state to `Stable` by any thread that finished the pending back-link.
pub struct Anchor<T> {
    /// The leftmost node, or null if the deque is empty.
    pub leftmost: *mut Node<T>,
    /// The rightmost node, or null if the deque is empty.
    pub rightmost: *mut Node<T>,
    state: AtomicU8,
    /// The back-link that completes a push: in `LeftPush` it goes into the old leftmost's left
    /// field, in `RightPush` into the old rightmost's right field. Null when `Stable`.
    pub pending: *mut Link<T>,
}

impl<T> Anchor<T> {
    /// Returns an anchor describing an empty deque.
    pub fn empty() -> Anchor<T> {
        Anchor {
            leftmost: ptr::null_mut(),
            rightmost: ptr::null_mut(),
            state: AtomicU8::new(State::Stable as u8),
            pending: ptr::null_mut(),
        }
    }

    /// Overwrites all fields. Only valid while the anchor is unpublished.
    pub fn set(
        &mut self,
        leftmost: *mut Node<T>,
        rightmost: *mut Node<T>,
        state: State,
        pending: *mut Link<T>,
    ) {
        debug_assert_eq!(leftmost.is_null(), rightmost.is_null());
        debug_assert_eq!(state == State::Stable, pending.is_null());

        self.leftmost = leftmost;
        self.rightmost = rightmost;
        *self.state.get_mut() = state as u8;
        self.pending = pending;
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.leftmost.is_null()
    }

    /// Marks the pending back-link as written.
    ///
    /// Idempotent: if another thread already did it, nothing changes.
    pub fn stabilize(&self, from: State) {
        debug_assert_ne!(from, State::Stable);
        let _ = self
            .state
            .compare_exchange(from as u8, State::Stable as u8, AcqRel, Acquire);
    }
}

impl<T> fmt::Debug for Anchor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anchor")
            .field("leftmost", &self.leftmost)
            .field("rightmost", &self.rightmost)
            .field("state", &self.state())
            .finish()
    }
}
