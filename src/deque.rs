//! A lock-free double-ended queue.
//!
//! The entire mutable state of the deque is one [`Anchor`] behind an atomic pointer. Every push
//! and pop reads the current anchor, computes a replacement, and tries to swap it in with a single
//! CAS. The CAS order is the linearization order.
//!
//! A push can't link the new node in both directions atomically. It publishes an anchor in the
//! `LeftPush` (or `RightPush`) state, where the new end already points inward but the old end
//! doesn't yet point back. Any thread that finds the deque in such a state first finishes the
//! back-link and flips the anchor to `Stable`, so a stalled pusher never wedges the structure.
//!
//! [`Anchor`]: ../anchor/struct.Anchor.html

use std::fmt;
use std::iter::FromIterator;
use std::ptr;
use std::sync::atomic::AtomicIsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use crate::anchor::{Anchor, Link, Node, State};
use crate::epoch::{self, Atomic, Pin, Ptr};
use crate::pool::AnchorPool;

/// Number of spare anchors a deque keeps by default.
const DEFAULT_POOL_CAPACITY: usize = 64;

/// Construction options for a [`LockFreeDeque`].
///
/// [`LockFreeDeque`]: struct.LockFreeDeque.html
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DequeConfig {
    pool_capacity: usize,
}

impl DequeConfig {
    pub fn new() -> Self {
        DequeConfig {
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }

    /// Sets how many retired anchors are kept for reuse. Zero disables pooling.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
}

impl Default for DequeConfig {
    fn default() -> Self {
        DequeConfig::new()
    }
}

/// Which end of the deque an operation works on.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    /// The state an anchor is in right after a push on this side.
    fn push_state(self) -> State {
        match self {
            Side::Left => State::LeftPush,
            Side::Right => State::RightPush,
        }
    }

    /// The end node of `anchor` on this side.
    fn end<T>(self, anchor: &Anchor<T>) -> *mut Node<T> {
        match self {
            Side::Left => anchor.leftmost,
            Side::Right => anchor.rightmost,
        }
    }

    /// The link in `node` pointing away from this side, towards the inside of the deque.
    fn inward<T>(self, node: &Node<T>) -> &Atomic<Link<T>> {
        match self {
            Side::Left => &node.right,
            Side::Right => &node.left,
        }
    }

    /// The link in `node` pointing towards this side.
    fn outward<T>(self, node: &Node<T>) -> &Atomic<Link<T>> {
        match self {
            Side::Left => &node.left,
            Side::Right => &node.right,
        }
    }
}

/// A lock-free double-ended queue.
///
/// It can be used with multiple producers and multiple consumers on both ends at the same time.
/// No operation blocks: contention only causes a retry.
///
/// Values are read out of shared nodes, so popping and peeking return clones. The stored value is
/// dropped once no thread can observe its node anymore.
///
/// `len` and the snapshot returned by `to_vec` are advisory under concurrent mutation.
///
/// # Examples
///
/// ```
/// use anchor_deque::LockFreeDeque;
///
/// let d = LockFreeDeque::new();
/// d.push_right(1);
/// d.push_right(2);
/// d.push_left(0);
///
/// assert_eq!(d.to_vec(), vec![0, 1, 2]);
/// assert_eq!(d.try_pop_left(), Some(0));
/// assert_eq!(d.try_pop_right(), Some(2));
/// assert_eq!(d.len(), 1);
/// ```
pub struct LockFreeDeque<T> {
    /// The current anchor. Never null.
    anchor: Atomic<Anchor<T>>,
    /// Number of elements, updated after each successful CAS.
    len: AtomicIsize,
    pool: AnchorPool<T>,
}

unsafe impl<T: Send> Send for LockFreeDeque<T> {}
unsafe impl<T: Send + Sync> Sync for LockFreeDeque<T> {}

impl<T> LockFreeDeque<T> {
    /// Returns a new, empty deque.
    pub fn new() -> Self {
        Self::with_config(DequeConfig::default())
    }

    /// Returns a new, empty deque configured by `config`.
    pub fn with_config(config: DequeConfig) -> Self {
        tracing::debug!(pool_capacity = config.pool_capacity, "creating lock-free deque");
        LockFreeDeque {
            anchor: Atomic::new(Anchor::empty()),
            len: AtomicIsize::new(0),
            pool: AnchorPool::new(config.pool_capacity),
        }
    }

    /// Returns the number of elements.
    ///
    /// Under concurrent mutation the result may already be stale.
    pub fn len(&self) -> usize {
        let len = self.len.load(Relaxed);
        if len < 0 {
            0
        } else {
            len as usize
        }
    }

    /// Returns `true` if the deque was empty at the moment of the call.
    pub fn is_empty(&self) -> bool {
        epoch::pin(|pin| self.current(pin).1.is_empty())
    }

    /// Loads the current anchor.
    fn current<'p>(&self, pin: &'p Pin) -> (Ptr<'p, Anchor<T>>, &'p Anchor<T>) {
        let a = self.anchor.load(Acquire, pin);
        // The anchor slot is initialized in the constructor and only ever replaced.
        (a, unsafe { &*a.as_raw() })
    }

    /// Finishes the push recorded in anchor `a`, if there is one pending.
    fn stabilize(&self, a: Ptr<'_, Anchor<T>>, anchor: &Anchor<T>, pin: &Pin) {
        let side = match anchor.state() {
            State::Stable => return,
            State::LeftPush => Side::Left,
            State::RightPush => Side::Right,
        };

        unsafe {
            // The new end node points inward to the previous end.
            let prev = match side
                .inward(&*side.end(anchor))
                .load(Acquire, pin)
                .as_ref()
            {
                Some(link) => link.node,
                None => return,
            };

            // If the anchor moved on, `prev` may be an unrelated node.
            if self.anchor.load(Acquire, pin) != a {
                return;
            }

            let field = side.outward(&*prev);
            let observed = field.load(Acquire, pin);

            if observed.as_raw() != anchor.pending {
                // The previous end still has its old outward link. The anchor check must come
                // after reading it: while `a` is current nobody but a helper of `a` writes there.
                if self.anchor.load(Acquire, pin) != a {
                    return;
                }

                match field.cas(observed, Ptr::from_raw(anchor.pending), AcqRel) {
                    Ok(()) => {
                        if !observed.is_null() {
                            epoch::defer_free(observed.as_raw(), pin);
                        }
                    }
                    Err(actual) if actual.as_raw() == anchor.pending => {}
                    Err(_) => return,
                }
            }
        }

        anchor.stabilize(side.push_state());
    }

    /// Loads the current anchor, helping along any pending push first.
    fn stable<'p>(&self, pin: &'p Pin) -> (Ptr<'p, Anchor<T>>, &'p Anchor<T>) {
        loop {
            let (a, anchor) = self.current(pin);
            if anchor.state() == State::Stable {
                return (a, anchor);
            }
            self.stabilize(a, anchor, pin);
        }
    }
}

impl<T> LockFreeDeque<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Pushes an element onto the left end.
    pub fn push_left(&self, value: T) {
        self.push(Side::Left, value)
    }

    /// Pushes an element onto the right end.
    pub fn push_right(&self, value: T) {
        self.push(Side::Right, value)
    }

    /// Attempts to pop an element from the left end.
    ///
    /// Returns `None` if the deque is empty.
    pub fn try_pop_left(&self) -> Option<T> {
        self.pop(Side::Left)
    }

    /// Attempts to pop an element from the right end.
    ///
    /// Returns `None` if the deque is empty.
    pub fn try_pop_right(&self) -> Option<T> {
        self.pop(Side::Right)
    }

    /// Returns a clone of the leftmost element, or `None` if the deque is empty.
    pub fn try_peek_left(&self) -> Option<T> {
        self.peek(Side::Left)
    }

    /// Returns a clone of the rightmost element, or `None` if the deque is empty.
    pub fn try_peek_right(&self) -> Option<T> {
        self.peek(Side::Right)
    }

    /// Pops an element from the left end.
    pub fn pop_left(&self) -> crate::Result<T> {
        self.try_pop_left().ok_or(crate::Error::EmptyCollection)
    }

    /// Pops an element from the right end.
    pub fn pop_right(&self) -> crate::Result<T> {
        self.try_pop_right().ok_or(crate::Error::EmptyCollection)
    }

    /// Returns a clone of the leftmost element.
    pub fn peek_left(&self) -> crate::Result<T> {
        self.try_peek_left().ok_or(crate::Error::EmptyCollection)
    }

    /// Returns a clone of the rightmost element.
    pub fn peek_right(&self) -> crate::Result<T> {
        self.try_peek_right().ok_or(crate::Error::EmptyCollection)
    }

    /// Pops elements from the left until the deque is empty.
    pub fn clear(&self) {
        while self.try_pop_left().is_some() {}
    }

    /// Returns the elements from left to right.
    ///
    /// The walk starts from a stable anchor and follows links as they are at the time of the
    /// call. It is not atomic with respect to concurrent pushes and pops.
    pub fn to_vec(&self) -> Vec<T> {
        epoch::pin(|pin| {
            let (_, anchor) = self.stable(pin);

            let mut values = Vec::new();
            let mut curr = anchor.leftmost;
            while let Some(node) = unsafe { curr.as_ref() } {
                values.push(node.value.clone());
                if curr == anchor.rightmost {
                    break;
                }
                curr = node.right_node(pin);
            }
            values
        })
    }

    fn push(&self, side: Side, value: T) {
        let node = Box::into_raw(Box::new(Node::new(value)));
        let mut candidate = self.pool.get();
        // The back-link the previous end will receive. Allocated on first need.
        let mut pending: *mut Link<T> = ptr::null_mut();

        let pushed_onto_empty = epoch::pin(|pin| loop {
            let (a, anchor) = self.stable(pin);
            let end = side.end(anchor);

            unsafe {
                // `node` is unpublished, so its links can be rewritten freely on every attempt.
                relink(side.inward(&*node), end, pin);

                if end.is_null() {
                    candidate.set(node, node, State::Stable, ptr::null_mut());
                } else {
                    if pending.is_null() {
                        pending = Box::into_raw(Link::new(node));
                    }
                    match side {
                        Side::Left => {
                            candidate.set(node, anchor.rightmost, State::LeftPush, pending)
                        }
                        Side::Right => {
                            candidate.set(anchor.leftmost, node, State::RightPush, pending)
                        }
                    }
                }

                match self.anchor.cas_box_weak(a, candidate, AcqRel) {
                    Ok(new) => {
                        self.len.fetch_add(1, Relaxed);
                        self.stabilize(new, &*new.as_raw(), pin);
                        self.pool.retire(Box::from_raw(a.as_raw()), pin);
                        return end.is_null();
                    }
                    Err((_, c)) => candidate = c,
                }
            }
        });

        if pushed_onto_empty && !pending.is_null() {
            unsafe { drop(Box::from_raw(pending)) }
        }
    }

    fn pop(&self, side: Side) -> Option<T> {
        let mut candidate = self.pool.get();

        epoch::pin(|pin| loop {
            let (a, anchor) = self.stable(pin);
            let end = side.end(anchor);

            if end.is_null() {
                self.pool.recycle(candidate);
                return None;
            }

            unsafe {
                if anchor.leftmost == anchor.rightmost {
                    let null = ptr::null_mut();
                    candidate.set(null, null, State::Stable, ptr::null_mut());
                } else {
                    // In a stable anchor the inward link of an end is authoritative.
                    let next = match side.inward(&*end).load(Acquire, pin).as_ref() {
                        Some(link) => link.node,
                        None => continue,
                    };
                    match side {
                        Side::Left => {
                            candidate.set(next, anchor.rightmost, State::Stable, ptr::null_mut())
                        }
                        Side::Right => {
                            candidate.set(anchor.leftmost, next, State::Stable, ptr::null_mut())
                        }
                    }
                }

                match self.anchor.cas_box_weak(a, candidate, AcqRel) {
                    Ok(_) => {
                        self.len.fetch_sub(1, Relaxed);
                        let value = (*end).value.clone();
                        self.pool.retire(Box::from_raw(a.as_raw()), pin);
                        epoch::defer_drop(end, pin);
                        return Some(value);
                    }
                    Err((_, c)) => candidate = c,
                }
            }
        })
    }

    fn peek(&self, side: Side) -> Option<T> {
        epoch::pin(|pin| {
            let (_, anchor) = self.current(pin);
            unsafe { side.end(anchor).as_ref() }.map(|node| node.value.clone())
        })
    }

    /// Verifies the structural invariants and returns the number of elements.
    ///
    /// Panics with a description of the first violation found.
    #[cfg(any(test, feature = "internals"))]
    pub fn check_invariants(&mut self) -> usize {
        use std::collections::HashSet;

        epoch::pin(|pin| {
            let (_, anchor) = self.current(pin);
            assert_eq!(
                anchor.leftmost.is_null(),
                anchor.rightmost.is_null(),
                "exactly one end of the anchor is null"
            );
            assert_eq!(anchor.state(), State::Stable, "quiescent deque has a pending push");

            let mut forward = Vec::new();
            let mut seen = HashSet::new();
            let mut curr = anchor.leftmost;
            while !curr.is_null() {
                assert!(seen.insert(curr as usize), "cycle in the right-going chain");
                forward.push(curr);
                if curr == anchor.rightmost {
                    break;
                }
                curr = unsafe { (*curr).right_node(pin) };
            }
            assert_eq!(
                forward.last().copied().unwrap_or(ptr::null_mut()),
                anchor.rightmost,
                "walking right from leftmost doesn't reach rightmost"
            );

            let mut backward = Vec::new();
            let mut curr = anchor.rightmost;
            while !curr.is_null() && backward.len() <= forward.len() {
                backward.push(curr);
                if curr == anchor.leftmost {
                    break;
                }
                curr = unsafe { (*curr).left_node(pin) };
            }
            backward.reverse();
            assert!(forward == backward, "left and right chains disagree");

            assert_eq!(self.len(), forward.len(), "element counter drifted from the chain");
            forward.len()
        })
    }
}

/// Points the unpublished `field` at `target`, reusing its link cell if it has one.
unsafe fn relink<T>(field: &Atomic<Link<T>>, target: *mut Node<T>, pin: &Pin) {
    let link = field.load_raw(Relaxed);
    if target.is_null() {
        if !link.is_null() {
            field.store(Ptr::null(), Relaxed);
            drop(Box::from_raw(link));
        }
    } else if link.is_null() {
        field.store_box(Link::new(target), Relaxed, pin);
    } else {
        (*link).node = target;
    }
}

impl<T> Drop for LockFreeDeque<T> {
    fn drop(&mut self) {
        unsafe {
            let anchor = Box::from_raw(self.anchor.load_raw(Relaxed));

            // Finish a pending push so that the walk below sees every node linked to the right.
            let side = match anchor.state() {
                State::Stable => None,
                State::LeftPush => Some(Side::Left),
                State::RightPush => Some(Side::Right),
            };
            if let Some(side) = side {
                let inward = side.inward(&*side.end(&*anchor)).load_raw(Relaxed);
                let field = side.outward(&*(*inward).node);
                let old = field.load_raw(Relaxed);
                if old != anchor.pending {
                    if !old.is_null() {
                        drop(Box::from_raw(old));
                    }
                    field.store(Ptr::from_raw(anchor.pending), Relaxed);
                }
            }

            let mut curr = anchor.leftmost;
            while !curr.is_null() {
                let next = if curr == anchor.rightmost {
                    ptr::null_mut()
                } else {
                    let link = (*curr).right.load_raw(Relaxed);
                    (*link).node
                };
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}

impl<T> Default for LockFreeDeque<T> {
    fn default() -> Self {
        LockFreeDeque::new()
    }
}

impl<T> fmt::Debug for LockFreeDeque<T>
where
    T: fmt::Debug + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_vec()).finish()
    }
}

impl<T> Extend<T> for LockFreeDeque<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push_right(value);
        }
    }
}

impl<T> FromIterator<T> for LockFreeDeque<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut deque = LockFreeDeque::new();
        deque.extend(iter);
        deque
    }
}

/// An owning iterator over the elements of a deque, from left to right.
pub struct IntoIter<T>(LockFreeDeque<T>);

impl<T> Iterator for IntoIter<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.0.try_pop_left()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.0.len();
        (len, Some(len))
    }
}

impl<T> DoubleEndedIterator for IntoIter<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn next_back(&mut self) -> Option<T> {
        self.0.try_pop_right()
    }
}

impl<T> IntoIterator for LockFreeDeque<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter(self)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::{AcqRel, Relaxed, SeqCst};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use rand::Rng;

    use super::{DequeConfig, LockFreeDeque, Side};
    use crate::anchor::{Anchor, Link, Node, State};
    use crate::epoch;
    use crate::Error;

    #[test]
    fn push_right_pops_in_order() {
        let d = LockFreeDeque::new();
        d.push_right(1);
        d.push_right(2);
        d.push_right(3);

        assert_eq!(d.try_pop_left(), Some(1));
        assert_eq!(d.try_pop_left(), Some(2));
        assert_eq!(d.try_pop_left(), Some(3));
        assert_eq!(d.try_pop_left(), None);
    }

    #[test]
    fn push_left_pops_reversed() {
        let d = LockFreeDeque::new();
        d.push_left(1);
        d.push_left(2);
        d.push_left(3);

        assert_eq!(d.try_pop_left(), Some(3));
        assert_eq!(d.try_pop_left(), Some(2));
        assert_eq!(d.try_pop_left(), Some(1));
        assert_eq!(d.try_pop_left(), None);
    }

    #[test]
    fn empty_contract() {
        let d = LockFreeDeque::<i32>::new();
        assert_eq!(d.try_pop_left(), None);
        assert_eq!(d.try_pop_right(), None);
        assert_eq!(d.try_peek_left(), None);
        assert_eq!(d.try_peek_right(), None);

        assert_eq!(d.pop_left(), Err(Error::EmptyCollection));
        assert_eq!(d.pop_right(), Err(Error::EmptyCollection));
        assert_eq!(d.peek_left(), Err(Error::EmptyCollection));
        assert_eq!(d.peek_right(), Err(Error::EmptyCollection));

        assert!(d.is_empty());
        assert_eq!(d.len(), 0);
        assert!(d.to_vec().is_empty());
    }

    #[test]
    fn single_element_round_trip() {
        let d = LockFreeDeque::new();
        d.push_left("x");
        assert_eq!(d.try_pop_right(), Some("x"));
        assert!(d.is_empty());

        d.push_right("y");
        assert_eq!(d.try_pop_left(), Some("y"));
        assert!(d.is_empty());
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn peeks_see_both_ends() {
        let d = LockFreeDeque::new();
        d.push_right(String::from("b"));
        d.push_left(String::from("a"));
        d.push_right(String::from("c"));

        assert_eq!(d.peek_left().unwrap(), "a");
        assert_eq!(d.peek_right().unwrap(), "c");
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn mixed_ends() {
        let mut d = LockFreeDeque::new();
        for i in 0..10 {
            if i % 2 == 0 {
                d.push_left(i);
            } else {
                d.push_right(i);
            }
        }
        assert_eq!(d.to_vec(), vec![8, 6, 4, 2, 0, 1, 3, 5, 7, 9]);
        assert_eq!(d.check_invariants(), 10);

        assert_eq!(d.try_pop_right(), Some(9));
        assert_eq!(d.try_pop_left(), Some(8));
        assert_eq!(d.check_invariants(), 8);

        // Drain from the right so the left-going links are exercised.
        let mut rest = Vec::new();
        while let Some(x) = d.try_pop_right() {
            rest.push(x);
        }
        assert_eq!(rest, vec![7, 5, 3, 1, 0, 2, 4, 6]);
        assert_eq!(d.check_invariants(), 0);
    }

    #[test]
    fn refill_after_draining() {
        let mut d = LockFreeDeque::new();
        for round in 0..5 {
            for i in 0..20 {
                d.push_left(round * 100 + i);
            }
            assert_eq!(d.check_invariants(), 20);
            d.clear();
            assert!(d.is_empty());
        }
        assert_eq!(d.check_invariants(), 0);
    }

    #[test]
    fn iterators() {
        let d: LockFreeDeque<u32> = (1..=5).collect();
        assert_eq!(format!("{:?}", d), "[1, 2, 3, 4, 5]");

        let mut it = d.into_iter();
        assert_eq!(it.size_hint(), (5, Some(5)));
        assert_eq!(it.next(), Some(1));
        assert_eq!(it.next_back(), Some(5));
        assert_eq!(it.collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn without_pooling() {
        let mut d = LockFreeDeque::with_config(DequeConfig::new().pool_capacity(0));
        for i in 0..100 {
            d.push_right(i);
        }
        for i in 0..50 {
            assert_eq!(d.try_pop_left(), Some(i));
        }
        assert_eq!(d.check_invariants(), 50);
    }

    #[derive(Clone)]
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    #[test]
    fn drop_releases_remaining_values() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let d = LockFreeDeque::new();
            for _ in 0..10 {
                d.push_right(Tracked(drops.clone()));
            }
        }
        assert_eq!(drops.load(SeqCst), 10);
    }

    /// Publishes a push on `side` the way a pusher would right after its CAS, without writing the
    /// back-link. Returns the previous end and the new node.
    fn stalled_push<T>(d: &LockFreeDeque<T>, side: Side, value: T) -> (*mut Node<T>, *mut Node<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let node = Box::into_raw(Box::new(Node::new(value)));

        epoch::pin(|pin| unsafe {
            let (a, anchor) = d.current(pin);
            assert_eq!(anchor.state(), State::Stable);
            let prev = side.end(anchor);
            assert!(!prev.is_null());

            side.inward(&*node).store_box(Link::new(prev), Relaxed, pin);
            let pending = Box::into_raw(Link::new(node));

            let mut candidate = Box::new(Anchor::empty());
            match side {
                Side::Left => candidate.set(node, anchor.rightmost, State::LeftPush, pending),
                Side::Right => candidate.set(anchor.leftmost, node, State::RightPush, pending),
            }

            assert!(d.anchor.cas_box(a, candidate, AcqRel).is_ok());
            d.len.fetch_add(1, Relaxed);
            d.pool.retire(Box::from_raw(a.as_raw()), pin);

            (prev, node)
        })
    }

    fn state<T>(d: &LockFreeDeque<T>) -> State {
        epoch::pin(|pin| d.current(pin).1.state())
    }

    #[test]
    fn pop_finishes_a_stalled_left_push() {
        let mut d = LockFreeDeque::new();
        d.push_right(1);
        d.push_right(2);

        let (prev, node) = stalled_push(&d, Side::Left, 0);
        assert_eq!(state(&d), State::LeftPush);
        epoch::pin(|pin| unsafe { assert!((*prev).left_node(pin).is_null()) });

        assert_eq!(d.try_pop_right(), Some(2));

        epoch::pin(|pin| unsafe { assert_eq!((*prev).left_node(pin), node) });
        assert_eq!(state(&d), State::Stable);
        assert_eq!(d.check_invariants(), 2);
        assert_eq!(d.to_vec(), vec![0, 1]);
    }

    #[test]
    fn walk_finishes_a_stalled_right_push_over_a_stale_link() {
        let mut d = LockFreeDeque::new();
        d.push_right(1);
        d.push_right(2);
        d.push_right(3);
        // Node 2 keeps its link to the popped node 3.
        assert_eq!(d.try_pop_right(), Some(3));

        let (prev, node) = stalled_push(&d, Side::Right, 4);
        assert_eq!(state(&d), State::RightPush);
        epoch::pin(|pin| unsafe { assert_ne!((*prev).right_node(pin), node) });

        assert_eq!(d.to_vec(), vec![1, 2, 4]);

        epoch::pin(|pin| unsafe { assert_eq!((*prev).right_node(pin), node) });
        assert_eq!(state(&d), State::Stable);
        assert_eq!(d.check_invariants(), 3);

        // The other end is untouched by the fix-up.
        assert_eq!(d.try_pop_left(), Some(1));
        assert_eq!(d.try_pop_right(), Some(4));
        assert_eq!(d.check_invariants(), 1);
    }

    #[test]
    fn push_after_a_stalled_push_helps_first() {
        let mut d = LockFreeDeque::new();
        d.push_left(1);

        let (prev, node) = stalled_push(&d, Side::Left, 0);
        d.push_right(2);

        epoch::pin(|pin| unsafe { assert_eq!((*prev).left_node(pin), node) });
        assert_eq!(d.to_vec(), vec![0, 1, 2]);
        assert_eq!(d.check_invariants(), 3);
    }

    #[test]
    fn drop_during_a_stalled_push_releases_every_value() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let d = LockFreeDeque::new();
            for _ in 0..3 {
                d.push_right(Tracked(drops.clone()));
            }
            stalled_push(&d, Side::Left, Tracked(drops.clone()));
            assert_eq!(state(&d), State::LeftPush);
        }
        assert_eq!(drops.load(SeqCst), 4);

        drops.store(0, SeqCst);
        {
            let d = LockFreeDeque::new();
            for _ in 0..3 {
                d.push_left(Tracked(drops.clone()));
            }
            stalled_push(&d, Side::Right, Tracked(drops.clone()));
            assert_eq!(state(&d), State::RightPush);
        }
        assert_eq!(drops.load(SeqCst), 4);
    }

    #[test]
    fn concurrent_pushes_are_conserved() {
        const THREADS: usize = 4;
        const COUNT: usize = 2_000;

        let d = Arc::new(LockFreeDeque::new());
        let threads = (0..THREADS)
            .map(|t| {
                let d = d.clone();
                thread::spawn(move || {
                    for i in 0..COUNT {
                        if i % 2 == 0 {
                            d.push_left(t * COUNT + i);
                        } else {
                            d.push_right(t * COUNT + i);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for t in threads {
            t.join().unwrap();
        }

        let mut d = Arc::try_unwrap(d).ok().unwrap();
        assert_eq!(d.check_invariants(), THREADS * COUNT);

        let mut all = d.to_vec();
        all.sort();
        assert_eq!(all, (0..THREADS * COUNT).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_push_pop_is_conserved() {
        const THREADS: usize = 4;
        const OPS: usize = 5_000;

        let d = Arc::new(LockFreeDeque::new());
        let pushed = Arc::new(AtomicUsize::new(0));
        let popped = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let threads = (0..THREADS)
            .map(|_| {
                let d = d.clone();
                let pushed = pushed.clone();
                let popped = popped.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    barrier.wait();
                    for i in 0..OPS {
                        match rng.gen_range(0..4) {
                            0 => d.push_left(i),
                            1 => d.push_right(i),
                            2 => {
                                if d.try_pop_left().is_some() {
                                    popped.fetch_add(1, SeqCst);
                                }
                                continue;
                            }
                            _ => {
                                if d.try_pop_right().is_some() {
                                    popped.fetch_add(1, SeqCst);
                                }
                                continue;
                            }
                        }
                        pushed.fetch_add(1, SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for t in threads {
            t.join().unwrap();
        }

        let mut d = Arc::try_unwrap(d).ok().unwrap();
        let remaining = d.check_invariants();
        assert_eq!(popped.load(SeqCst) + remaining, pushed.load(SeqCst));
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Op {
        PushLeft(u32),
        PushRight(u32),
        PopLeft,
        PopRight,
    }

    /// One completed call, with the logical times at which it started and returned.
    #[derive(Clone, Copy, Debug)]
    struct Event {
        op: Op,
        result: Option<u32>,
        invoked: usize,
        returned: usize,
    }

    fn apply(model: &mut VecDeque<u32>, op: Op) -> Option<u32> {
        match op {
            Op::PushLeft(x) => {
                model.push_front(x);
                None
            }
            Op::PushRight(x) => {
                model.push_back(x);
                None
            }
            Op::PopLeft => model.pop_front(),
            Op::PopRight => model.pop_back(),
        }
    }

    /// Searches for a sequential order of the per-thread histories that respects real time and
    /// reproduces every observed result on a `VecDeque`.
    fn linearize(history: &[Vec<Event>], next: &mut [usize], model: &VecDeque<u32>) -> bool {
        if history.iter().zip(next.iter()).all(|(h, &n)| n == h.len()) {
            return true;
        }

        for t in 0..history.len() {
            let e = match history[t].get(next[t]) {
                Some(e) => *e,
                None => continue,
            };

            // A call that returned before `e` was invoked must come first.
            let blocked = history
                .iter()
                .zip(next.iter())
                .any(|(h, &n)| h[n..].iter().any(|o| o.returned < e.invoked));
            if blocked {
                continue;
            }

            let mut m = model.clone();
            if apply(&mut m, e.op) != e.result {
                continue;
            }

            next[t] += 1;
            let found = linearize(history, next, &m);
            next[t] -= 1;
            if found {
                return true;
            }
        }
        false
    }

    #[test]
    fn linearize_rejects_impossible_histories() {
        let event = |op, result, invoked, returned| Event {
            op,
            result,
            invoked,
            returned,
        };
        // A pop that returns a value pushed strictly after it completed.
        let history = vec![
            vec![event(Op::PopLeft, Some(7), 0, 1)],
            vec![event(Op::PushRight(7), None, 2, 3)],
        ];
        assert!(!linearize(&history, &mut [0, 0], &VecDeque::new()));

        // The same calls overlapping in time are fine.
        let history = vec![
            vec![event(Op::PopLeft, Some(7), 0, 3)],
            vec![event(Op::PushRight(7), None, 1, 2)],
        ];
        assert!(linearize(&history, &mut [0, 0], &VecDeque::new()));
    }

    #[test]
    fn concurrent_histories_are_linearizable() {
        const ROUNDS: usize = 2_000;
        const THREADS: usize = 3;
        const OPS: usize = 3;

        let mut rng = rand::thread_rng();

        for round in 0..ROUNDS {
            let d = Arc::new(LockFreeDeque::new());
            let mut model = VecDeque::new();
            for &x in &[100, 101] {
                d.push_right(x);
                model.push_back(x);
            }

            let clock = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(THREADS));

            let threads = (0..THREADS)
                .map(|t| {
                    let ops = (0..OPS)
                        .map(|i| {
                            let x = (t * OPS + i) as u32;
                            match rng.gen_range(0..4) {
                                0 => Op::PushLeft(x),
                                1 => Op::PushRight(x),
                                2 => Op::PopLeft,
                                _ => Op::PopRight,
                            }
                        })
                        .collect::<Vec<_>>();

                    let d = d.clone();
                    let clock = clock.clone();
                    let barrier = barrier.clone();

                    thread::spawn(move || {
                        barrier.wait();
                        ops.into_iter()
                            .map(|op| {
                                let invoked = clock.fetch_add(1, SeqCst);
                                let result = match op {
                                    Op::PushLeft(x) => {
                                        d.push_left(x);
                                        None
                                    }
                                    Op::PushRight(x) => {
                                        d.push_right(x);
                                        None
                                    }
                                    Op::PopLeft => d.try_pop_left(),
                                    Op::PopRight => d.try_pop_right(),
                                };
                                let returned = clock.fetch_add(1, SeqCst);
                                Event {
                                    op,
                                    result,
                                    invoked,
                                    returned,
                                }
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();

            let history = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .collect::<Vec<_>>();

            let mut next = vec![0; THREADS];
            assert!(
                linearize(&history, &mut next, &model),
                "round {}: no sequential order explains {:?}",
                round,
                history
            );
        }
    }

    mod model {
        use std::collections::VecDeque;

        use proptest::prelude::*;

        use super::LockFreeDeque;

        #[derive(Clone, Debug)]
        enum Op {
            PushLeft(u16),
            PushRight(u16),
            PopLeft,
            PopRight,
            PeekLeft,
            PeekRight,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                any::<u16>().prop_map(Op::PushLeft),
                any::<u16>().prop_map(Op::PushRight),
                Just(Op::PopLeft),
                Just(Op::PopRight),
                Just(Op::PeekLeft),
                Just(Op::PeekRight),
            ]
        }

        proptest! {
            #[test]
            fn behaves_like_vec_deque(ops in proptest::collection::vec(op(), 0..256)) {
                let mut d = LockFreeDeque::new();
                let mut m = VecDeque::new();

                for op in ops {
                    match op {
                        Op::PushLeft(x) => {
                            d.push_left(x);
                            m.push_front(x);
                        }
                        Op::PushRight(x) => {
                            d.push_right(x);
                            m.push_back(x);
                        }
                        Op::PopLeft => prop_assert_eq!(d.try_pop_left(), m.pop_front()),
                        Op::PopRight => prop_assert_eq!(d.try_pop_right(), m.pop_back()),
                        Op::PeekLeft => prop_assert_eq!(d.try_peek_left(), m.front().copied()),
                        Op::PeekRight => prop_assert_eq!(d.try_peek_right(), m.back().copied()),
                    }
                    prop_assert_eq!(d.len(), m.len());
                }

                prop_assert_eq!(d.to_vec(), m.iter().copied().collect::<Vec<_>>());
                prop_assert_eq!(d.check_invariants(), m.len());
            }
        }
    }
}
