//! Participants, pinning and the global epoch.
//!
//! # Epochs
//!
//! `EPOCH` is a global counter that moves forward in steps of 2. It may only move when every
//! thread that is currently pinned was pinned at the current value. An object unlinked at epoch
//! `e` is therefore out of reach of all threads once the counter has moved twice past `e`.
//!
//! # Participants
//!
//! Each thread that pins for the first time registers a `Thread` entry in the `PARTICIPANTS`
//! list, through a lazily created thread-local `Harness`. The entry publishes whether the thread
//! is pinned and at which epoch. When the thread exits, the harness marks the entry as deleted and
//! a later call to `try_advance` unlinks it.
//!
//! # Retiring
//!
//! Retired objects go into the pinned thread's local bag. A full bag is stamped with the epoch and
//! handed over to the global garbage queue.

use std::cell::Cell;
use std::cmp;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};

use super::garbage::{self, Bag};
use super::TaggedAtomic;

/// The global epoch. Always even; the low bit of `Thread::state` is the pinned flag.
static EPOCH: AtomicUsize = AtomicUsize::new(0);

/// Head of the participants list.
static PARTICIPANTS: TaggedAtomic<Thread> = TaggedAtomic::null();

/// Every this many pins a thread tries to advance the epoch and collects some garbage.
const PINS_BETWEEN_COLLECT: usize = 128;

thread_local! {
    static HARNESS: Harness = Harness {
        thread: Thread::register(),
        is_pinned: Cell::new(false),
        pin_count: Cell::new(0),
        bag: Cell::new(Box::into_raw(Box::new(Bag::new()))),
    };
}

/// Per-thread state. Dropping it unregisters the thread.
struct Harness {
    thread: *const Thread,
    is_pinned: Cell<bool>,
    pin_count: Cell<usize>,
    /// The bag retired objects are added to.
    bag: Cell<*mut Bag>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let thread = unsafe { &*self.thread };

        // `HARNESS` is being destroyed, so `pin()` is off limits. Pin by hand instead.
        let pin = &Pin { bag: &self.bag };
        thread.set_pinned(pin);

        // Collecting may retire more objects into the local bag, so it goes first.
        try_advance(pin);
        garbage::collect(EPOCH.load(SeqCst), pin);

        let bag = unsafe { Box::from_raw(self.bag.get()) };
        garbage::push(bag, EPOCH.load(SeqCst), pin);

        thread.set_unpinned();
        thread.unregister();
        tracing::debug!(thread = ?self.thread, "unregistered epoch participant");
    }
}

/// An entry in the participants list.
struct Thread {
    /// `epoch | 1` while pinned, `0` otherwise.
    state: AtomicUsize,
    /// Tag 1 marks this entry as deleted.
    next: TaggedAtomic<Thread>,
}

impl Thread {
    /// Announces that the thread is pinned at the current epoch. The thread must not be pinned.
    #[inline]
    fn set_pinned(&self, _pin: &Pin) {
        let epoch = EPOCH.load(Relaxed);
        // Loads from shared memory must not be reordered before this store, hence a full barrier.
        store_with_fence(&self.state, epoch | 1);

        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        fn store_with_fence(dest: &AtomicUsize, value: usize) {
            dest.store(value, Relaxed);
            ::std::sync::atomic::fence(SeqCst);
        }

        // A locked `cmpxchg` is a full barrier too, and cheaper than `mfence`.
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        fn store_with_fence(dest: &AtomicUsize, value: usize) {
            let old = dest.load(Relaxed);
            let _ = dest.compare_exchange(old, value, SeqCst, SeqCst);
        }
    }

    #[inline]
    fn set_unpinned(&self) {
        self.state.store(0, Release);
    }

    /// Pushes a fresh entry onto the participants list and returns it.
    fn register() -> *mut Thread {
        let mut entry = Box::new(Thread {
            state: AtomicUsize::new(0),
            next: TaggedAtomic::null(),
        });

        // Runs during `HARNESS` initialization, so a real pin isn't available yet. Only the list
        // head is touched here.
        let pin = &Pin::fake();

        let mut head = PARTICIPANTS.load(Acquire, pin);
        loop {
            entry.next.store(head, Relaxed);

            match PARTICIPANTS.cas_box_weak(head, entry, 0, AcqRel) {
                Ok(registered) => {
                    tracing::debug!(thread = ?registered.as_raw(), "registered epoch participant");
                    return registered.as_raw();
                }
                Err((h, e)) => {
                    head = h;
                    entry = e;
                }
            }
        }
    }

    /// Marks the entry as deleted. `try_advance` unlinks it later.
    fn unregister(&self) {
        let pin = &Pin::fake();

        let mut next = self.next.load(Acquire, pin);
        while next.tag() == 0 {
            match self.next.cas_weak(next, next.with_tag(1), AcqRel) {
                Ok(()) => break,
                Err(n) => next = n,
            }
        }
    }
}

/// Moves the global epoch forward if no pinned thread lags behind it.
///
/// Deleted entries met along the way are unlinked and retired.
#[cold]
fn try_advance(pin: &Pin) {
    let epoch = EPOCH.load(SeqCst);

    let mut pred = &PARTICIPANTS;
    let mut curr = pred.load(Acquire, pin);

    while let Some(c) = curr.as_ref() {
        let succ = c.next.load(Acquire, pin);

        if succ.tag() == 1 {
            let succ = succ.with_tag(0);

            // Someone else is walking the list and got there first. Let them finish the job.
            if pred.cas(curr, succ, Release).is_err() {
                return;
            }

            unsafe { defer_free(c as *const Thread as *mut Thread, pin) }

            // `pred` stays where it is.
            curr = succ;
        } else {
            let state = c.state.load(SeqCst);
            let is_pinned = state & 1 == 1;

            if is_pinned && state & !1 != epoch {
                return;
            }

            pred = &c.next;
            curr = succ;
        }
    }

    let next = epoch.wrapping_add(2);
    if EPOCH.compare_exchange(epoch, next, SeqCst, SeqCst).is_ok() {
        tracing::trace!(epoch = next, "advanced global epoch");
    }
}

/// Number of advancements between two epochs, taking wrap-around into account.
#[inline]
pub(super) fn distance(epoch1: usize, epoch2: usize) -> usize {
    let diff = epoch1.wrapping_sub(epoch2);
    cmp::min(diff, 0usize.wrapping_sub(diff)) / 2
}

/// Returns the current global epoch.
///
/// The value is only meaningful as a stamp passed to [`is_expired`] later.
///
/// [`is_expired`]: fn.is_expired.html
#[inline]
pub fn current() -> usize {
    EPOCH.load(SeqCst)
}

/// Returns `true` if an object retired at epoch `stamp` can no longer be referenced by any pinned
/// thread.
///
/// The object must have been unlinked before `stamp` was read with [`current`].
///
/// [`current`]: fn.current.html
#[inline]
pub fn is_expired(stamp: usize) -> bool {
    distance(EPOCH.load(SeqCst), stamp) > 2
}

/// Proof that the current thread is pinned.
///
/// Loading from an [`Atomic`] requires a `&Pin`, and the returned pointer can't outlive it. A pin
/// belongs to the thread that created it and is neither `Send` nor `Sync`.
///
/// [`Atomic`]: struct.Atomic.html
#[derive(Debug)]
pub struct Pin {
    /// The harness cell holding the local bag. Kept here so that retiring works while the harness
    /// itself is being dropped.
    bag: *const Cell<*mut Bag>,
}

impl Pin {
    /// A pin that carries no bag. It must never be used to retire objects.
    fn fake() -> Pin {
        Pin { bag: ptr::null() }
    }
}

/// Runs `f` with the current thread pinned.
///
/// Nothing loaded through the [`Pin`] handed to `f` is freed before `f` returns. A pinned thread
/// holds back reclamation for everyone, so `f` should be short.
///
/// Pinning is reentrant: a nested call just reuses the outer pin.
///
/// [`Pin`]: struct.Pin.html
pub fn pin<F, T>(f: F) -> T
where
    F: FnOnce(&Pin) -> T,
{
    HARNESS.with(|harness| {
        let thread = unsafe { &*harness.thread };
        let pin = &Pin { bag: &harness.bag };

        let was_pinned = harness.is_pinned.get();
        if !was_pinned {
            harness.is_pinned.set(true);
            thread.set_pinned(pin);

            let count = harness.pin_count.get();
            harness.pin_count.set(count.wrapping_add(1));
            if count % PINS_BETWEEN_COLLECT == 0 {
                try_advance(pin);
                garbage::collect(EPOCH.load(SeqCst), pin);
            }
        }

        // Unpin even if `f` panics.
        defer! {
            if !was_pinned {
                thread.set_unpinned();
                harness.is_pinned.set(false);
            }
        }

        f(pin)
    })
}

/// Adds `object` and its destructor to the local bag, rotating the bag out if it is full.
unsafe fn defer<T>(destroy: unsafe fn(*mut u8), object: *mut T, pin: &Pin) {
    debug_assert!(!pin.bag.is_null(), "retiring through a fake pin");

    let cell = &*pin.bag;
    loop {
        let bag = cell.get();
        if (*bag).try_insert(destroy, object) {
            return;
        }

        cell.set(Box::into_raw(Box::new(Bag::new())));

        // Collecting may retire objects into the fresh bag.
        try_advance(pin);
        garbage::collect(EPOCH.load(SeqCst), pin);

        garbage::push(Box::from_raw(bag), EPOCH.load(SeqCst), pin);
    }
}

/// Stashes away an object that will later be freed without running its destructor.
///
/// The object must have been allocated with `Box` and unlinked so that no thread pinned from now
/// on can reach it.
pub unsafe fn defer_free<T>(object: *mut T, pin: &Pin) {
    unsafe fn free<T>(ptr: *mut u8) {
        drop(Box::from_raw(ptr as *mut ManuallyDrop<T>));
    }

    defer(free::<T>, object, pin)
}

/// Stashes away an object that will later be dropped.
///
/// Same contract as [`defer_free`], but the destructor runs on whichever thread collects the bag.
///
/// [`defer_free`]: fn.defer_free.html
pub unsafe fn defer_drop<T: Send>(object: *mut T, pin: &Pin) {
    unsafe fn destroy<T>(ptr: *mut u8) {
        drop(Box::from_raw(ptr as *mut T));
    }

    defer(destroy::<T>, object, pin)
}

/// Moves the thread-local bag into the global queue and collects some garbage.
///
/// Threads do this on their own every once in a while. Calling it explicitly only makes memory
/// come back sooner.
pub fn flush() {
    pin(|pin| unsafe {
        let cell = &*pin.bag;
        let bag = cell.get();

        if !(*bag).is_empty() {
            cell.set(Box::into_raw(Box::new(Bag::new())));
            garbage::push(Box::from_raw(bag), EPOCH.load(SeqCst), pin);
        }

        try_advance(pin);
        garbage::collect(EPOCH.load(SeqCst), pin);
    })
}
