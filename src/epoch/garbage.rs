//! Bags of retired objects and the global garbage queue.
//!
//! A retired object is not destroyed on the spot. It sits in the retiring thread's local bag,
//! together with the function that destroys it. A bag that reaches `MAX_OBJECTS` entries or
//! `FULL_BYTES` of payload is swapped for an empty one, stamped with the global epoch, and pushed
//! into a global queue. Exiting threads push their bag as well, full or not.
//!
//! Threads drain the front of the queue from time to time. A bag is destroyed once its stamp is
//! far enough behind the global epoch.

use std::mem;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use super::{Atomic, Pin};

/// A bag is full at this many objects.
const MAX_OBJECTS: usize = 64;

/// A bag is also full once its objects add up to this many bytes.
const FULL_BYTES: usize = 1 << 14; // 16 KB

/// Upper bound on bags destroyed by one `collect`.
const COLLECT_STEPS: usize = 8;

/// The global garbage queue.
static QUEUE: AtomicPtr<Queue> = AtomicPtr::new(ptr::null_mut());

/// A retired object together with the function that destroys it.
struct Deferred {
    destroy: unsafe fn(*mut u8),
    ptr: *mut u8,
}

/// A batch of retired objects.
pub struct Bag {
    total_bytes: usize,
    objects: Vec<Deferred>,
    /// Read after every object in the bag was unlinked.
    epoch: usize,
    /// Successor in the garbage queue.
    next: Atomic<Bag>,
}

// Bags travel between threads through the global queue. The objects inside are unreachable, so
// whichever thread destroys them is as good as any other.
unsafe impl Send for Bag {}
unsafe impl Sync for Bag {}

impl Bag {
    /// Returns a new, empty bag.
    pub fn new() -> Self {
        Bag {
            total_bytes: 0,
            objects: Vec::with_capacity(MAX_OBJECTS),
            epoch: 0,
            next: Atomic::null(),
        }
    }

    /// Adds `ptr` to the bag, or returns `false` if the bag is full.
    ///
    /// `destroy(ptr)` runs exactly once, when the bag is collected.
    pub fn try_insert<T>(&mut self, destroy: unsafe fn(*mut u8), ptr: *mut T) -> bool {
        if self.is_full() {
            return false;
        }

        self.objects.push(Deferred {
            destroy,
            ptr: ptr as *mut u8,
        });
        self.total_bytes += mem::size_of::<T>();
        true
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.objects.len() == MAX_OBJECTS || self.total_bytes >= FULL_BYTES
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Runs every stored destructor. Must be called at most once.
    unsafe fn destroy_all_objects(&self) {
        for d in &self.objects {
            (d.destroy)(d.ptr);
        }
    }
}

/// A Michael-Scott queue of bags.
#[repr(C)]
struct Queue {
    /// Always points to a sentinel. The first real bag is its successor.
    head: Atomic<Bag>,
    /// Keeps `head` and `tail` on different cache lines.
    _pad: [u8; 64],
    tail: Atomic<Bag>,
}

impl Queue {
    /// Returns an empty queue holding only the sentinel.
    fn new(pin: &Pin) -> Self {
        let queue = Queue {
            head: Atomic::null(),
            _pad: [0; 64],
            tail: Atomic::null(),
        };

        let sentinel = queue.head.store_box(Box::new(Bag::new()), Relaxed, pin);
        queue.tail.store(sentinel, Relaxed);

        queue
    }

    /// Appends a bag that already carries its epoch stamp.
    fn push(&self, mut bag: Box<Bag>, pin: &Pin) {
        let mut tail = self.tail.load(Acquire, pin);
        loop {
            let t = match tail.as_ref() {
                Some(t) => t,
                None => return,
            };
            let next = t.next.load(Acquire, pin);

            if next.is_null() {
                match t.next.cas_box_weak(next, bag, AcqRel) {
                    Ok(bag) => {
                        // Swing the tail; if this fails someone already did.
                        let _ = self.tail.cas(tail, bag, Release);
                        break;
                    }
                    Err((_, b)) => {
                        tail = self.tail.load(Acquire, pin);
                        bag = b;
                    }
                }
            } else {
                // The tail lags behind. Help it along before retrying.
                match self.tail.cas_weak(tail, next, AcqRel) {
                    Ok(()) => tail = next,
                    Err(t) => tail = t,
                }
            }
        }
    }

    /// Unlinks the first bag if it satisfies `condition`.
    ///
    /// The returned bag becomes the new sentinel, so only its objects may be destroyed, never the
    /// bag itself.
    fn pop_if<'p, F>(&self, condition: F, pin: &'p Pin) -> Option<&'p Bag>
    where
        F: Fn(&Bag) -> bool,
    {
        let mut head = self.head.load(Acquire, pin);
        loop {
            let next = head.as_ref()?.next.load(Acquire, pin);

            match next.as_ref() {
                Some(n) if condition(n) => {
                    // The tail must never lag behind the head, or a retired sentinel would stay
                    // reachable through it.
                    let tail = self.tail.load(Acquire, pin);
                    if tail == head {
                        let _ = self.tail.cas(tail, next, Release);
                    }

                    match self.head.cas_weak(head, next, AcqRel) {
                        Ok(()) => {
                            // The old sentinel is unreachable now.
                            unsafe { super::defer_drop(head.as_raw(), pin) }
                            return Some(n);
                        }
                        Err(h) => head = h,
                    }
                }
                None | Some(_) => return None,
            }
        }
    }
}

/// Returns the global garbage queue, creating it on first use.
fn singleton(pin: &Pin) -> &'static Queue {
    let current = QUEUE.load(Acquire);

    let queue = if current.is_null() {
        let raw = Box::into_raw(Box::new(Queue::new(pin)));
        match QUEUE.compare_exchange(ptr::null_mut(), raw, AcqRel, Acquire) {
            Ok(_) => raw,
            // Lost the race; use the winner's queue.
            Err(previous) => {
                unsafe { drop(Box::from_raw(raw)) }
                previous
            }
        }
    } else {
        current
    };

    unsafe { &*queue }
}

/// Stamps `bag` with `epoch` and appends it to the global queue.
pub fn push(mut bag: Box<Bag>, epoch: usize, pin: &Pin) {
    bag.epoch = epoch;
    singleton(pin).push(bag, pin);
}

/// Destroys up to `COLLECT_STEPS` expired bags at the front of the queue, given the current
/// global `epoch`. Returns the number of objects destroyed.
///
/// Every `push` is paired with at least one `collect`, and a `collect` can drain several bags, so
/// the queue doesn't grow without bound.
#[cold]
pub fn collect(epoch: usize, pin: &Pin) -> usize {
    let condition = |bag: &Bag| super::thread::distance(epoch, bag.epoch) > 2;

    let queue = singleton(pin);
    let mut destroyed = 0;

    for _ in 0..COLLECT_STEPS {
        match queue.pop_if(&condition, pin) {
            None => break,
            Some(bag) => unsafe {
                destroyed += bag.len();
                bag.destroy_all_objects();
            },
        }
    }

    if destroyed > 0 {
        tracing::trace!(destroyed, epoch, "collected garbage");
    }
    destroyed
}
