//! Epoch-based memory management.
//!
//! Objects unlinked from the deque (nodes, link cells and anchors) cannot be freed right away,
//! because another thread might still be reading them. Instead they are retired: stashed into a
//! thread-local bag, which eventually moves into a global garbage queue stamped with the global
//! epoch. A bag is destroyed once the epoch has advanced far enough that no pinned thread can
//! still hold a reference into it.
//!
//! Every access to shared memory happens inside [`pin`]. A [`Ptr`] loaded from an [`Atomic`] is
//! tied to the lifetime of the [`Pin`], so it cannot outlive the protection.
//!
//! [`pin`]: fn.pin.html
//! [`Ptr`]: struct.Ptr.html
//! [`Atomic`]: struct.Atomic.html
//! [`Pin`]: struct.Pin.html

mod atomic;
mod garbage;
mod tagged_atomic;
mod thread;

pub use self::atomic::{Atomic, Ptr};
pub use self::tagged_atomic::{TaggedAtomic, TaggedPtr};
pub use self::thread::{current, defer_drop, defer_free, flush, is_expired, pin, Pin};
