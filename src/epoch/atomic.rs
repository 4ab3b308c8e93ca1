use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{self, AcqRel, Acquire, Relaxed, Release, SeqCst};

use super::Pin;

/// Returns the strongest failure ordering allowed for a CAS with the given success ordering.
fn failure_order(order: Ordering) -> Ordering {
    match order {
        AcqRel => Acquire,
        Release => Relaxed,
        SeqCst => SeqCst,
        order => order,
    }
}

/// A pointer loaded from an [`Atomic`] while the current thread is pinned.
///
/// The lifetime `'p` is bound to the [`Pin`], so the pointee cannot be reclaimed while the
/// pointer is in use.
///
/// [`Atomic`]: struct.Atomic.html
/// [`Pin`]: struct.Pin.html
pub struct Ptr<'p, T: 'p> {
    ptr: *mut T, // !Send + !Sync
    _marker: PhantomData<&'p T>,
}

impl<'p, T> Clone for Ptr<'p, T> {
    fn clone(&self) -> Self {
        Ptr {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<'p, T> Copy for Ptr<'p, T> {}

impl<'p, T> PartialEq for Ptr<'p, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<'p, T> Eq for Ptr<'p, T> {}

impl<'p, T> fmt::Debug for Ptr<'p, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ptr").field(&self.ptr).finish()
    }
}

impl<'p, T> Ptr<'p, T> {
    /// Returns a null pointer.
    pub fn null() -> Self {
        unsafe { Self::from_raw(ptr::null_mut()) }
    }

    /// Wraps a raw pointer.
    ///
    /// The caller must guarantee the pointee stays alive for `'p`.
    pub unsafe fn from_raw(raw: *mut T) -> Self {
        Ptr {
            ptr: raw,
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn as_ref(&self) -> Option<&'p T> {
        unsafe { self.ptr.as_ref() }
    }

    pub fn as_raw(&self) -> *mut T {
        self.ptr
    }
}

/// An atomic nullable pointer to a heap-allocated `T`.
///
/// `Atomic` never frees what it points to. Whoever unlinks an object is responsible for retiring
/// it through [`defer_free`] or [`defer_drop`].
///
/// [`defer_free`]: fn.defer_free.html
/// [`defer_drop`]: fn.defer_drop.html
pub struct Atomic<T> {
    ptr: AtomicPtr<T>,
    _marker: PhantomData<*const ()>, // !Send + !Sync
}

unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atomic").field(&self.ptr.load(Relaxed)).finish()
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Atomic::null()
    }
}

impl<T> Atomic<T> {
    pub fn null() -> Self {
        unsafe { Self::from_raw(ptr::null_mut()) }
    }

    pub fn new(data: T) -> Self {
        unsafe { Self::from_raw(Box::into_raw(Box::new(data))) }
    }

    pub unsafe fn from_raw(raw: *mut T) -> Self {
        Atomic {
            ptr: AtomicPtr::new(raw),
            _marker: PhantomData,
        }
    }

    pub fn load<'p>(&self, order: Ordering, _: &'p Pin) -> Ptr<'p, T> {
        unsafe { Ptr::from_raw(self.ptr.load(order)) }
    }

    /// Loads the raw pointer without pinning.
    ///
    /// Only useful when the caller has exclusive access, e.g. in destructors.
    pub fn load_raw(&self, order: Ordering) -> *mut T {
        self.ptr.load(order)
    }

    pub fn store<'p>(&self, new: Ptr<'p, T>, order: Ordering) {
        self.ptr.store(new.ptr, order);
    }

    pub fn store_box<'p>(&self, new: Box<T>, order: Ordering, _: &'p Pin) -> Ptr<'p, T> {
        let r = unsafe { Ptr::from_raw(Box::into_raw(new)) };
        self.ptr.store(r.ptr, order);
        r
    }

    /// Stores `new` and returns the previous pointer.
    pub fn swap<'p>(&self, new: Box<T>, order: Ordering, _: &'p Pin) -> Ptr<'p, T> {
        unsafe { Ptr::from_raw(self.ptr.swap(Box::into_raw(new), order)) }
    }

    pub fn cas<'p>(
        &self,
        current: Ptr<'p, T>,
        new: Ptr<'p, T>,
        order: Ordering,
    ) -> Result<(), Ptr<'p, T>> {
        match self
            .ptr
            .compare_exchange(current.ptr, new.ptr, order, failure_order(order))
        {
            Ok(_) => Ok(()),
            Err(previous) => unsafe { Err(Ptr::from_raw(previous)) },
        }
    }

    pub fn cas_weak<'p>(
        &self,
        current: Ptr<'p, T>,
        new: Ptr<'p, T>,
        order: Ordering,
    ) -> Result<(), Ptr<'p, T>> {
        match self
            .ptr
            .compare_exchange_weak(current.ptr, new.ptr, order, failure_order(order))
        {
            Ok(_) => Ok(()),
            Err(previous) => unsafe { Err(Ptr::from_raw(previous)) },
        }
    }

    /// Installs `new` if the current value is `current`.
    ///
    /// On failure the box is handed back together with the actual value, so the caller can
    /// reuse the allocation on the next attempt.
    pub fn cas_box<'p>(
        &self,
        current: Ptr<'p, T>,
        new: Box<T>,
        order: Ordering,
    ) -> Result<Ptr<'p, T>, (Ptr<'p, T>, Box<T>)> {
        let raw = Box::into_raw(new);
        match self
            .ptr
            .compare_exchange(current.ptr, raw, order, failure_order(order))
        {
            Ok(_) => unsafe { Ok(Ptr::from_raw(raw)) },
            Err(previous) => unsafe { Err((Ptr::from_raw(previous), Box::from_raw(raw))) },
        }
    }

    pub fn cas_box_weak<'p>(
        &self,
        current: Ptr<'p, T>,
        new: Box<T>,
        order: Ordering,
    ) -> Result<Ptr<'p, T>, (Ptr<'p, T>, Box<T>)> {
        let raw = Box::into_raw(new);
        match self
            .ptr
            .compare_exchange_weak(current.ptr, raw, order, failure_order(order))
        {
            Ok(_) => unsafe { Ok(Ptr::from_raw(raw)) },
            Err(previous) => unsafe { Err((Ptr::from_raw(previous), Box::from_raw(raw))) },
        }
    }
}
