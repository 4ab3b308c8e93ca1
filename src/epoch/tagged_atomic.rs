use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{self, AcqRel, Acquire, Relaxed, Release, SeqCst};

use super::Pin;

pub struct TaggedPtr<'p, T: 'p> {
    data: usize,
    _marker: PhantomData<(*mut T, &'p T)>, // !Send + !Sync
}

impl<'p, T> Clone for TaggedPtr<'p, T> {
    fn clone(&self) -> Self {
        TaggedPtr {
            data: self.data,
            _marker: PhantomData,
        }
    }
}

impl<'p, T> Copy for TaggedPtr<'p, T> {}

fn low_bits<T>() -> usize {
    (1 << mem::align_of::<T>().trailing_zeros()) - 1
}

fn raw_and_tag<T>(raw: *mut T, tag: usize) -> usize {
    let mask = low_bits::<T>();
    assert!(tag <= mask, "tag too large to fit into the unused bits: {} > {}", tag, mask);
    raw as usize | tag
}

fn failure_order(order: Ordering) -> Ordering {
    match order {
        AcqRel => Acquire,
        Release => Relaxed,
        SeqCst => SeqCst,
        order => order,
    }
}

impl<'p, T: 'p> TaggedPtr<'p, T> {
    unsafe fn from_data(data: usize) -> Self {
        TaggedPtr {
            data,
            _marker: PhantomData,
        }
    }

    pub fn null(tag: usize) -> Self {
        unsafe { Self::from_data(raw_and_tag::<T>(ptr::null_mut(), tag)) }
    }

    pub unsafe fn from_raw(raw: *mut T, tag: usize) -> Self {
        Self::from_data(raw_and_tag(raw, tag))
    }

    pub fn is_null(&self) -> bool {
        self.as_raw().is_null()
    }

    pub fn as_ref(&self) -> Option<&'p T> {
        unsafe { self.as_raw().as_ref() }
    }

    pub fn as_raw(&self) -> *mut T {
        (self.data & !low_bits::<T>()) as *mut T
    }

    pub fn tag(&self) -> usize {
        self.data & low_bits::<T>()
    }

    pub fn with_tag(&self, tag: usize) -> Self {
        unsafe { Self::from_raw(self.as_raw(), tag) }
    }
}

/// An atomic pointer with a small tag packed into the alignment bits.
pub struct TaggedAtomic<T> {
    data: AtomicUsize,
    _marker: PhantomData<*mut T>, // !Send + !Sync
}

unsafe impl<T: Sync> Send for TaggedAtomic<T> {}
unsafe impl<T: Sync> Sync for TaggedAtomic<T> {}

impl<T> TaggedAtomic<T> {
    /// Returns a null pointer with tag 0. Usable in statics.
    pub const fn null() -> Self {
        TaggedAtomic {
            data: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub fn load<'p>(&self, order: Ordering, _: &'p Pin) -> TaggedPtr<'p, T> {
        unsafe { TaggedPtr::from_data(self.data.load(order)) }
    }

    pub fn store<'p>(&self, new: TaggedPtr<'p, T>, order: Ordering) {
        self.data.store(new.data, order);
    }

    pub fn cas<'p>(
        &self,
        current: TaggedPtr<'p, T>,
        new: TaggedPtr<'p, T>,
        order: Ordering,
    ) -> Result<(), TaggedPtr<'p, T>> {
        match self
            .data
            .compare_exchange(current.data, new.data, order, failure_order(order))
        {
            Ok(_) => Ok(()),
            Err(previous) => unsafe { Err(TaggedPtr::from_data(previous)) },
        }
    }

    pub fn cas_weak<'p>(
        &self,
        current: TaggedPtr<'p, T>,
        new: TaggedPtr<'p, T>,
        order: Ordering,
    ) -> Result<(), TaggedPtr<'p, T>> {
        match self
            .data
            .compare_exchange_weak(current.data, new.data, order, failure_order(order))
        {
            Ok(_) => Ok(()),
            Err(previous) => unsafe { Err(TaggedPtr::from_data(previous)) },
        }
    }

    pub fn cas_box_weak<'p>(
        &self,
        current: TaggedPtr<'p, T>,
        new: Box<T>,
        tag: usize,
        order: Ordering,
    ) -> Result<TaggedPtr<'p, T>, (TaggedPtr<'p, T>, Box<T>)> {
        let raw = Box::into_raw(new);
        let new_data = raw_and_tag(raw, tag);
        match self
            .data
            .compare_exchange_weak(current.data, new_data, order, failure_order(order))
        {
            Ok(_) => unsafe { Ok(TaggedPtr::from_data(new_data)) },
            Err(previous) => unsafe { Err((TaggedPtr::from_data(previous), Box::from_raw(raw))) },
        }
    }
}
