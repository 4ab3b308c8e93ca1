//! The structural contract shared by deque implementations.

use crate::deque::LockFreeDeque;
use crate::error::{Error, Result};

/// A double-ended queue usable through a shared reference.
///
/// Implementations can be swapped for one another, or wrapped by a decorator that adds mutual
/// exclusion on top. The fallible accessors are provided on top of the `try_` methods and map an
/// empty deque to [`Error::EmptyCollection`].
///
/// [`Error::EmptyCollection`]: enum.Error.html#variant.EmptyCollection
pub trait Deque<T> {
    fn push_left(&self, value: T);

    fn push_right(&self, value: T);

    fn try_pop_left(&self) -> Option<T>;

    fn try_pop_right(&self) -> Option<T>;

    fn try_peek_left(&self) -> Option<T>;

    fn try_peek_right(&self) -> Option<T>;

    /// Number of elements. May be approximate while other threads are mutating the deque.
    fn len(&self) -> usize;

    /// The elements from left to right.
    fn to_vec(&self) -> Vec<T>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_left(&self) -> Result<T> {
        self.try_pop_left().ok_or(Error::EmptyCollection)
    }

    fn pop_right(&self) -> Result<T> {
        self.try_pop_right().ok_or(Error::EmptyCollection)
    }

    fn peek_left(&self) -> Result<T> {
        self.try_peek_left().ok_or(Error::EmptyCollection)
    }

    fn peek_right(&self) -> Result<T> {
        self.try_peek_right().ok_or(Error::EmptyCollection)
    }
}

impl<T> Deque<T> for LockFreeDeque<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn push_left(&self, value: T) {
        LockFreeDeque::push_left(self, value)
    }

    fn push_right(&self, value: T) {
        LockFreeDeque::push_right(self, value)
    }

    fn try_pop_left(&self) -> Option<T> {
        LockFreeDeque::try_pop_left(self)
    }

    fn try_pop_right(&self) -> Option<T> {
        LockFreeDeque::try_pop_right(self)
    }

    fn try_peek_left(&self) -> Option<T> {
        LockFreeDeque::try_peek_left(self)
    }

    fn try_peek_right(&self) -> Option<T> {
        LockFreeDeque::try_peek_right(self)
    }

    fn len(&self) -> usize {
        LockFreeDeque::len(self)
    }

    fn to_vec(&self) -> Vec<T> {
        LockFreeDeque::to_vec(self)
    }

    fn is_empty(&self) -> bool {
        LockFreeDeque::is_empty(self)
    }
}
