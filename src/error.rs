use thiserror::Error;

/// Errors returned by the non-`try` accessors of a deque.
///
/// Contention is never an error: a lost race is retried internally and never observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The deque had no element at the requested end.
    #[error("the collection is empty")]
    EmptyCollection,
}

/// Result type for deque accessors.
pub type Result<T> = std::result::Result<T, Error>;
