//! A lock-free concurrent double-ended queue.
//!
//! The whole state of a [`LockFreeDeque`] is a single anchor holding its two end nodes, swapped
//! atomically on every push and pop. Pushes that can't link both directions at once leave a note
//! in the anchor, and whichever thread touches the deque next finishes the job.
//!
//! Unlinked memory is reclaimed through the epoch-based collector in [`epoch`].
//!
//! ```
//! use anchor_deque::LockFreeDeque;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let d = Arc::new(LockFreeDeque::new());
//! let handles = (0..4)
//!     .map(|t| {
//!         let d = d.clone();
//!         thread::spawn(move || d.push_right(t))
//!     })
//!     .collect::<Vec<_>>();
//! for h in handles {
//!     h.join().unwrap();
//! }
//! assert_eq!(d.len(), 4);
//! ```
//!
//! [`LockFreeDeque`]: struct.LockFreeDeque.html
//! [`epoch`]: epoch/index.html

#[macro_use(defer)]
extern crate scopeguard;

mod anchor;
mod contract;
mod deque;
mod error;
mod pool;

pub mod epoch;

pub use crate::contract::Deque;
pub use crate::deque::{DequeConfig, IntoIter, LockFreeDeque};
pub use crate::error::{Error, Result};
