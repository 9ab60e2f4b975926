//! # vela-partition
//!
//! Parallel in-place array partitioning with user reductions.
//!
//! [`parallel_partition`] rearranges a slice so that every element
//! satisfying a predicate precedes every element that does not, without
//! auxiliary storage, while folding a user reduction over each side
//! (e.g. a bounding-box union per half). Work is fanned out over rayon
//! tasks in three phases: local partition, misplaced-range detection,
//! and a lock-free pairwise swap of the misplaced elements.
//!
//! ```rust
//! use vela_partition::parallel_partition;
//!
//! let mut values = [1u32, 2, 3, 4, 5, 6, 7, 8];
//! let (mid, evens_sum, odds_sum) = parallel_partition::<2, _, _, _, _, _>(
//!     &mut values,
//!     0u64,
//!     &|x| x % 2 == 0,
//!     &|acc, x| *acc += u64::from(*x),
//!     &|acc, other| *acc += other,
//!     None,
//! );
//! assert_eq!(mid, 4);
//! assert!(values[..mid].iter().all(|x| x % 2 == 0));
//! assert_eq!((evens_sum, odds_sum), (20, 16));
//! ```
//!
//! The partition is not stable, and a non-commutative combine makes the
//! reductions depend on the task count; see [`parallel_partition`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod parallel;
mod serial;

pub use parallel::{parallel_partition, MAX_TASKS};
pub use serial::serial_partition;
