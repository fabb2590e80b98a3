//! Bounded task execution for the tester.
//!
//! [`WorkerPool`] runs submitted jobs at a fixed concurrency with panic
//! isolation; [`AdmissionController`] gates task starts on memory and
//! process headroom so bounded parallelism cannot be defeated by
//! per-process overhead.

pub mod admission;
pub mod pool;

pub use admission::{Admission, AdmissionController};
pub use pool::{Job, SubmitError, WorkerPool};
