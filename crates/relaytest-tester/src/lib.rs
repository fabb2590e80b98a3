//! Batch orchestration for the proxy tester.
//!
//! [`Tester`] fans one batch of candidates out over the worker pool and
//! collects classified results; [`BatchDriver`] slices the input stream
//! into batches and persists per-batch result files;
//! [`ShutdownSupervisor`] turns OS signals into coordinated drain and
//! abort.

pub mod batch;
pub mod shutdown;
pub mod tester;

pub use batch::{BatchDriver, DriverOutcome, DriverReport};
pub use shutdown::{ShutdownSupervisor, SupervisorState};
pub use tester::Tester;
