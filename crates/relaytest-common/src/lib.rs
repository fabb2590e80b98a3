//! Shared types for the relaytest harness.
//!
//! This crate defines the error taxonomy, the normalized candidate record
//! consumed from the collector, the per-test result record, and the
//! environment-driven tester configuration. Everything else in the
//! workspace builds on these types.

pub mod config;
pub mod errors;
pub mod types;

pub use config::TesterConfig;
pub use errors::{Result, TesterError};
pub use types::{BatchRun, Protocol, ProxyConfig, TestResult, TestResultData};
