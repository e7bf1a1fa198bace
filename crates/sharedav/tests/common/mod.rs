//! Common test utilities for share routing integration tests.

pub mod harness;

pub use harness::*;
