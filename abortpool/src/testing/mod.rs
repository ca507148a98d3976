//! Testing utilities for code built on abortpool.
//!
//! This module provides:
//! - FlakyOperation, an operation failing a fixed number of times
//! - CallbackRecorder, which records abort callback invocations

mod mocks;

pub use mocks::{CallbackRecorder, FlakyError, FlakyOperation};
