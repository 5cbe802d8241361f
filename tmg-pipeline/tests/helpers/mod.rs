//! Test Helper Utilities
//!
//! Shared fixtures for tmg-pipeline integration tests

#![allow(dead_code)]

pub mod fakes;
pub mod fixtures;
pub mod log_capture;

pub use fakes::{FakeExtractor, FakeFitter};
pub use fixtures::{TestRoot, PSR};
pub use log_capture::{capture_logs, LogCapture};
