//! Utility modules for tmg-pipeline

pub mod atomic_file;
pub mod db_retry;
pub mod stats;

pub use atomic_file::write_atomic;
pub use db_retry::{retry_on_lock, RetryPolicy};
