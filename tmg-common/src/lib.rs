//! # Timing Common Library
//!
//! Shared code for the pulsar timing pipeline:
//! - Error type
//! - Bootstrap (TOML) and global pipeline (JSON) configuration
//! - SQLite schema initialization
//! - Event types and EventBus
//! - MJD / wall-clock conversions and "last updated" formatting

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod human_time;
pub mod pipeline_config;
pub mod time;

pub use error::{Error, Result};
pub use pipeline_config::{BackendId, GlobalConfig};
