//! Database access for tmg-pipeline
//!
//! Schema lives in `tmg_common::db`; these modules hold the queries.

pub mod catalog;
pub mod failures;
pub mod pulsars;
pub mod snapshots;
pub mod toas;
pub mod warnings;

pub use tmg_common::db::init_database;
