//! Database module.
//!
//! SQLite storage for normalized messages, alert matches, alert term
//! sets and time-series count buckets.

mod models;
mod store;

pub use models::*;
pub use store::*;
