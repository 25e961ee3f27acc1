//! Logging bootstrap shared by the hive daemons.

mod logger;
pub use logger::*;
