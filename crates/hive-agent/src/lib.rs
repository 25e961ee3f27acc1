//! Slave side of hive.
//!
//! A [`SlaveAgent`] serves the `SlaveService` contract and hands every
//! accepted sub-task to a [`LoadEngine`]. [`MasterLink`] keeps the slave
//! registered and alive on the master, [`StatsReporter`] streams the engine's
//! samples upstream. [`run`] wires all of them.

mod config;
pub use config::AgentConfig;

mod error;
pub use error::AgentError;

mod engine;
pub use engine::{LoadEngine, StatsSink};

mod system;
pub use system::{SystemSnapshot, default_slave_id};

mod service;
pub use service::{AgentOutbox, SlaveAgent};

mod reporter;
pub use reporter::StatsReporter;

mod link;
pub use link::MasterLink;

mod runtime;
pub use runtime::run;
