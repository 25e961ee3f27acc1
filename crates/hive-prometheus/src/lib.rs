//! Prometheus metrics backend for the hive master.
//!
//! [`PrometheusMetrics`] implements [`hive_core::MetricsBackend`] and keeps
//! its collectors in a private [`Registry`].
//!
//! ## Metrics
//! - `hive_task_transitions_total{state}` - Counter
//! - `hive_dispatch_total{outcome}` - Counter
//! - `hive_stats_dropped_total` - Counter
//! - `hive_slaves_registered` - Gauge
//! - `hive_slaves_healthy` - Gauge
//!
//! This crate does not serve `/metrics`; the HTTP layer calls
//! [`PrometheusMetrics::encode_text`].

mod backend;
pub use backend::PrometheusMetrics;

pub use prometheus::{Encoder, Registry, TextEncoder};
