use std::time::Duration;

use hive_model::{SelectStrategy, SlaveFilter, SplitStrategy};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("heartbeat timeout ({timeout:?}) must exceed heartbeat interval ({interval:?})")]
    TimeoutBelowInterval { timeout: Duration, interval: Duration },
}

/// Master node configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address the slave-facing gRPC service binds to.
    pub grpc_addr: String,
    /// Address the admin HTTP service binds to.
    pub http_addr: String,
    /// Heartbeat interval advertised to slaves at registration.
    pub heartbeat_interval: Duration,
    /// A slave is late once its last heartbeat is older than this.
    pub heartbeat_timeout: Duration,
    /// Health sweep period.
    pub health_check_interval: Duration,
    /// Consecutive late sweeps before a slave is marked as errored.
    pub max_failures: u32,
    /// Workers one slave is expected to carry; sizes the slave count of a task.
    pub workers_per_slave: u32,
    pub min_slave_count: usize,
    pub select_strategy: SelectStrategy,
    /// Regions preferred by the location-aware selector.
    pub preferred_regions: Vec<String>,
    pub split_strategy: SplitStrategy,
    /// Candidate filter for starts without explicit targeting.
    pub default_filter: SlaveFilter,
    /// Per-call timeout of `ExecuteTask`.
    pub dispatch_timeout: Duration,
    /// Per-call timeout of `StopTask`.
    pub stop_timeout: Duration,
    /// Capacity of the stats ingestion buffer.
    pub stats_buffer_size: usize,
    pub cleanup_interval: Duration,
    /// Completed and failed tasks older than this are evicted.
    pub cleanup_max_age: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            grpc_addr: "0.0.0.0:9090".to_string(),
            http_addr: "0.0.0.0:8080".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(5),
            max_failures: 3,
            workers_per_slave: 100,
            min_slave_count: 1,
            select_strategy: SelectStrategy::LeastLoaded,
            preferred_regions: Vec::new(),
            split_strategy: SplitStrategy::Equal,
            default_filter: SlaveFilter::available(),
            dispatch_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            stats_buffer_size: 1000,
            cleanup_interval: Duration::from_secs(10 * 60),
            cleanup_max_age: Duration::from_secs(60 * 60),
        }
    }
}

impl MasterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grpc_addr.trim().is_empty() {
            return Err(ConfigError::Empty("grpc_addr"));
        }
        if self.http_addr.trim().is_empty() {
            return Err(ConfigError::Empty("http_addr"));
        }

        let durations = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("health_check_interval", self.health_check_interval),
            ("dispatch_timeout", self.dispatch_timeout),
            ("stop_timeout", self.stop_timeout),
            ("cleanup_interval", self.cleanup_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Zero(*name));
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::TimeoutBelowInterval {
                timeout: self.heartbeat_timeout,
                interval: self.heartbeat_interval,
            });
        }
        if self.max_failures == 0 {
            return Err(ConfigError::Zero("max_failures"));
        }
        if self.workers_per_slave == 0 {
            return Err(ConfigError::Zero("workers_per_slave"));
        }
        if self.stats_buffer_size == 0 {
            return Err(ConfigError::Zero("stats_buffer_size"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(MasterConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_buffer_and_empty_addr() {
        let cfg = MasterConfig {
            stats_buffer_size: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("stats_buffer_size")));

        let cfg = MasterConfig {
            grpc_addr: " ".into(),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Empty("grpc_addr")));
    }

    #[test]
    fn rejects_timeout_not_above_interval() {
        let cfg = MasterConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TimeoutBelowInterval { .. })
        ));
    }
}
