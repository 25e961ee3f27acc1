use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::{Context, anyhow};
use hive_core::MasterConfig;
use hive_observe::{LoggerConfig, LoggerFormat, LoggerLevel};

/// Reads `HIVE_*` overrides through `lookup`; unset or blank variables keep
/// the default.
pub struct Settings<F> {
    lookup: F,
}

impl<F> Settings<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    fn get<T>(&self, name: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match (self.lookup)(name) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow!("{name}={raw:?}: {e}")),
            _ => Ok(None),
        }
    }

    fn secs(&self, name: &str) -> anyhow::Result<Option<Duration>> {
        Ok(self.get::<u64>(name)?.map(Duration::from_secs))
    }

    pub fn logger(&self) -> anyhow::Result<LoggerConfig> {
        let mut cfg = LoggerConfig::default();
        if let Some(level) = (self.lookup)("HIVE_LOG_LEVEL").filter(|l| !l.trim().is_empty()) {
            // a bare level is checked, full filter directives pass through
            if !level.contains(['=', ',']) {
                level.parse::<LoggerLevel>()?;
            }
            cfg.level = level;
        }
        if let Some(format) = self.get::<LoggerFormat>("HIVE_LOG_FORMAT")? {
            cfg.format = format;
        }
        Ok(cfg)
    }

    pub fn master(&self) -> anyhow::Result<MasterConfig> {
        let mut cfg = MasterConfig::default();
        if let Some(v) = self.get("HIVE_GRPC_ADDR")? {
            cfg.grpc_addr = v;
        }
        if let Some(v) = self.get("HIVE_HTTP_ADDR")? {
            cfg.http_addr = v;
        }
        if let Some(v) = self.secs("HIVE_HEARTBEAT_INTERVAL_SECS")? {
            cfg.heartbeat_interval = v;
        }
        if let Some(v) = self.secs("HIVE_HEARTBEAT_TIMEOUT_SECS")? {
            cfg.heartbeat_timeout = v;
        }
        if let Some(v) = self.secs("HIVE_HEALTH_CHECK_INTERVAL_SECS")? {
            cfg.health_check_interval = v;
        }
        if let Some(v) = self.get("HIVE_MAX_FAILURES")? {
            cfg.max_failures = v;
        }
        if let Some(v) = self.get("HIVE_WORKERS_PER_SLAVE")? {
            cfg.workers_per_slave = v;
        }
        if let Some(v) = self.get("HIVE_MIN_SLAVE_COUNT")? {
            cfg.min_slave_count = v;
        }
        if let Some(v) = self.get("HIVE_SELECT_STRATEGY")? {
            cfg.select_strategy = v;
        }
        if let Some(v) = self.get::<String>("HIVE_PREFERRED_REGIONS")? {
            cfg.preferred_regions = v
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = self.get("HIVE_SPLIT_STRATEGY")? {
            cfg.split_strategy = v;
        }
        if let Some(v) = self.secs("HIVE_DISPATCH_TIMEOUT_SECS")? {
            cfg.dispatch_timeout = v;
        }
        if let Some(v) = self.secs("HIVE_STOP_TIMEOUT_SECS")? {
            cfg.stop_timeout = v;
        }
        if let Some(v) = self.get("HIVE_STATS_BUFFER_SIZE")? {
            cfg.stats_buffer_size = v;
        }
        if let Some(v) = self.secs("HIVE_CLEANUP_MAX_AGE_SECS")? {
            cfg.cleanup_max_age = v;
        }
        cfg.validate().context("invalid master configuration")?;
        Ok(cfg)
    }
}
