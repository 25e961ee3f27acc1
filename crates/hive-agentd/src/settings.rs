use std::{collections::HashMap, fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, anyhow, bail};
use hive_agent::AgentConfig;
use hive_observe::{LoggerConfig, LoggerFormat, LoggerLevel};

const DEFAULT_DEMO_RPS: f64 = 20.0;

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

    /// Requests per second each synthetic worker produces.
    pub fn demo_rps(&self) -> anyhow::Result<f64> {
        match self.get::<f64>("HIVE_DEMO_RPS")? {
            Some(v) if v.is_finite() && v > 0.0 => Ok(v),
            Some(v) => bail!("HIVE_DEMO_RPS must be positive, got {v}"),
            None => Ok(DEFAULT_DEMO_RPS),
        }
    }

    pub fn agent(&self) -> anyhow::Result<AgentConfig> {
        let mut cfg = AgentConfig::default();
        if let Some(v) = self.get("HIVE_SLAVE_ID")? {
            cfg.slave_id = v;
        }
        if let Some(v) = self.get("HIVE_MASTER_ENDPOINT")? {
            cfg.master_endpoint = v;
        }
        if let Some(v) = self.get::<String>("HIVE_BIND_ADDR")? {
            // the advertised port follows the bind port unless set explicitly
            if let Ok(addr) = v.parse::<SocketAddr>() {
                cfg.advertise_port = addr.port();
            }
            cfg.bind_addr = v;
        }
        if let Some(v) = self.get("HIVE_ADVERTISE_HOST")? {
            cfg.advertise_host = v;
        }
        if let Some(v) = self.get("HIVE_ADVERTISE_PORT")? {
            cfg.advertise_port = v;
        }
        if let Some(v) = self.get("HIVE_REGION")? {
            cfg.region = v;
        }
        if let Some(v) = self.get::<String>("HIVE_LABELS")? {
            cfg.labels = parse_labels(&v)?;
        }
        if let Some(v) = self.get("HIVE_MAX_CONCURRENCY")? {
            cfg.max_concurrency = v;
        }
        if let Some(v) = self.secs("HIVE_REPORT_INTERVAL_SECS")? {
            cfg.report_interval = v;
        }
        if let Some(v) = self.get("HIVE_REPORT_BUFFER")? {
            cfg.report_buffer = v;
        }
        if let Some(v) = self.secs("HIVE_RPC_TIMEOUT_SECS")? {
            cfg.rpc_timeout = v;
        }
        if let Some(v) = self.secs("HIVE_REGISTER_RETRY_SECS")? {
            cfg.register_retry = v;
        }
        cfg.validate().context("invalid agent configuration")?;
        Ok(cfg)
    }
}

/// `k=v,k2=v2`; blank entries are skipped.
fn parse_labels(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => Err(anyhow!("HIVE_LABELS: malformed label {pair:?}, expected key=value")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Settings<impl Fn(&str) -> Option<String>> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::new(move |name: &str| vars.get(name).cloned())
    }

    #[test]
    fn overrides_apply() {
        let cfg = settings(&[
            ("HIVE_SLAVE_ID", "load-7"),
            ("HIVE_MASTER_ENDPOINT", "http://master:9090"),
            ("HIVE_BIND_ADDR", "0.0.0.0:7001"),
            ("HIVE_REGION", "eu-west"),
            ("HIVE_LABELS", "rack=a, tier = edge,"),
            ("HIVE_MAX_CONCURRENCY", "4"),
            ("HIVE_REPORT_INTERVAL_SECS", "2"),
        ])
        .agent()
        .unwrap();
        assert_eq!(cfg.slave_id, "load-7");
        assert_eq!(cfg.master_endpoint, "http://master:9090");
        assert_eq!(cfg.advertise_port, 7001);
        assert_eq!(cfg.region, "eu-west");
        assert_eq!(cfg.labels.get("tier").map(String::as_str), Some("edge"));
        assert_eq!(cfg.labels.len(), 2);
        assert_eq!(cfg.max_concurrency, 4);
        assert_eq!(cfg.report_interval, Duration::from_secs(2));
    }

    #[test]
    fn explicit_advertise_port_wins() {
        let cfg = settings(&[
            ("HIVE_SLAVE_ID", "s1"),
            ("HIVE_BIND_ADDR", "0.0.0.0:7001"),
            ("HIVE_ADVERTISE_PORT", "17001"),
        ])
        .agent()
        .unwrap();
        assert_eq!(cfg.advertise_port, 17001);
    }

    #[test]
    fn bad_values_fail() {
        assert!(settings(&[("HIVE_LABELS", "rack")]).agent().is_err());
        assert!(settings(&[("HIVE_MAX_CONCURRENCY", "0")]).agent().is_err());
        assert!(settings(&[("HIVE_MASTER_ENDPOINT", "master:9090")]).agent().is_err());
        assert!(settings(&[("HIVE_DEMO_RPS", "-1")]).demo_rps().is_err());
    }

    #[test]
    fn demo_rps_default() {
        assert_eq!(settings(&[]).demo_rps().unwrap(), DEFAULT_DEMO_RPS);
        assert_eq!(settings(&[("HIVE_DEMO_RPS", "5")]).demo_rps().unwrap(), 5.0);
    }
}
