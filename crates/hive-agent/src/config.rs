use std::{collections::HashMap, time::Duration};

use crate::{error::AgentError, system::default_slave_id};

/// Slave agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity on the master; defaults to the hostname.
    pub slave_id: String,
    /// URI of the master's gRPC service.
    pub master_endpoint: String,
    /// Address the slave gRPC server binds to.
    pub bind_addr: String,
    /// Host the master should dial back; empty lets the master use the peer address.
    pub advertise_host: String,
    pub advertise_port: u16,
    pub region: String,
    pub labels: HashMap<String, String>,
    /// Sub-tasks this slave runs at once.
    pub max_concurrency: u32,
    /// Stats flush period.
    pub report_interval: Duration,
    /// Samples buffered between flushes; overflow is dropped.
    pub report_buffer: usize,
    /// Timeout of every call to the master.
    pub rpc_timeout: Duration,
    /// Pause between failed registration attempts.
    pub register_retry: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            slave_id: default_slave_id(),
            master_endpoint: "http://127.0.0.1:9090".to_string(),
            bind_addr: "0.0.0.0:9091".to_string(),
            advertise_host: String::new(),
            advertise_port: 9091,
            region: String::new(),
            labels: HashMap::new(),
            max_concurrency: 1,
            report_interval: Duration::from_secs(1),
            report_buffer: 256,
            rpc_timeout: Duration::from_secs(5),
            register_retry: Duration::from_secs(2),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(AgentError::InvalidConfig(what.to_string()))
            }
        };
        check(!self.slave_id.trim().is_empty(), "slave_id must not be empty")?;
        check(
            self.master_endpoint.starts_with("http://") || self.master_endpoint.starts_with("https://"),
            "master_endpoint must be an http(s) URI",
        )?;
        check(!self.bind_addr.trim().is_empty(), "bind_addr must not be empty")?;
        check(self.advertise_port != 0, "advertise_port must be greater than zero")?;
        check(self.max_concurrency > 0, "max_concurrency must be greater than zero")?;
        check(!self.report_interval.is_zero(), "report_interval must be greater than zero")?;
        check(self.report_buffer > 0, "report_buffer must be greater than zero")?;
        check(!self.rpc_timeout.is_zero(), "rpc_timeout must be greater than zero")?;
        Ok(())
    }
}
