use hive_core::{CompletionReport, ExecuteAck, ExecuteRequest, ReportedStatus};
use hive_model::{ResourceUsage, SlaveInfo, SlaveState, SlaveStats, time_serde};

use crate::{error::ApiError, proto};

// =====
// SlaveState
// =====

impl From<SlaveState> for proto::SlaveState {
    fn from(state: SlaveState) -> Self {
        match state {
            SlaveState::Idle => proto::SlaveState::Idle,
            SlaveState::Running => proto::SlaveState::Running,
            SlaveState::Stopping => proto::SlaveState::Stopping,
            SlaveState::Busy => proto::SlaveState::Busy,
            SlaveState::Overloaded => proto::SlaveState::Overloaded,
            SlaveState::Error => proto::SlaveState::Error,
            SlaveState::Offline => proto::SlaveState::Offline,
            SlaveState::Unreachable => proto::SlaveState::Unreachable,
        }
    }
}

/// `None` for `UNSPECIFIED`.
pub(crate) fn slave_state_from_proto(state: proto::SlaveState) -> Option<SlaveState> {
    match state {
        proto::SlaveState::Unspecified => None,
        proto::SlaveState::Idle => Some(SlaveState::Idle),
        proto::SlaveState::Running => Some(SlaveState::Running),
        proto::SlaveState::Stopping => Some(SlaveState::Stopping),
        proto::SlaveState::Busy => Some(SlaveState::Busy),
        proto::SlaveState::Overloaded => Some(SlaveState::Overloaded),
        proto::SlaveState::Error => Some(SlaveState::Error),
        proto::SlaveState::Offline => Some(SlaveState::Offline),
        proto::SlaveState::Unreachable => Some(SlaveState::Unreachable),
    }
}

// =====
// SlaveInfo
// =====

impl TryFrom<proto::SlaveInfo> for SlaveInfo {
    type Error = ApiError;

    fn try_from(p: proto::SlaveInfo) -> Result<Self, Self::Error> {
        if p.slave_id.trim().is_empty() {
            return Err(ApiError::InvalidRequest("slave_id cannot be empty".into()));
        }
        let port = u16::try_from(p.grpc_port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ApiError::InvalidRequest(format!("invalid grpc_port {}", p.grpc_port)))?;

        let mut info = SlaveInfo::new(p.slave_id)
            .with_endpoint(p.ip, port)
            .with_region(p.region)
            .with_cpu_cores(p.cpu_cores)
            .with_memory(p.memory)
            .with_max_concurrency(p.max_concurrency.max(1));
        info.hostname = p.hostname;
        info.version = p.version;
        info.labels = p.labels;
        Ok(info)
    }
}

impl From<&SlaveInfo> for proto::SlaveInfo {
    fn from(info: &SlaveInfo) -> Self {
        Self {
            slave_id: info.id.clone(),
            hostname: info.hostname.clone(),
            ip: info.ip.clone(),
            grpc_port: u32::from(info.grpc_port),
            cpu_cores: info.cpu_cores,
            memory: info.memory,
            version: info.version.clone(),
            region: info.region.clone(),
            labels: info.labels.clone(),
            max_concurrency: info.max_concurrency,
        }
    }
}

// =====
// Heartbeat status
// =====

impl From<proto::SlaveStatus> for ReportedStatus {
    fn from(p: proto::SlaveStatus) -> Self {
        let active = if p.running_task_ids.is_empty() {
            u32::from(!p.current_task_id.is_empty())
        } else {
            p.running_task_ids.len() as u32
        };
        let state = slave_state_from_proto(p.state()).unwrap_or(SlaveState::Idle);

        ReportedStatus {
            state,
            usage: ResourceUsage {
                cpu_percent: p.cpu_usage,
                memory_percent: p.memory_usage,
                memory_used: p.memory_used,
                memory_total: p.memory_total,
                active_tasks: active,
                load_average: p.load_average,
                ..Default::default()
            },
        }
    }
}

// =====
// Stats
// =====

impl From<proto::StatsData> for SlaveStats {
    fn from(p: proto::StatsData) -> Self {
        let success_rate = if p.total_requests > 0 {
            p.success_count as f64 / p.total_requests as f64 * 100.0
        } else {
            0.0
        };
        SlaveStats {
            task_id: p.task_id,
            slave_id: p.slave_id,
            total_requests: p.total_requests,
            success_requests: p.success_count,
            failed_requests: p.failed_count,
            success_rate,
            avg_latency: p.avg_latency,
            min_latency: p.min_latency,
            max_latency: p.max_latency,
            p50_latency: p.p50_latency,
            p90_latency: p.p90_latency,
            p95_latency: p.p95_latency,
            p99_latency: p.p99_latency,
            qps: p.qps,
            status_codes: p.status_codes,
            error_types: p.error_types,
            timestamp: p.timestamp,
        }
    }
}

impl From<SlaveStats> for proto::StatsData {
    fn from(s: SlaveStats) -> Self {
        Self {
            slave_id: s.slave_id,
            task_id: s.task_id,
            timestamp: s.timestamp,
            total_requests: s.total_requests,
            success_count: s.success_requests,
            failed_count: s.failed_requests,
            avg_latency: s.avg_latency,
            min_latency: s.min_latency,
            max_latency: s.max_latency,
            p50_latency: s.p50_latency,
            p90_latency: s.p90_latency,
            p95_latency: s.p95_latency,
            p99_latency: s.p99_latency,
            qps: s.qps,
            status_codes: s.status_codes,
            error_types: s.error_types,
        }
    }
}

// =====
// Task execution
// =====

impl From<ExecuteRequest> for proto::TaskConfig {
    fn from(r: ExecuteRequest) -> Self {
        Self {
            task_id: r.task_id,
            sub_task_id: r.sub_task_id,
            worker_count: r.worker_count,
            protocol: r.protocol,
            target: r.target,
            duration_secs: r.duration_secs,
            ramp_up_secs: r.ramp_up_secs,
            config_data: r.config_data,
            report_interval_seconds: r.report_interval_secs,
        }
    }
}

impl From<proto::TaskConfig> for ExecuteRequest {
    fn from(p: proto::TaskConfig) -> Self {
        Self {
            task_id: p.task_id,
            sub_task_id: p.sub_task_id,
            worker_count: p.worker_count,
            protocol: p.protocol,
            target: p.target,
            duration_secs: p.duration_secs,
            ramp_up_secs: p.ramp_up_secs,
            config_data: p.config_data,
            report_interval_secs: p.report_interval_seconds,
        }
    }
}

impl From<proto::TaskResponse> for ExecuteAck {
    fn from(p: proto::TaskResponse) -> Self {
        Self {
            accepted: p.accepted,
            message: p.message,
        }
    }
}

impl From<proto::TaskCompletionRequest> for CompletionReport {
    fn from(p: proto::TaskCompletionRequest) -> Self {
        Self {
            slave_id: p.slave_id,
            task_id: p.task_id,
            success: p.success,
            error_message: p.error_message,
            completed_at: time_serde::from_unix(p.completed_at),
        }
    }
}

impl From<CompletionReport> for proto::TaskCompletionRequest {
    fn from(r: CompletionReport) -> Self {
        Self {
            slave_id: r.slave_id,
            task_id: r.task_id,
            success: r.success,
            error_message: r.error_message,
            completed_at: time_serde::to_unix(r.completed_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_state_mapping_is_symmetric() {
        for state in [
            SlaveState::Idle,
            SlaveState::Running,
            SlaveState::Stopping,
            SlaveState::Busy,
            SlaveState::Overloaded,
            SlaveState::Error,
            SlaveState::Offline,
            SlaveState::Unreachable,
        ] {
            assert_eq!(slave_state_from_proto(state.into()), Some(state));
        }
        assert_eq!(slave_state_from_proto(proto::SlaveState::Unspecified), None);
    }

    #[test]
    fn slave_info_requires_id_and_port() {
        let base = proto::SlaveInfo {
            slave_id: "s1".into(),
            ip: "10.0.0.1".into(),
            grpc_port: 9091,
            ..Default::default()
        };
        let info = SlaveInfo::try_from(base.clone()).unwrap();
        assert_eq!(info.endpoint(), "http://10.0.0.1:9091");
        assert_eq!(info.max_concurrency, 1);

        let no_id = proto::SlaveInfo {
            slave_id: "".into(),
            ..base.clone()
        };
        assert!(SlaveInfo::try_from(no_id).is_err());

        let bad_port = proto::SlaveInfo {
            grpc_port: 70_000,
            ..base
        };
        assert!(SlaveInfo::try_from(bad_port).is_err());
    }

    #[test]
    fn stats_success_rate_is_derived() {
        let data = proto::StatsData {
            slave_id: "s1".into(),
            task_id: "t1".into(),
            total_requests: 200,
            success_count: 150,
            failed_count: 50,
            ..Default::default()
        };
        let stats = SlaveStats::from(data);
        assert!((stats.success_rate - 75.0).abs() < 1e-9);
        assert_eq!(stats.failed_requests, 50);

        let empty = SlaveStats::from(proto::StatsData::default());
        assert_eq!(empty.success_rate, 0.0);
    }

    #[test]
    fn heartbeat_status_counts_tasks() {
        let status = proto::SlaveStatus {
            state: proto::SlaveState::Running as i32,
            cpu_usage: 42.0,
            running_task_ids: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let reported = ReportedStatus::from(status);
        assert_eq!(reported.state, SlaveState::Running);
        assert_eq!(reported.usage.active_tasks, 2);
        assert_eq!(reported.usage.cpu_percent, 42.0);

        let legacy = proto::SlaveStatus {
            current_task_id: "t1".into(),
            ..Default::default()
        };
        let reported = ReportedStatus::from(legacy);
        assert_eq!(reported.state, SlaveState::Idle);
        assert_eq!(reported.usage.active_tasks, 1);
    }
}
