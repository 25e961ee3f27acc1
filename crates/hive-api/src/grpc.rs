use std::sync::Arc;

use hive_core::{CompletionReport, CoreError, Master, ReportedStatus};
use hive_model::{SlaveInfo, SlaveStats};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::proto::{self, RegisterResult, master_service_server::MasterService};

/// Slave-facing gRPC service of the master.
///
/// Domain rejections (duplicate registration, unknown slave) are answered
/// in-band through the `success`/`ok` flags; only malformed requests fail
/// with a [`Status`].
pub struct MasterGrpcService {
    master: Arc<Master>,
}

impl MasterGrpcService {
    pub fn new(master: Arc<Master>) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl MasterService for MasterGrpcService {
    async fn register_slave(
        &self,
        request: Request<proto::SlaveInfo>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let peer = request.remote_addr();
        let mut info = SlaveInfo::try_from(request.into_inner()).map_err(Status::from)?;
        if info.ip.is_empty() {
            if let Some(addr) = peer {
                info.ip = addr.ip().to_string();
            }
        }
        let slave_id = info.id.clone();
        let endpoint = info.endpoint();

        let reply = match self.master.register_slave(info) {
            Ok(()) => {
                info!(%slave_id, %endpoint, "slave registered");
                proto::RegisterResponse {
                    success: true,
                    message: "registered".into(),
                    token: uuid::Uuid::new_v4().to_string(),
                    heartbeat_interval: self.master.heartbeat_interval().as_secs() as i64,
                    result: RegisterResult::Ok as i32,
                }
            }
            Err(e) => {
                let result = match &e {
                    CoreError::AlreadyRegistered(_) => {
                        let held_by = self.master.registry().get(&slave_id).map(|s| s.endpoint());
                        if held_by.as_deref() == Some(endpoint.as_str()) {
                            RegisterResult::Stale
                        } else {
                            RegisterResult::Conflict
                        }
                    }
                    _ => RegisterResult::Rejected,
                };
                warn!(%slave_id, error = %e, ?result, "registration rejected");
                proto::RegisterResponse {
                    success: false,
                    message: e.to_string(),
                    result: result as i32,
                    ..Default::default()
                }
            }
        };
        Ok(Response::new(reply))
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        if req.slave_id.trim().is_empty() {
            return Err(Status::invalid_argument("slave_id cannot be empty"));
        }

        let status = req.status.map(ReportedStatus::from);
        let reply = match self.master.heartbeat(&req.slave_id, status) {
            Ok(()) => proto::HeartbeatResponse {
                ok: true,
                message: String::new(),
            },
            Err(e) => {
                debug!(slave_id = %req.slave_id, error = %e, "heartbeat refused");
                proto::HeartbeatResponse {
                    ok: false,
                    message: e.to_string(),
                }
            }
        };
        Ok(Response::new(reply))
    }

    async fn report_stats(
        &self,
        request: Request<Streaming<proto::StatsData>>,
    ) -> Result<Response<proto::StatsAck>, Status> {
        let mut stream = request.into_inner();
        let mut ack = proto::StatsAck {
            received: true,
            accepted: 0,
            dropped: 0,
        };

        while let Some(data) = stream.message().await? {
            if self.master.collect_stats(SlaveStats::from(data)) {
                ack.accepted += 1;
            } else {
                ack.dropped += 1;
            }
        }
        debug!(accepted = ack.accepted, dropped = ack.dropped, "stats stream closed");
        Ok(Response::new(ack))
    }

    async fn unregister_slave(
        &self,
        request: Request<proto::UnregisterRequest>,
    ) -> Result<Response<proto::UnregisterResponse>, Status> {
        let req = request.into_inner();
        let reason = if req.reason.is_empty() {
            "unspecified"
        } else {
            req.reason.as_str()
        };

        let reply = match self.master.unregister_slave(&req.slave_id, reason) {
            Ok(()) => proto::UnregisterResponse {
                success: true,
                message: "unregistered".into(),
            },
            Err(e) => proto::UnregisterResponse {
                success: false,
                message: e.to_string(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn report_task_completion(
        &self,
        request: Request<proto::TaskCompletionRequest>,
    ) -> Result<Response<proto::TaskCompletionResponse>, Status> {
        let report = CompletionReport::from(request.into_inner());
        let (slave_id, task_id) = (report.slave_id.clone(), report.task_id.clone());

        let reply = match self.master.report_completion(report) {
            Ok(state) => proto::TaskCompletionResponse {
                acknowledged: true,
                message: format!("task is {state}"),
            },
            Err(e) => {
                warn!(%slave_id, %task_id, error = %e, "completion report rejected");
                proto::TaskCompletionResponse {
                    acknowledged: false,
                    message: e.to_string(),
                }
            }
        };
        Ok(Response::new(reply))
    }
}
