use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hive_core::{CoreError, ExecuteAck, ExecuteRequest, SlaveConnector};
use hive_model::SlaveInfo;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::proto::{self, slave_service_client::SlaveServiceClient};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Cached {
    endpoint: String,
    client: SlaveServiceClient<Channel>,
}

/// [`SlaveConnector`] speaking the `SlaveService` gRPC contract.
///
/// Channels are opened lazily per slave and reused; a slave that comes back
/// on a different endpoint gets a fresh channel.
pub struct GrpcSlaveConnector {
    clients: DashMap<String, Cached>,
    connect_timeout: Duration,
}

impl GrpcSlaveConnector {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn client(&self, slave: &SlaveInfo) -> Result<SlaveServiceClient<Channel>, CoreError> {
        let endpoint = slave.endpoint();
        if let Some(cached) = self.clients.get(&slave.id) {
            if cached.endpoint == endpoint {
                return Ok(cached.client.clone());
            }
        }

        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| CoreError::Dispatch(format!("invalid endpoint {endpoint}: {e}")))?
            .connect_timeout(self.connect_timeout)
            .connect_lazy();
        let client = SlaveServiceClient::new(channel);
        debug!(slave_id = %slave.id, %endpoint, "opened slave channel");

        self.clients.insert(
            slave.id.clone(),
            Cached {
                endpoint,
                client: client.clone(),
            },
        );
        Ok(client)
    }
}

impl Default for GrpcSlaveConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn rpc_error(slave: &SlaveInfo, status: tonic::Status) -> CoreError {
    CoreError::Dispatch(format!(
        "slave {} ({:?}): {}",
        slave.id,
        status.code(),
        status.message()
    ))
}

#[async_trait]
impl SlaveConnector for GrpcSlaveConnector {
    async fn execute_task(
        &self,
        slave: &SlaveInfo,
        request: ExecuteRequest,
    ) -> Result<ExecuteAck, CoreError> {
        let mut client = self.client(slave)?;
        let reply = client
            .execute_task(proto::TaskConfig::from(request))
            .await
            .map_err(|s| rpc_error(slave, s))?;
        Ok(ExecuteAck::from(reply.into_inner()))
    }

    async fn stop_task(&self, slave: &SlaveInfo, task_id: &str, force: bool) -> Result<(), CoreError> {
        let mut client = self.client(slave)?;
        let reply = client
            .stop_task(proto::StopRequest {
                task_id: task_id.to_string(),
                force,
            })
            .await
            .map_err(|s| rpc_error(slave, s))?
            .into_inner();

        if reply.stopped {
            Ok(())
        } else {
            Err(CoreError::Dispatch(format!(
                "slave {} did not stop task {task_id}: {}",
                slave.id, reply.message
            )))
        }
    }

    fn forget(&self, slave_id: &str) {
        self.clients.remove(slave_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channels_are_cached_per_endpoint() {
        let connector = GrpcSlaveConnector::new();
        let slave = SlaveInfo::new("s1").with_endpoint("127.0.0.1", 9091);

        connector.client(&slave).unwrap();
        connector.client(&slave).unwrap();
        assert_eq!(connector.clients.len(), 1);

        let moved = SlaveInfo::new("s1").with_endpoint("127.0.0.1", 9092);
        connector.client(&moved).unwrap();
        assert_eq!(
            connector.clients.get("s1").unwrap().endpoint,
            "http://127.0.0.1:9092"
        );

        connector.forget("s1");
        assert!(connector.clients.is_empty());
    }
}
