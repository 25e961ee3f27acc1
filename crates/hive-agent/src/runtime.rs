use std::{net::SocketAddr, sync::Arc};

use hive_api::SlaveServiceServer;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::{
    config::AgentConfig, engine::LoadEngine, error::AgentError, link::MasterLink,
    reporter::StatsReporter, service::SlaveAgent,
};

/// Runs a slave until `token` is cancelled: serves `SlaveService` on
/// `bind_addr`, keeps the master link up and streams stats.
///
/// On cancellation the slave unregisters, cancels its running tasks and
/// flushes the remaining stats before the server stops.
pub async fn run(
    config: AgentConfig,
    engine: Arc<dyn LoadEngine>,
    token: CancellationToken,
) -> Result<(), AgentError> {
    let addr: SocketAddr = config.bind_addr.parse().map_err(|e| AgentError::BindAddr {
        addr: config.bind_addr.clone(),
        reason: format!("{e}"),
    })?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| AgentError::BindAddr {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    let (agent, outbox) = SlaveAgent::new(config, engine)?;
    let link = MasterLink::new(agent.clone())?;
    let session = token.child_token();
    let server_stop = CancellationToken::new();

    let reporter = StatsReporter::new(outbox.stats, agent.config().report_interval);
    let reporter = tokio::spawn(reporter.run(link.client(), session.clone()));

    info!(
        slave_id = %agent.slave_id(),
        %addr,
        master = %agent.config().master_endpoint,
        "slave agent started"
    );

    let serve = {
        let session = session.clone();
        let server_stop = server_stop.clone();
        let agent = agent.clone();
        async move {
            let result = Server::builder()
                .add_service(SlaveServiceServer::new(agent))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    server_stop.cancelled_owned(),
                )
                .await;
            session.cancel();
            result
        }
    };
    let link_session = async {
        let result = link.run(outbox.completions, session.clone()).await;
        agent.shutdown();
        server_stop.cancel();
        result
    };

    let (served, linked) = tokio::join!(serve, link_session);
    if let Err(e) = reporter.await {
        warn!(error = %e, "stats reporter panicked");
    }
    info!("slave agent stopped");

    served?;
    linked
}
