mod settings;

use std::sync::Arc;

use anyhow::Context;
use hive_api::{
    GrpcSlaveConnector, HttpApi, MasterApiAdapter, MasterGrpcService, MasterServiceServer, axum,
    tonic::transport::Server,
};
use hive_core::Master;
use hive_observe::logger_init;
use hive_prometheus::PrometheusMetrics;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new(|name: &str| std::env::var(name).ok());

    // 1) Logger
    logger_init(&settings.logger()?)?;

    // 2) Config
    let config = settings.master()?;
    info!(
        grpc = %config.grpc_addr,
        http = %config.http_addr,
        select = %config.select_strategy,
        split = %config.split_strategy,
        "master configured"
    );

    // 3) Core + metrics
    let metrics = PrometheusMetrics::new().context("create prometheus registry")?;
    let connector = GrpcSlaveConnector::new().with_connect_timeout(config.dispatch_timeout);
    let master = Arc::new(Master::new(
        config,
        Arc::new(connector),
        Arc::new(metrics.clone()),
    )?);
    let token = CancellationToken::new();
    let background = master.spawn_background(token.child_token());

    // 4) Slave-facing gRPC
    let grpc_addr = master.config().grpc_addr.clone();
    let grpc_listener = TcpListener::bind(&grpc_addr)
        .await
        .with_context(|| format!("bind gRPC listener on {grpc_addr}"))?;
    let grpc = {
        let service = MasterServiceServer::new(MasterGrpcService::new(Arc::clone(&master)));
        let shutdown = token.clone().cancelled_owned();
        tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(grpc_listener), shutdown)
                .await
        })
    };
    info!(addr = %grpc_addr, "gRPC server listening");

    // 5) Admin HTTP
    let http_addr = master.config().http_addr.clone();
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("bind HTTP listener on {http_addr}"))?;
    let router = HttpApi::new(Arc::new(MasterApiAdapter::new(Arc::clone(&master))))
        .with_metrics(metrics)
        .router();
    let http = {
        let shutdown = token.clone().cancelled_owned();
        tokio::spawn(async move {
            axum::serve(http_listener, router)
                .with_graceful_shutdown(shutdown)
                .await
        })
    };
    info!(addr = %http_addr, "HTTP server listening");

    // 6) Run until Ctrl+C
    info!("master is running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    token.cancel();

    grpc.await.context("gRPC server task")??;
    http.await.context("HTTP server task")??;
    if let Err(e) = background.await {
        warn!(error = %e, "background jobs panicked");
    }
    master.collector().drain();

    let status = master.status();
    info!(
        slaves = status.slave_count,
        running = status.queue.running,
        pending = status.queue.pending,
        "master stopped"
    );
    Ok(())
}
