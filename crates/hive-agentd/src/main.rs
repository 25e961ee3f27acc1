mod engine;
mod settings;

use std::sync::Arc;

use hive_observe::logger_init;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use engine::DemoEngine;
use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new(|name: &str| std::env::var(name).ok());

    // 1) Logger
    logger_init(&settings.logger()?)?;

    // 2) Config
    let config = settings.agent()?;
    let engine = Arc::new(DemoEngine::new(settings.demo_rps()?));

    // 3) Ctrl+C cancels the session
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutting down..."),
                Err(e) => warn!(error = %e, "ctrl-c handler failed, shutting down"),
            }
            token.cancel();
        });
    }

    // 4) Run until cancelled
    hive_agent::run(config, engine, token).await?;
    Ok(())
}
