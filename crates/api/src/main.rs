use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use codeflow_infra::{Orchestrator, OrchestratorConfig};

const DEFAULT_BIND: &str = "0.0.0.0:6666";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    codeflow_observability::init();

    let config = OrchestratorConfig::from_env()?;
    let bind = std::env::var("CODEFLOW_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());

    let orchestrator = Arc::new(
        Orchestrator::from_config(&config).context("failed to open artifact store")?,
    );
    orchestrator.start().context("failed to start workers")?;

    let purger = tokio::spawn(purge_loop(orchestrator.clone()));

    let app = codeflow_api::app::build_app(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    purger.abort();
    tracing::info!("draining job queue");
    tokio::task::spawn_blocking(move || orchestrator.shutdown()).await?;
    Ok(())
}

/// Periodically drop finished job records past their retention.
async fn purge_loop(orchestrator: Arc<Orchestrator>) {
    let period = (orchestrator.job_retention() / 4).clamp(Duration::from_secs(1), Duration::from_secs(300));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if let Err(e) = orchestrator.purge_finished() {
            tracing::warn!(error = %e, "job purge failed");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
