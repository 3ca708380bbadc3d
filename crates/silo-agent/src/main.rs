use std::net::SocketAddr;

use anyhow::Context;
use silo_agent::{AgentConfig, InstanceManager, api};

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("silo_agent=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AgentConfig::from_env().context("load agent config")?;
    tracing::info!(
        root = %config.root_dir.display(),
        minio = %config.minio_bin.display(),
        ports = ?config.port_range(),
        domain = config.domain.as_deref().unwrap_or("<localhost>"),
        "silo-agent starting"
    );

    let addr = SocketAddr::new(config.bind, config.agent_port);
    let manager = InstanceManager::from_config(config)?;
    manager
        .ensure_dirs()
        .await
        .context("create agent directories")?;

    // Bring the fleet back before accepting any request.
    let report = manager.recover().await.context("recover instances")?;
    tracing::info!(
        recovered = report.recovered.len(),
        failed = report.failures.len(),
        "recovery finished"
    );
    for failure in &report.failures {
        tracing::warn!(instance = %failure.instance, error = %failure.error, "instance not recovered");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "silo-agent HTTP listening");

    axum::serve(listener, api::router(manager))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
