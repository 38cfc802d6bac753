use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use ember_control::HttpControlPlane;
use ember_daemon::{Daemon, DaemonConfig};
use ember_runtime::{DockerRuntime, HostSampler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("EMBER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/daemon.json"));
    let config = DaemonConfig::load(&config_path).context("loading daemon configuration")?;

    info!(api_url = %config.api_url, "starting emberpanel daemon");

    // Both of these are fatal: without the engine socket or a usable config
    // the daemon has nothing to reconcile against.
    let runtime = DockerRuntime::connect()
        .await
        .context("connecting to the container engine")?;
    let control = HttpControlPlane::new(config.api_url.clone(), config.api_key.clone());
    let sampler = HostSampler::new();

    let daemon = Daemon::new(
        config,
        Arc::new(runtime),
        Arc::new(control),
        Arc::new(sampler),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, finishing current cycle");
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
