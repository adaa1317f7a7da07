//! docker-upstreams daemon entry point.

use log::{error, info};
use tokio::signal;
use tokio::sync::watch;

use docker_upstreams::{Config, DockerRuntime, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting docker-upstreams with config: {:?}", cfg);

    let runtime = DockerRuntime::connect(cfg.docker_host.as_deref(), cfg.filter_health)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (engine, watcher) = SyncEngine::start(runtime, cfg.sync_settings(), shutdown_rx).await?;
    info!(
        "Serving {} upstreams",
        engine.upstreams().snapshot().len()
    );

    // Manual resync on SIGHUP
    #[cfg(unix)]
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!("Unable to listen for SIGHUP: {}", e);
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                info!("Received SIGHUP, resyncing containers");
                if let Err(e) = engine.resync().await {
                    error!("Resync failed: {}", e);
                }
            }
        });
    }

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = watcher.await {
        error!("Container watcher panicked: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}
