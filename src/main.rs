use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use occupant::audit::TracingAuditSink;
use occupant::config::Config;
use occupant::engine::Engine;
use occupant::notify::NotifyHub;
use occupant::{gateway, sweeper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    occupant::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        notify,
        Arc::new(TracingAuditSink),
    )?);

    let cancel = CancellationToken::new();
    let sweeper_task = tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        config.sweep_interval,
        cancel.clone(),
    ));
    let compactor_task = tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        cancel.clone(),
    ));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("occupant listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  sweep_interval: {}s", config.sweep_interval.as_secs());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let server = tokio::spawn(gateway::serve(
        listener,
        engine.clone(),
        config.max_connections,
        Duration::from_secs(10),
        cancel.clone(),
    ));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let an in-flight sweep finish
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received");
    cancel.cancel();
    server.await?;
    sweeper_task.await?;
    compactor_task.await?;

    info!("occupant stopped");
    Ok(())
}
