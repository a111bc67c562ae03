use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use visitas::clock::SystemClock;
use visitas::config::Settings;
use visitas::engine::Scheduler;
use visitas::reaper;
use visitas::state::AppState;
use visitas::store::DocumentStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    visitas::observability::init(settings.metrics_port)?;

    std::fs::create_dir_all(&settings.data_dir)?;
    let store = Arc::new(DocumentStore::open(&settings.wal_path())?);
    info!("visitas store open");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  appointments: {}", store.appointment_count());
    info!("  users: {}", store.user_count());
    info!("  retention: {} days, sweep every {:?}", settings.retention_days, settings.sweep_interval);
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        Arc::new(AppState::new()),
        Arc::new(SystemClock),
        settings.super_admins.clone(),
    ));

    let sweeper = tokio::spawn(reaper::run_retention_sweeper(
        scheduler,
        settings.sweep_interval,
        chrono::Duration::days(settings.retention_days),
    ));
    let compactor = tokio::spawn(reaper::run_compactor(
        store.clone(),
        settings.compact_threshold,
        Duration::from_secs(5),
    ));

    // Graceful shutdown on SIGTERM/ctrl-c: stop background jobs, then
    // leave a compacted log behind.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    sweeper.abort();
    compactor.abort();
    if let Err(e) = store.compact().await {
        tracing::error!("final compaction failed: {e}");
    }

    info!("visitas stopped");
    Ok(())
}
