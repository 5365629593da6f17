//! Reelsync media daemon.
//!
//! Serves the one file selected for synchronized playback to every viewer
//! over HTTP range requests, fairly, through the delivery scheduler.
//!
//! Usage:
//!   reelsync-server --bind 0.0.0.0:8080 --media /srv/film.mkv
//!
//! Scheduling parameters come from `REELSYNC_*` environment variables.

use std::sync::Arc;
use std::time::Duration;

// ---

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---

use reelsync_delivery::{
    // ---
    ConfigWatcher,
    DeliveryParams,
    DeliveryService,
    EnvSource,
    FileReader,
    TracingDiagnostics,
};

// ---

mod config;
mod control;
mod routes;

// ---

use config::Config;
use routes::{router, AppState};

// Gateway re-exports; siblings import via super::Symbol
pub use control::ControlPlane;

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---

    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(!no_color)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "reelsync-server starting");

    // Bad values fall back to defaults with a diagnostic; never fatal.
    let params = DeliveryParams::resolve(&EnvSource, &TracingDiagnostics);
    let watcher = ConfigWatcher::new(params.clone());

    let control = Arc::new(ControlPlane::new());
    let service = Arc::new(DeliveryService::start(
        params,
        Arc::new(FileReader::new()),
        control.clone(),
        Arc::new(TracingDiagnostics),
    ));

    if let Some(path) = &cfg.media {
        let file = control.select(path).await?;
        service.warm(&file).await?;
    } else {
        info!("no media selected; waiting for POST /admin/select");
    }

    if let Some(every) = cfg.config_check_interval() {
        tokio::spawn(watch_config(watcher, Arc::clone(&service), every));
    }

    let app = router(AppState { service, control });

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    info!(bind = %cfg.bind, "HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("ctrl-c handler failed: {e}");
            }
        })
        .await?;

    info!("shutting down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Config drift
// ---------------------------------------------------------------------------

/// Re-read the environment every `every`.  Drift is reported once; only a
/// smaller head cache is applied without a restart.
async fn watch_config(mut watcher: ConfigWatcher, service: Arc<DeliveryService>, every: Duration) {
    // ---
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires at once and would only compare startup to itself.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let report = watcher.check(&EnvSource, &TracingDiagnostics);
        if !report.changed.is_empty() {
            tracing::debug!(changed = ?report.changed, "config drift check");
        }
        service.apply_drift(&report);
    }
}
