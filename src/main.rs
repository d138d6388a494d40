//! Fleet feed sync binary entrypoint.
//! Authenticates, discovers vehicles, then polls position and odometer feeds
//! on a fixed interval until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_feed_sync::config::sync::load_default;
use fleet_feed_sync::sync::providers::geotab::GeotabClient;
use fleet_feed_sync::sync::scheduler::{run_scheduler, SyncSchedulerCfg};
use fleet_feed_sync::{CsvFileSink, CursorStore, RotationPolicy, SyncContext};

/// Compact text logs by default, JSON lines when LOG_FORMAT=json.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fleet_feed_sync=info,sync=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_default().context("loading sync config")?;
    if let Some(addr) = cfg.metrics_addr.as_deref() {
        fleet_feed_sync::exporter::install_exporter(
            addr,
            cfg.cycle_interval_secs,
            cfg.call_budget_per_cycle,
        )?;
    }

    let settings = cfg.settings();
    let client = Arc::new(GeotabClient::new(
        cfg.telemetry.clone(),
        cfg.results_limit,
        settings.fetch_timeout,
    ));
    client
        .authenticate()
        .await
        .context("initial telemetry authentication")?;
    let entities = client
        .discover_entities()
        .await
        .context("discovering vehicles")?;
    if entities.is_empty() {
        tracing::warn!("no vehicles found, nothing to sync");
        return Ok(());
    }

    let rotation = RotationPolicy::new(
        entities,
        cfg.call_budget_per_cycle,
        cfg.calls_per_entity(),
    );
    tracing::info!(
        vehicles = rotation.order().len(),
        per_cycle = rotation.capacity(),
        interval_secs = cfg.cycle_interval_secs,
        "rotation configured"
    );
    if !rotation.starvation_bound() {
        tracing::warn!(
            "call budget covers fewer than half the vehicles; some will wait more than two cycles"
        );
    }

    let ctx = SyncContext {
        fetcher: client,
        sink: Arc::new(CsvFileSink::new(&cfg.output_dir).with_retention(settings.lookback)),
        cursors: Arc::new(CursorStore::load(&cfg.cursor_path).await),
        settings,
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };
    let cycles = run_scheduler(
        ctx,
        rotation,
        SyncSchedulerCfg::every(cfg.cycle_interval()),
        shutdown,
    )
    .await;

    tracing::info!(cycles, "sync stopped");
    Ok(())
}
