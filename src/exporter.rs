use anyhow::{Context, Result};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with its own HTTP listener on `addr`
/// (scrape path `/metrics`), and publish the static sync settings as gauges.
pub fn install_exporter(addr: &str, cycle_interval_secs: u64, call_budget: usize) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics_addr {addr:?}"))?;

    // Use default buckets to avoid API differences across crate versions.
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("prometheus: install recorder")?;

    gauge!("sync_cycle_interval_secs").set(cycle_interval_secs as f64);
    gauge!("sync_call_budget_per_cycle").set(call_budget as f64);

    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}
