// src/sync/scheduler.rs
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::sync::rotation::RotationPolicy;
use crate::sync::{run_cycle, SyncContext};

#[derive(Clone, Copy, Debug)]
pub struct SyncSchedulerCfg {
    pub interval: Duration,
    /// Stop after this many cycles; `None` runs until shutdown.
    pub max_cycles: Option<u64>,
}

impl SyncSchedulerCfg {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_cycles: None,
        }
    }
}

/// Drive cycles on a fixed interval until `shutdown` resolves.
///
/// A cycle always runs to completion; shutdown is only observed between
/// cycles. Ticks missed while a cycle overran are skipped, never queued, so
/// two cycles never share the cursor store. Returns the number of cycles run.
pub async fn run_scheduler<F>(
    ctx: SyncContext,
    mut rotation: RotationPolicy,
    cfg: SyncSchedulerCfg,
    shutdown: F,
) -> u64
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut cycles = 0u64;
    loop {
        if cfg.max_cycles.is_some_and(|max| cycles >= max) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                tracing::info!(target: "sync", cycles, "shutdown requested");
                break;
            }
        }

        let selected = rotation.next_cycle();
        tracing::debug!(
            target: "sync",
            cycle = rotation.cycle(),
            selected = ?selected.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            "cycle starting"
        );
        let _summary = run_cycle(&ctx, &selected).await;
        cycles += 1;
    }

    if let Err(e) = ctx.cursors.flush().await {
        tracing::warn!(error = ?e, "final cursor flush failed");
    }
    cycles
}
