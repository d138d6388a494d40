// src/sync/mod.rs
pub mod correlate;
pub mod cursor;
pub mod providers;
pub mod rotation;
pub mod scheduler;
pub mod sink;
pub mod types;

use crate::sync::correlate::Correlator;
use crate::sync::cursor::CursorStore;
use crate::sync::sink::RecordSink;
use crate::sync::types::{
    EnrichedRecord, Entity, FailureKind, FeedBatch, FeedFetcher, FeedKind, FeedRecords, FeedStart,
    FetchError,
};
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("sync_cycles_total", "Completed poll-and-correlate cycles.");
        describe_counter!(
            "sync_records_fetched_total",
            "Raw records fetched, labelled by feed."
        );
        describe_counter!(
            "sync_records_enriched_total",
            "Enriched records handed to the sink."
        );
        describe_counter!(
            "sync_fetch_failures_total",
            "Abandoned feed fetches, labelled by failure kind."
        );
        describe_counter!("sync_sink_failures_total", "Failed sink appends.");
        describe_counter!(
            "sync_cursor_flush_failures_total",
            "Cursor state writes that failed and will be retried next cycle."
        );
        describe_histogram!("sync_cycle_duration_ms", "Cycle wall time in milliseconds.");
        describe_gauge!("sync_last_cycle_ts", "Unix ts when the last cycle finished.");
    });
}

/// Per-cycle knobs read once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub match_threshold: Duration,
    pub lookback: Duration,
    pub fetch_timeout: std::time::Duration,
    pub max_concurrent_entities: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            match_threshold: Duration::seconds(correlate::DEFAULT_MATCH_THRESHOLD_SECS),
            lookback: Duration::hours(24),
            fetch_timeout: std::time::Duration::from_secs(30),
            max_concurrent_entities: 4,
        }
    }
}

/// Everything a cycle touches, owned explicitly instead of living in globals.
#[derive(Clone)]
pub struct SyncContext {
    pub fetcher: Arc<dyn FeedFetcher>,
    pub sink: Arc<dyn RecordSink>,
    pub cursors: Arc<CursorStore>,
    pub settings: SyncSettings,
}

/// Result of a single (entity, feed) fetch as seen by the cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(FeedBatch),
    Failed(FetchError),
}

impl FetchOutcome {
    fn from_result(r: Result<FeedBatch, FetchError>) -> Self {
        match r {
            Ok(b) => FetchOutcome::Fetched(b),
            Err(e) => FetchOutcome::Failed(e),
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, FetchOutcome::Failed(FetchError::AuthRequired))
    }
}

/// What happened to one entity during a cycle.
#[derive(Debug, Clone, Default)]
pub struct EntityReport {
    pub entity_id: String,
    pub fetched: BTreeMap<FeedKind, usize>,
    pub enriched: usize,
    pub written: usize,
    pub failures: Vec<(FeedKind, FailureKind)>,
    pub sink_failed: bool,
}

/// Cycle summary, logged once per cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub entities_attempted: usize,
    pub records_fetched: usize,
    pub records_enriched: usize,
    pub records_written: usize,
    pub failures: BTreeMap<FailureKind, usize>,
    pub flush_failed: bool,
}

impl CycleSummary {
    fn absorb(&mut self, report: &EntityReport) {
        self.entities_attempted += 1;
        self.records_fetched += report.fetched.values().sum::<usize>();
        self.records_enriched += report.enriched;
        self.records_written += report.written;
        for (_, kind) in &report.failures {
            *self.failures.entry(*kind).or_default() += 1;
        }
        if report.sink_failed {
            *self.failures.entry(FailureKind::Sink).or_default() += 1;
        }
    }

    pub fn failure_count(&self, kind: FailureKind) -> usize {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    fn failures_label(&self) -> String {
        if self.failures.is_empty() {
            return "none".to_string();
        }
        self.failures
            .iter()
            .map(|(k, n)| format!("{}={n}", k.as_str()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Where to start reading `kind` for `entity`: the stored cursor, or
/// `now - lookback` when the feed was never fetched.
pub fn feed_start(
    cursors: &CursorStore,
    entity_id: &str,
    kind: FeedKind,
    now: DateTime<Utc>,
    lookback: Duration,
) -> FeedStart {
    match cursors.get(entity_id, kind) {
        Some(v) => FeedStart::Version(v),
        None => FeedStart::Since(now - lookback),
    }
}

async fn fetch_one(
    ctx: &SyncContext,
    entity: &Entity,
    kind: FeedKind,
    now: DateTime<Utc>,
) -> FetchOutcome {
    let start = feed_start(&ctx.cursors, &entity.id, kind, now, ctx.settings.lookback);
    let timeout = ctx.settings.fetch_timeout;
    let res = match tokio::time::timeout(timeout, ctx.fetcher.fetch(entity, kind, &start)).await {
        Ok(r) => r,
        Err(_) => Err(FetchError::Timeout(timeout)),
    };
    let res = res.and_then(|batch| {
        if batch.records.kind() == kind {
            Ok(batch)
        } else {
            Err(FetchError::MalformedResponse(format!(
                "asked for {kind} feed, got {}",
                batch.records.kind()
            )))
        }
    });
    FetchOutcome::from_result(res)
}

/// Fetch both feeds of one entity, advance cursors for the feeds that
/// succeeded, correlate, and hand the result to the sink.
///
/// An auth failure on either feed abandons the whole entity for this cycle:
/// the other feed's batch is discarded even if it succeeded, and neither
/// cursor moves. The discarded range is fetched again next time.
pub async fn sync_entity(
    ctx: &SyncContext,
    entity: &Entity,
    now: DateTime<Utc>,
) -> EntityReport {
    let mut report = EntityReport {
        entity_id: entity.id.clone(),
        ..Default::default()
    };

    let (pos, odo) = tokio::join!(
        fetch_one(ctx, entity, FeedKind::Position, now),
        fetch_one(ctx, entity, FeedKind::Odometer, now)
    );

    if pos.is_auth_failure() || odo.is_auth_failure() {
        // session is gone: drop the entity for this cycle, cursors untouched
        tracing::warn!(
            entity = %entity.id,
            fetcher = ctx.fetcher.name(),
            "auth required, entity abandoned for this cycle"
        );
        for (kind, outcome) in [(FeedKind::Position, &pos), (FeedKind::Odometer, &odo)] {
            if let FetchOutcome::Failed(e) = outcome {
                report.failures.push((kind, e.kind()));
                counter!("sync_fetch_failures_total", "kind" => e.kind().as_str()).increment(1);
            }
        }
        return report;
    }

    let mut samples = Vec::new();
    let mut readings = Vec::new();
    for (kind, outcome) in [(FeedKind::Position, pos), (FeedKind::Odometer, odo)] {
        match outcome {
            FetchOutcome::Fetched(batch) => {
                report.fetched.insert(kind, batch.records.len());
                counter!("sync_records_fetched_total", "feed" => kind.as_str())
                    .increment(batch.records.len() as u64);
                if let Some(v) = batch.to_version {
                    ctx.cursors.set(&entity.id, kind, v);
                }
                match batch.records {
                    FeedRecords::Positions(v) => samples = v,
                    FeedRecords::Odometer(v) => readings = v,
                }
            }
            FetchOutcome::Failed(e) => {
                tracing::warn!(
                    entity = %entity.id,
                    feed = %kind,
                    error = %e,
                    "fetch abandoned for this cycle"
                );
                counter!("sync_fetch_failures_total", "kind" => e.kind().as_str()).increment(1);
                report.failures.push((kind, e.kind()));
            }
        }
    }

    let enriched: Vec<EnrichedRecord> =
        Correlator::new(ctx.settings.match_threshold).correlate(entity, &samples, &readings);
    report.enriched = enriched.len();
    if enriched.is_empty() {
        return report;
    }
    counter!("sync_records_enriched_total").increment(enriched.len() as u64);

    match ctx.sink.append(entity, &enriched).await {
        Ok(n) => report.written = n,
        Err(e) => {
            tracing::warn!(entity = %entity.id, error = ?e, "sink write failed, records dropped");
            counter!("sync_sink_failures_total").increment(1);
            report.sink_failed = true;
        }
    }
    report
}

/// Run one cycle over `selected`, then persist the cursor map.
///
/// Per-entity failures are contained; nothing here returns an error.
pub async fn run_cycle(ctx: &SyncContext, selected: &[Entity]) -> CycleSummary {
    ensure_metrics_described();
    let t0 = std::time::Instant::now();
    let now = Utc::now();

    let permits = Arc::new(Semaphore::new(ctx.settings.max_concurrent_entities.max(1)));
    let mut tasks = JoinSet::new();
    for (idx, entity) in selected.iter().cloned().enumerate() {
        let ctx = ctx.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            (idx, sync_entity(&ctx, &entity, now).await)
        });
    }

    let mut reports = Vec::with_capacity(selected.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(r) => reports.push(r),
            Err(e) => tracing::error!(error = ?e, "entity task panicked"),
        }
    }
    reports.sort_by_key(|(idx, _)| *idx);

    let mut summary = CycleSummary::default();
    for (_, report) in &reports {
        summary.absorb(report);
    }

    if let Err(e) = ctx.cursors.flush().await {
        tracing::warn!(
            path = %ctx.cursors.path().display(),
            error = ?e,
            "cursor flush failed, retrying next cycle"
        );
        counter!("sync_cursor_flush_failures_total").increment(1);
        summary.flush_failed = true;
    }

    let ms = t0.elapsed().as_secs_f64() * 1_000.0;
    histogram!("sync_cycle_duration_ms").record(ms);
    counter!("sync_cycles_total").increment(1);
    gauge!("sync_last_cycle_ts").set(Utc::now().timestamp() as f64);

    tracing::info!(
        target: "sync",
        entities = summary.entities_attempted,
        fetched = summary.records_fetched,
        enriched = summary.records_enriched,
        written = summary.records_written,
        failures = %summary.failures_label(),
        elapsed_ms = ms as u64,
        "cycle finished"
    );

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn start_prefers_cursor_over_lookback() {
        let store = CursorStore::empty("unused.json");
        store.set("b1", FeedKind::Position, "42");
        let now = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap();

        assert_eq!(
            feed_start(&store, "b1", FeedKind::Position, now, Duration::hours(24)),
            FeedStart::Version("42".into())
        );
        assert_eq!(
            feed_start(&store, "b1", FeedKind::Odometer, now, Duration::hours(24)),
            FeedStart::Since(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
        );
    }

    struct StalledFetcher;

    #[async_trait::async_trait]
    impl FeedFetcher for StalledFetcher {
        async fn fetch(
            &self,
            _entity: &Entity,
            _kind: FeedKind,
            _start: &FeedStart,
        ) -> Result<FeedBatch, FetchError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn sub_second_timeout_is_reported_exactly() {
        let ctx = SyncContext {
            fetcher: Arc::new(StalledFetcher),
            sink: Arc::new(crate::sync::sink::MemorySink::new()),
            cursors: Arc::new(CursorStore::empty("unused.json")),
            settings: SyncSettings {
                fetch_timeout: std::time::Duration::from_millis(20),
                ..SyncSettings::default()
            },
        };
        let out = fetch_one(&ctx, &Entity::new("b1"), FeedKind::Position, Utc::now()).await;
        assert_eq!(
            out,
            FetchOutcome::Failed(FetchError::Timeout(std::time::Duration::from_millis(20)))
        );
    }

    #[test]
    fn summary_counts_failures_by_kind() {
        let mut s = CycleSummary::default();
        s.absorb(&EntityReport {
            entity_id: "a".into(),
            fetched: BTreeMap::from([(FeedKind::Position, 3), (FeedKind::Odometer, 2)]),
            enriched: 3,
            written: 3,
            failures: vec![],
            sink_failed: false,
        });
        s.absorb(&EntityReport {
            entity_id: "b".into(),
            failures: vec![(FeedKind::Odometer, FailureKind::Quota)],
            sink_failed: true,
            ..Default::default()
        });
        assert_eq!(s.entities_attempted, 2);
        assert_eq!(s.records_fetched, 5);
        assert_eq!(s.failure_count(FailureKind::Quota), 1);
        assert_eq!(s.failure_count(FailureKind::Sink), 1);
        assert_eq!(s.failures_label(), "quota=1,sink=1");
    }
}
