// tests/sink_csv.rs
use chrono::{TimeZone, Utc};
use fleet_feed_sync::sync::providers::scripted::ScriptedFetcher;
use fleet_feed_sync::sync::sink::CSV_HEADER;
use fleet_feed_sync::{
    run_cycle, CsvFileSink, CursorStore, Entity, FeedRecords, OdometerReading, PositionSample,
    SyncContext, SyncSettings,
};
use std::sync::Arc;

fn sample(secs: u32) -> PositionSample {
    PositionSample {
        entity_id: "b12".into(),
        timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 6, 30, secs).unwrap(),
        latitude: 43.6532,
        longitude: -79.3832,
    }
}

async fn one_cycle(dir: &std::path::Path, fetcher: Arc<ScriptedFetcher>) {
    let ctx = SyncContext {
        fetcher,
        sink: Arc::new(CsvFileSink::new(dir.join("out"))),
        cursors: Arc::new(CursorStore::load(dir.join("cursors.json")).await),
        settings: SyncSettings::default(),
    };
    let e = Entity::new("b12").with_labels(Some("Reefer 12".into()), Some("1FUJGLDR5CL".into()));
    run_cycle(&ctx, &[e]).await;
}

#[tokio::test]
async fn rows_survive_restart_without_second_header_or_duplicates() {
    let dir = tempfile::tempdir().unwrap();

    let f1 = Arc::new(ScriptedFetcher::new());
    f1.push_batch("b12", FeedRecords::Positions(vec![sample(0), sample(5)]), Some("10"));
    f1.push_batch(
        "b12",
        FeedRecords::Odometer(vec![OdometerReading {
            entity_id: "b12".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 6, 29, 58).unwrap(),
            value: 120_345.5,
        }]),
        Some("20"),
    );
    one_cycle(dir.path(), f1).await;

    // "restart": fresh sink + cursor store; the remote re-delivers sample(5)
    let f2 = Arc::new(ScriptedFetcher::new());
    f2.push_batch("b12", FeedRecords::Positions(vec![sample(5), sample(9)]), Some("11"));
    one_cycle(dir.path(), f2.clone()).await;

    // resumed from the persisted cursor
    assert!(f2
        .calls()
        .iter()
        .any(|c| c.start == fleet_feed_sync::FeedStart::Version("10".into())));

    let text = std::fs::read_to_string(dir.path().join("out").join("b12.csv")).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], CSV_HEADER);
    assert_eq!(text.matches(CSV_HEADER).count(), 1);
    assert_eq!(lines.len(), 4, "{text}");
    assert_eq!(
        lines[1],
        "b12,Reefer 12,1FUJGLDR5CL,2025-03-01T06:30:00Z,43.6532,-79.3832,120345.5"
    );
    assert!(lines[2].starts_with("b12,Reefer 12,1FUJGLDR5CL,2025-03-01T06:30:05Z"));
    assert!(lines[3].ends_with(','), "no odometer in second run: {}", lines[3]);
}
