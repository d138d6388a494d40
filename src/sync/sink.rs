// src/sync/sink.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::sync::types::{EnrichedRecord, Entity};

pub const CSV_HEADER: &str = "entity_id,name,vin,timestamp,latitude,longitude,odometer";

/// How far behind the newest written row keys are remembered by default.
pub const DEFAULT_DEDUP_RETENTION_HOURS: i64 = 24;

#[async_trait::async_trait]
pub trait RecordSink: Send + Sync {
    /// Append one entity's records in order. Records whose (entity, timestamp)
    /// key is already stored are dropped. Returns the number of rows written.
    async fn append(&self, entity: &Entity, records: &[EnrichedRecord]) -> Result<usize>;
}

/// Timestamps already written for one entity, limited to `retention` behind
/// the newest one. Anything older can only come back through a re-fetch that
/// reaches further than the lookback window, so it is forgotten.
#[derive(Debug, Default)]
struct KeyWindow {
    keys: BTreeSet<DateTime<Utc>>,
}

impl KeyWindow {
    fn floor(&self, retention: Duration) -> Option<DateTime<Utc>> {
        self.keys.last().map(|newest| *newest - retention)
    }

    fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.keys.contains(ts)
    }

    fn insert(&mut self, ts: DateTime<Utc>, retention: Duration) {
        if self.floor(retention).is_some_and(|floor| ts < floor) {
            return;
        }
        self.keys.insert(ts);
        if let Some(floor) = self.floor(retention) {
            self.keys = self.keys.split_off(&floor);
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// One append-only CSV file per entity under `dir`.
pub struct CsvFileSink {
    dir: PathBuf,
    retention: Duration,
    // recent keys on disk, populated on first touch of each entity file
    seen: tokio::sync::Mutex<HashMap<String, KeyWindow>>,
}

impl CsvFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention: Duration::hours(DEFAULT_DEDUP_RETENTION_HOURS),
            seen: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Remember keys this far behind the newest row. Use the fetch lookback.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn path_for(&self, entity_id: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", file_stem(entity_id)))
    }

    /// Number of keys currently remembered for `entity_id`.
    pub async fn tracked_keys(&self, entity_id: &str) -> usize {
        self.seen.lock().await.get(entity_id).map_or(0, KeyWindow::len)
    }
}

#[async_trait::async_trait]
impl RecordSink for CsvFileSink {
    async fn append(&self, entity: &Entity, records: &[EnrichedRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let path = self.path_for(&entity.id);

        let mut seen = self.seen.lock().await;
        if !seen.contains_key(&entity.id) {
            let window = read_existing_keys(&path, self.retention).await?;
            seen.insert(entity.id.clone(), window);
        }
        let window = seen.entry(entity.id.clone()).or_default();

        let mut batch = HashSet::new();
        let mut fresh = Vec::with_capacity(records.len());
        for r in records {
            if window.contains(&r.timestamp) || !batch.insert(r.timestamp) {
                tracing::debug!(
                    entity = %r.entity_id,
                    ts = %r.timestamp,
                    "duplicate record key, skipped"
                );
                continue;
            }
            fresh.push(r);
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let needs_header = file.metadata().await?.len() == 0;
        let buf = encode_rows(&fresh, needs_header)?;

        file.write_all(&buf)
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush().await?;
        for ts in batch {
            window.insert(ts, self.retention);
        }
        Ok(fresh.len())
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn row_fields(r: &EnrichedRecord) -> [String; 7] {
    [
        r.entity_id.clone(),
        r.name.clone().unwrap_or_default(),
        r.vin.clone().unwrap_or_default(),
        format_timestamp(&r.timestamp),
        r.latitude.to_string(),
        r.longitude.to_string(),
        r.odometer.map(|v| v.to_string()).unwrap_or_default(),
    ]
}

/// Encode rows (and optionally the header) as CSV with `\n` terminators.
fn encode_rows(records: &[&EnrichedRecord], header: bool) -> Result<Vec<u8>> {
    let mut w = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    if header {
        w.write_record(CSV_HEADER.split(','))?;
    }
    for r in records {
        w.write_record(row_fields(r))?;
    }
    w.into_inner()
        .map_err(|e| anyhow::anyhow!("flushing csv buffer: {}", e.error()))
}

async fn read_existing_keys(path: &Path, retention: Duration) -> Result<KeyWindow> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || scan_keys(&owned, retention))
        .await
        .context("sink key scan task")?
}

// Streams the file so only keys inside the retention window stay in memory.
fn scan_keys(path: &Path, retention: Duration) -> Result<KeyWindow> {
    let mut window = KeyWindow::default();
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(window),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(std::io::BufReader::new(file));

    for row in reader.records() {
        let parsed = row.ok().and_then(|rec| {
            let ts = DateTime::parse_from_rfc3339(rec.get(3)?).ok()?;
            Some(ts.with_timezone(&Utc))
        });
        match parsed {
            Some(ts) => window.insert(ts, retention),
            None => {
                tracing::debug!(path = %path.display(), "unparseable row in sink file, ignored")
            }
        }
    }
    Ok(window)
}

/// Safe file stem for an entity id. Ids that needed rewriting get a short
/// digest suffix so `a/b` and `a_b` land in different files.
fn file_stem(id: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.is_empty() && id.chars().all(safe) {
        return id.to_string();
    }
    let stem: String = id.chars().map(|c| if safe(c) { c } else { '_' }).collect();
    let digest = Sha256::digest(id.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{stem}-{suffix}")
}

// --- Test helper ---
/// In-memory sink recording every call; does not deduplicate.
pub struct MemorySink {
    pub calls: parking_lot::Mutex<Vec<(String, Vec<EnrichedRecord>)>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            calls: parking_lot::Mutex::new(vec![]),
            fail: false,
        }
    }

    /// A sink whose every append fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn records(&self) -> Vec<EnrichedRecord> {
        self.calls
            .lock()
            .iter()
            .flat_map(|(_, rs)| rs.iter().cloned())
            .collect()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RecordSink for MemorySink {
    async fn append(&self, entity: &Entity, records: &[EnrichedRecord]) -> Result<usize> {
        if self.fail {
            anyhow::bail!("memory sink configured to fail");
        }
        self.calls.lock().push((entity.id.clone(), records.to_vec()));
        Ok(records.len())
    }
}
