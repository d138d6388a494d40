// src/sync/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tracked device. Name and VIN only label output rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub name: Option<String>,
    pub vin: Option<String>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            vin: None,
        }
    }

    pub fn with_labels(mut self, name: Option<String>, vin: Option<String>) -> Self {
        self.name = name;
        self.vin = vin;
        self
    }
}

/// The two streams tracked per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Position,
    Odometer,
}

impl FeedKind {
    pub const ALL: [FeedKind; 2] = [FeedKind::Position, FeedKind::Odometer];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Position => "position",
            FeedKind::Odometer => "odometer",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a feed read starts: a stored cursor, or a bounded lookback on first run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStart {
    Version(String),
    Since(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdometerReading {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    /// Odometer value as reported by the device (metres for MyGeotab).
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedRecords {
    Positions(Vec<PositionSample>),
    Odometer(Vec<OdometerReading>),
}

impl FeedRecords {
    pub fn empty(kind: FeedKind) -> Self {
        match kind {
            FeedKind::Position => FeedRecords::Positions(Vec::new()),
            FeedKind::Odometer => FeedRecords::Odometer(Vec::new()),
        }
    }

    pub fn kind(&self) -> FeedKind {
        match self {
            FeedRecords::Positions(_) => FeedKind::Position,
            FeedRecords::Odometer(_) => FeedKind::Odometer,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FeedRecords::Positions(v) => v.len(),
            FeedRecords::Odometer(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One successful feed read. `to_version` is `None` when the remote side did
/// not report a new position, in which case the stored cursor stays put.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBatch {
    pub records: FeedRecords,
    pub to_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("session invalid, re-authentication required")]
    AuthRequired,

    #[error("call quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl FetchError {
    /// Stable label used in cycle summaries and metrics.
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::AuthRequired => FailureKind::Auth,
            FetchError::QuotaExceeded(_) => FailureKind::Quota,
            FetchError::MalformedResponse(_) => FailureKind::Malformed,
            FetchError::Transport(_) => FailureKind::Transport,
            FetchError::Timeout(_) => FailureKind::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    Auth,
    Quota,
    Malformed,
    Transport,
    Timeout,
    Sink,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Auth => "auth",
            FailureKind::Quota => "quota",
            FailureKind::Malformed => "malformed",
            FailureKind::Transport => "transport",
            FailureKind::Timeout => "timeout",
            FailureKind::Sink => "sink",
        }
    }
}

/// Boundary toward the remote telemetry service.
#[async_trait::async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(
        &self,
        entity: &Entity,
        kind: FeedKind,
        start: &FeedStart,
    ) -> Result<FeedBatch, FetchError>;

    fn name(&self) -> &'static str;
}

/// Sink deduplication identity for an enriched record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A position sample with its matched odometer value, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub entity_id: String,
    pub name: Option<String>,
    pub vin: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub odometer: Option<f64>,
}

impl EnrichedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            entity_id: self.entity_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_keeps_sub_second_precision() {
        let e = FetchError::Timeout(std::time::Duration::from_millis(250));
        assert_eq!(e.to_string(), "call timed out after 250ms");
        assert_eq!(e.kind(), FailureKind::Timeout);
    }
}
