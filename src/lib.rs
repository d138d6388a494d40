// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod exporter;

// Fetch / cursor / rotation / correlate / sink pipeline
pub mod sync;

// ---- Re-exports for stable public API ----
pub use crate::config::sync::SyncConfig;
pub use crate::sync::correlate::Correlator;
pub use crate::sync::cursor::CursorStore;
pub use crate::sync::rotation::RotationPolicy;
pub use crate::sync::sink::{CsvFileSink, MemorySink, RecordSink};
pub use crate::sync::types::{
    EnrichedRecord, Entity, FeedBatch, FeedFetcher, FeedKind, FeedRecords, FeedStart, FetchError,
    OdometerReading, PositionSample, RecordKey,
};
pub use crate::sync::{run_cycle, CycleSummary, SyncContext, SyncSettings};
