// src/sync/correlate.rs
//! Nearest-preceding odometer match for position samples.
//!
//! Pure, no I/O. Works on one entity's records from a single cycle; a sample
//! whose true nearest reading arrives in a later cycle stays unmatched. That
//! boundary loss is accepted rather than widening the lookback.

use chrono::Duration;

use crate::sync::types::{EnrichedRecord, Entity, OdometerReading, PositionSample};

pub const DEFAULT_MATCH_THRESHOLD_SECS: i64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct Correlator {
    threshold: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_MATCH_THRESHOLD_SECS))
    }
}

impl Correlator {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// One enriched record per sample, in sample order.
    pub fn correlate(
        &self,
        entity: &Entity,
        samples: &[PositionSample],
        readings: &[OdometerReading],
    ) -> Vec<EnrichedRecord> {
        let mut sorted: Vec<&OdometerReading> = readings.iter().collect();
        // stable: equal timestamps keep arrival order
        sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        samples
            .iter()
            .map(|p| EnrichedRecord {
                entity_id: entity.id.clone(),
                name: entity.name.clone(),
                vin: entity.vin.clone(),
                timestamp: p.timestamp,
                latitude: p.latitude,
                longitude: p.longitude,
                odometer: self.nearest_preceding(p, &sorted).map(|o| o.value),
            })
            .collect()
    }

    /// `sorted` must be ascending by timestamp.
    fn nearest_preceding<'a>(
        &self,
        p: &PositionSample,
        sorted: &[&'a OdometerReading],
    ) -> Option<&'a OdometerReading> {
        let mut best: Option<(&'a OdometerReading, Duration)> = None;
        for &o in sorted {
            if o.timestamp > p.timestamp {
                break;
            }
            let diff = p.timestamp - o.timestamp;
            if diff >= self.threshold {
                continue;
            }
            match best {
                Some((_, d)) if diff >= d => {}
                _ => best = Some((o, diff)),
            }
        }
        best.map(|(o, _)| o)
    }
}

/// Correlate with the default 10 s threshold.
pub fn correlate(
    entity: &Entity,
    samples: &[PositionSample],
    readings: &[OdometerReading],
) -> Vec<EnrichedRecord> {
    Correlator::default().correlate(entity, samples, readings)
}
