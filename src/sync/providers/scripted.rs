// src/sync/providers/scripted.rs
//! In-memory fetcher replaying queued responses. Used by tests and dry runs.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::sync::types::{
    Entity, FeedBatch, FeedFetcher, FeedKind, FeedRecords, FeedStart, FetchError,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub entity_id: String,
    pub kind: FeedKind,
    pub start: FeedStart,
}

/// Responses are queued per (entity, feed). An exhausted queue answers with
/// an empty batch that leaves the cursor alone.
#[derive(Default)]
pub struct ScriptedFetcher {
    queues: Mutex<HashMap<(String, FeedKind), VecDeque<Result<FeedBatch, FetchError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entity_id: &str, kind: FeedKind, response: Result<FeedBatch, FetchError>) {
        self.queues
            .lock()
            .entry((entity_id.to_string(), kind))
            .or_default()
            .push_back(response);
    }

    pub fn push_batch(&self, entity_id: &str, records: FeedRecords, to_version: Option<&str>) {
        let kind = records.kind();
        self.push(
            entity_id,
            kind,
            Ok(FeedBatch {
                records,
                to_version: to_version.map(str::to_string),
            }),
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Entity ids in the order their first call was made.
    pub fn entities_called(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in self.calls.lock().iter() {
            if !out.contains(&c.entity_id) {
                out.push(c.entity_id.clone());
            }
        }
        out
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait::async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        entity: &Entity,
        kind: FeedKind,
        start: &FeedStart,
    ) -> Result<FeedBatch, FetchError> {
        self.calls.lock().push(RecordedCall {
            entity_id: entity.id.clone(),
            kind,
            start: start.clone(),
        });
        let next = self
            .queues
            .lock()
            .get_mut(&(entity.id.clone(), kind))
            .and_then(|q| q.pop_front());
        next.unwrap_or_else(|| {
            Ok(FeedBatch {
                records: FeedRecords::empty(kind),
                to_version: None,
            })
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
