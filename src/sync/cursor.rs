// src/sync/cursor.rs
//! Durable (entity, feed) -> version token map.
//!
//! The whole map lives in memory behind one lock; `flush` rewrites the file
//! through a temp file + rename so readers never observe a half-written
//! document. Load problems degrade to an empty map.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::sync::types::FeedKind;

/// On-disk shape: entity id -> feed name -> token. Sorted keys keep the
/// serialized bytes stable for identical state.
pub type CursorMap = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    inner: RwLock<CursorMap>,
}

impl CursorStore {
    /// Empty store bound to `path`; nothing is read.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(CursorMap::new()),
        }
    }

    /// Read the persisted map. Missing file, unreadable file, or corrupt JSON
    /// all start empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match read_map(&path).await {
            Ok(Some(map)) => {
                tracing::info!(path = %path.display(), entities = map.len(), "cursor state loaded");
                map
            }
            Ok(None) => {
                tracing::info!(path = %path.display(), "no cursor state yet, starting empty");
                CursorMap::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = ?e,
                    "cursor state unreadable, starting empty"
                );
                CursorMap::new()
            }
        };
        Self {
            path,
            inner: RwLock::new(map),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, entity_id: &str, kind: FeedKind) -> Option<String> {
        self.inner
            .read()
            .get(entity_id)
            .and_then(|feeds| feeds.get(kind.as_str()))
            .cloned()
    }

    /// In-memory update only; see [`CursorStore::flush`].
    pub fn set(&self, entity_id: &str, kind: FeedKind, cursor: impl Into<String>) {
        self.inner
            .write()
            .entry(entity_id.to_string())
            .or_default()
            .insert(kind.as_str().to_string(), cursor.into());
    }

    pub fn snapshot(&self) -> CursorMap {
        self.inner.read().clone()
    }

    /// Number of stored (entity, feed) cursors.
    pub fn len(&self) -> usize {
        self.inner.read().values().map(|feeds| feeds.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically replace the persisted document with the current map.
    /// On error the in-memory state is untouched.
    pub async fn flush(&self) -> Result<()> {
        let bytes = {
            let map = self.inner.read();
            serde_json::to_vec_pretty(&*map).context("serializing cursor map")?
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let tmp = tmp_path(&self.path);
        fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

async fn read_map(path: &Path) -> Result<Option<CursorMap>> {
    let raw = match fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let map: CursorMap = serde_json::from_str(&raw).context("parsing cursor JSON")?;
    Ok(Some(map))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "cursors".into());
    name.push(".tmp");
    path.with_file_name(name)
}
