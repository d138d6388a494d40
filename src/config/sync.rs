// src/config/sync.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::sync::types::FeedKind;
use crate::sync::SyncSettings;

pub const ENV_CONFIG_PATH: &str = "SYNC_CONFIG_PATH";

/// Upper bounds accepted by `validate`.
pub const MAX_MATCH_THRESHOLD_SECS: u64 = 3_600;
pub const MAX_LOOKBACK_HOURS: u64 = 24 * 366;

fn default_cycle_interval_secs() -> u64 {
    120
}
fn default_match_threshold_secs() -> u64 {
    10
}
fn default_lookback_hours() -> u64 {
    24
}
fn default_call_budget() -> usize {
    20
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_concurrent_entities() -> usize {
    4
}
fn default_results_limit() -> u32 {
    5000
}
fn default_cursor_path() -> PathBuf {
    PathBuf::from("state/cursors.json")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_server() -> String {
    "my.geotab.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    /// "ENV" means: read from TELEMETRY_PASSWORD.
    #[serde(default)]
    pub password: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            database: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_match_threshold_secs")]
    pub match_threshold_secs: u64,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,
    #[serde(default = "default_call_budget")]
    pub call_budget_per_cycle: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_entities")]
    pub max_concurrent_entities: usize,
    #[serde(default = "default_results_limit")]
    pub results_limit: u32,
    #[serde(default = "default_cursor_path")]
    pub cursor_path: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// e.g. "0.0.0.0:9100"; no exporter when unset.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval_secs(),
            match_threshold_secs: default_match_threshold_secs(),
            lookback_hours: default_lookback_hours(),
            call_budget_per_cycle: default_call_budget(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_concurrent_entities: default_max_concurrent_entities(),
            results_limit: default_results_limit(),
            cursor_path: default_cursor_path(),
            output_dir: default_output_dir(),
            metrics_addr: None,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Calls one selected entity costs per cycle.
    pub fn calls_per_entity(&self) -> usize {
        FeedKind::ALL.len()
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            match_threshold: chrono::Duration::seconds(
                self.match_threshold_secs.min(MAX_MATCH_THRESHOLD_SECS) as i64,
            ),
            lookback: chrono::Duration::hours(self.lookback_hours.min(MAX_LOOKBACK_HOURS) as i64),
            fetch_timeout: std::time::Duration::from_secs(self.fetch_timeout_secs),
            max_concurrent_entities: self.max_concurrent_entities.max(1),
        }
    }

    pub fn cycle_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cycle_interval_secs == 0 {
            bail!("cycle_interval_secs must be > 0");
        }
        if self.call_budget_per_cycle < self.calls_per_entity() {
            bail!(
                "call_budget_per_cycle ({}) cannot cover one entity ({} calls)",
                self.call_budget_per_cycle,
                self.calls_per_entity()
            );
        }
        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be > 0");
        }
        if !(1..=MAX_MATCH_THRESHOLD_SECS).contains(&self.match_threshold_secs) {
            bail!("match_threshold_secs must be in 1..={MAX_MATCH_THRESHOLD_SECS}");
        }
        if !(1..=MAX_LOOKBACK_HOURS).contains(&self.lookback_hours) {
            bail!("lookback_hours must be in 1..={MAX_LOOKBACK_HOURS}");
        }
        Ok(())
    }

    /// Environment wins over file values for credentials and server.
    fn apply_env(&mut self) -> Result<()> {
        let env = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        if let Some(v) = env("TELEMETRY_SERVER") {
            self.telemetry.server = v;
        }
        if let Some(v) = env("TELEMETRY_DATABASE") {
            self.telemetry.database = v;
        }
        if let Some(v) = env("TELEMETRY_USERNAME") {
            self.telemetry.username = v;
        }
        let from_env = self.telemetry.password.trim().eq_ignore_ascii_case("env");
        match env("TELEMETRY_PASSWORD") {
            Some(v) => self.telemetry.password = v,
            None if from_env => bail!("Missing TELEMETRY_PASSWORD env var"),
            None => {}
        }
        Ok(())
    }
}

/// Load from an explicit path. TOML or JSON by extension, TOML otherwise.
pub fn load_from(path: &Path) -> Result<SyncConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sync config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut cfg = parse(&content, &ext)?;
    cfg.apply_env()?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load using env var + fallbacks:
/// 1) $SYNC_CONFIG_PATH
/// 2) config/sync.toml
/// 3) config/sync.json
/// 4) built-in defaults (+ env credentials)
pub fn load_default() -> Result<SyncConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        }
        return Err(anyhow!("SYNC_CONFIG_PATH points to non-existent path"));
    }
    for candidate in ["config/sync.toml", "config/sync.json"] {
        let pb = PathBuf::from(candidate);
        if pb.exists() {
            return load_from(&pb);
        }
    }
    let mut cfg = SyncConfig::default();
    cfg.apply_env()?;
    cfg.validate()?;
    Ok(cfg)
}

fn parse(s: &str, hint_ext: &str) -> Result<SyncConfig> {
    if hint_ext == "json" {
        return serde_json::from_str(s).context("parsing sync config JSON");
    }
    toml::from_str(s).context("parsing sync config TOML")
}
