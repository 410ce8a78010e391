//! Per-source run telemetry and the JSON manifest that stores it.
//!
//! The manifest document belongs to the workspace; the parser only owns the
//! `parser` entry of each source and keeps every other key untouched.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ParserError, Result};
use crate::parser::health::{HealthReport, HealthStatus};

/// Lock waits shorter than this are not counted as contention.
const CONTENTION_EPSILON_SECONDS: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserRunMetrics {
    pub files_discovered: u64,
    pub files_parsed: u64,
    pub files_reused: u64,
    pub files_failed: u64,
    pub chunks_emitted: u64,
    pub chunks_reused: u64,
    pub fallbacks: u64,
    pub queue_depth: u64,
    pub handlers_invoked: BTreeMap<String, u64>,
    pub handler_runtime_seconds: BTreeMap<String, f64>,
    pub lock_wait_seconds: f64,
    pub lock_contention_events: u64,
}

impl ParserRunMetrics {
    pub fn increment_handler(&mut self, handler: &str) {
        *self.handlers_invoked.entry(handler.to_string()).or_default() += 1;
    }

    pub fn record_handler_runtime(&mut self, handler: &str, seconds: f64) {
        *self
            .handler_runtime_seconds
            .entry(handler.to_string())
            .or_default() += seconds.max(0.0);
    }

    pub fn record_fallback(&mut self) {
        self.fallbacks += 1;
    }

    /// Accumulate time spent waiting for the database lock.
    pub fn record_lock_wait(&mut self, seconds: f64) {
        let seconds = seconds.max(0.0);
        self.lock_wait_seconds += seconds;
        if seconds > CONTENTION_EPSILON_SECONDS {
            self.lock_contention_events += 1;
        }
    }
}

/// Outcome of one parser run over one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserRunRecord {
    pub batch_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: HealthStatus,
    pub summary: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub handler_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: ParserRunMetrics,
}

/// The `parser` entry of one source in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserManifestState {
    pub enabled: bool,
    pub last_batch_id: Option<String>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
    pub last_run_status: HealthStatus,
    pub last_run_summary: Option<String>,
    pub last_run_warnings: Vec<String>,
    pub last_run_errors: Vec<String>,
    pub last_run_notes: Vec<String>,
    pub handler_versions: BTreeMap<String, String>,
    pub metrics: ParserRunMetrics,
}

impl Default for ParserManifestState {
    fn default() -> Self {
        Self {
            enabled: true,
            last_batch_id: None,
            last_run_started_at: None,
            last_run_completed_at: None,
            last_run_status: HealthStatus::Unknown,
            last_run_summary: None,
            last_run_warnings: Vec::new(),
            last_run_errors: Vec::new(),
            last_run_notes: Vec::new(),
            handler_versions: BTreeMap::new(),
            metrics: ParserRunMetrics::default(),
        }
    }
}

impl ParserManifestState {
    /// Copy the outcome of `record` into the state.
    ///
    /// A run without a batch id keeps the previous `last_batch_id` so health
    /// checks still point at the last committed data.
    pub fn apply_run(&mut self, record: &ParserRunRecord) {
        if let Some(batch_id) = &record.batch_id {
            self.last_batch_id = Some(batch_id.clone());
        }
        self.last_run_started_at = Some(record.started_at);
        self.last_run_completed_at = record.completed_at;
        self.last_run_status = record.status;
        self.last_run_summary = record.summary.clone();
        self.last_run_warnings = record.warnings.clone();
        self.last_run_errors = record.errors.clone();
        self.last_run_notes = record.notes.clone();
        self.handler_versions = record.handler_versions.clone();
        self.metrics = record.metrics.clone();
    }

    /// Health as recorded by the last run, without consulting the database.
    pub fn to_health_report(&self, name: &str) -> HealthReport {
        HealthReport {
            name: name.to_string(),
            status: self.last_run_status,
            summary: Some(
                self.last_run_summary
                    .clone()
                    .unwrap_or_else(|| "parser healthy".to_string()),
            ),
            actions: self.last_run_notes.clone(),
            last_refresh_at: self.last_run_completed_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SourceEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parser: Option<ParserManifestState>,
    #[serde(flatten)]
    other: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    sources: BTreeMap<String, SourceEntry>,
    #[serde(flatten)]
    other: BTreeMap<String, serde_json::Value>,
}

/// JSON-backed manifest keyed by source name.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<ManifestDocument> {
        match fs::read_to_string(&self.path) {
            Ok(data) if data.trim().is_empty() => Ok(ManifestDocument::default()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ManifestDocument::default()),
            Err(err) => Err(ParserError::io(&self.path, err)),
        }
    }

    /// Write the document next to its final path, then rename over it.
    fn write_document(&self, document: &ManifestDocument) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ParserError::io(parent, e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let data = serde_json::to_string_pretty(document)?;
        fs::write(&tmp, data).map_err(|e| ParserError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| ParserError::io(&self.path, e))?;
        debug!("manifest written: {}", self.path.display());
        Ok(())
    }

    /// Parser state for `source`; `None` when the entry is missing.
    pub fn load(&self, source: &str) -> Result<Option<ParserManifestState>> {
        let document = self.read_document()?;
        Ok(document.sources.get(source).and_then(|entry| entry.parser.clone()))
    }

    /// Apply `mutate` to the parser state of `source` and persist the result.
    pub fn write<F>(&self, source: &str, mutate: F) -> Result<ParserManifestState>
    where
        F: FnOnce(&mut ParserManifestState),
    {
        let mut document = self.read_document()?;
        let entry = document.sources.entry(source.to_string()).or_default();
        let state = entry.parser.get_or_insert_with(ParserManifestState::default);
        mutate(state);
        let state = state.clone();
        self.write_document(&document)?;
        Ok(state)
    }
}
