//! Health reports for parser sources.
//!
//! A source is judged from its manifest entry, the chunk slices of its last
//! batch, and the lock telemetry recorded by the last run.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, HealthConfig};
use crate::db::Db;
use crate::db::models::SliceSummary;
use crate::parser::manifest::{ManifestStore, ParserManifestState, ParserRunMetrics};
use crate::parser::metadata::{Metadata, MetadataExt};

/// Ordered by severity: `Ok < Unknown < Degraded < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    #[default]
    Unknown,
    Degraded,
    Error,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Unknown => "unknown",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub name: String,
    pub status: HealthStatus,
    pub summary: Option<String>,
    pub actions: Vec<String>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

fn rerun_action(source: &str) -> String {
    format!("Run `chunkloom parse {source}` to rebuild parser data.")
}

const CONCURRENCY_ACTION: &str =
    "Inspect parser lock telemetry and lower `max_concurrency` or stagger runs.";

/// Issues collected while evaluating one source.
#[derive(Debug, Default)]
struct Findings {
    severity: Option<HealthStatus>,
    issues: Vec<String>,
    actions: BTreeSet<String>,
}

impl Findings {
    fn raise(&mut self, status: HealthStatus, issue: String) {
        self.severity = self.severity.max(Some(status));
        if !self.issues.contains(&issue) {
            self.issues.push(issue);
        }
    }
}

/// One report per configured source, or a single module report when disabled.
pub fn parser_health_hook(config: &Config, manifest: &ManifestStore, db: Option<&Db>) -> Vec<HealthReport> {
    if !config.enabled {
        return vec![HealthReport {
            name: "parser-module".to_string(),
            status: HealthStatus::Unknown,
            summary: Some("Parser module disabled via configuration.".to_string()),
            actions: vec!["Set `enabled = true` in the parser configuration to enable checks.".to_string()],
            last_refresh_at: None,
        }];
    }
    config
        .sources
        .keys()
        .map(|name| evaluate_source(name, &config.health, manifest, db))
        .collect()
}

/// Evaluate one source.
pub fn evaluate_source(
    name: &str,
    thresholds: &HealthConfig,
    manifest: &ManifestStore,
    db: Option<&Db>,
) -> HealthReport {
    let rerun = rerun_action(name);
    let error_report = |summary: String, last_refresh_at| HealthReport {
        name: name.to_string(),
        status: HealthStatus::Error,
        summary: Some(summary),
        actions: vec![rerun.clone()],
        last_refresh_at,
    };

    let (state, entry_missing) = match manifest.load(name) {
        Ok(Some(state)) => (state, false),
        Ok(None) => (ParserManifestState::default(), true),
        Err(err) => return error_report(format!("Failed to read manifest: {err}"), None),
    };
    let last_refresh_at = state.last_run_completed_at;

    let mut findings = Findings {
        actions: state.last_run_notes.iter().cloned().collect(),
        ..Findings::default()
    };
    if entry_missing {
        findings.raise(HealthStatus::Unknown, "parser manifest entry missing".to_string());
        findings.actions.insert(rerun.clone());
    }

    let Some(batch_id) = state.last_batch_id.as_deref() else {
        findings.raise(HealthStatus::Unknown, "parser has not completed a batch yet".to_string());
        findings.actions.insert(rerun.clone());
        return finish(name, &state, findings);
    };

    let Some(db) = db else {
        return error_report(
            "Parser database missing while manifest references a batch.".to_string(),
            last_refresh_at,
        );
    };
    match db.batch_exists(batch_id) {
        Ok(true) => {}
        Ok(false) => {
            return error_report(
                "Manifest last_batch_id missing from batches table.".to_string(),
                last_refresh_at,
            );
        }
        Err(err) => return error_report(format!("Failed to query parser database: {err}"), last_refresh_at),
    }
    let rows = match db.select_slice_summaries(batch_id) {
        Ok(rows) if rows.is_empty() => {
            return error_report(
                "Chunk slices missing for manifest last_batch_id; rerun the parser to repopulate data."
                    .to_string(),
                last_refresh_at,
            );
        }
        Ok(rows) => rows,
        Err(err) => return error_report(format!("Failed to query parser database: {err}"), last_refresh_at),
    };

    let before = findings.issues.len();
    assess_chunk_integrity(&rows, &mut findings);
    if findings.issues.len() > before {
        findings.actions.insert(rerun);
    }
    assess_concurrency(&state.metrics, thresholds, &mut findings);
    finish(name, &state, findings)
}

fn finish(name: &str, state: &ParserManifestState, findings: Findings) -> HealthReport {
    let status = findings
        .severity
        .map_or(state.last_run_status, |severity| severity.max(state.last_run_status));
    let summary = if findings.issues.is_empty() {
        state
            .last_run_summary
            .clone()
            .unwrap_or_else(|| "parser healthy".to_string())
    } else {
        findings.issues.join(", ")
    };
    HealthReport {
        name: name.to_string(),
        status,
        summary: Some(summary),
        actions: findings.actions.into_iter().collect(),
        last_refresh_at: state.last_run_completed_at,
    }
}

fn assess_chunk_integrity(rows: &[SliceSummary], findings: &mut Findings) {
    let mut indices: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    let mut totals: BTreeMap<&str, i64> = BTreeMap::new();
    let mut parents: Vec<(&str, String)> = Vec::new();

    for row in rows {
        let chunk_id = row.chunk_id.as_str();
        indices.entry(chunk_id).or_default().push(row.part_index);
        let recorded = *totals.entry(chunk_id).or_insert(row.part_total);
        if recorded != row.part_total {
            findings.raise(
                HealthStatus::Error,
                format!("chunk '{chunk_id}' has inconsistent part totals"),
            );
        }

        let Some(raw) = row.metadata_json.as_deref().filter(|raw| !raw.trim().is_empty()) else {
            continue;
        };
        match serde_json::from_str::<Metadata>(raw) {
            Ok(metadata) => {
                if let Some(parent) = metadata.get_str("delegate_parent_chunk").filter(|p| !p.is_empty()) {
                    parents.push((chunk_id, parent.to_string()));
                }
            }
            Err(_) => findings.raise(
                HealthStatus::Error,
                format!("chunk '{chunk_id}' metadata not valid JSON"),
            ),
        }
    }

    for (chunk_id, parts) in &mut indices {
        parts.sort_unstable();
        let total = totals.get(chunk_id).copied().unwrap_or(0);
        let expected: Vec<i64> = (0..total).collect();
        if *parts != expected {
            findings.raise(
                HealthStatus::Error,
                format!("chunk '{chunk_id}' part indices not contiguous"),
            );
        }
    }

    for (chunk_id, parent) in parents {
        if !indices.contains_key(parent.as_str()) {
            findings.raise(
                HealthStatus::Error,
                format!("chunk '{chunk_id}' references missing parent '{parent}'"),
            );
        }
    }
}

fn assess_concurrency(metrics: &ParserRunMetrics, thresholds: &HealthConfig, findings: &mut Findings) {
    let before = findings.severity;
    let wait = metrics.lock_wait_seconds;
    if wait >= thresholds.lock_wait_error_seconds {
        findings.raise(
            HealthStatus::Error,
            format!(
                "parser lock waits accumulated {wait:.2}s (error threshold {:.2}s)",
                thresholds.lock_wait_error_seconds
            ),
        );
    } else if wait >= thresholds.lock_wait_warning_seconds {
        findings.raise(
            HealthStatus::Degraded,
            format!(
                "parser lock waits accumulated {wait:.2}s (warning threshold {:.2}s)",
                thresholds.lock_wait_warning_seconds
            ),
        );
    }

    let events = metrics.lock_contention_events;
    if events >= thresholds.lock_contention_error {
        findings.raise(
            HealthStatus::Error,
            format!(
                "parser recorded {events} lock contention events (error threshold {})",
                thresholds.lock_contention_error
            ),
        );
    } else if events >= thresholds.lock_contention_warning {
        findings.raise(
            HealthStatus::Degraded,
            format!(
                "parser recorded {events} lock contention events (warning threshold {})",
                thresholds.lock_contention_warning
            ),
        );
    }

    if findings.severity != before {
        findings.actions.insert(CONCURRENCY_ACTION.to_string());
    }
}
