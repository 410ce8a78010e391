//! Orchestration of one parser run: plan, parse, stage, record.
//!
//! Handlers run on the blocking pool with at most `max_concurrency` files in
//! flight. The database is shared behind an async mutex; time spent waiting
//! for it while staging is reported as lock contention in the run metrics.
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tracing::{debug, debug_span, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::error::{ParserError, Result};
use crate::parser::handlers::{HandlerCache, HandlerResult, ParseContext};
use crate::parser::hashing::hash_file;
use crate::parser::health::{HealthReport, HealthStatus, parser_health_hook};
use crate::parser::manifest::{ManifestStore, ParserManifestState, ParserRunMetrics, ParserRunRecord};
use crate::parser::persistence::{FileStageOutcome, StageRequest, stage_file};
use crate::parser::registry::{HandlerRegistry, HandlerSelection, build_default_registry};
use crate::parser::tokenizer::{TokenEncoder, get_token_encoder};
use crate::parser::traversal::TraversalService;

/// Bytes read when sniffing a `#!` line.
const SHEBANG_SNIFF_BYTES: u64 = 256;

/// One file scheduled for parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserPlanEntry {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub selection: HandlerSelection,
    /// Content hash salted with the handler version and relative path.
    pub file_hash: String,
    pub shebang: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParserBatchPlan {
    pub source: String,
    pub root: PathBuf,
    pub entries: Vec<ParserPlanEntry>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub metrics: ParserRunMetrics,
    pub handler_versions: BTreeMap<String, String>,
}

impl ParserBatchPlan {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Run details merged with the plan by [`ParserService::build_run_record`].
#[derive(Debug, Clone, Default)]
pub struct RunDetails {
    pub started_at: Option<DateTime<Utc>>,
    pub status: Option<HealthStatus>,
    pub summary: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub notes: Vec<String>,
    pub metrics: Option<ParserRunMetrics>,
}

/// What a full [`ParserService::run_source`] produced.
#[derive(Debug, Clone)]
pub struct ParserRunOutcome {
    pub source: String,
    pub batch_id: Option<String>,
    pub record: ParserRunRecord,
    pub state: ParserManifestState,
    pub failed_files: Vec<PathBuf>,
}

/// What [`ParserService::stage_batch`] wrote.
#[derive(Debug, Clone, Default)]
pub struct StagedBatch {
    pub files: Vec<(ParserPlanEntry, FileStageOutcome)>,
    /// Files rolled back while staging, with the error.
    pub failures: Vec<(PathBuf, String)>,
    pub metrics: ParserRunMetrics,
}

/// Progress callbacks for long runs.
pub trait ParseProgress {
    fn planned(&self, _files: usize) {}
    fn parsed(&self, _entry: &ParserPlanEntry) {}
}

impl ParseProgress for () {}

pub struct ParserService {
    config: Arc<Config>,
    registry: Arc<HandlerRegistry>,
    encoder: Arc<dyn TokenEncoder>,
    db: Arc<TokioMutex<Db>>,
    manifest: ManifestStore,
}

impl ParserService {
    pub fn new(config: Config, db: Arc<TokioMutex<Db>>, manifest: ManifestStore) -> Result<Self> {
        let registry = build_default_registry(&config)?;
        let encoder = get_token_encoder(&config)?;
        Ok(Self::with_parts(config, registry, encoder, db, manifest))
    }

    pub fn with_parts(
        config: Config,
        registry: HandlerRegistry,
        encoder: Arc<dyn TokenEncoder>,
        db: Arc<TokioMutex<Db>>,
        manifest: ManifestStore,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            encoder,
            db,
            manifest,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    fn source_root(&self, source: &str) -> Result<&Path> {
        self.config
            .sources
            .get(source)
            .map(PathBuf::as_path)
            .ok_or_else(|| ParserError::SourceNotConfigured(source.to_string()))
    }

    // ── Planning ─────────────────────────────────────────────────────

    /// Discover files for `source` and resolve a handler for each.
    pub fn plan_source(&self, source: &str, scope: &[PathBuf]) -> Result<ParserBatchPlan> {
        if !self.config.enabled {
            return Err(ParserError::ModuleDisabled);
        }
        let traversal = TraversalService::new(
            self.source_root(source)?,
            self.config.gitignore_behavior,
            &self.config.workspace_ignore_patterns,
            self.config.follow_symlinks,
        )?;

        let mut metrics = ParserRunMetrics::default();
        let mut warnings = self.degraded_handler_warnings();
        let mut errors = Vec::new();
        let mut entries = Vec::new();
        let mut fallback_logged = HashSet::new();

        for found in traversal.iter_files(scope)? {
            metrics.files_discovered += 1;
            let display = found.relative_path.to_string_lossy().replace('\\', "/");
            let shebang = read_shebang(&found.absolute_path);

            let selection = match self
                .registry
                .resolve(&found.absolute_path, None, shebang.as_deref())
            {
                Ok(selection) => selection,
                Err(err) => {
                    errors.push(format!("No handler available for {display}: {err}"));
                    metrics.files_failed += 1;
                    continue;
                }
            };

            if selection.fallback {
                metrics.record_fallback();
                warnings.push(format!(
                    "Fallback to {} for {display} via {}",
                    selection.name, selection.resolved_via
                ));
                if fallback_logged.insert((selection.name.clone(), selection.resolved_via.clone())) {
                    warn!(
                        "source {source}: falling back to {} via {}",
                        selection.name, selection.resolved_via
                    );
                }
            }

            let file_hash = match hash_file(&found.absolute_path, &selection.version, [display.as_bytes()]) {
                Ok(hash) => hash,
                Err(err) => {
                    errors.push(format!("Failed to hash {display}: {err}"));
                    metrics.files_failed += 1;
                    continue;
                }
            };

            metrics.files_parsed += 1;
            metrics.increment_handler(&selection.name);
            entries.push(ParserPlanEntry {
                absolute_path: found.absolute_path,
                relative_path: found.relative_path,
                selection,
                file_hash,
                shebang,
            });
        }

        metrics.queue_depth = entries.len() as u64;
        dedup_messages(&mut warnings);
        dedup_messages(&mut errors);
        debug!(
            "plan for {source}: {} files, {} warnings, {} errors, {} fallbacks",
            entries.len(),
            warnings.len(),
            errors.len(),
            metrics.fallbacks
        );

        Ok(ParserBatchPlan {
            source: source.to_string(),
            root: traversal.root().to_path_buf(),
            entries,
            warnings,
            errors,
            metrics,
            handler_versions: self.registry.versions(),
        })
    }

    fn degraded_handler_warnings(&self) -> Vec<String> {
        self.registry
            .availability()
            .into_iter()
            .filter(|a| a.enabled && a.status != HealthStatus::Ok)
            .map(|a| {
                warn!("handler {} degraded: {}", a.name, a.summary);
                format!("Handler {} degraded: {}", a.name, a.summary)
            })
            .collect()
    }

    // ── Parsing ──────────────────────────────────────────────────────

    /// Parse every planned file; results come back in plan order.
    pub async fn parse_plan(&self, plan: &mut ParserBatchPlan) -> Result<Vec<(ParserPlanEntry, HandlerResult)>> {
        self.parse_plan_with(plan, &()).await
    }

    pub async fn parse_plan_with(
        &self,
        plan: &mut ParserBatchPlan,
        progress: &dyn ParseProgress,
    ) -> Result<Vec<(ParserPlanEntry, HandlerResult)>> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let cache = Arc::new(HandlerCache::new());
        let source: Arc<str> = Arc::from(plan.source.as_str());
        let root = Arc::new(plan.root.clone());

        let mut tasks = Vec::with_capacity(plan.entries.len());
        for entry in &plan.entries {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| ParserError::Plan(format!("parser pool closed: {e}")))?;
            let job = ParseJob {
                source: Arc::clone(&source),
                root: Arc::clone(&root),
                config: Arc::clone(&self.config),
                registry: Arc::clone(&self.registry),
                encoder: Arc::clone(&self.encoder),
                cache: Arc::clone(&cache),
                entry: entry.clone(),
            };
            tasks.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job.run()
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (task, entry) in tasks.into_iter().zip(&plan.entries) {
            let (result, seconds) = task
                .await
                .map_err(|e| ParserError::Plan(format!("parser task failed: {e}")))?;
            plan.metrics.record_handler_runtime(&entry.selection.name, seconds);
            progress.parsed(entry);
            results.push((entry.clone(), result));
        }
        debug!("parsed {} files, {} handlers cached", results.len(), cache.len());
        Ok(results)
    }

    // ── Staging ──────────────────────────────────────────────────────

    /// Persist `results` under `batch_id`. Results carrying errors are skipped
    /// and counted as failed files; a file that fails to stage is rolled back
    /// and reported in [`StagedBatch::failures`] while the rest of the batch
    /// is still staged.
    pub async fn stage_batch(
        &self,
        source: &str,
        batch_id: &str,
        plan: &ParserBatchPlan,
        results: &[(ParserPlanEntry, HandlerResult)],
        batch_ref: Option<&str>,
    ) -> Result<StagedBatch> {
        let mut staged = StagedBatch {
            metrics: plan.metrics.clone(),
            ..StagedBatch::default()
        };
        if results.is_empty() {
            return Ok(staged);
        }

        let planned: HashSet<&Path> = plan.entries.iter().map(|e| e.relative_path.as_path()).collect();
        let mut seen = HashSet::new();
        for (entry, result) in results {
            let shown = entry.relative_path.display();
            if !planned.contains(entry.relative_path.as_path()) {
                return Err(ParserError::Plan(format!("result entry missing from plan: {shown}")));
            }
            if !seen.insert(entry.relative_path.as_path()) {
                return Err(ParserError::Plan(format!("duplicate handler result for {shown}")));
            }
            if result.file.path != entry.relative_path {
                return Err(ParserError::Plan(format!(
                    "handler result path mismatch for {shown} (got {})",
                    result.file.path.display()
                )));
            }
        }

        let mut handler_versions = plan.handler_versions.clone();
        let metrics = &mut staged.metrics;

        let wait_started = Instant::now();
        let (mut db, lock_wait) = match self.db.try_lock() {
            Ok(guard) => (guard, 0.0),
            Err(_) => {
                let guard = self.db.lock().await;
                (guard, wait_started.elapsed().as_secs_f64())
            }
        };

        db.ensure_batch(batch_id, batch_ref, Utc::now(), None)?;

        for (entry, result) in results {
            let shown = entry.relative_path.display();
            if result.has_errors() {
                warn!("skipping {shown}: {}", result.errors.join("; "));
                metrics.files_failed += 1;
                metrics.files_parsed = metrics.files_parsed.saturating_sub(1);
                continue;
            }

            handler_versions
                .entry(entry.selection.name.clone())
                .or_insert_with(|| entry.selection.version.clone());
            let request = StageRequest {
                batch_id,
                handler_name: &entry.selection.name,
                handler_version: &entry.selection.version,
                handler_versions: &handler_versions,
                result,
                file_sha: Some(&entry.file_hash),
                mtime_ns: mtime_ns(&entry.absolute_path),
            };
            let outcome = match stage_file(&mut db, &request) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!("failed to stage {shown}: {err}");
                    metrics.files_failed += 1;
                    metrics.files_parsed = metrics.files_parsed.saturating_sub(1);
                    staged.failures.push((entry.relative_path.clone(), err.to_string()));
                    continue;
                }
            };

            metrics.chunks_emitted += outcome.chunks_inserted as u64;
            metrics.chunks_reused += outcome.chunks_reused as u64;
            if outcome.symbols_written == 0 && outcome.chunks_inserted == 0 {
                metrics.files_reused += 1;
            }
            debug!(
                "staged {shown}: symbols written={} reused={}, chunks inserted={} reused={}",
                outcome.symbols_written, outcome.symbols_reused, outcome.chunks_inserted, outcome.chunks_reused
            );
            staged.files.push((entry.clone(), outcome));
        }
        drop(db);

        if lock_wait > 0.0 {
            metrics.record_lock_wait(lock_wait);
            debug!("source {source} waited {lock_wait:.3}s for the database lock");
        }
        Ok(staged)
    }

    // ── Manifest ─────────────────────────────────────────────────────

    /// Merge plan messages with run details into a manifest record.
    pub fn build_run_record(&self, plan: &ParserBatchPlan, batch_id: Option<&str>, run: RunDetails) -> ParserRunRecord {
        let mut warnings = plan.warnings.clone();
        warnings.extend(run.warnings);
        dedup_messages(&mut warnings);
        let mut errors = plan.errors.clone();
        errors.extend(run.errors);
        dedup_messages(&mut errors);

        let status = run.status.unwrap_or(if !errors.is_empty() {
            HealthStatus::Error
        } else if !warnings.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        });
        let started_at = run.started_at.unwrap_or_else(Utc::now);

        ParserRunRecord {
            batch_id: batch_id.map(str::to_string),
            started_at,
            completed_at: Some(Utc::now()),
            status,
            summary: run.summary,
            warnings,
            errors,
            notes: run.notes,
            handler_versions: plan.handler_versions.clone(),
            metrics: run.metrics.unwrap_or_else(|| plan.metrics.clone()),
        }
    }

    pub fn record_run(&self, source: &str, record: &ParserRunRecord) -> Result<ParserManifestState> {
        let enabled = self.config.enabled;
        self.manifest.write(source, |state| {
            state.apply_run(record);
            state.enabled = enabled;
        })
    }

    pub fn load_manifest_state(&self, source: &str) -> Result<ParserManifestState> {
        Ok(self.manifest.load(source)?.unwrap_or_default())
    }

    /// Health as recorded in the manifest, without reading the database.
    pub fn health_report(&self, source: &str) -> Result<HealthReport> {
        Ok(self.load_manifest_state(source)?.to_health_report(source))
    }

    /// Full health check of every configured source.
    pub async fn check_health(&self) -> Vec<HealthReport> {
        let db = self.db.lock().await;
        parser_health_hook(&self.config, &self.manifest, Some(&db))
    }

    pub fn handler_availability(&self) -> Vec<(String, HealthStatus)> {
        self.registry
            .availability()
            .into_iter()
            .map(|a| (a.name, a.status))
            .collect()
    }

    // ── Full run ─────────────────────────────────────────────────────

    /// Plan, parse, stage and record one source.
    ///
    /// A fresh batch id is generated when `batch_id` is `None`. Staging
    /// failures are recorded in the manifest instead of aborting the run.
    pub async fn run_source(
        &self,
        source: &str,
        scope: &[PathBuf],
        batch_id: Option<String>,
        progress: &dyn ParseProgress,
    ) -> Result<ParserRunOutcome> {
        let started_at = Utc::now();
        let mut plan = self.plan_source(source, scope)?;
        info!(
            "parser plan for {source}: {} files, {} warnings, {} errors",
            plan.entries.len(),
            plan.warnings.len(),
            plan.errors.len()
        );
        progress.planned(plan.entries.len());

        let results = self.parse_plan_with(&mut plan, progress).await?;
        let mut run_warnings = Vec::new();
        let mut run_errors = Vec::new();
        let mut failed_files = Vec::new();
        for (entry, result) in &results {
            let display = entry.relative_path.display();
            run_warnings.extend(result.warnings.iter().map(|w| format!("{display}: {w}")));
            if result.has_errors() {
                run_errors.extend(result.errors.iter().map(|e| format!("{display}: {e}")));
                failed_files.push(entry.relative_path.clone());
            }
        }

        let mut metrics = plan.metrics.clone();
        let mut staged_batch = None;
        if results.iter().any(|(_, result)| !result.has_errors()) {
            let batch = batch_id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
            let batch_ref = short_ref(&batch);
            match self.stage_batch(source, &batch, &plan, &results, Some(&batch_ref)).await {
                Ok(staged) => {
                    for (path, err) in staged.failures {
                        run_errors.push(format!("{}: failed to stage: {err}", path.display()));
                        failed_files.push(path);
                    }
                    metrics = staged.metrics;
                    staged_batch = Some(batch);
                }
                Err(err) => {
                    warn!("failed to stage parser batch for {source}: {err}");
                    run_errors.push(format!("Failed to stage parser batch: {err}"));
                }
            }
        } else {
            metrics.files_failed += failed_files.len() as u64;
            metrics.files_parsed = metrics.files_parsed.saturating_sub(failed_files.len() as u64);
        }

        let has_failures = plan.has_errors() || !run_errors.is_empty();
        let summary = format_run_summary(&plan, &metrics, has_failures);
        let record = self.build_run_record(
            &plan,
            staged_batch.as_deref(),
            RunDetails {
                started_at: Some(started_at),
                summary: Some(summary),
                warnings: run_warnings,
                errors: run_errors,
                metrics: Some(metrics),
                ..RunDetails::default()
            },
        );
        let state = self.record_run(source, &record)?;
        info!(
            "parser run for {source} finished: {} ({})",
            record.summary.as_deref().unwrap_or_default(),
            record.status
        );

        Ok(ParserRunOutcome {
            source: source.to_string(),
            batch_id: staged_batch,
            record,
            state,
            failed_files,
        })
    }

    /// Remove the slices written by `batch_id` and its batch row when unused.
    pub async fn delete_batch(&self, source: &str, batch_id: &str) -> Result<usize> {
        self.source_root(source)?;
        let db = self.db.lock().await;
        let removed = db.delete_chunk_slices_by_batch(batch_id)?;
        let dropped = db.delete_batch_if_unused(batch_id)?;
        info!("deleted {removed} chunk slices of batch {batch_id} (batch row removed: {dropped})");
        Ok(removed)
    }
}

/// Owned inputs for one blocking parse.
struct ParseJob {
    source: Arc<str>,
    root: Arc<PathBuf>,
    config: Arc<Config>,
    registry: Arc<HandlerRegistry>,
    encoder: Arc<dyn TokenEncoder>,
    cache: Arc<HandlerCache>,
    entry: ParserPlanEntry,
}

impl ParseJob {
    fn run(self) -> (HandlerResult, f64) {
        let name = self.entry.selection.name.as_str();
        let _span = debug_span!("parse", handler = name, path = %self.entry.relative_path.display()).entered();
        let started = Instant::now();
        let ctx = ParseContext {
            source: &self.source,
            root: &self.root,
            config: &self.config,
            encoder: self.encoder.as_ref(),
            registry: &self.registry,
            cache: &self.cache,
            depth: 0,
            view: None,
        };
        let result = match self.cache.get_or_create(&self.registry, name) {
            Ok(handler) => handler.parse(&self.entry.absolute_path, &ctx),
            Err(err) => HandlerResult::unreadable(&ctx, &self.entry.absolute_path, name, &err),
        };
        (result, started.elapsed().as_secs_f64())
    }
}

/// First line of `path` when it starts with `#!`.
fn read_shebang(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file).take(SHEBANG_SNIFF_BYTES);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).ok()?;
    if !line.starts_with(b"#!") {
        return None;
    }
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

fn mtime_ns(path: &Path) -> Option<i64> {
    let modified = path.metadata().ok()?.modified().ok()?;
    let nanos = modified.duration_since(UNIX_EPOCH).ok()?.as_nanos();
    i64::try_from(nanos).ok()
}

fn short_ref(batch_id: &str) -> String {
    batch_id.chars().filter(|c| *c != '-').take(12).collect()
}

/// Drop repeated messages, keeping first occurrences in order.
fn dedup_messages(messages: &mut Vec<String>) {
    let mut seen = HashSet::new();
    messages.retain(|m| !m.is_empty() && seen.insert(m.clone()));
}

/// Human-readable one-liner stored as the manifest summary.
pub fn format_run_summary(plan: &ParserBatchPlan, metrics: &ParserRunMetrics, has_failures: bool) -> String {
    let no_work = plan.entries.is_empty();
    if no_work && !has_failures && metrics.chunks_emitted == 0 && metrics.files_parsed == 0 && metrics.files_failed == 0 {
        return "no changes".to_string();
    }
    let status = if has_failures || metrics.files_failed > 0 {
        "completed with failures"
    } else if no_work {
        "no changes"
    } else {
        "completed"
    };

    let mut file_details = Vec::new();
    if metrics.files_reused > 0 {
        file_details.push(format!("reused={}", metrics.files_reused));
    }
    if metrics.files_failed > 0 {
        file_details.push(format!("failed={}", metrics.files_failed));
    }
    if metrics.files_discovered > 0 && metrics.files_discovered != metrics.files_parsed {
        file_details.push(format!("discovered={}", metrics.files_discovered));
    }
    let mut files = format!("files parsed={}", metrics.files_parsed);
    if !file_details.is_empty() {
        files.push_str(&format!(" ({})", file_details.join(", ")));
    }

    let mut chunks = format!("chunks inserted={}", metrics.chunks_emitted);
    if metrics.chunks_reused > 0 {
        chunks.push_str(&format!(", reused={}", metrics.chunks_reused));
    }
    if metrics.fallbacks > 0 {
        chunks.push_str(&format!(", fallbacks={}", metrics.fallbacks));
    }
    format!("{status}: {files}; {chunks}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn setup(files: &[(&str, &str)]) -> (TempDir, ParserService) {
        let dir = tempdir().unwrap();
        let source = dir.path().join("repo");
        for (path, body) in files {
            let path = source.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        let mut config = Config::default();
        config.sources.insert("repo".to_string(), source);
        let manifest = ManifestStore::new(dir.path().join("manifest.json"));
        let db = Arc::new(TokioMutex::new(Db::open_in_memory().unwrap()));
        let service = ParserService::new(config, db, manifest).unwrap();
        (dir, service)
    }

    #[test]
    fn test_plan_resolves_handlers_and_hashes() {
        let (_dir, service) = setup(&[
            ("README.md", "# Title\n\nBody.\n"),
            ("bin/tool", "#!/usr/bin/env python3\nprint('hi')\n"),
            ("notes", "plain\n"),
        ]);
        let plan = service.plan_source("repo", &[]).unwrap();
        let names: Vec<(String, String)> = plan
            .entries
            .iter()
            .map(|e| (e.relative_path.to_string_lossy().replace('\\', "/"), e.selection.name.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("README.md".to_string(), "markdown".to_string()),
                ("bin/tool".to_string(), "python".to_string()),
                ("notes".to_string(), "text".to_string()),
            ]
        );
        assert_eq!(plan.metrics.files_discovered, 3);
        assert_eq!(plan.metrics.queue_depth, 3);
        assert!(plan.entries.iter().all(|e| e.file_hash.len() == 64));
        assert!(plan.handler_versions.contains_key("css"));
    }

    #[test]
    fn test_plan_rejects_unknown_source_and_disabled_module() {
        let (_dir, service) = setup(&[]);
        assert!(matches!(
            service.plan_source("nope", &[]),
            Err(ParserError::SourceNotConfigured(_))
        ));

        let mut config = service.config().clone();
        config.enabled = false;
        let disabled = ParserService::new(
            config,
            Arc::new(TokioMutex::new(Db::open_in_memory().unwrap())),
            service.manifest().clone(),
        )
        .unwrap();
        assert!(matches!(disabled.plan_source("repo", &[]), Err(ParserError::ModuleDisabled)));
    }

    #[test]
    fn test_disabled_handler_falls_back_with_warning() {
        let (dir, _) = setup(&[("style.css", "a { color: red; }\n"), ("more.css", "b { margin: 0; }\n")]);
        let mut config = Config::default();
        config.sources.insert("repo".to_string(), dir.path().join("repo"));
        config.handlers.entry("css".to_string()).or_default().enabled = false;
        let service = ParserService::new(
            config,
            Arc::new(TokioMutex::new(Db::open_in_memory().unwrap())),
            ManifestStore::new(dir.path().join("manifest.json")),
        )
        .unwrap();

        let plan = service.plan_source("repo", &[]).unwrap();
        assert!(plan.entries.iter().all(|e| e.selection.name == "text" && e.selection.fallback));
        assert_eq!(plan.metrics.fallbacks, 2);
        assert_eq!(plan.warnings.len(), 2);
        assert!(plan.warnings[0].contains("via fallback:disabled"));
    }

    #[tokio::test]
    async fn test_run_source_records_manifest_and_reuses_chunks() {
        let (_dir, service) = setup(&[
            ("docs/guide.md", "# Guide\n\nFirst paragraph.\n\n## Usage\n\nSecond paragraph.\n"),
            ("notes.txt", "one\n\ntwo\n"),
        ]);

        let first = service
            .run_source("repo", &[], Some("b1".to_string()), &())
            .await
            .unwrap();
        assert_eq!(first.batch_id.as_deref(), Some("b1"));
        assert_eq!(first.record.status, HealthStatus::Ok);
        assert!(first.record.metrics.chunks_emitted > 0);
        assert_eq!(first.state.last_batch_id.as_deref(), Some("b1"));

        let second = service
            .run_source("repo", &[], Some("b2".to_string()), &())
            .await
            .unwrap();
        assert_eq!(second.record.metrics.chunks_emitted, 0);
        assert_eq!(second.record.metrics.chunks_reused, first.record.metrics.chunks_emitted);
        assert_eq!(second.record.metrics.files_reused, 2);

        let reports = service.check_health().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, HealthStatus::Ok);
        assert!(reports[0].summary.as_deref().unwrap().starts_with("completed"));
    }

    #[tokio::test]
    async fn test_stage_batch_rejects_unplanned_results() {
        let (_dir, service) = setup(&[("a.txt", "alpha\n")]);
        let mut plan = service.plan_source("repo", &[]).unwrap();
        let mut results = service.parse_plan(&mut plan).await.unwrap();
        results.push(results[0].clone());

        let err = service.stage_batch("repo", "b1", &plan, &results, None).await.unwrap_err();
        assert!(matches!(err, ParserError::Plan(_)));
    }

    #[tokio::test]
    async fn test_stage_batch_continues_past_a_failing_file() {
        let (_dir, service) = setup(&[("a.txt", "alpha\n"), ("b.txt", "bravo\n"), ("c.txt", "charlie\n")]);
        let mut plan = service.plan_source("repo", &[]).unwrap();
        let mut results = service.parse_plan(&mut plan).await.unwrap();
        let broken = results
            .iter_mut()
            .find(|(entry, _)| entry.relative_path == Path::new("b.txt"))
            .unwrap();
        broken.1.chunks[0].part_index = 1;

        let staged = service.stage_batch("repo", "b1", &plan, &results, None).await.unwrap();
        assert_eq!(staged.files.len(), 2);
        assert_eq!(staged.failures.len(), 1);
        assert_eq!(staged.failures[0].0, PathBuf::from("b.txt"));
        assert!(staged.failures[0].1.contains("part indices not contiguous"));
        assert_eq!(staged.metrics.files_failed, 1);

        let db = service.db.lock().await;
        assert!(db.file_id("a.txt").unwrap().is_some());
        assert!(db.file_id("b.txt").unwrap().is_none());
        assert!(db.file_id("c.txt").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_batch_purges_slices() {
        let (_dir, service) = setup(&[("a.txt", "alpha\n")]);
        service.run_source("repo", &[], Some("b1".to_string()), &()).await.unwrap();
        let removed = service.delete_batch("repo", "b1").await.unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_format_run_summary() {
        let plan = ParserBatchPlan {
            source: "repo".to_string(),
            root: PathBuf::from("."),
            entries: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            metrics: ParserRunMetrics::default(),
            handler_versions: BTreeMap::new(),
        };
        assert_eq!(format_run_summary(&plan, &ParserRunMetrics::default(), false), "no changes");

        let metrics = ParserRunMetrics {
            files_discovered: 3,
            files_parsed: 2,
            files_failed: 1,
            chunks_emitted: 5,
            ..ParserRunMetrics::default()
        };
        assert_eq!(
            format_run_summary(&plan, &metrics, true),
            "completed with failures: files parsed=2 (failed=1, discovered=3); chunks inserted=5"
        );
    }

    #[test]
    fn test_short_ref_and_shebang() {
        assert_eq!(short_ref("0190a1b2-c3d4-7e5f"), "0190a1b2c3d4");
        let dir = tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, "#!/bin/sh\necho\n").unwrap();
        assert_eq!(read_shebang(&path).as_deref(), Some("#!/bin/sh"));
        fs::write(&path, "echo\n").unwrap();
        assert_eq!(read_shebang(&path), None);
    }
}
