/// End-to-end integration tests for the chunkloom pipeline.
///
/// Tests the complete flow:
///   Config → Traversal → Handlers → Staging → Recomposition → Health
use chunkloom::config::{Config, TokenLimit};
use chunkloom::db::Db;
use chunkloom::db::models::ChunkSlice;
use chunkloom::parser::health::{HealthStatus, parser_health_hook};
use chunkloom::parser::manifest::ManifestStore;
use chunkloom::parser::recomposition::{ChunkRecomposer, RecomposedChunk};
use chunkloom::parser::service::ParserService;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use tokio::sync::Mutex as TokioMutex;

const PAGE: &str = "<html>\n<body>\n<h1>Docs</h1>\n<script>\n  const answer = 42;\n  function ask() { return answer; }\n</script>\n<style>\n  .note { color: blue; }\n  .warn { color: red; }\n</style>\n</body>\n</html>\n";

struct Workspace {
    dir: TempDir,
    db: Arc<TokioMutex<Db>>,
    service: ParserService,
}

fn workspace(files: &[(&str, &str)], tweak: impl FnOnce(&mut Config)) -> Workspace {
    let dir = tempdir().unwrap();
    let source = dir.path().join("site");
    for (path, body) in files {
        let path = source.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    let mut config = Config::default();
    config.sources.insert("site".to_string(), source);
    tweak(&mut config);

    let db = Arc::new(TokioMutex::new(Db::open_in_memory().unwrap()));
    let manifest = ManifestStore::new(dir.path().join("manifest.json"));
    let service = ParserService::new(config, Arc::clone(&db), manifest).unwrap();
    Workspace { dir, db, service }
}

fn find<'a>(chunks: &'a [RecomposedChunk], pred: &dyn Fn(&RecomposedChunk) -> bool) -> Option<&'a RecomposedChunk> {
    for chunk in chunks {
        if pred(chunk) {
            return Some(chunk);
        }
        if let Some(found) = find(&chunk.delegate_children, pred) {
            return Some(found);
        }
    }
    None
}

/// HTML with inline script and style: delegated chunks come back as children.
#[tokio::test]
async fn test_html_delegation_round_trip() {
    let ws = workspace(&[("index.html", PAGE)], |_| {});
    let outcome = ws
        .service
        .run_source("site", &[], Some("b1".to_string()), &())
        .await
        .unwrap();
    assert_eq!(outcome.batch_id.as_deref(), Some("b1"));
    assert!(outcome.failed_files.is_empty());

    let db = ws.db.lock().await;
    let chunks = ChunkRecomposer::for_path(&db, "b1", "index.html").unwrap().unwrap();

    let style = find(&chunks, &|c| c.handler_name == "css" && c.text.contains(".warn")).unwrap();
    assert!(style.delegate_parent_chunk_id.is_some());
    assert!(
        style
            .delegate_children
            .iter()
            .any(|child| child.text.contains(".note")),
        "css rules hang off the delegated style chunk"
    );

    let script = find(&chunks, &|c| c.handler_name == "javascript").unwrap();
    assert!(script.text.contains("const answer = 42;"));

    // Every stored chunk shows up exactly once in the rebuilt forest
    let stored = db.select_chunk_slices_for_file("b1", style.file_id).unwrap();
    let mut ids: Vec<&str> = stored.iter().map(|s| s.chunk_id.as_str()).collect();
    ids.dedup();
    assert_eq!(chunks.iter().map(RecomposedChunk::tree_size).sum::<usize>(), ids.len());
}

/// Oversized text is stored as parts and stitched back losslessly.
#[tokio::test]
async fn test_split_text_recomposes_losslessly() {
    let body = "a b c\nd e f\ng h i\n";
    let ws = workspace(&[("flat.txt", body)], |config| {
        config.general_max_tokens = TokenLimit::Limit(4);
    });
    let outcome = ws
        .service
        .run_source("site", &[], Some("b1".to_string()), &())
        .await
        .unwrap();
    assert_eq!(outcome.record.status, HealthStatus::Degraded);
    assert!(outcome.record.warnings.iter().any(|w| w.contains("due to token cap")));

    let db = ws.db.lock().await;
    let chunks = ChunkRecomposer::for_path(&db, "b1", "flat.txt").unwrap().unwrap();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].parts.len() > 1);
    assert_eq!(chunks[0].text, body);
    assert!(chunks[0].metadata.get("part_index").is_none());
}

/// A second batch over unchanged files reuses every row and keeps them visible.
#[tokio::test]
async fn test_idempotent_across_batches() {
    let ws = workspace(
        &[
            ("index.html", PAGE),
            ("README.md", "# Site\n\nIntro text.\n\n## Build\n\nRun it.\n"),
        ],
        |_| {},
    );
    let first = ws.service.run_source("site", &[], Some("b1".to_string()), &()).await.unwrap();
    let second = ws.service.run_source("site", &[], Some("b2".to_string()), &()).await.unwrap();

    assert_eq!(second.record.metrics.chunks_emitted, 0);
    assert_eq!(second.record.metrics.chunks_reused, first.record.metrics.chunks_emitted);

    let db = ws.db.lock().await;
    let before = ChunkRecomposer::for_path(&db, "b1", "README.md").unwrap().unwrap();
    let after = ChunkRecomposer::for_path(&db, "b2", "README.md").unwrap().unwrap();
    let texts = |chunks: &[RecomposedChunk]| chunks.iter().map(|c| c.text.clone()).collect::<Vec<_>>();
    assert_eq!(texts(&before), texts(&after));
    assert!(after.iter().all(|c| c.first_seen_batch == "b1" && c.last_seen_batch == "b2"));

    // Editing one file only rewrites that file's chunks
    fs::write(
        ws.dir.path().join("site/README.md"),
        "# Site\n\nIntro text.\n\n## Build\n\nRun it twice.\n",
    )
    .unwrap();
    drop(db);
    let third = ws.service.run_source("site", &[], Some("b3".to_string()), &()).await.unwrap();
    assert!(third.record.metrics.chunks_emitted > 0);
    assert!(third.record.metrics.files_reused >= 1);
}

/// A stray part row in the last batch makes the source unhealthy.
#[tokio::test]
async fn test_health_flags_part_gaps() {
    let ws = workspace(&[("notes.txt", "first\n\nsecond\n")], |_| {});
    ws.service.run_source("site", &[], Some("b1".to_string()), &()).await.unwrap();

    let reports = ws.service.check_health().await;
    assert_eq!(reports[0].status, HealthStatus::Ok);

    {
        let db = ws.db.lock().await;
        let file_id = db.file_id("notes.txt").unwrap().unwrap();
        let mut stray: ChunkSlice = db.select_chunk_slices_for_file("b1", file_id).unwrap().remove(0);
        stray.chunk_id = "text:broken:0:1".to_string();
        stray.part_index = 2;
        stray.part_total = 3;
        db.upsert_chunk_slice(&stray).unwrap();
    }

    let reports = ws.service.check_health().await;
    assert_eq!(reports[0].status, HealthStatus::Error);
    let summary = reports[0].summary.as_deref().unwrap();
    assert!(summary.contains("chunk 'text:broken:0:1' part indices not contiguous"), "{summary}");
    assert!(reports[0].actions.iter().any(|a| a.contains("chunkloom parse site")));
}

/// Disabling a handler routes its files to the text handler and degrades the run.
#[tokio::test]
async fn test_disabled_handler_falls_back_to_text() {
    let ws = workspace(&[("guide.md", "# Guide\n\nBody.\n")], |config| {
        config.handlers.get_mut("markdown").unwrap().enabled = false;
    });
    let outcome = ws.service.run_source("site", &[], Some("b1".to_string()), &()).await.unwrap();
    assert_eq!(outcome.record.status, HealthStatus::Degraded);
    assert_eq!(outcome.record.metrics.fallbacks, 1);
    assert!(
        outcome
            .record
            .warnings
            .iter()
            .any(|w| w == "Fallback to text for guide.md via fallback:disabled")
    );

    let db = ws.db.lock().await;
    let chunks = ChunkRecomposer::for_path(&db, "b1", "guide.md").unwrap().unwrap();
    assert!(chunks.iter().all(|c| c.handler_name == "text"));
}

/// The health hook reports the module as a whole when it is switched off.
#[test]
fn test_disabled_module_health() {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.enabled = false;
    config.sources.insert("site".to_string(), dir.path().to_path_buf());
    let manifest = ManifestStore::new(dir.path().join("manifest.json"));

    let reports = parser_health_hook(&config, &manifest, None);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, HealthStatus::Unknown);
    assert!(!Path::new(manifest.path()).exists());
}
