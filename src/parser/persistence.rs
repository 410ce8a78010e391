//! Stage one handler result into the store.
//!
//! A file is written in a single transaction: the `files` row, its symbols,
//! then its chunk slices. Unchanged symbols and chunks only have their
//! `last_seen_batch` moved forward; changed chunks get a new row version under
//! the current batch.
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::db::Db;
use crate::db::chunk_slices::{delete_trailing_parts, mark_last_seen, select_history_for_file, upsert_chunk_slice};
use crate::db::files::upsert_file;
use crate::db::models::{ChunkSlice, FileWrite, SymbolRecord};
use crate::db::symbols::{insert_symbol, select_symbol, set_symbol_parent, touch_symbol, update_symbol};
use crate::error::{ParserError, Result};
use crate::parser::handlers::{HandlerChunk, HandlerResult, HandlerSymbol};
use crate::parser::hashing::{hash_text, normalize_text};
use crate::parser::metadata::MetadataExt;

/// Everything needed to stage one parsed file.
#[derive(Debug, Clone, Copy)]
pub struct StageRequest<'a> {
    pub batch_id: &'a str,
    /// Handler that parsed the file.
    pub handler_name: &'a str,
    pub handler_version: &'a str,
    /// Versions of every handler that may appear as a delegate.
    pub handler_versions: &'a BTreeMap<String, String>,
    pub result: &'a HandlerResult,
    /// Overrides `result.file.checksum` as the stored `file_sha`.
    pub file_sha: Option<&'a str>,
    pub mtime_ns: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStageOutcome {
    pub file_id: i64,
    pub symbols_written: usize,
    pub symbols_reused: usize,
    pub chunks_inserted: usize,
    pub chunks_reused: usize,
}

/// Chunk parts grouped by `chunk_id` in first-appearance order.
type ChunkGroups<'r> = Vec<(&'r str, Vec<&'r HandlerChunk>)>;

/// Group parts and check that every chunk has parts `0..N` with `part_total = N`.
pub fn group_chunks(chunks: &[HandlerChunk]) -> Result<ChunkGroups<'_>> {
    let mut order: HashMap<&str, usize> = HashMap::new();
    let mut groups: ChunkGroups<'_> = Vec::new();
    for chunk in chunks {
        let slot = *order.entry(chunk.chunk_id.as_str()).or_insert_with(|| {
            groups.push((chunk.chunk_id.as_str(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(chunk);
    }

    for (chunk_id, parts) in &mut groups {
        parts.sort_by_key(|part| part.part_index);
        let total = parts.len();
        let contiguous = parts.iter().enumerate().all(|(i, part)| part.part_index == i);
        if !contiguous {
            return Err(ParserError::Integrity(format!(
                "chunk {chunk_id:?} part indices not contiguous"
            )));
        }
        let totals_match = parts.iter().all(|part| {
            part.metadata
                .get_int("part_total")
                .is_none_or(|t| usize::try_from(t).is_ok_and(|t| t == total))
        });
        if !totals_match {
            return Err(ParserError::Integrity(format!(
                "chunk {chunk_id:?} has inconsistent part totals"
            )));
        }
    }
    Ok(groups)
}

fn resolve_version<'v>(handler: &str, request: &'v StageRequest<'_>) -> Result<&'v str> {
    if let Some(version) = request.handler_versions.get(handler) {
        return Ok(version.as_str());
    }
    if handler == request.handler_name {
        return Ok(request.handler_version);
    }
    Err(ParserError::MissingHandlerVersion(handler.to_string()))
}

/// Handler responsible for a chunk: its delegate, the recorded sub-handler, or the file handler.
fn chunk_handler<'c>(chunk: &'c HandlerChunk, request: &'c StageRequest<'_>) -> &'c str {
    chunk
        .delegate
        .as_deref()
        .or_else(|| chunk.metadata.get_str("handler"))
        .unwrap_or(request.handler_name)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Write `request.result` for one file in a single transaction.
pub fn stage_file(db: &mut Db, request: &StageRequest<'_>) -> Result<FileStageOutcome> {
    let result = request.result;
    let groups = group_chunks(&result.chunks)?;
    let repo_path = result.file.path.to_string_lossy().replace('\\', "/");
    let now = Utc::now();

    let tx = db.conn.transaction()?;
    let file_id = upsert_file(
        &tx,
        &FileWrite {
            batch_id: request.batch_id,
            repo_path: &repo_path,
            lang: &result.file.language,
            file_sha: request.file_sha.unwrap_or(&result.file.checksum),
            mtime_ns: request.mtime_ns,
            size_bytes: result.file.metadata.get_int("size_bytes"),
        },
    )?;

    let mut outcome = FileStageOutcome {
        file_id,
        ..FileStageOutcome::default()
    };
    let symbol_ids = persist_symbols(&tx, file_id, request, &mut outcome)?;
    persist_chunks(&tx, file_id, request, &groups, &symbol_ids, now, &repo_path, &mut outcome)?;
    tx.commit()?;

    debug!(
        "staged {repo_path}: {} symbols written, {} reused, {} chunk parts inserted, {} reused",
        outcome.symbols_written, outcome.symbols_reused, outcome.chunks_inserted, outcome.chunks_reused
    );
    Ok(outcome)
}

/// Candidate row for `symbol`, derived from the chunks parented to it.
fn symbol_candidate(
    symbol: &HandlerSymbol,
    chunks: &[HandlerChunk],
    file_id: i64,
    request: &StageRequest<'_>,
) -> Result<SymbolRecord> {
    let owned: Vec<&HandlerChunk> = chunks
        .iter()
        .filter(|c| c.parent_symbol_id.as_deref() == Some(symbol.symbol_id.as_str()))
        .collect();

    let joined = if owned.is_empty() {
        format!(
            "{}\n{}\n{}",
            symbol.kind,
            symbol.name,
            symbol.docstring.as_deref().unwrap_or_default()
        )
    } else {
        owned.iter().map(|c| c.text.as_str()).collect::<String>()
    };

    let start_line = owned
        .iter()
        .filter_map(|c| c.metadata.get_int("start_line"))
        .min()
        .or_else(|| symbol.metadata.get_int("start_line"));
    let end_line = owned
        .iter()
        .filter_map(|c| c.metadata.get_int("end_line"))
        .max()
        .or_else(|| symbol.metadata.get_int("end_line"));
    let tokens = owned.iter().map(|c| c.token_count).sum::<usize>();

    let handler = symbol.metadata.get_str("handler").unwrap_or(request.handler_name);
    let version = resolve_version(handler, request)?;
    let salt = [symbol.symbol_id.as_str(), symbol.kind.as_str()];

    Ok(SymbolRecord {
        id: 0,
        file_id,
        parent_id: None,
        kind: symbol.kind.clone(),
        symbol_path: symbol.symbol_id.clone(),
        start_line,
        end_line,
        symbol_sha: hash_text(&joined, version, salt),
        symbol_norm_sha: Some(hash_text(&normalize_text(&joined), version, salt)),
        docstring: symbol.docstring.clone(),
        tokens: to_i64(tokens),
        first_seen_batch: request.batch_id.to_string(),
        last_seen_batch: request.batch_id.to_string(),
    })
}

/// Upsert every symbol, then link parents. Returns handler id → row id.
fn persist_symbols(
    conn: &Connection,
    file_id: i64,
    request: &StageRequest<'_>,
    outcome: &mut FileStageOutcome,
) -> Result<HashMap<String, i64>> {
    let result = request.result;
    let mut ids = HashMap::with_capacity(result.symbols.len());

    for symbol in &result.symbols {
        let candidate = symbol_candidate(symbol, &result.chunks, file_id, request)?;
        let id = match select_symbol(conn, file_id, &candidate.symbol_path)? {
            Some(existing) if existing.same_content(&candidate) => {
                touch_symbol(conn, existing.id, request.batch_id)?;
                outcome.symbols_reused += 1;
                existing.id
            }
            Some(existing) => {
                update_symbol(conn, existing.id, &candidate)?;
                outcome.symbols_written += 1;
                existing.id
            }
            None => {
                outcome.symbols_written += 1;
                insert_symbol(conn, &candidate)?
            }
        };
        ids.insert(symbol.symbol_id.clone(), id);
    }

    for symbol in &result.symbols {
        let parent = match symbol.parent_id.as_deref() {
            Some(parent) => Some(
                *ids.get(parent)
                    .ok_or_else(|| ParserError::MissingSymbol(parent.to_string()))?,
            ),
            None => None,
        };
        set_symbol_parent(conn, ids[&symbol.symbol_id], parent)?;
    }
    Ok(ids)
}

fn lookup_symbol(key: Option<&str>, ids: &HashMap<String, i64>) -> Result<Option<i64>> {
    match key {
        Some(key) => ids
            .get(key)
            .copied()
            .map(Some)
            .ok_or_else(|| ParserError::MissingSymbol(key.to_string())),
        None => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
fn persist_chunks(
    conn: &Connection,
    file_id: i64,
    request: &StageRequest<'_>,
    groups: &ChunkGroups<'_>,
    symbol_ids: &HashMap<String, i64>,
    now: DateTime<Utc>,
    repo_path: &str,
    outcome: &mut FileStageOutcome,
) -> Result<()> {
    if groups.is_empty() {
        return Ok(());
    }

    // History per chunk: part index -> versions, oldest first
    let mut history: HashMap<String, BTreeMap<i64, Vec<ChunkSlice>>> = HashMap::new();
    for row in select_history_for_file(conn, file_id)? {
        history
            .entry(row.chunk_id.clone())
            .or_default()
            .entry(row.part_index)
            .or_default()
            .push(row);
    }

    for (chunk_id, parts) in groups {
        let chunk_history = history.get(*chunk_id);
        let first_seen = chunk_history
            .into_iter()
            .flat_map(|by_part| by_part.values().flatten())
            .min_by_key(|row| row.id)
            .map(|row| row.first_seen_batch.clone())
            .unwrap_or_else(|| request.batch_id.to_string());

        let rows = parts
            .iter()
            .map(|part| build_row(part, file_id, request, symbol_ids, now, &first_seen, repo_path))
            .collect::<Result<Vec<_>>>()?;

        // Newest version of parts 0..N only; rows past N belong to older, longer versions
        let latest: Vec<&ChunkSlice> = chunk_history
            .and_then(|by_part| {
                (0..to_i64(rows.len()))
                    .map(|index| by_part.get(&index).and_then(|versions| versions.last()))
                    .collect::<Option<Vec<_>>>()
            })
            .unwrap_or_default();
        let unchanged = latest.len() == rows.len()
            && latest
                .iter()
                .zip(&rows)
                .all(|(old, new)| old.part_total == new.part_total && old.same_content(new));

        if unchanged {
            let ids: Vec<i64> = latest.iter().map(|row| row.id).collect();
            mark_last_seen(conn, &ids, request.batch_id, now)?;
            outcome.chunks_reused += rows.len();
            continue;
        }

        delete_trailing_parts(conn, request.batch_id, file_id, chunk_id, to_i64(rows.len()))?;
        for row in &rows {
            upsert_chunk_slice(conn, row)?;
        }
        outcome.chunks_inserted += rows.len();
    }
    Ok(())
}

fn build_row(
    chunk: &HandlerChunk,
    file_id: i64,
    request: &StageRequest<'_>,
    symbol_ids: &HashMap<String, i64>,
    now: DateTime<Utc>,
    first_seen: &str,
    repo_path: &str,
) -> Result<ChunkSlice> {
    let handler = chunk_handler(chunk, request);
    let version = resolve_version(handler, request)?;
    let metadata = &chunk.metadata;

    let symbol_id = lookup_symbol(chunk.parent_symbol_id.as_deref(), symbol_ids)?;
    let parent_symbol_id = lookup_symbol(metadata.get_str("delegate_parent_symbol"), symbol_ids)?;
    let part_total = metadata.get_int("part_total").unwrap_or(1);
    let overflow = metadata.get_flag("overflow") || metadata.get_flag("overflow_is_truncated");
    let overflow_reason = metadata.get_str("overflow_reason").map(str::to_string);
    let metadata_json = if metadata.is_empty() {
        None
    } else {
        Some(serde_json::to_string(metadata)?)
    };

    let salt = [chunk.chunk_id.as_str(), handler];
    let row = ChunkSlice {
        id: 0,
        batch_id: request.batch_id.to_string(),
        file_id,
        symbol_id,
        parent_symbol_id,
        chunk_id: chunk.chunk_id.clone(),
        handler_name: handler.to_string(),
        handler_version: version.to_string(),
        part_index: to_i64(chunk.part_index),
        part_total,
        start_line: metadata.get_int("start_line"),
        end_line: metadata.get_int("end_line"),
        start_byte: Some(to_i64(chunk.start_offset)),
        end_byte: Some(to_i64(chunk.end_offset)),
        token_count: to_i64(chunk.token_count),
        content_hash: hash_text(&chunk.text, version, salt),
        content_norm_hash: Some(hash_text(&normalize_text(&chunk.text), version, salt)),
        content_text: chunk.text.clone(),
        overflow_is_truncated: overflow,
        overflow_reason,
        metadata_json,
        created_at: now,
        updated_at: now,
        first_seen_batch: first_seen.to_string(),
        last_seen_batch: request.batch_id.to_string(),
    };

    if overflow || row.overflow_reason.is_some() {
        info!(
            "chunk overflow: {}:{handler}:{repo_path}:{}:{}:{} (part {} of {}, {} tokens)",
            request.batch_id,
            chunk.start_offset,
            chunk.end_offset,
            chunk.part_index,
            chunk.part_index + 1,
            part_total,
            chunk.token_count
        );
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta;
    use crate::parser::handlers::{HandlerChunk, HandlerFile};
    use crate::parser::metadata::Metadata;
    use std::path::PathBuf;

    fn file() -> HandlerFile {
        HandlerFile {
            path: PathBuf::from("docs/notes.md"),
            language: "markdown".to_string(),
            encoding: "utf-8".to_string(),
            checksum: "abc".to_string(),
            metadata: meta! { "size_bytes" => 12_i64 },
        }
    }

    fn chunk(id: &str, text: &str, part: usize, total: usize, parent: Option<&str>) -> HandlerChunk {
        let mut chunk = HandlerChunk::new(id, text, 0, text.len()).with_parent(parent);
        chunk.part_index = part;
        chunk.token_count = 1;
        chunk.metadata = meta! { "kind" => "section", "part_total" => total, "start_line" => 1_i64, "end_line" => 1_i64 };
        chunk
    }

    fn symbol(id: &str, parent: Option<&str>) -> HandlerSymbol {
        HandlerSymbol {
            symbol_id: id.to_string(),
            name: id.to_string(),
            kind: "heading".to_string(),
            start_offset: 0,
            end_offset: 1,
            docstring: None,
            parent_id: parent.map(str::to_string),
            metadata: Metadata::new(),
        }
    }

    fn result(text: &str) -> HandlerResult {
        HandlerResult {
            file: file(),
            symbols: vec![symbol("h1", None), symbol("h2", Some("h1"))],
            chunks: vec![chunk("c1", text, 0, 1, Some("h1")), chunk("c2", "tail", 0, 1, Some("h2"))],
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn stage(db: &mut Db, batch: &str, result: &HandlerResult) -> Result<FileStageOutcome> {
        let versions = BTreeMap::from([("markdown".to_string(), "1.0.0".to_string())]);
        db.ensure_batch(batch, None, Utc::now(), None)?;
        stage_file(
            db,
            &StageRequest {
                batch_id: batch,
                handler_name: "markdown",
                handler_version: "1.0.0",
                handler_versions: &versions,
                result,
                file_sha: None,
                mtime_ns: None,
            },
        )
    }

    #[test]
    fn test_group_chunks_rejects_gaps() {
        let chunks = vec![chunk("c1", "a", 0, 3, None), chunk("c1", "c", 2, 3, None)];
        let err = group_chunks(&chunks).unwrap_err();
        assert!(err.to_string().contains("part indices not contiguous"));
    }

    #[test]
    fn test_group_chunks_sorts_parts() {
        let chunks = vec![chunk("c1", "b", 1, 2, None), chunk("c1", "a", 0, 2, None)];
        let groups = group_chunks(&chunks).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1[0].text, "a");
    }

    #[test]
    fn test_restaging_identical_content_reuses_rows() {
        let mut db = Db::open_in_memory().unwrap();
        let first = stage(&mut db, "b1", &result("hello")).unwrap();
        assert_eq!(first.chunks_inserted, 2);
        assert_eq!(first.symbols_written, 2);

        let second = stage(&mut db, "b2", &result("hello")).unwrap();
        assert_eq!(second.file_id, first.file_id);
        assert_eq!(second.chunks_inserted, 0);
        assert_eq!(second.chunks_reused, 2);
        assert_eq!(second.symbols_reused, 2);

        let history = db.select_chunk_history_for_file(first.file_id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|row| row.last_seen_batch == "b2" && row.first_seen_batch == "b1"));
    }

    #[test]
    fn test_changed_content_writes_new_version() {
        let mut db = Db::open_in_memory().unwrap();
        let first = stage(&mut db, "b1", &result("hello")).unwrap();
        let second = stage(&mut db, "b2", &result("changed")).unwrap();
        assert_eq!(second.chunks_inserted, 1);
        assert_eq!(second.chunks_reused, 1);

        let rows = db.select_chunk_slices_for_chunk("b2", "c1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].batch_id, "b2");
        assert_eq!(rows[0].first_seen_batch, "b1");
        assert_eq!(rows[0].content_text, "changed");

        let old = db.select_chunk_slices_for_file("b1", first.file_id).unwrap();
        assert!(old.iter().any(|row| row.content_text == "hello"));
    }

    fn split(parts: &[&str]) -> HandlerResult {
        let total = parts.len();
        HandlerResult {
            file: file(),
            symbols: vec![symbol("h1", None)],
            chunks: parts
                .iter()
                .enumerate()
                .map(|(i, text)| chunk("c1", text, i, total, Some("h1")))
                .collect(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_shrunken_chunk_is_reused_after_rewrite() {
        let mut db = Db::open_in_memory().unwrap();
        stage(&mut db, "b1", &split(&["a", "b", "c"])).unwrap();
        let second = stage(&mut db, "b2", &split(&["a", "b"])).unwrap();
        assert_eq!(second.chunks_inserted, 2);

        let third = stage(&mut db, "b3", &split(&["a", "b"])).unwrap();
        assert_eq!(third.chunks_inserted, 0);
        assert_eq!(third.chunks_reused, 2);
        let fourth = stage(&mut db, "b4", &split(&["a", "b"])).unwrap();
        assert_eq!(fourth.chunks_reused, 2);

        let visible = db.select_chunk_slices_for_chunk("b4", "c1").unwrap();
        let texts: Vec<&str> = visible.iter().map(|row| row.content_text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert!(visible.iter().all(|row| row.batch_id == "b2" && row.part_total == 2));
    }

    #[test]
    fn test_grown_chunk_writes_new_version() {
        let mut db = Db::open_in_memory().unwrap();
        stage(&mut db, "b1", &split(&["a", "b"])).unwrap();
        stage(&mut db, "b2", &split(&["a"])).unwrap();
        let third = stage(&mut db, "b3", &split(&["a", "b"])).unwrap();
        assert_eq!(third.chunks_inserted, 2);
        assert_eq!(third.chunks_reused, 0);
        assert_eq!(db.select_chunk_slices_for_chunk("b3", "c1").unwrap().len(), 2);
    }

    #[test]
    fn test_symbol_parents_are_linked() {
        let mut db = Db::open_in_memory().unwrap();
        let outcome = stage(&mut db, "b1", &result("hello")).unwrap();
        let symbols = db.symbols_for_file(outcome.file_id).unwrap();
        assert_eq!(symbols[1].parent_id, Some(symbols[0].id));
        assert_eq!(symbols[0].tokens, 1);
    }

    #[test]
    fn test_unknown_delegate_version_fails() {
        let mut db = Db::open_in_memory().unwrap();
        let mut res = result("hello");
        res.chunks[0].delegate = Some("cobol".to_string());
        let err = stage(&mut db, "b1", &res).unwrap_err();
        assert!(matches!(err, ParserError::MissingHandlerVersion(name) if name == "cobol"));
        assert!(db.file_id("docs/notes.md").unwrap().is_none());
    }

    #[test]
    fn test_missing_parent_symbol_fails() {
        let mut db = Db::open_in_memory().unwrap();
        let mut res = result("hello");
        res.chunks[0].parent_symbol_id = Some("ghost".to_string());
        assert!(matches!(stage(&mut db, "b1", &res), Err(ParserError::MissingSymbol(_))));
    }
}
