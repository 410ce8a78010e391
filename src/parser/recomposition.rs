//! Rebuild logical chunks and their delegation trees from stored slices.
use std::collections::HashMap;

use crate::db::Db;
use crate::db::models::ChunkSlice;
use crate::error::{ParserError, Result};
use crate::parser::metadata::{MetaValue, Metadata, MetadataExt};

/// A logical chunk stitched back together from its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct RecomposedChunk {
    pub chunk_id: String,
    pub batch_id: String,
    pub file_id: i64,
    pub handler_name: String,
    pub handler_version: String,
    pub symbol_id: Option<i64>,
    pub parent_symbol_id: Option<i64>,
    pub text: String,
    pub token_count: i64,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub start_byte: Option<i64>,
    pub end_byte: Option<i64>,
    /// Part 0 metadata without `part_index`, with the aggregated `part_total`.
    pub metadata: Metadata,
    /// Stored parts in `part_index` order.
    pub parts: Vec<ChunkSlice>,
    pub first_seen_batch: String,
    pub last_seen_batch: String,
    pub delegate_parent_chunk_id: Option<String>,
    pub delegate_children: Vec<RecomposedChunk>,
}

impl RecomposedChunk {
    fn sort_key(&self) -> (i64, i64, String) {
        let position = self
            .start_byte
            .or(self.start_line)
            .or_else(|| self.parts.first().map(|p| p.part_index))
            .unwrap_or(0);
        (self.file_id, position, self.chunk_id.clone())
    }

    /// Chunks produced by or for a delegate carry linkage metadata.
    fn is_delegated(&self) -> bool {
        self.metadata.contains_key("delegate_parent_chunk")
            || self.metadata.contains_key("delegate_parent_handler")
    }

    /// Number of chunks in this subtree, itself included.
    pub fn tree_size(&self) -> usize {
        1 + self.delegate_children.iter().map(Self::tree_size).sum::<usize>()
    }
}

fn parse_metadata(raw: Option<&str>) -> Result<Metadata> {
    match raw.map(str::trim) {
        Some(json) if !json.is_empty() => Ok(serde_json::from_str(json)?),
        _ => Ok(Metadata::new()),
    }
}

fn merge_parts(mut parts: Vec<ChunkSlice>) -> Result<RecomposedChunk> {
    parts.sort_by_key(|p| p.part_index);
    let first = parts
        .first()
        .ok_or_else(|| ParserError::Integrity("chunk without parts".to_string()))?;

    let mut metadata = parse_metadata(first.metadata_json.as_deref())?;
    metadata.remove("part_index");
    let mut totals: Vec<i64> = parts.iter().map(|p| p.part_total).filter(|t| *t > 0).collect();
    totals.dedup();
    let count = i64::try_from(parts.len()).unwrap_or(i64::MAX);
    let part_total = match totals.as_slice() {
        [single] => count.max(*single),
        _ => count,
    };
    metadata.insert("part_total".to_string(), MetaValue::Int(part_total));
    let delegate_parent_chunk_id = metadata.get_str("delegate_parent_chunk").map(str::to_string);

    Ok(RecomposedChunk {
        chunk_id: first.chunk_id.clone(),
        batch_id: first.batch_id.clone(),
        file_id: first.file_id,
        handler_name: first.handler_name.clone(),
        handler_version: first.handler_version.clone(),
        symbol_id: first.symbol_id,
        parent_symbol_id: first.parent_symbol_id,
        text: parts.iter().map(|p| p.content_text.as_str()).collect(),
        token_count: parts.iter().map(|p| p.token_count).sum(),
        start_line: parts.iter().filter_map(|p| p.start_line).min(),
        end_line: parts.iter().filter_map(|p| p.end_line).max(),
        start_byte: parts.iter().filter_map(|p| p.start_byte).min(),
        end_byte: parts.iter().filter_map(|p| p.end_byte).max(),
        first_seen_batch: first.first_seen_batch.clone(),
        last_seen_batch: first.last_seen_batch.clone(),
        metadata,
        delegate_parent_chunk_id,
        delegate_children: Vec::new(),
        parts,
    })
}

/// Group `rows` into logical chunks and attach delegate children to parents.
///
/// Children point at their parent through `delegate_parent_chunk`. A
/// delegated chunk without one but with a parent symbol hangs under the first
/// ordinary chunk of that symbol. Returns the top-level chunks in document
/// order.
pub fn recompose_chunk_slices(rows: Vec<ChunkSlice>) -> Result<Vec<RecomposedChunk>> {
    let mut order: HashMap<(i64, String), usize> = HashMap::new();
    let mut grouped: Vec<Vec<ChunkSlice>> = Vec::new();
    for row in rows {
        let key = (row.file_id, row.chunk_id.clone());
        let slot = *order.entry(key).or_insert_with(|| {
            grouped.push(Vec::new());
            grouped.len() - 1
        });
        grouped[slot].push(row);
    }

    let mut chunks = grouped.into_iter().map(merge_parts).collect::<Result<Vec<_>>>()?;
    chunks.sort_by_key(RecomposedChunk::sort_key);
    let index: HashMap<(i64, &str), usize> = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| ((c.file_id, c.chunk_id.as_str()), i))
        .collect();

    let mut parent_of: Vec<Option<usize>> = vec![None; chunks.len()];
    for (i, chunk) in chunks.iter().enumerate() {
        if let Some(parent) = chunk.delegate_parent_chunk_id.as_deref() {
            let parent_idx = index.get(&(chunk.file_id, parent)).copied().ok_or_else(|| {
                ParserError::Integrity(format!(
                    "chunk {:?} references missing parent {parent:?}",
                    chunk.chunk_id
                ))
            })?;
            if parent_idx == i {
                return Err(ParserError::Integrity(format!(
                    "chunk {:?} is its own delegate parent",
                    chunk.chunk_id
                )));
            }
            parent_of[i] = Some(parent_idx);
        } else if chunk.is_delegated() {
            if let Some(symbol) = chunk.parent_symbol_id {
                parent_of[i] = chunks.iter().position(|c| {
                    c.file_id == chunk.file_id && c.symbol_id == Some(symbol) && !c.is_delegated()
                });
            }
        }
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); chunks.len()];
    let mut roots = Vec::new();
    for (i, parent) in parent_of.iter().enumerate() {
        match parent {
            Some(p) => children[*p].push(i),
            None => roots.push(i),
        }
    }

    let mut slots: Vec<Option<RecomposedChunk>> = chunks.into_iter().map(Some).collect();
    let mut placed = 0;
    let mut tree = Vec::with_capacity(roots.len());
    for root in roots {
        if let Some(chunk) = assemble(root, &children, &mut slots, &mut placed) {
            tree.push(chunk);
        }
    }
    if placed != slots.len() {
        return Err(ParserError::Integrity(
            "delegate parent links form a cycle".to_string(),
        ));
    }
    Ok(tree)
}

fn assemble(
    idx: usize,
    children: &[Vec<usize>],
    slots: &mut [Option<RecomposedChunk>],
    placed: &mut usize,
) -> Option<RecomposedChunk> {
    let mut chunk = slots[idx].take()?;
    *placed += 1;
    chunk.delegate_children = children[idx]
        .iter()
        .filter_map(|&child| assemble(child, children, slots, placed))
        .collect();
    Some(chunk)
}

/// Reads slices from the store and recomposes them.
pub struct ChunkRecomposer;

impl ChunkRecomposer {
    pub fn for_file(db: &Db, batch_id: &str, file_id: i64) -> Result<Vec<RecomposedChunk>> {
        recompose_chunk_slices(db.select_chunk_slices_for_file(batch_id, file_id)?)
    }

    /// Recompose by repository path; `None` when the file was never staged.
    pub fn for_path(db: &Db, batch_id: &str, repo_path: &str) -> Result<Option<Vec<RecomposedChunk>>> {
        match db.file_id(repo_path)? {
            Some(file_id) => Self::for_file(db, batch_id, file_id).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(chunk: &str, part: i64, total: i64, text: &str, start: i64, metadata: &str) -> ChunkSlice {
        ChunkSlice {
            id: 0,
            batch_id: "b1".to_string(),
            file_id: 1,
            symbol_id: None,
            parent_symbol_id: None,
            chunk_id: chunk.to_string(),
            handler_name: "html".to_string(),
            handler_version: "1.0.0".to_string(),
            part_index: part,
            part_total: total,
            start_line: Some(1),
            end_line: Some(1 + part),
            start_byte: Some(start),
            end_byte: Some(start + text.len() as i64),
            token_count: 2,
            content_hash: String::new(),
            content_norm_hash: None,
            content_text: text.to_string(),
            overflow_is_truncated: false,
            overflow_reason: None,
            metadata_json: Some(metadata.to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            first_seen_batch: "b1".to_string(),
            last_seen_batch: "b1".to_string(),
        }
    }

    #[test]
    fn test_parts_are_merged_in_order() {
        let rows = vec![
            row("c", 1, 2, "world", 6, r#"{"part_index":1,"part_total":2}"#),
            row("c", 0, 2, "hello ", 0, r#"{"kind":"p","part_index":0,"part_total":2}"#),
        ];
        let chunks = recompose_chunk_slices(rows).unwrap();
        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.text, "hello world");
        assert_eq!(chunk.token_count, 4);
        assert_eq!((chunk.start_line, chunk.end_line), (Some(1), Some(2)));
        assert_eq!(chunk.metadata.get_str("kind"), Some("p"));
        assert_eq!(chunk.metadata.get_int("part_total"), Some(2));
        assert!(!chunk.metadata.contains_key("part_index"));
    }

    #[test]
    fn test_children_attach_to_parent_chunk() {
        let rows = vec![
            row("shell", 0, 1, "<style>", 0, r#"{"kind":"element"}"#),
            row("css", 0, 1, "a{}", 7, r#"{"delegate_parent_chunk":"shell","delegate_parent_handler":"html"}"#),
            row("css/rule", 0, 1, "a{}", 0, r#"{"delegate_parent_chunk":"css","delegate_parent_handler":"css"}"#),
        ];
        let chunks = recompose_chunk_slices(rows).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, "shell");
        assert_eq!(chunks[0].delegate_children[0].chunk_id, "css");
        assert_eq!(chunks[0].delegate_children[0].delegate_children[0].chunk_id, "css/rule");
        assert_eq!(chunks[0].tree_size(), 3);
    }

    #[test]
    fn test_symbol_parent_without_shell() {
        let mut owner = row("app", 0, 1, "const App = ...", 0, r#"{"kind":"const"}"#);
        owner.symbol_id = Some(7);
        let mut jsx = row("jsx", 0, 1, "<div/>", 12, r#"{"delegate_parent_handler":"typescript"}"#);
        jsx.parent_symbol_id = Some(7);
        let chunks = recompose_chunk_slices(vec![jsx, owner]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delegate_children[0].chunk_id, "jsx");
    }

    #[test]
    fn test_missing_parent_is_integrity_error() {
        let rows = vec![row("orphan", 0, 1, "x", 0, r#"{"delegate_parent_chunk":"ghost"}"#)];
        let err = recompose_chunk_slices(rows).unwrap_err();
        assert!(matches!(err, ParserError::Integrity(msg) if msg.contains("ghost")));
    }

    #[test]
    fn test_top_level_order_follows_position() {
        let rows = vec![
            row("b", 0, 1, "second", 10, "{}"),
            row("a", 0, 1, "first", 0, ""),
        ];
        let ids: Vec<_> = recompose_chunk_slices(rows)
            .unwrap()
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
