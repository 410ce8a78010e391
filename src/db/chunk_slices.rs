use super::{Db, models::*};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result, params};

const SLICE_COLUMNS: &str = "c.id, c.batch_id, c.file_id, c.symbol_id, c.parent_symbol_id, c.chunk_id, \
     c.handler_name, c.handler_version, c.part_index, c.part_total, c.start_line, c.end_line, \
     c.start_byte, c.end_byte, c.token_count, c.content_hash, c.content_norm_hash, c.content_text, \
     c.overflow_is_truncated, c.overflow_reason, c.metadata_json, c.created_at, c.updated_at, \
     c.first_seen_batch, c.last_seen_batch";

/// Rows visible in batch `?1`: written by it or confirmed unchanged by it,
/// keeping the newest row per (file, chunk, part) slot.
const VISIBLE_IN_BATCH: &str = r#"
    (c.batch_id = ?1 OR c.last_seen_batch = ?1)
    AND c.id = (
        SELECT MAX(v.id) FROM chunk_slices v
        WHERE v.file_id = c.file_id
          AND v.chunk_id = c.chunk_id
          AND v.part_index = c.part_index
          AND (v.batch_id = ?1 OR v.last_seen_batch = ?1)
    )
"#;

fn slice_from_row(row: &rusqlite::Row<'_>) -> Result<ChunkSlice> {
    Ok(ChunkSlice {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        file_id: row.get(2)?,
        symbol_id: row.get(3)?,
        parent_symbol_id: row.get(4)?,
        chunk_id: row.get(5)?,
        handler_name: row.get(6)?,
        handler_version: row.get(7)?,
        part_index: row.get(8)?,
        part_total: row.get(9)?,
        start_line: row.get(10)?,
        end_line: row.get(11)?,
        start_byte: row.get(12)?,
        end_byte: row.get(13)?,
        token_count: row.get(14)?,
        content_hash: row.get(15)?,
        content_norm_hash: row.get(16)?,
        content_text: row.get(17)?,
        overflow_is_truncated: row.get(18)?,
        overflow_reason: row.get(19)?,
        metadata_json: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
        first_seen_batch: row.get(23)?,
        last_seen_batch: row.get(24)?,
    })
}

/// Insert `slice`, or overwrite the row already holding its batch slot.
pub(crate) fn upsert_chunk_slice(conn: &Connection, slice: &ChunkSlice) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO chunk_slices (
            batch_id, file_id, symbol_id, parent_symbol_id, chunk_id,
            handler_name, handler_version, part_index, part_total,
            start_line, end_line, start_byte, end_byte, token_count,
            content_hash, content_norm_hash, content_text,
            overflow_is_truncated, overflow_reason, metadata_json,
            created_at, updated_at, first_seen_batch, last_seen_batch
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(batch_id, file_id, chunk_id, part_index) DO UPDATE SET
            symbol_id = excluded.symbol_id,
            parent_symbol_id = excluded.parent_symbol_id,
            handler_name = excluded.handler_name,
            handler_version = excluded.handler_version,
            part_total = excluded.part_total,
            start_line = excluded.start_line,
            end_line = excluded.end_line,
            start_byte = excluded.start_byte,
            end_byte = excluded.end_byte,
            token_count = excluded.token_count,
            content_hash = excluded.content_hash,
            content_norm_hash = excluded.content_norm_hash,
            content_text = excluded.content_text,
            overflow_is_truncated = excluded.overflow_is_truncated,
            overflow_reason = excluded.overflow_reason,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at,
            last_seen_batch = excluded.last_seen_batch
        "#,
        params![
            slice.batch_id,
            slice.file_id,
            slice.symbol_id,
            slice.parent_symbol_id,
            slice.chunk_id,
            slice.handler_name,
            slice.handler_version,
            slice.part_index,
            slice.part_total,
            slice.start_line,
            slice.end_line,
            slice.start_byte,
            slice.end_byte,
            slice.token_count,
            slice.content_hash,
            slice.content_norm_hash,
            slice.content_text,
            slice.overflow_is_truncated,
            slice.overflow_reason,
            slice.metadata_json,
            slice.created_at,
            slice.updated_at,
            slice.first_seen_batch,
            slice.last_seen_batch
        ],
    )?;
    Ok(())
}

/// Remove parts at or beyond `part_total` left by an earlier write in the same batch.
pub(crate) fn delete_trailing_parts(
    conn: &Connection,
    batch_id: &str,
    file_id: i64,
    chunk_id: &str,
    part_total: i64,
) -> Result<usize> {
    conn.execute(
        "DELETE FROM chunk_slices WHERE batch_id = ? AND file_id = ? AND chunk_id = ? AND part_index >= ?",
        params![batch_id, file_id, chunk_id, part_total],
    )
}

/// Every stored version of every chunk of `file_id`, oldest first per slot.
pub(crate) fn select_history_for_file(conn: &Connection, file_id: i64) -> Result<Vec<ChunkSlice>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SLICE_COLUMNS} FROM chunk_slices c WHERE c.file_id = ? ORDER BY c.chunk_id, c.part_index, c.id"
    ))?;
    let rows = stmt.query_map(params![file_id], slice_from_row)?;
    rows.collect()
}

pub(crate) fn mark_last_seen(
    conn: &Connection,
    row_ids: &[i64],
    batch_id: &str,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    let mut stmt =
        conn.prepare("UPDATE chunk_slices SET last_seen_batch = ?, updated_at = ? WHERE id = ?")?;
    for id in row_ids {
        stmt.execute(params![batch_id, updated_at, id])?;
    }
    Ok(())
}

impl Db {
    /// Purge rows written by `batch_id`; rows of other batches are untouched.
    pub fn delete_chunk_slices_by_batch(&self, batch_id: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM chunk_slices WHERE batch_id = ?", params![batch_id])
    }

    /// Slices of one file as seen by `batch_id`, ordered by chunk and part.
    pub fn select_chunk_slices_for_file(&self, batch_id: &str, file_id: i64) -> Result<Vec<ChunkSlice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SLICE_COLUMNS} FROM chunk_slices c WHERE {VISIBLE_IN_BATCH} AND c.file_id = ?2 \
             ORDER BY c.chunk_id, c.part_index"
        ))?;
        let rows = stmt.query_map(params![batch_id, file_id], slice_from_row)?;
        rows.collect()
    }

    /// Parts of one chunk as seen by `batch_id`, ordered by part.
    pub fn select_chunk_slices_for_chunk(&self, batch_id: &str, chunk_id: &str) -> Result<Vec<ChunkSlice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SLICE_COLUMNS} FROM chunk_slices c WHERE {VISIBLE_IN_BATCH} AND c.chunk_id = ?2 \
             ORDER BY c.file_id, c.part_index"
        ))?;
        let rows = stmt.query_map(params![batch_id, chunk_id], slice_from_row)?;
        rows.collect()
    }

    pub fn select_chunk_history_for_file(&self, file_id: i64) -> Result<Vec<ChunkSlice>> {
        select_history_for_file(&self.conn, file_id)
    }

    /// Integrity columns of every slice visible in `batch_id`.
    pub fn select_slice_summaries(&self, batch_id: &str) -> Result<Vec<SliceSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT c.chunk_id, c.part_index, c.part_total, c.metadata_json \
             FROM chunk_slices c WHERE {VISIBLE_IN_BATCH} ORDER BY c.file_id, c.chunk_id, c.part_index"
        ))?;
        let rows = stmt.query_map(params![batch_id], |row| {
            Ok(SliceSummary {
                chunk_id: row.get(0)?,
                part_index: row.get(1)?,
                part_total: row.get(2)?,
                metadata_json: row.get(3)?,
            })
        })?;
        rows.collect()
    }

    /// Store one slice directly, outside the staging pipeline.
    pub fn upsert_chunk_slice(&self, slice: &ChunkSlice) -> Result<()> {
        upsert_chunk_slice(&self.conn, slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn slice(batch: &str, file_id: i64, chunk: &str, part: i64, total: i64, text: &str) -> ChunkSlice {
        let now = Utc::now();
        ChunkSlice {
            id: 0,
            batch_id: batch.to_string(),
            file_id,
            symbol_id: None,
            parent_symbol_id: None,
            chunk_id: chunk.to_string(),
            handler_name: "text".to_string(),
            handler_version: "1.0.0".to_string(),
            part_index: part,
            part_total: total,
            start_line: Some(1),
            end_line: Some(1),
            start_byte: Some(0),
            end_byte: Some(text.len() as i64),
            token_count: 1,
            content_hash: format!("h-{text}"),
            content_norm_hash: None,
            content_text: text.to_string(),
            overflow_is_truncated: false,
            overflow_reason: None,
            metadata_json: None,
            created_at: now,
            updated_at: now,
            first_seen_batch: batch.to_string(),
            last_seen_batch: batch.to_string(),
        }
    }

    fn setup() -> (Db, i64) {
        let db = Db::open_in_memory().unwrap();
        for batch in ["b1", "b2"] {
            db.ensure_batch(batch, None, Utc::now(), None).unwrap();
        }
        let file_id = db
            .upsert_file(&FileWrite {
                batch_id: "b1",
                repo_path: "notes.txt",
                lang: "text",
                file_sha: "x",
                mtime_ns: None,
                size_bytes: None,
            })
            .unwrap();
        (db, file_id)
    }

    #[test]
    fn test_upsert_same_slot_overwrites() {
        let (db, file_id) = setup();
        db.upsert_chunk_slice(&slice("b1", file_id, "c1", 0, 1, "old")).unwrap();
        db.upsert_chunk_slice(&slice("b1", file_id, "c1", 0, 1, "new")).unwrap();

        let rows = db.select_chunk_slices_for_file("b1", file_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content_text, "new");
    }

    #[test]
    fn test_reused_rows_are_visible_in_later_batch() {
        let (db, file_id) = setup();
        db.upsert_chunk_slice(&slice("b1", file_id, "c1", 0, 1, "same")).unwrap();
        let history = db.select_chunk_history_for_file(file_id).unwrap();
        mark_last_seen(&db.conn, &[history[0].id], "b2", Utc::now()).unwrap();

        let rows = db.select_chunk_slices_for_file("b2", file_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].batch_id, "b1");
        assert_eq!(rows[0].last_seen_batch, "b2");
        assert_eq!(db.select_chunk_slices_for_chunk("b2", "c1").unwrap().len(), 1);
        assert_eq!(db.select_slice_summaries("b2").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_by_batch_only_touches_that_batch() {
        let (db, file_id) = setup();
        db.upsert_chunk_slice(&slice("b1", file_id, "c1", 0, 1, "one")).unwrap();
        db.upsert_chunk_slice(&slice("b2", file_id, "c1", 0, 1, "two")).unwrap();

        assert_eq!(db.delete_chunk_slices_by_batch("b2").unwrap(), 1);
        assert_eq!(db.select_chunk_history_for_file(file_id).unwrap().len(), 1);
        assert_eq!(db.select_chunk_slices_for_file("b1", file_id).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_trailing_parts() {
        let (db, file_id) = setup();
        for part in 0..3 {
            db.upsert_chunk_slice(&slice("b1", file_id, "c1", part, 3, "p")).unwrap();
        }
        assert_eq!(delete_trailing_parts(&db.conn, "b1", file_id, "c1", 2).unwrap(), 1);
        assert_eq!(db.select_chunk_slices_for_file("b1", file_id).unwrap().len(), 2);
    }
}
