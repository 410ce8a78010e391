use super::{Db, models::*};
use rusqlite::{Connection, OptionalExtension, Result, params};

const SYMBOL_COLUMNS: &str = "id, file_id, parent_id, kind, symbol_path, start_line, end_line, \
     symbol_sha, symbol_norm_sha, docstring, tokens, first_seen_batch, last_seen_batch";

fn symbol_from_row(row: &rusqlite::Row<'_>) -> Result<SymbolRecord> {
    Ok(SymbolRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        parent_id: row.get(2)?,
        kind: row.get(3)?,
        symbol_path: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        symbol_sha: row.get(7)?,
        symbol_norm_sha: row.get(8)?,
        docstring: row.get(9)?,
        tokens: row.get(10)?,
        first_seen_batch: row.get(11)?,
        last_seen_batch: row.get(12)?,
    })
}

pub(crate) fn select_symbol(conn: &Connection, file_id: i64, symbol_path: &str) -> Result<Option<SymbolRecord>> {
    conn.query_row(
        &format!("SELECT {SYMBOL_COLUMNS} FROM symbols WHERE file_id = ? AND symbol_path = ?"),
        params![file_id, symbol_path],
        symbol_from_row,
    )
    .optional()
}

/// Insert `symbol` without a parent; parents are linked once every row exists.
pub(crate) fn insert_symbol(conn: &Connection, symbol: &SymbolRecord) -> Result<i64> {
    conn.query_row(
        r#"
        INSERT INTO symbols (
            file_id, kind, symbol_path, start_line, end_line, symbol_sha,
            symbol_norm_sha, docstring, tokens, first_seen_batch, last_seen_batch
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
        params![
            symbol.file_id,
            symbol.kind,
            symbol.symbol_path,
            symbol.start_line,
            symbol.end_line,
            symbol.symbol_sha,
            symbol.symbol_norm_sha,
            symbol.docstring,
            symbol.tokens,
            symbol.first_seen_batch,
            symbol.last_seen_batch
        ],
        |row| row.get(0),
    )
}

/// Overwrite the content columns of row `id`, keeping `first_seen_batch`.
pub(crate) fn update_symbol(conn: &Connection, id: i64, symbol: &SymbolRecord) -> Result<()> {
    conn.execute(
        r#"
        UPDATE symbols SET
            kind = ?, start_line = ?, end_line = ?, symbol_sha = ?,
            symbol_norm_sha = ?, docstring = ?, tokens = ?, last_seen_batch = ?
        WHERE id = ?
        "#,
        params![
            symbol.kind,
            symbol.start_line,
            symbol.end_line,
            symbol.symbol_sha,
            symbol.symbol_norm_sha,
            symbol.docstring,
            symbol.tokens,
            symbol.last_seen_batch,
            id
        ],
    )?;
    Ok(())
}

pub(crate) fn touch_symbol(conn: &Connection, id: i64, batch_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE symbols SET last_seen_batch = ? WHERE id = ?",
        params![batch_id, id],
    )?;
    Ok(())
}

pub(crate) fn set_symbol_parent(conn: &Connection, id: i64, parent_id: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE symbols SET parent_id = ? WHERE id = ? AND parent_id IS NOT ?",
        params![parent_id, id, parent_id],
    )?;
    Ok(())
}

impl Db {
    /// Symbols of one file in insertion order.
    pub fn symbols_for_file(&self, file_id: i64) -> Result<Vec<SymbolRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SYMBOL_COLUMNS} FROM symbols WHERE file_id = ? ORDER BY id"))?;
        let rows = stmt.query_map(params![file_id], symbol_from_row)?;
        rows.collect()
    }

    pub fn symbol(&self, file_id: i64, symbol_path: &str) -> Result<Option<SymbolRecord>> {
        select_symbol(&self.conn, file_id, symbol_path)
    }
}
