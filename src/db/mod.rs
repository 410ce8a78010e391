//! SQLite store for parser batches, files, symbols and chunk slices
use rusqlite::{Connection, OptionalExtension, Result, params};
use std::path::Path;
use tracing::info;

pub mod chunk_slices;
pub mod files;
pub mod models;
pub mod symbols;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id TEXT PRIMARY KEY,
    ref TEXT,
    generated_at DATETIME NOT NULL,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    repo_path TEXT NOT NULL UNIQUE,
    lang TEXT NOT NULL,
    file_sha TEXT NOT NULL,
    mtime_ns INTEGER,
    size_bytes INTEGER,
    FOREIGN KEY (batch_id) REFERENCES batches(id)
);

CREATE INDEX IF NOT EXISTS idx_files_batch ON files(batch_id);

CREATE TABLE IF NOT EXISTS symbols (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    parent_id INTEGER,
    kind TEXT NOT NULL,
    symbol_path TEXT NOT NULL,
    start_line INTEGER,
    end_line INTEGER,
    symbol_sha TEXT NOT NULL,
    symbol_norm_sha TEXT,
    docstring TEXT,
    tokens INTEGER NOT NULL DEFAULT 0,
    first_seen_batch TEXT NOT NULL,
    last_seen_batch TEXT NOT NULL,
    UNIQUE(file_id, symbol_path),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE,
    FOREIGN KEY (parent_id) REFERENCES symbols(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_id);
CREATE INDEX IF NOT EXISTS idx_symbols_parent ON symbols(parent_id);

CREATE TABLE IF NOT EXISTS chunk_slices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    file_id INTEGER NOT NULL,
    symbol_id INTEGER,
    parent_symbol_id INTEGER,
    chunk_id TEXT NOT NULL,
    handler_name TEXT NOT NULL,
    handler_version TEXT NOT NULL,
    part_index INTEGER NOT NULL,
    part_total INTEGER NOT NULL,
    start_line INTEGER,
    end_line INTEGER,
    start_byte INTEGER,
    end_byte INTEGER,
    token_count INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    content_norm_hash TEXT,
    content_text TEXT NOT NULL,
    overflow_is_truncated INTEGER NOT NULL DEFAULT 0,
    overflow_reason TEXT,
    metadata_json TEXT,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    first_seen_batch TEXT NOT NULL,
    last_seen_batch TEXT NOT NULL,
    UNIQUE(batch_id, file_id, chunk_id, part_index),
    FOREIGN KEY (batch_id) REFERENCES batches(id),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE,
    FOREIGN KEY (symbol_id) REFERENCES symbols(id) ON DELETE SET NULL,
    FOREIGN KEY (parent_symbol_id) REFERENCES symbols(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_slices_file_chunk ON chunk_slices(file_id, chunk_id, part_index);
CREATE INDEX IF NOT EXISTS idx_slices_batch ON chunk_slices(batch_id);
CREATE INDEX IF NOT EXISTS idx_slices_last_seen ON chunk_slices(last_seen_batch);
"#;

/// A wrapper around a SQLite connection initialized with the parser schema.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing database: {}", path.display());

        let conn = Connection::open(path)?;
        let db = Self::init(conn)?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Record a batch row; re-registering an existing id refreshes its details.
    pub fn ensure_batch(
        &self,
        batch_id: &str,
        git_ref: Option<&str>,
        generated_at: chrono::DateTime<chrono::Utc>,
        notes: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO batches (id, ref, generated_at, notes)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                ref = COALESCE(excluded.ref, batches.ref),
                notes = COALESCE(excluded.notes, batches.notes)
            "#,
            params![batch_id, git_ref, generated_at, notes],
        )?;
        Ok(())
    }

    pub fn batch_exists(&self, batch_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM batches WHERE id = ?", params![batch_id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn batch(&self, batch_id: &str) -> Result<Option<models::BatchRecord>> {
        self.conn
            .query_row(
                "SELECT id, ref, generated_at, notes FROM batches WHERE id = ?",
                params![batch_id],
                |row| {
                    Ok(models::BatchRecord {
                        id: row.get(0)?,
                        git_ref: row.get(1)?,
                        generated_at: row.get(2)?,
                        notes: row.get(3)?,
                    })
                },
            )
            .optional()
    }

    /// Drop the batch row once no file references it.
    pub fn delete_batch_if_unused(&self, batch_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            r#"
            DELETE FROM batches
            WHERE id = ?1
              AND NOT EXISTS (SELECT 1 FROM files WHERE batch_id = ?1)
              AND NOT EXISTS (SELECT 1 FROM chunk_slices WHERE batch_id = ?1)
            "#,
            params![batch_id],
        )?;
        Ok(rows > 0)
    }
}
