use super::{Db, models::*};
use rusqlite::{Connection, OptionalExtension, Result, params};

/// Insert or refresh the row for `file.repo_path`, returning its stable id.
pub(crate) fn upsert_file(conn: &Connection, file: &FileWrite<'_>) -> Result<i64> {
    conn.query_row(
        r#"
        INSERT INTO files (batch_id, repo_path, lang, file_sha, mtime_ns, size_bytes)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(repo_path) DO UPDATE SET
            batch_id = excluded.batch_id,
            lang = excluded.lang,
            file_sha = excluded.file_sha,
            mtime_ns = excluded.mtime_ns,
            size_bytes = excluded.size_bytes
        RETURNING id
        "#,
        params![
            file.batch_id,
            file.repo_path,
            file.lang,
            file.file_sha,
            file.mtime_ns,
            file.size_bytes
        ],
        |row| row.get(0),
    )
}

fn file_from_row(row: &rusqlite::Row<'_>) -> Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        repo_path: row.get(2)?,
        lang: row.get(3)?,
        file_sha: row.get(4)?,
        mtime_ns: row.get(5)?,
        size_bytes: row.get(6)?,
    })
}

impl Db {
    pub fn upsert_file(&self, file: &FileWrite<'_>) -> Result<i64> {
        upsert_file(&self.conn, file)
    }

    pub fn file_id(&self, repo_path: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM files WHERE repo_path = ?",
                params![repo_path],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn file(&self, repo_path: &str) -> Result<Option<FileRecord>> {
        self.conn
            .query_row(
                "SELECT id, batch_id, repo_path, lang, file_sha, mtime_ns, size_bytes FROM files WHERE repo_path = ?",
                params![repo_path],
                file_from_row,
            )
            .optional()
    }

    /// All files ordered by path.
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, batch_id, repo_path, lang, file_sha, mtime_ns, size_bytes FROM files ORDER BY repo_path",
        )?;
        let rows = stmt.query_map([], file_from_row)?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn write<'a>(batch: &'a str, sha: &'a str) -> FileWrite<'a> {
        FileWrite {
            batch_id: batch,
            repo_path: "src/app.py",
            lang: "python",
            file_sha: sha,
            mtime_ns: Some(1),
            size_bytes: Some(10),
        }
    }

    #[test]
    fn test_upsert_keeps_id() {
        let db = Db::open_in_memory().unwrap();
        db.ensure_batch("b1", None, Utc::now(), None).unwrap();
        db.ensure_batch("b2", None, Utc::now(), None).unwrap();

        let first = db.upsert_file(&write("b1", "aaa")).unwrap();
        let second = db.upsert_file(&write("b2", "bbb")).unwrap();
        assert_eq!(first, second);

        let file = db.file("src/app.py").unwrap().unwrap();
        assert_eq!(file.batch_id, "b2");
        assert_eq!(file.file_sha, "bbb");
        assert_eq!(db.file_id("missing.py").unwrap(), None);
        assert_eq!(db.list_files().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_requires_batch() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.upsert_file(&write("nope", "aaa")).is_err());
    }
}
