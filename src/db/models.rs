use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub id: String,
    pub git_ref: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Values written to `files` for one staged file.
#[derive(Debug, Clone)]
pub struct FileWrite<'a> {
    pub batch_id: &'a str,
    pub repo_path: &'a str,
    pub lang: &'a str,
    pub file_sha: &'a str,
    pub mtime_ns: Option<i64>,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    pub batch_id: String,
    pub repo_path: String,
    pub lang: String,
    pub file_sha: String,
    pub mtime_ns: Option<i64>,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRecord {
    pub id: i64,
    pub file_id: i64,
    pub parent_id: Option<i64>,
    pub kind: String,
    /// Handler-local symbol id.
    pub symbol_path: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub symbol_sha: String,
    pub symbol_norm_sha: Option<String>,
    pub docstring: Option<String>,
    pub tokens: i64,
    pub first_seen_batch: String,
    pub last_seen_batch: String,
}

impl SymbolRecord {
    /// True when the content columns match; ids and batch markers are ignored.
    pub fn same_content(&self, other: &SymbolRecord) -> bool {
        self.kind == other.kind
            && self.start_line == other.start_line
            && self.end_line == other.end_line
            && self.symbol_sha == other.symbol_sha
            && self.symbol_norm_sha == other.symbol_norm_sha
            && self.docstring == other.docstring
            && self.tokens == other.tokens
    }
}

/// One persisted part of a logical chunk. `id` is ignored on write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSlice {
    pub id: i64,
    pub batch_id: String,
    pub file_id: i64,
    pub symbol_id: Option<i64>,
    pub parent_symbol_id: Option<i64>,
    pub chunk_id: String,
    pub handler_name: String,
    pub handler_version: String,
    pub part_index: i64,
    pub part_total: i64,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub start_byte: Option<i64>,
    pub end_byte: Option<i64>,
    pub token_count: i64,
    pub content_hash: String,
    pub content_norm_hash: Option<String>,
    pub content_text: String,
    pub overflow_is_truncated: bool,
    pub overflow_reason: Option<String>,
    pub metadata_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub first_seen_batch: String,
    pub last_seen_batch: String,
}

impl ChunkSlice {
    /// Compare everything except identity, timestamps and batch markers.
    pub fn same_content(&self, other: &ChunkSlice) -> bool {
        self.file_id == other.file_id
            && self.chunk_id == other.chunk_id
            && self.handler_name == other.handler_name
            && self.handler_version == other.handler_version
            && self.symbol_id == other.symbol_id
            && self.parent_symbol_id == other.parent_symbol_id
            && self.part_index == other.part_index
            && self.part_total == other.part_total
            && self.start_line == other.start_line
            && self.end_line == other.end_line
            && self.start_byte == other.start_byte
            && self.end_byte == other.end_byte
            && self.token_count == other.token_count
            && self.content_hash == other.content_hash
            && self.content_norm_hash == other.content_norm_hash
            && self.content_text == other.content_text
            && self.overflow_is_truncated == other.overflow_is_truncated
            && self.overflow_reason == other.overflow_reason
            && self.metadata_json == other.metadata_json
    }
}

/// Columns the health check reads for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceSummary {
    pub chunk_id: String,
    pub part_index: i64,
    pub part_total: i64,
    pub metadata_json: Option<String>,
}
