/// Error types shared by the parser core.
///
/// Handlers never surface these: per-file problems travel inside
/// `HandlerResult::errors`. These variants cover registry, storage and
/// orchestration failures.
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while planning, persisting or reading parser output.
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("metadata serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid parser configuration: {0}")]
    Config(String),

    #[error("unknown handler {0:?}")]
    UnknownHandler(String),

    #[error("parser module is disabled")]
    ModuleDisabled,

    #[error("source {0:?} is not configured")]
    SourceNotConfigured(String),

    #[error("missing handler version for delegate {0:?}")]
    MissingHandlerVersion(String),

    #[error("symbol mapping missing for key {0:?}")]
    MissingSymbol(String),

    #[error("chunk integrity violated: {0}")]
    Integrity(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("traversal failed: {0}")]
    Traversal(String),

    #[error("invalid batch plan: {0}")]
    Plan(String),
}

impl ParserError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for parser operations.
pub type Result<T> = std::result::Result<T, ParserError>;
