//! Handler contract shared by every language handler.
//!
//! A handler turns one file (or one delegated view of a file) into a
//! [`HandlerResult`]: the file descriptor, an ordered symbol list with
//! parents before children, and chunks in document order.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tree_sitter::{Language, Parser};

use crate::config::{Config, TokenLimit};
use crate::error::{ParserError, Result};
use crate::meta;
use crate::parser::hashing;
use crate::parser::health::HealthStatus;
use crate::parser::metadata::{Metadata, MetadataExt};
use crate::parser::registry::{HandlerProbe, HandlerRegistry};
use crate::parser::tokenizer::TokenEncoder;

pub mod css;
pub mod front_matter;
pub mod html;
pub mod javascript;
pub mod markdown;
pub mod python;
pub mod text;

/// File-level descriptor produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFile {
    /// Path relative to the traversal root.
    pub path: PathBuf,
    pub language: String,
    pub encoding: String,
    /// sha256 of the raw bytes.
    pub checksum: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSymbol {
    /// Handler-local identifier, stable across runs for the same content.
    pub symbol_id: String,
    pub name: String,
    pub kind: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub docstring: Option<String>,
    pub parent_id: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerChunk {
    pub chunk_id: String,
    pub text: String,
    pub token_count: usize,
    /// Byte offsets into the handler's view.
    pub start_offset: usize,
    pub end_offset: usize,
    pub part_index: usize,
    pub parent_symbol_id: Option<String>,
    /// Handler that processes this chunk's text further.
    pub delegate: Option<String>,
    pub metadata: Metadata,
}

impl HandlerChunk {
    /// A single-part chunk spanning `start..end` of `view`.
    pub fn new(chunk_id: impl Into<String>, view: &str, start: usize, end: usize) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            text: view[start..end].to_string(),
            token_count: 0,
            start_offset: start,
            end_offset: end,
            part_index: 0,
            parent_symbol_id: None,
            delegate: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, symbol_id: Option<&str>) -> Self {
        self.parent_symbol_id = symbol_id.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResult {
    pub file: HandlerFile,
    pub symbols: Vec<HandlerSymbol>,
    pub chunks: Vec<HandlerChunk>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl HandlerResult {
    pub fn empty(file: HandlerFile, warnings: Vec<String>, errors: Vec<String>) -> Self {
        Self {
            file,
            symbols: Vec::new(),
            chunks: Vec::new(),
            warnings,
            errors,
        }
    }

    /// Result for a file that could not be read at all.
    pub fn unreadable(ctx: &ParseContext<'_>, path: &Path, language: &str, err: &ParserError) -> Self {
        let file = HandlerFile {
            path: ctx.relative_path(path),
            language: language.to_string(),
            encoding: "utf-8".to_string(),
            checksum: String::new(),
            metadata: Metadata::new(),
        };
        Self::empty(file, Vec::new(), vec![err.to_string()])
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Contract implemented by each language handler.
///
/// Handlers never return `Err`: dependency and structural failures go to
/// `HandlerResult::errors`, budget issues to `warnings`.
pub trait ParserHandler: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn parse(&self, path: &Path, ctx: &ParseContext<'_>) -> HandlerResult;
}

/// Run-scoped memo of handler instances used by delegation.
#[derive(Default)]
pub struct HandlerCache {
    handlers: Mutex<HashMap<String, Arc<dyn ParserHandler>>>,
}

impl HandlerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handler `name`, building it through the registry on first use.
    pub fn get_or_create(&self, registry: &HandlerRegistry, name: &str) -> Result<Arc<dyn ParserHandler>> {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handler) = handlers.get(name) {
            return Ok(Arc::clone(handler));
        }
        let handler: Arc<dyn ParserHandler> = Arc::from(registry.instantiate(name)?);
        handlers.insert(name.to_string(), Arc::clone(&handler));
        Ok(handler)
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Everything a handler may consult while parsing.
#[derive(Clone, Copy)]
pub struct ParseContext<'a> {
    pub source: &'a str,
    pub root: &'a Path,
    pub config: &'a Config,
    pub encoder: &'a dyn TokenEncoder,
    pub registry: &'a HandlerRegistry,
    pub cache: &'a HandlerCache,
    /// Number of delegation hops above this parse.
    pub depth: usize,
    /// Synthetic content used instead of the file on disk for delegated parses.
    pub view: Option<&'a str>,
}

/// Decoded source handed to a handler.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub file: HandlerFile,
    pub text: String,
    pub warnings: Vec<String>,
}

impl<'a> ParseContext<'a> {
    /// Context for a delegated parse of `view`.
    #[must_use]
    pub fn delegated(&self, view: &'a str) -> Self {
        Self {
            depth: self.depth + 1,
            view: Some(view),
            ..*self
        }
    }

    pub fn relative_path(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.root).unwrap_or(path).to_path_buf()
    }

    /// Resolved token budget for `handler`.
    pub fn max_tokens(&self, handler: &str) -> usize {
        match self.config.handler_max_tokens(handler) {
            TokenLimit::Limit(n) => n,
            TokenLimit::Auto => match self.config.general_max_tokens {
                TokenLimit::Limit(n) => n,
                TokenLimit::Auto => self.encoder.default_budget(),
            },
        }
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.encoder.count(text)
    }

    /// Read `path` (or the delegated view) once and describe it.
    pub fn read_source(&self, path: &Path, language: &str) -> Result<LoadedSource> {
        let mut warnings = Vec::new();
        let (text, checksum) = match self.view {
            Some(view) => (view.to_string(), hashing::checksum(view.as_bytes())),
            None => {
                let bytes = fs::read(path).map_err(|e| ParserError::io(path, e))?;
                let checksum = hashing::checksum(&bytes);
                let text = match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(err) => {
                        warnings.push(format!(
                            "{} is not valid utf-8; invalid bytes were replaced",
                            path.display()
                        ));
                        String::from_utf8_lossy(err.as_bytes()).into_owned()
                    }
                };
                (text, checksum)
            }
        };
        let metadata = meta! {
            "size_bytes" => text.len(),
            "line_count" => text.lines().count(),
        };
        let file = HandlerFile {
            path: self.relative_path(path),
            language: language.to_string(),
            encoding: "utf-8".to_string(),
            checksum,
            metadata,
        };
        Ok(LoadedSource { file, text, warnings })
    }
}

/// Byte offset → 1-based line lookups over one view.
#[derive(Debug, Clone)]
pub struct LineIndex {
    newlines: Vec<usize>,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let newlines = text
            .bytes()
            .enumerate()
            .filter_map(|(i, b)| (b == b'\n').then_some(i))
            .collect();
        Self { newlines }
    }

    /// Line containing byte `offset`.
    pub fn line(&self, offset: usize) -> usize {
        self.newlines.partition_point(|&nl| nl < offset) + 1
    }

    /// First and last line touched by `start..end`.
    pub fn span(&self, start: usize, end: usize) -> (usize, usize) {
        let last = if end > start { end - 1 } else { start };
        (self.line(start), self.line(last))
    }
}

/// Record `start_line`/`end_line` for `start..end` in `metadata`.
pub(crate) fn put_lines(metadata: &mut Metadata, lines: &LineIndex, start: usize, end: usize) {
    let (start_line, end_line) = lines.span(start, end);
    metadata.put("start_line", start_line);
    metadata.put("end_line", end_line);
}

/// Dotted module-style name for a relative path without its extension.
pub(crate) fn dotted_name(path: &Path) -> String {
    let stem = path.with_extension("");
    let parts: Vec<String> = stem
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .filter(|s| !s.is_empty() && *s != "." && *s != "/")
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        "module".to_string()
    } else {
        parts.join(".")
    }
}

/// Build a tree-sitter parser for `language`.
pub(crate) fn grammar_parser(language: &Language) -> std::result::Result<Parser, String> {
    let mut parser = Parser::new();
    parser.set_language(language).map_err(|e| e.to_string())?;
    Ok(parser)
}

/// Probe result for a grammar-backed handler.
pub(crate) fn grammar_probe(handler: &str, language: &Language) -> HandlerProbe {
    match grammar_parser(language) {
        Ok(_) => HandlerProbe::ok(format!("{handler} grammar loaded")),
        Err(reason) => HandlerProbe {
            status: HealthStatus::Error,
            summary: format!("{handler} grammar unavailable: {reason}"),
            warnings: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_index() {
        let text = "a\nbc\n\nd";
        let lines = LineIndex::new(text);
        assert_eq!(lines.line(0), 1);
        assert_eq!(lines.line(1), 1);
        assert_eq!(lines.line(2), 2);
        assert_eq!(lines.line(6), 4);
        assert_eq!(lines.span(0, 5), (1, 2));
        assert_eq!(lines.span(2, 2), (2, 2));
    }

    #[test]
    fn test_dotted_name() {
        assert_eq!(dotted_name(Path::new("pkg/mod/util.py")), "pkg.mod.util");
        assert_eq!(dotted_name(Path::new("styles.css")), "styles");
        assert_eq!(dotted_name(Path::new("")), "module");
    }

    #[test]
    fn test_chunk_builder() {
        let chunk = HandlerChunk::new("c", "hello world", 6, 11)
            .with_parent(Some("sym"))
            .with_metadata(meta! { "kind" => "word" });
        assert_eq!(chunk.text, "world");
        assert_eq!(chunk.parent_symbol_id.as_deref(), Some("sym"));
        assert_eq!(chunk.metadata.get_str("kind"), Some("word"));
    }
}
