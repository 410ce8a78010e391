//! Plain-text handler and the registry's fallback target.
use std::path::Path;

use crate::meta;
use crate::parser::handlers::{
    HandlerChunk, HandlerResult, LineIndex, ParseContext, ParserHandler, put_lines,
};
use crate::parser::registry::ParserHandlerDescriptor;
use crate::parser::splitter;

pub const NAME: &str = "text";
pub const VERSION: &str = "1.0.0";

pub fn descriptor() -> ParserHandlerDescriptor {
    ParserHandlerDescriptor::new(NAME, VERSION, "Plain text", || Box::new(TextHandler::new()))
        .extensions(&["txt", "log", "ini", "toml", "cfg"])
}

#[derive(Debug, Default)]
pub struct TextHandler;

impl TextHandler {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Paragraph,
    Indent,
    Fallback,
}

impl Strategy {
    fn label(self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Indent => "indent",
            Self::Fallback => "fallback",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Indent => "indent_block",
            Self::Fallback => "fallback",
        }
    }
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Blank-line separated blocks; each block keeps its trailing blank lines.
fn paragraph_blocks(text: &str) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut block_start = 0;
    let mut has_content = false;
    let mut after_blank = false;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if is_blank(line) {
            after_blank = has_content;
        } else {
            if after_blank {
                blocks.push((block_start, offset));
                block_start = offset;
                after_blank = false;
            }
            has_content = true;
        }
        offset += line.len();
    }
    if block_start < text.len() {
        blocks.push((block_start, text.len()));
    }
    blocks
}

/// Blocks that start whenever a column-0 line follows indented lines.
fn indent_blocks(text: &str) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut block_start = 0;
    let mut seen_indented = false;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if !is_blank(line) {
            let indented = line.starts_with([' ', '\t']);
            if !indented && seen_indented && offset > block_start {
                blocks.push((block_start, offset));
                block_start = offset;
                seen_indented = false;
            }
            seen_indented |= indented;
        }
        offset += line.len();
    }
    if block_start < text.len() {
        blocks.push((block_start, text.len()));
    }
    blocks
}

impl ParserHandler for TextHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn parse(&self, path: &Path, ctx: &ParseContext<'_>) -> HandlerResult {
        let source = match ctx.read_source(path, NAME) {
            Ok(source) => source,
            Err(err) => return HandlerResult::unreadable(ctx, path, NAME, &err),
        };
        let text = source.text.as_str();
        let mut result = HandlerResult::empty(source.file.clone(), source.warnings.clone(), Vec::new());
        if text.trim().is_empty() {
            return result;
        }

        let budget = ctx.max_tokens(NAME);
        let lines = LineIndex::new(text);

        let mut strategy = Strategy::Paragraph;
        let mut blocks = paragraph_blocks(text);
        if blocks.len() == 1 && ctx.count_tokens(text) > budget {
            blocks = indent_blocks(text);
            strategy = Strategy::Indent;
            if blocks.len() <= 1 {
                blocks = vec![(0, text.len())];
                strategy = Strategy::Fallback;
            }
        }

        for (start, end) in blocks {
            let chunk_id = format!("text:{}:{start}:{end}", strategy.label());
            let mut chunk = HandlerChunk::new(chunk_id.clone(), text, start, end).with_metadata(meta! {
                "kind" => strategy.kind(),
                "strategy" => strategy.label(),
            });
            put_lines(&mut chunk.metadata, &lines, start, end);

            let parts = splitter::split_chunk(chunk, ctx.encoder, budget, Some(&lines));
            if parts.len() > 1 {
                result.warnings.push(splitter::split_warning(&chunk_id, parts.len()));
            }
            result.chunks.extend(parts);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HandlerConfig, TokenLimit};
    use crate::parser::metadata::MetadataExt;
    use crate::parser::testing::parse_str;

    #[test]
    fn test_paragraphs_keep_trailing_separator() {
        let text = "first para\nline two\n\nsecond\n\n\nthird\n";
        let result = parse_str(NAME, "notes.txt", text, &Config::default());

        assert_eq!(result.chunks.len(), 3);
        assert_eq!(result.chunks[0].text, "first para\nline two\n\n");
        assert_eq!(result.chunks[1].text, "second\n\n\n");
        assert_eq!(result.chunks[2].text, "third\n");
        let joined: String = result.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);

        let first = &result.chunks[0];
        assert_eq!(first.chunk_id, "text:paragraph:0:21");
        assert_eq!(first.metadata.get_str("kind"), Some("paragraph"));
        assert_eq!(first.metadata.get_int("start_line"), Some(1));
        assert_eq!(first.metadata.get_int("end_line"), Some(3));
        assert_eq!(first.metadata.get_int("part_total"), Some(1));
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        let result = parse_str(NAME, "empty.txt", "\n  \n", &Config::default());
        assert!(result.chunks.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_indent_blocks_used_for_single_oversized_block() {
        let text = "alpha:\n  one two\n  three\nbeta:\n  four five\n";
        let mut config = Config::default();
        config.handlers.insert(
            NAME.to_string(),
            HandlerConfig {
                enabled: true,
                max_tokens: Some(TokenLimit::Limit(6)),
            },
        );
        let result = parse_str(NAME, "conf.cfg", text, &config);

        assert_eq!(result.chunks.len(), 2);
        assert_eq!(result.chunks[0].metadata.get_str("kind"), Some("indent_block"));
        assert_eq!(result.chunks[0].text, "alpha:\n  one two\n  three\n");
        assert_eq!(result.chunks[1].metadata.get_int("start_line"), Some(4));
    }

    #[test]
    fn test_fallback_is_split_by_budget() {
        let text = "a b c\nd e f\ng h i\n";
        let mut config = Config::default();
        config.general_max_tokens = TokenLimit::Limit(4);
        let result = parse_str(NAME, "flat.txt", text, &config);

        assert!(result.chunks.len() > 1);
        assert!(result.chunks.iter().all(|c| c.metadata.get_str("strategy") == Some("fallback")));
        for (i, chunk) in result.chunks.iter().enumerate() {
            assert_eq!(chunk.part_index, i);
            assert_eq!(chunk.chunk_id, result.chunks[0].chunk_id);
        }
        assert_eq!(result.warnings.len(), 1);
    }
}
