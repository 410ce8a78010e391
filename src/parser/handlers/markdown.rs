//! Markdown handler: front matter, heading hierarchy, sections and fences.
//!
//! Headings and fences are located with pulldown-cmark offset events, so a
//! `#` line inside a fence never opens a section.
use std::path::Path;

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

use crate::meta;
use crate::parser::delegation::{self, DelegationRequest};
use crate::parser::handlers::front_matter;
use crate::parser::handlers::{
    HandlerChunk, HandlerResult, HandlerSymbol, LineIndex, ParseContext, ParserHandler, put_lines,
};
use crate::parser::metadata::MetadataExt;
use crate::parser::registry::ParserHandlerDescriptor;
use crate::parser::splitter;

pub const NAME: &str = "markdown";
pub const VERSION: &str = "1.0.0";

pub fn descriptor() -> ParserHandlerDescriptor {
    ParserHandlerDescriptor::new(NAME, VERSION, "Markdown", || Box::new(MarkdownHandler::new()))
        .extensions(&["md", "markdown", "mdown", "mkdn", "mkd"])
}

#[derive(Debug, Default)]
pub struct MarkdownHandler;

impl MarkdownHandler {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
struct Heading {
    start: usize,
    level: usize,
    title: String,
}

#[derive(Debug, Clone)]
struct Fence {
    info: String,
    content_start: usize,
    content_end: usize,
}

/// Headings and fences of `text[base..]`, with offsets into `text`.
fn scan(text: &str, base: usize) -> (Vec<Heading>, Vec<Fence>) {
    let mut headings = Vec::new();
    let mut fences = Vec::new();
    let mut open_heading: Option<Heading> = None;
    let mut open_fence: Option<(String, Option<(usize, usize)>)> = None;

    for (event, range) in Parser::new_ext(&text[base..], Options::empty()).into_offset_iter() {
        let (start, end) = (base + range.start, base + range.end);
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                open_heading = Some(Heading {
                    start,
                    level: level as usize,
                    title: String::new(),
                });
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(mut heading) = open_heading.take() {
                    heading.title = heading.title.trim().to_string();
                    headings.push(heading);
                }
            }
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                open_fence = Some((info.trim().to_string(), None));
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((info, Some((content_start, content_end)))) = open_fence.take() {
                    fences.push(Fence {
                        info,
                        content_start,
                        content_end,
                    });
                }
            }
            Event::Text(fragment) | Event::Code(fragment) => {
                if let Some(heading) = open_heading.as_mut() {
                    heading.title.push_str(&fragment);
                } else if let Some((_, span)) = open_fence.as_mut() {
                    *span = Some(match *span {
                        Some((s, e)) => (s.min(start), e.max(end)),
                        None => (start, end),
                    });
                }
            }
            _ => {}
        }
    }
    (headings, fences)
}

impl MarkdownHandler {
    #[allow(clippy::too_many_arguments)]
    fn emit_fence(
        &self,
        path: &Path,
        ctx: &ParseContext<'_>,
        text: &str,
        lines: &LineIndex,
        fence: &Fence,
        heading_symbol: &str,
        section_chunk: &str,
        result: &mut HandlerResult,
    ) {
        let body = &text[fence.content_start..fence.content_end];
        if body.trim().is_empty() {
            return;
        }
        let language = fence.info.split_whitespace().next().unwrap_or("").to_string();
        let fence_meta = meta! {
            "kind" => "fenced_code",
            "language" => language.as_str(),
            "fence_info" => fence.info.as_str(),
            "heading_symbol" => heading_symbol,
        };

        match ctx.registry.delegate_for(&language) {
            Some(delegate) => {
                let outcome = delegation::delegate(
                    path,
                    ctx,
                    DelegationRequest {
                        delegate,
                        parent_handler: NAME,
                        component: Some("fence"),
                        marker: None,
                        text: body,
                        start_offset: fence.content_start,
                        end_offset: fence.content_end,
                        start_line: lines.line(fence.content_start),
                        parent_symbol: Some(heading_symbol),
                        parent_chunk: Some(section_chunk),
                        metadata: fence_meta,
                    },
                );
                result.symbols.extend(outcome.symbols);
                result.chunks.extend(outcome.chunks);
                result.warnings.extend(outcome.warnings);
            }
            None => {
                let chunk_id = format!("markdown:fence:{}:{}", fence.content_start, fence.content_end);
                let mut chunk = HandlerChunk::new(chunk_id, text, fence.content_start, fence.content_end)
                    .with_parent(Some(heading_symbol))
                    .with_metadata(fence_meta);
                put_lines(&mut chunk.metadata, lines, fence.content_start, fence.content_end);
                result.chunks.extend(splitter::split_chunk(
                    chunk,
                    ctx.encoder,
                    ctx.max_tokens(NAME),
                    Some(lines),
                ));
            }
        }
    }
}

impl ParserHandler for MarkdownHandler {
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
        let lines = LineIndex::new(text);
        let budget = ctx.max_tokens(NAME);

        let mut body_start = 0;
        if let Some(fm) = front_matter::locate(text) {
            let mut chunk = HandlerChunk::new("markdown:front-matter", text, 0, fm.end).with_metadata(meta! {
                "kind" => "front_matter",
                "front_matter_format" => fm.format.to_string(),
            });
            match front_matter::keys(&fm) {
                Ok(keys) => chunk.metadata.put("front_matter_keys", keys),
                Err(err) => result
                    .warnings
                    .push(format!("front matter could not be parsed: {err}")),
            }
            put_lines(&mut chunk.metadata, &lines, 0, fm.end);
            result
                .chunks
                .extend(splitter::split_chunk(chunk, ctx.encoder, budget, Some(&lines)));
            body_start = fm.end;
        }

        let (headings, fences) = scan(text, body_start);

        if headings.is_empty() {
            if !text[body_start..].trim().is_empty() {
                let chunk_id = format!("markdown:body:{body_start}:{}", text.len());
                let mut chunk = HandlerChunk::new(chunk_id, text, body_start, text.len()).with_metadata(meta! {
                    "kind" => "body",
                    "strategy" => "fallback",
                });
                put_lines(&mut chunk.metadata, &lines, body_start, text.len());
                result
                    .chunks
                    .extend(splitter::split_chunk(chunk, ctx.encoder, budget, Some(&lines)));
            }
            return result;
        }

        let has_intro = !text[body_start..headings[0].start].trim().is_empty();

        // (level, symbol id) of the open ancestors
        let mut stack: Vec<(usize, String)> = Vec::new();
        for (idx, heading) in headings.iter().enumerate() {
            let symbol_id = format!("markdown:heading:{}", heading.start);
            while stack.last().is_some_and(|(level, _)| *level >= heading.level) {
                stack.pop();
            }
            let symbol_end = headings[idx + 1..]
                .iter()
                .find(|h| h.level <= heading.level)
                .map_or(text.len(), |h| h.start);
            let line = lines.line(heading.start);
            result.symbols.push(HandlerSymbol {
                symbol_id: symbol_id.clone(),
                name: heading.title.clone(),
                kind: "heading".to_string(),
                start_offset: heading.start,
                end_offset: symbol_end,
                docstring: None,
                parent_id: stack.last().map(|(_, id)| id.clone()),
                metadata: meta! { "level" => heading.level, "line" => line },
            });
            stack.push((heading.level, symbol_id.clone()));

            let intro_attached = idx == 0 && has_intro;
            let start = if intro_attached { body_start } else { heading.start };
            let end = headings.get(idx + 1).map_or(text.len(), |h| h.start);
            let section_id = format!("markdown:section:{start}:{end}");
            let mut chunk = HandlerChunk::new(section_id.clone(), text, start, end)
                .with_parent(Some(symbol_id.as_str()))
                .with_metadata(meta! {
                    "kind" => "section",
                    "heading_title" => heading.title.as_str(),
                    "heading_level" => heading.level,
                    "heading_line" => line,
                    "intro_attached" => intro_attached,
                });
            put_lines(&mut chunk.metadata, &lines, start, end);
            let parts = splitter::split_chunk(chunk, ctx.encoder, budget, Some(&lines));
            if parts.len() > 1 {
                let name = if heading.title.is_empty() { section_id.as_str() } else { heading.title.as_str() };
                result.warnings.push(splitter::split_warning(name, parts.len()));
            }
            result.chunks.extend(parts);

            for fence in fences
                .iter()
                .filter(|f| f.content_start >= start && f.content_start < end)
            {
                self.emit_fence(path, ctx, text, &lines, fence, &symbol_id, &section_id, &mut result);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::parser::testing::parse_str;

    #[test]
    fn test_heading_hierarchy_and_python_fence() {
        let text = "# H1\nfoo\n\n## H2\n```python\nprint(1)\n```\n";
        let result = parse_str(NAME, "README.md", text, &Config::default());
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        let headings: Vec<_> = result.symbols.iter().filter(|s| s.kind == "heading").collect();
        assert_eq!(headings.len(), 2);
        assert_eq!(headings[0].name, "H1");
        assert_eq!(headings[1].name, "H2");
        assert_eq!(headings[1].parent_id.as_deref(), Some(headings[0].symbol_id.as_str()));

        let h2_section = result
            .chunks
            .iter()
            .find(|c| c.metadata.get_str("heading_title") == Some("H2"))
            .unwrap();
        assert_eq!(h2_section.chunk_id, format!("markdown:section:10:{}", text.len()));

        let fence = result
            .chunks
            .iter()
            .find(|c| c.delegate.as_deref() == Some("python"))
            .unwrap();
        assert_eq!(fence.text, "print(1)\n");
        assert_eq!(fence.parent_symbol_id.as_deref(), Some(headings[1].symbol_id.as_str()));
        assert_eq!(
            fence.metadata.get_str("delegate_parent_chunk"),
            Some(h2_section.chunk_id.as_str())
        );
        assert!(result.chunks.iter().all(|c| c.metadata.get_str("kind") != Some("front_matter")));
    }

    #[test]
    fn test_no_headings_falls_back_to_body() {
        let result = parse_str(NAME, "notes.md", "just some prose\n\nmore prose\n", &Config::default());
        assert!(result.symbols.is_empty());
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].metadata.get_str("kind"), Some("body"));
        assert_eq!(result.chunks[0].metadata.get_str("strategy"), Some("fallback"));
    }

    #[test]
    fn test_front_matter_and_intro() {
        let text = "---\ntitle: Doc\n---\nIntro line.\n\n# Title\nBody\n";
        let result = parse_str(NAME, "doc.md", text, &Config::default());

        let fm = &result.chunks[0];
        assert_eq!(fm.chunk_id, "markdown:front-matter");
        assert_eq!(fm.metadata.get_str("front_matter_format"), Some("yaml"));
        assert_eq!(
            fm.metadata.get("front_matter_keys"),
            Some(&vec!["title".to_string()].into())
        );

        let section = &result.chunks[1];
        assert!(section.metadata.get_flag("intro_attached"));
        assert!(section.text.starts_with("Intro line."));
    }

    #[test]
    fn test_heading_inside_fence_is_ignored_and_unknown_language_is_plain() {
        let text = "# Real\n```cobol\n# not a heading\n```\n";
        let result = parse_str(NAME, "x.md", text, &Config::default());
        assert_eq!(result.symbols.len(), 1);

        let fence = result
            .chunks
            .iter()
            .find(|c| c.metadata.get_str("kind") == Some("fenced_code"))
            .unwrap();
        assert!(fence.delegate.is_none());
        assert_eq!(fence.metadata.get_str("language"), Some("cobol"));
        assert_eq!(fence.text, "# not a heading\n");
    }
}
