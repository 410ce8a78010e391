//! CSS handler backed by tree-sitter-css.
//!
//! Rules with a selector list emit one chunk per top-level selector, all
//! sharing the rule body. At-rules become symbols whose name carries the
//! prelude; nested rules record the enclosing at-rule as `cascade`.
use std::path::Path;

use tree_sitter::{Language, Node};

use crate::meta;
use crate::parser::handlers::{
    HandlerChunk, HandlerResult, HandlerSymbol, LineIndex, ParseContext, ParserHandler, dotted_name,
    grammar_parser, grammar_probe, put_lines,
};
use crate::parser::metadata::MetadataExt;
use crate::parser::registry::{HandlerProbe, ParserHandlerDescriptor};
use crate::parser::splitter;

pub const NAME: &str = "css";
pub const VERSION: &str = "1.0.0";

const ROOT_SYMBOL: &str = "css:stylesheet";

fn language() -> Language {
    tree_sitter_css::LANGUAGE.into()
}

fn probe() -> HandlerProbe {
    grammar_probe(NAME, &language())
}

pub fn descriptor() -> ParserHandlerDescriptor {
    ParserHandlerDescriptor::new(NAME, VERSION, "CSS", || Box::new(CssHandler::new()))
        .extensions(&["css", "scss", "less"])
        .probe(probe)
}

#[derive(Debug, Default)]
pub struct CssHandler;

impl CssHandler {
    pub fn new() -> Self {
        Self
    }
}

/// Split a selector list on commas outside `()` and `[]`.
pub fn split_selectors(list: &str) -> Vec<String> {
    let mut selectors = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in list.chars() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth <= 0 => {
                selectors.push(collapse(&current));
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    selectors.push(collapse(&current));
    selectors.retain(|s| !s.is_empty());
    selectors
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_at_rule(kind: &str) -> bool {
    kind == "at_rule" || kind.ends_with("_statement")
}

struct CssWalker<'a, 'c> {
    path: &'a Path,
    text: &'a str,
    lines: LineIndex,
    ctx: &'a ParseContext<'c>,
    budget: usize,
    result: HandlerResult,
}

impl CssWalker<'_, '_> {
    fn slice(&self, node: Node<'_>) -> &str {
        &self.text[node.byte_range()]
    }

    fn push_chunk(&mut self, mut chunk: HandlerChunk, exact: bool) {
        put_lines(&mut chunk.metadata, &self.lines, chunk.start_offset, chunk.end_offset);
        let lines = exact.then_some(&self.lines);
        let chunk_id = chunk.chunk_id.clone();
        let parts = splitter::split_chunk(chunk, self.ctx.encoder, self.budget, lines);
        if parts.len() > 1 {
            self.result.warnings.push(splitter::split_warning(&chunk_id, parts.len()));
        }
        self.result.chunks.extend(parts);
    }

    fn push_symbol(&mut self, symbol_id: &str, name: String, kind: &str, node: Node<'_>, parent: Option<&str>) {
        let (start_line, end_line) = self.lines.span(node.start_byte(), node.end_byte());
        self.result.symbols.push(HandlerSymbol {
            symbol_id: symbol_id.to_string(),
            name,
            kind: kind.to_string(),
            start_offset: node.start_byte(),
            end_offset: node.end_byte(),
            docstring: None,
            parent_id: parent.map(str::to_string),
            metadata: meta! { "start_line" => start_line, "end_line" => end_line },
        });
    }

    fn walk_children(&mut self, node: Node<'_>, parent: Option<&str>, cascade: Option<&str>) {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            self.visit(child, parent, cascade);
        }
    }

    fn visit(&mut self, node: Node<'_>, parent: Option<&str>, cascade: Option<&str>) {
        match node.kind() {
            "rule_set" => self.rule(node, parent, cascade),
            "comment" | "js_comment" => {
                let chunk_id = format!("css:comment:{}:{}", node.start_byte(), node.end_byte());
                let mut metadata = meta! { "kind" => "comment" };
                if let Some(cascade) = cascade {
                    metadata.put("cascade", cascade);
                }
                let chunk = HandlerChunk::new(chunk_id, self.text, node.start_byte(), node.end_byte())
                    .with_parent(parent)
                    .with_metadata(metadata);
                self.push_chunk(chunk, true);
            }
            "ERROR" => {
                let chunk_id = format!("css:error:{}:{}", node.start_byte(), node.end_byte());
                let line = self.lines.line(node.start_byte());
                self.result
                    .warnings
                    .push(format!("{}: css syntax error at line {line}", self.path.display()));
                let chunk = HandlerChunk::new(chunk_id, self.text, node.start_byte(), node.end_byte())
                    .with_parent(parent)
                    .with_metadata(meta! { "kind" => "error" });
                self.push_chunk(chunk, true);
            }
            kind if is_at_rule(kind) => self.at_rule(node, parent, cascade),
            _ => {}
        }
    }

    fn rule(&mut self, node: Node<'_>, parent: Option<&str>, cascade: Option<&str>) {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        let selectors_node = children.iter().find(|c| c.kind() == "selectors");
        let Some(block) = children.iter().find(|c| c.kind() == "block").copied() else {
            return;
        };
        let selector_list = selectors_node.map(|n| self.slice(*n)).unwrap_or_default();
        let selectors = split_selectors(selector_list);
        let body = self.slice(block).to_string();

        let symbol_id = format!("css:rule:{}", node.start_byte());
        self.push_symbol(&symbol_id, selectors.join(", "), "rule", node, parent);

        let total = selectors.len();
        for (index, selector) in selectors.iter().enumerate() {
            let chunk_id = format!("css:rule:{}:{}:{index}", node.start_byte(), node.end_byte());
            let mut metadata = meta! {
                "kind" => "rule",
                "selector" => selector.as_str(),
                "selector_index" => index,
                "selector_total" => total,
                "body" => body.as_str(),
            };
            if let Some(cascade) = cascade {
                metadata.put("cascade", cascade);
            }
            let mut chunk = HandlerChunk::new(chunk_id, self.text, node.start_byte(), node.end_byte())
                .with_parent(Some(symbol_id.as_str()))
                .with_metadata(metadata);
            let exact = total == 1;
            if !exact {
                chunk.text = format!("{selector} {body}");
            }
            self.push_chunk(chunk, exact);
        }

        // Nested rules (SCSS/LESS, CSS nesting)
        let mut block_cursor = block.walk();
        let nested: Vec<Node<'_>> = block
            .children(&mut block_cursor)
            .filter(|c| c.kind() == "rule_set" || is_at_rule(c.kind()))
            .collect();
        for child in nested {
            self.visit(child, Some(symbol_id.as_str()), cascade);
        }
    }

    fn at_rule(&mut self, node: Node<'_>, parent: Option<&str>, cascade: Option<&str>) {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        let Some(keyword) = children.first().copied() else {
            return;
        };
        let body = children
            .iter()
            .find(|c| matches!(c.kind(), "block" | "keyframe_block_list"))
            .copied();
        let prelude_end = body.map_or(node.end_byte(), |b| b.start_byte());
        let prelude = collapse(self.text[keyword.end_byte()..prelude_end].trim_end_matches(';'));
        let keyword_text = self.slice(keyword).trim().to_string();
        let label = if prelude.is_empty() {
            keyword_text.clone()
        } else {
            format!("{keyword_text} {prelude}")
        };

        let symbol_id = format!("css:at_rule:{}", node.start_byte());
        self.push_symbol(&symbol_id, label.clone(), "at_rule", node, parent);

        let header_end = body.map_or(node.end_byte(), |b| (b.start_byte() + 1).min(b.end_byte()));
        let chunk_id = format!("css:at_rule:{}:{header_end}", node.start_byte());
        let mut metadata = meta! {
            "kind" => "at_rule",
            "at_rule" => keyword_text.trim_start_matches('@'),
            "prelude" => prelude.as_str(),
        };
        if let Some(cascade) = cascade {
            metadata.put("cascade", cascade);
        }
        let chunk = HandlerChunk::new(chunk_id, self.text, node.start_byte(), header_end)
            .with_parent(Some(symbol_id.as_str()))
            .with_metadata(metadata);
        self.push_chunk(chunk, true);

        let nested_cascade = match cascade {
            Some(outer) => format!("{outer} > {label}"),
            None => label.clone(),
        };
        match body {
            Some(list) if list.kind() == "keyframe_block_list" => {
                self.keyframes(list, &symbol_id, &nested_cascade);
            }
            Some(block) => self.walk_children(block, Some(symbol_id.as_str()), Some(nested_cascade.as_str())),
            None => {}
        }
    }

    fn keyframes(&mut self, list: Node<'_>, symbol_id: &str, cascade: &str) {
        let mut cursor = list.walk();
        let frames: Vec<Node<'_>> = list.children(&mut cursor).collect();
        for frame in frames {
            if frame.kind() != "keyframe_block" {
                self.visit(frame, Some(symbol_id), Some(cascade));
                continue;
            }
            let selector = frame
                .child(0)
                .map(|n| collapse(self.slice(n)))
                .unwrap_or_default();
            let chunk_id = format!("css:keyframe:{}:{}", frame.start_byte(), frame.end_byte());
            let chunk = HandlerChunk::new(chunk_id, self.text, frame.start_byte(), frame.end_byte())
                .with_parent(Some(symbol_id))
                .with_metadata(meta! {
                    "kind" => "keyframe",
                    "selector" => selector,
                    "cascade" => cascade,
                });
            self.push_chunk(chunk, true);
        }
    }
}

impl ParserHandler for CssHandler {
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
        let mut parser = match grammar_parser(&language()) {
            Ok(parser) => parser,
            Err(reason) => {
                let error = format!("css handler requires the tree-sitter-css grammar: {reason}");
                return HandlerResult::empty(source.file, source.warnings, vec![error]);
            }
        };
        let Some(tree) = parser.parse(&source.text, None) else {
            let error = format!("{}: css parse was cancelled", path.display());
            return HandlerResult::empty(source.file, source.warnings, vec![error]);
        };

        let text = source.text.as_str();
        let mut walker = CssWalker {
            path,
            text,
            lines: LineIndex::new(text),
            ctx,
            budget: ctx.max_tokens(NAME),
            result: HandlerResult::empty(source.file.clone(), source.warnings.clone(), Vec::new()),
        };

        // A delegated stylesheet hangs off the delegating symbol instead of a root.
        let root_symbol = if ctx.depth == 0 {
            let root = tree.root_node();
            let name = dotted_name(&source.file.path);
            walker.push_symbol(ROOT_SYMBOL, name, "stylesheet", root, None);
            Some(ROOT_SYMBOL)
        } else {
            None
        };
        walker.walk_children(tree.root_node(), root_symbol, None);
        walker.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::parser::testing::parse_str;

    #[test]
    fn test_split_selectors() {
        assert_eq!(split_selectors(".a, .b"), vec![".a", ".b"]);
        assert_eq!(
            split_selectors("a:not(.x, .y),\n  b[data-k=\"1,2\"]"),
            vec!["a:not(.x, .y)", "b[data-k=\"1,2\"]"]
        );
    }

    #[test]
    fn test_selector_list_emits_one_chunk_per_selector() {
        let result = parse_str(NAME, "site.css", ".a, .b { color: red; }", &Config::default());
        assert!(result.errors.is_empty());

        let rules: Vec<_> = result
            .chunks
            .iter()
            .filter(|c| c.metadata.get_str("kind") == Some("rule"))
            .collect();
        assert_eq!(rules.len(), 2);
        let selectors: Vec<_> = rules.iter().filter_map(|c| c.metadata.get_str("selector")).collect();
        assert_eq!(selectors, vec![".a", ".b"]);
        assert_eq!(rules[0].metadata.get_str("body"), rules[1].metadata.get_str("body"));
        assert_eq!(rules[0].metadata.get_str("body"), Some("{ color: red; }"));
        assert_eq!(rules[1].text, ".b { color: red; }");

        assert_eq!(result.symbols[0].symbol_id, ROOT_SYMBOL);
        assert_eq!(result.symbols[0].kind, "stylesheet");
        assert_eq!(result.symbols[0].name, "site");
        assert_eq!(result.symbols[1].kind, "rule");
        assert_eq!(result.symbols[1].name, ".a, .b");
    }

    #[test]
    fn test_at_rules_comments_and_keyframes() {
        let css = "/* header */\n@media screen and (max-width: 600px) {\n  .nav { display: none; }\n}\n@keyframes spin {\n  from { opacity: 0; }\n  to { opacity: 1; }\n}\n";
        let result = parse_str(NAME, "app.css", css, &Config::default());

        let comment = &result.chunks[0];
        assert_eq!(comment.metadata.get_str("kind"), Some("comment"));
        assert_eq!(comment.text, "/* header */");

        let media = result.symbols.iter().find(|s| s.kind == "at_rule").unwrap();
        assert_eq!(media.name, "@media screen and (max-width: 600px)");

        let nav = result
            .chunks
            .iter()
            .find(|c| c.metadata.get_str("selector") == Some(".nav"))
            .unwrap();
        assert_eq!(nav.metadata.get_str("cascade"), Some(media.name.as_str()));

        let frames: Vec<_> = result
            .chunks
            .iter()
            .filter(|c| c.metadata.get_str("kind") == Some("keyframe"))
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].metadata.get_str("selector"), Some("from"));
    }
}
