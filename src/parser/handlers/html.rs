//! HTML handler backed by tree-sitter-html.
//!
//! Structural elements become symbols. `<script>` and `<style>` bodies are
//! delegated to the JavaScript/TypeScript and CSS handlers behind a shell
//! chunk for the element itself.
use std::collections::BTreeMap;
use std::path::Path;

use tree_sitter::{Language, Node};

use crate::meta;
use crate::parser::delegation::{self, DelegationRequest};
use crate::parser::handlers::{
    HandlerChunk, HandlerResult, HandlerSymbol, LineIndex, ParseContext, ParserHandler, dotted_name,
    grammar_parser, grammar_probe, put_lines,
};
use crate::parser::metadata::MetadataExt;
use crate::parser::registry::{HandlerProbe, ParserHandlerDescriptor};
use crate::parser::splitter;

pub const NAME: &str = "html";
pub const VERSION: &str = "1.0.0";

const DOCUMENT_SYMBOL: &str = "html:document";

const STRUCTURAL_TAGS: [&str; 16] = [
    "html", "head", "body", "header", "footer", "main", "nav", "section", "article", "aside", "form",
    "table", "template", "div", "ul", "ol",
];

fn language() -> Language {
    tree_sitter_html::LANGUAGE.into()
}

fn probe() -> HandlerProbe {
    grammar_probe(NAME, &language())
}

pub fn descriptor() -> ParserHandlerDescriptor {
    ParserHandlerDescriptor::new(NAME, VERSION, "HTML", || Box::new(HtmlHandler::new()))
        .extensions(&["html", "htm"])
        .probe(probe)
}

#[derive(Debug, Default)]
pub struct HtmlHandler;

impl HtmlHandler {
    pub fn new() -> Self {
        Self
    }
}

/// Delegate for a `<script type=...>` value; `None` for data blocks.
fn script_delegate(script_type: Option<&str>) -> Option<&'static str> {
    let script_type = script_type.map(|t| t.trim().to_ascii_lowercase());
    match script_type.as_deref() {
        None | Some("" | "module" | "text/javascript" | "application/javascript" | "javascript") => {
            Some("javascript")
        }
        Some("text/typescript" | "application/typescript" | "typescript" | "ts") => Some("typescript"),
        Some(_) => None,
    }
}

/// Strip the common indentation and surrounding blank lines.
pub fn dedent(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    let trimmed: Vec<&str> = lines
        .iter()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()).trim_end())
        .collect();
    trimmed.join("\n").trim_matches('\n').to_string()
}

fn child_of_kind<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).find(|c| c.kind() == kind)
}

struct HtmlWalker<'a, 'c> {
    path: &'a Path,
    text: &'a str,
    lines: LineIndex,
    ctx: &'a ParseContext<'c>,
    budget: usize,
    result: HandlerResult,
}

impl HtmlWalker<'_, '_> {
    fn slice(&self, node: Node<'_>) -> &str {
        &self.text[node.byte_range()]
    }

    fn tag_name(&self, node: Node<'_>) -> Option<String> {
        let start_tag = child_of_kind(node, "start_tag").or_else(|| child_of_kind(node, "self_closing_tag"))?;
        let name = child_of_kind(start_tag, "tag_name")?;
        Some(self.slice(name).trim().to_ascii_lowercase())
    }

    fn attributes(&self, node: Node<'_>) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        let Some(start_tag) = child_of_kind(node, "start_tag") else {
            return attributes;
        };
        let mut cursor = start_tag.walk();
        for attr in start_tag.children(&mut cursor).filter(|c| c.kind() == "attribute") {
            let Some(name) = child_of_kind(attr, "attribute_name") else {
                continue;
            };
            let value = child_of_kind(attr, "quoted_attribute_value")
                .or_else(|| child_of_kind(attr, "attribute_value"))
                .map(|v| self.slice(v).trim().trim_matches(['"', '\'']).to_string())
                .unwrap_or_default();
            attributes.insert(self.slice(name).trim().to_ascii_lowercase(), value);
        }
        attributes
    }

    fn push_chunk(&mut self, mut chunk: HandlerChunk, exact: bool) -> String {
        put_lines(&mut chunk.metadata, &self.lines, chunk.start_offset, chunk.end_offset);
        let chunk_id = chunk.chunk_id.clone();
        let lines = exact.then_some(&self.lines);
        let parts = splitter::split_chunk(chunk, self.ctx.encoder, self.budget, lines);
        if parts.len() > 1 {
            self.result.warnings.push(splitter::split_warning(&chunk_id, parts.len()));
        }
        self.result.chunks.extend(parts);
        chunk_id
    }

    fn push_element(&mut self, node: Node<'_>, tag: &str, kind: &str, parent: Option<&str>) -> (String, String) {
        let (start, end) = (node.start_byte(), node.end_byte());
        let symbol_id = format!("html::{tag}:{start}:{end}");
        let attributes = self.attributes(node);
        let (start_line, end_line) = self.lines.span(start, end);

        let mut metadata = meta! { "tag" => tag, "start_line" => start_line, "end_line" => end_line };
        for key in ["id", "class"] {
            if let Some(value) = attributes.get(key) {
                metadata.put(key, value.as_str());
            }
        }
        self.result.symbols.push(HandlerSymbol {
            symbol_id: symbol_id.clone(),
            name: tag.to_string(),
            kind: kind.to_string(),
            start_offset: start,
            end_offset: end,
            docstring: None,
            parent_id: parent.map(str::to_string),
            metadata: metadata.clone(),
        });

        metadata.put("kind", "element");
        let chunk = HandlerChunk::new(format!("html:{tag}:{start}:{end}"), self.text, start, end)
            .with_parent(Some(symbol_id.as_str()))
            .with_metadata(metadata);
        let chunk_id = self.push_chunk(chunk, true);
        (symbol_id, chunk_id)
    }

    fn visit(&mut self, node: Node<'_>, parent: Option<&str>) {
        match node.kind() {
            "script_element" => self.embedded(node, "script", parent),
            "style_element" => self.embedded(node, "style", parent),
            "element" => {
                let tag = self.tag_name(node);
                match tag.as_deref() {
                    Some(tag) if STRUCTURAL_TAGS.contains(&tag) => {
                        let (symbol_id, _) = self.push_element(node, tag, "element", parent);
                        self.visit_children(node, Some(symbol_id.as_str()));
                    }
                    _ => self.visit_children(node, parent),
                }
            }
            kind @ ("text" | "comment") => {
                let raw = self.slice(node);
                let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
                if collapsed.is_empty() {
                    return;
                }
                let (start, end) = (node.start_byte(), node.end_byte());
                let mut chunk = HandlerChunk::new(format!("html:{kind}:{start}:{end}"), self.text, start, end)
                    .with_parent(parent)
                    .with_metadata(meta! { "kind" => kind });
                chunk.text = collapsed;
                self.push_chunk(chunk, false);
            }
            _ => self.visit_children(node, parent),
        }
    }

    fn visit_children(&mut self, node: Node<'_>, parent: Option<&str>) {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
        for child in children {
            self.visit(child, parent);
        }
    }

    fn embedded(&mut self, node: Node<'_>, kind: &str, parent: Option<&str>) {
        let tag = self.tag_name(node).unwrap_or_else(|| kind.to_string());
        let (symbol_id, shell_id) = self.push_element(node, &tag, kind, parent);

        let Some(raw) = child_of_kind(node, "raw_text") else {
            return;
        };
        let body = dedent(self.slice(raw));
        if body.is_empty() {
            return;
        }
        let delegate = if kind == "script" {
            let attributes = self.attributes(node);
            match script_delegate(attributes.get("type").map(String::as_str)) {
                Some(delegate) => delegate,
                None => {
                    self.plain_inline(raw, kind, &body, &symbol_id, None);
                    return;
                }
            }
        } else {
            "css"
        };

        if !self.ctx.registry.is_available(delegate) {
            let warning = format!("inline {kind} block could not delegate because {delegate} handler is unavailable");
            self.plain_inline(raw, kind, &body, &symbol_id, Some(delegate));
            self.result.warnings.push(warning);
            return;
        }

        // First line of the body inside the raw text
        let leading = self.slice(raw).len() - self.slice(raw).trim_start().len();
        let start_line = self.lines.line(raw.start_byte() + leading);
        let component = format!("inline_{kind}");
        let outcome = delegation::delegate(
            self.path,
            self.ctx,
            DelegationRequest {
                delegate,
                parent_handler: NAME,
                component: Some(component.as_str()),
                marker: None,
                text: &body,
                start_offset: raw.start_byte(),
                end_offset: raw.end_byte(),
                start_line,
                parent_symbol: Some(symbol_id.as_str()),
                parent_chunk: Some(shell_id.as_str()),
                metadata: meta! { "kind" => kind, "tag" => tag.as_str() },
            },
        );
        self.result.symbols.extend(outcome.symbols);
        self.result.chunks.extend(outcome.chunks);
        self.result.warnings.extend(outcome.warnings);
    }

    fn plain_inline(&mut self, raw: Node<'_>, kind: &str, body: &str, symbol_id: &str, delegate: Option<&str>) {
        let (start, end) = (raw.start_byte(), raw.end_byte());
        let mut metadata = meta! { "kind" => format!("inline_{kind}") };
        if let Some(delegate) = delegate {
            metadata.put("delegate_status", "unavailable");
            metadata.put("intended_delegate", delegate);
        }
        let mut chunk = HandlerChunk::new(format!("html:{kind}:inline:{start}:{end}"), self.text, start, end)
            .with_parent(Some(symbol_id))
            .with_metadata(metadata);
        chunk.text = body.to_string();
        self.push_chunk(chunk, false);
    }
}

impl ParserHandler for HtmlHandler {
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
                let error = format!("html handler requires the tree-sitter-html grammar: {reason}");
                return HandlerResult::empty(source.file, source.warnings, vec![error]);
            }
        };
        let Some(tree) = parser.parse(&source.text, None) else {
            let error = format!("{}: html parse was cancelled", path.display());
            return HandlerResult::empty(source.file, source.warnings, vec![error]);
        };

        let text = source.text.as_str();
        let mut walker = HtmlWalker {
            path,
            text,
            lines: LineIndex::new(text),
            ctx,
            budget: ctx.max_tokens(NAME),
            result: HandlerResult::empty(source.file.clone(), source.warnings.clone(), Vec::new()),
        };

        let root = tree.root_node();
        let document = if ctx.depth == 0 {
            let (start_line, end_line) = walker.lines.span(0, text.len());
            walker.result.symbols.push(HandlerSymbol {
                symbol_id: DOCUMENT_SYMBOL.to_string(),
                name: dotted_name(&source.file.path),
                kind: "document".to_string(),
                start_offset: 0,
                end_offset: text.len(),
                docstring: None,
                parent_id: None,
                metadata: meta! { "start_line" => start_line, "end_line" => end_line },
            });
            Some(DOCUMENT_SYMBOL)
        } else {
            None
        };
        if root.has_error() {
            walker
                .result
                .warnings
                .push(format!("{}: html contains syntax errors", path.display()));
        }
        walker.visit_children(root, document);
        walker.result
    }
}
