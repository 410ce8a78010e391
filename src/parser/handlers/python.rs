//! Python handler backed by tree-sitter-python.
use std::path::Path;

use tree_sitter::Node;

use crate::meta;
use crate::parser::handlers::{
    HandlerChunk, HandlerResult, HandlerSymbol, LineIndex, ParseContext, ParserHandler, dotted_name,
    grammar_parser, grammar_probe, put_lines,
};
use crate::parser::metadata::MetadataExt;
use crate::parser::registry::ParserHandlerDescriptor;
use crate::parser::splitter;

pub const NAME: &str = "python";
pub const VERSION: &str = "1.0.0";

pub fn descriptor() -> ParserHandlerDescriptor {
    ParserHandlerDescriptor::new(NAME, VERSION, "Python", || Box::new(PythonHandler::new()))
        .extensions(&["py", "pyw", "pyi"])
        .shebangs(&["python", "python3", "python2"])
        .probe(|| grammar_probe(NAME, &tree_sitter_python::LANGUAGE.into()))
}

#[derive(Debug, Default)]
pub struct PythonHandler;

impl PythonHandler {
    pub fn new() -> Self {
        Self
    }
}

/// Strip string prefixes and quotes, then dedent like `inspect.cleandoc`.
pub fn clean_docstring(literal: &str) -> String {
    let body = literal.trim_start_matches(|c: char| "rRbBuUfF".contains(c));
    let body = ["\"\"\"", "'''", "\"", "'"]
        .iter()
        .find_map(|q| body.strip_prefix(q).and_then(|b| b.strip_suffix(q)))
        .unwrap_or(body);

    let lines: Vec<&str> = body.lines().collect();
    let indent = lines
        .iter()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut cleaned: Vec<&str> = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            cleaned.push(line.trim());
        } else {
            cleaned.push(line.get(indent..).unwrap_or_else(|| line.trim_start()).trim_end());
        }
    }
    while cleaned.first().is_some_and(|l| l.is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|l| l.is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}

/// First statement of `block` when it is a bare string literal.
fn docstring_node(block: Node<'_>) -> Option<Node<'_>> {
    let first = block.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string = first.named_child(0)?;
    (string.kind() == "string").then_some(first)
}

struct Collector<'a, 'c> {
    text: &'a str,
    lines: LineIndex,
    ctx: &'a ParseContext<'c>,
    budget: usize,
    /// `python:<path>` prefix for symbol ids.
    prefix: String,
    /// Dotted scope for qualified names; empty inside delegated views.
    scope: Vec<String>,
    parents: Vec<String>,
    pending: Option<(usize, usize)>,
    result: HandlerResult,
}

impl Collector<'_, '_> {
    fn slice(&self, node: Node<'_>) -> &str {
        &self.text[node.byte_range()]
    }

    fn qualified(&self, name: &str) -> String {
        let mut parts = self.scope.clone();
        parts.push(name.to_string());
        parts.join(".")
    }

    fn push_chunks(&mut self, chunk_id: String, kind: &str, start: usize, end: usize, parent: Option<&str>, label: &str) {
        let mut chunk = HandlerChunk::new(chunk_id, self.text, start, end)
            .with_parent(parent)
            .with_metadata(meta! { "kind" => kind, "qualified_name" => label });
        put_lines(&mut chunk.metadata, &self.lines, start, end);
        let parts = splitter::split_chunk(chunk, self.ctx.encoder, self.budget, Some(&self.lines));
        if parts.len() > 1 {
            self.result.warnings.push(splitter::split_warning(label, parts.len()));
        }
        self.result.chunks.extend(parts);
    }

    fn flush_pending(&mut self) {
        if let Some((start, end)) = self.pending.take() {
            let chunk_id = format!("{NAME}:module_code:{start}:{end}");
            let parent = self.parents.last().cloned();
            let label = self.scope.first().cloned().unwrap_or_else(|| "module".to_string());
            self.push_chunks(chunk_id, "module_code", start, end, parent.as_deref(), &label);
        }
    }

    /// Walk the statements of one block. Only the module level keeps loose code.
    fn block(&mut self, block: Node<'_>, top_level: bool) {
        let mut cursor = block.walk();
        let statements: Vec<Node<'_>> = block.named_children(&mut cursor).collect();
        let skip_doc = docstring_node(block).map(|n| n.id());
        for statement in statements {
            if Some(statement.id()) == skip_doc {
                continue;
            }
            if !self.definition(statement) && top_level {
                self.pending = Some(match self.pending {
                    Some((start, _)) => (start, statement.end_byte()),
                    None => (statement.start_byte(), statement.end_byte()),
                });
            }
        }
    }

    fn definition(&mut self, statement: Node<'_>) -> bool {
        let (outer, node, decorators) = match statement.kind() {
            "decorated_definition" => {
                let Some(inner) = statement.child_by_field_name("definition") else {
                    return false;
                };
                let mut cursor = statement.walk();
                let decorators: Vec<String> = statement
                    .named_children(&mut cursor)
                    .filter(|c| c.kind() == "decorator")
                    .map(|c| self.slice(c).trim().trim_start_matches('@').trim().to_string())
                    .collect();
                (statement, inner, decorators)
            }
            "class_definition" | "function_definition" => (statement, statement, Vec::new()),
            _ => return false,
        };
        let kind = match node.kind() {
            "class_definition" => "class",
            "function_definition" => "function",
            _ => return false,
        };
        self.flush_pending();

        let Some(name) = node.child_by_field_name("name").map(|n| self.slice(n).to_string()) else {
            return false;
        };
        let qualified_name = self.qualified(&name);
        let symbol_id = format!("{}::{qualified_name}", self.prefix);
        let body = node.child_by_field_name("body");
        let docstring = body
            .and_then(docstring_node)
            .map(|doc| clean_docstring(self.slice(doc).trim()))
            .filter(|d| !d.is_empty());

        let (start, end) = (outer.start_byte(), outer.end_byte());
        let mut metadata = meta! { "kind" => kind, "qualified_name" => qualified_name.as_str() };
        put_lines(&mut metadata, &self.lines, start, end);
        if !decorators.is_empty() {
            metadata.put("decorators", decorators.clone());
        }
        let is_async = kind == "function" && self.slice(node).trim_start().starts_with("async");
        if kind == "class" {
            if let Some(superclasses) = node.child_by_field_name("superclasses") {
                let mut cursor = superclasses.walk();
                let bases: Vec<String> = superclasses
                    .named_children(&mut cursor)
                    .filter(|c| c.kind() != "comment")
                    .map(|c| self.slice(c).trim().to_string())
                    .collect();
                if !bases.is_empty() {
                    metadata.put("bases", bases);
                }
            }
        } else {
            metadata.put("async", is_async);
            if let Some(params) = node.child_by_field_name("parameters") {
                metadata.put("parameters", self.slice(params).trim());
            }
            if let Some(returns) = node.child_by_field_name("return_type") {
                metadata.put("return_annotation", self.slice(returns).trim());
            }
        }

        self.result.symbols.push(HandlerSymbol {
            symbol_id: symbol_id.clone(),
            name: name.clone(),
            kind: kind.to_string(),
            start_offset: start,
            end_offset: end,
            docstring,
            parent_id: self.parents.last().cloned(),
            metadata,
        });

        let before = self.result.chunks.len();
        let chunk_id = format!("{NAME}:{qualified_name}:{start}:{end}");
        self.push_chunks(chunk_id, kind, start, end, Some(symbol_id.as_str()), &qualified_name);
        for chunk in &mut self.result.chunks[before..] {
            if is_async {
                chunk.metadata.put("async", true);
            }
            if !decorators.is_empty() {
                chunk.metadata.put("decorators", decorators.clone());
            }
        }

        if let Some(body) = body {
            self.scope.push(name);
            self.parents.push(symbol_id);
            self.block(body, false);
            self.parents.pop();
            self.scope.pop();
        }
        true
    }
}

impl ParserHandler for PythonHandler {
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
        let mut parser = match grammar_parser(&tree_sitter_python::LANGUAGE.into()) {
            Ok(parser) => parser,
            Err(reason) => {
                let error = format!("python handler requires the tree-sitter-python grammar: {reason}");
                return HandlerResult::empty(source.file, source.warnings, vec![error]);
            }
        };
        let Some(tree) = parser.parse(&source.text, None) else {
            let error = format!("{}: python parse was cancelled", path.display());
            return HandlerResult::empty(source.file, source.warnings, vec![error]);
        };

        let text = source.text.as_str();
        let root = tree.root_node();
        let module_name = dotted_name(&source.file.path);
        let prefix = format!("{NAME}:{}", source.file.path.display());
        let mut collector = Collector {
            text,
            lines: LineIndex::new(text),
            ctx,
            budget: ctx.max_tokens(NAME),
            prefix,
            scope: Vec::new(),
            parents: Vec::new(),
            pending: None,
            result: HandlerResult::empty(source.file.clone(), source.warnings.clone(), Vec::new()),
        };
        if root.has_error() {
            collector
                .result
                .warnings
                .push(format!("{}: python source contains syntax errors", path.display()));
        }

        let doc_node = docstring_node(root);
        let docstring = doc_node
            .map(|doc| clean_docstring(collector.slice(doc).trim()))
            .filter(|d| !d.is_empty());

        if ctx.depth == 0 {
            let symbol_id = format!("{}::{module_name}", collector.prefix);
            let mut metadata = meta! { "kind" => "module", "qualified_name" => module_name.as_str() };
            put_lines(&mut metadata, &collector.lines, 0, text.len());
            collector.result.symbols.push(HandlerSymbol {
                symbol_id: symbol_id.clone(),
                name: module_name.clone(),
                kind: "module".to_string(),
                start_offset: 0,
                end_offset: text.len(),
                docstring: docstring.clone(),
                parent_id: None,
                metadata,
            });
            collector.scope.push(module_name.clone());
            collector.parents.push(symbol_id);
        }

        if let (Some(doc), Some(_)) = (doc_node, docstring.as_ref()) {
            let (start, end) = (doc.start_byte(), doc.end_byte());
            let chunk_id = format!("{NAME}:module_docstring:{start}:{end}");
            let parent = collector.parents.last().cloned();
            collector.push_chunks(chunk_id, "module_docstring", start, end, parent.as_deref(), &module_name);
        }

        collector.block(root, true);
        collector.flush_pending();
        collector.result
    }
}
