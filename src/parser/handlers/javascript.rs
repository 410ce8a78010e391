//! JavaScript and TypeScript handlers backed by tree-sitter.
//!
//! One implementation serves both registry entries; the dialect picks the
//! grammar (`.tsx` files use the TSX grammar).
use std::path::Path;

use tree_sitter::{Language, Node};

use crate::meta;
use crate::parser::delegation::{self, DelegationRequest};
use crate::parser::handlers::{
    HandlerChunk, HandlerResult, HandlerSymbol, LineIndex, ParseContext, ParserHandler, dotted_name,
    grammar_parser, grammar_probe, put_lines,
};
use crate::parser::metadata::{Metadata, MetadataExt};
use crate::parser::registry::{HandlerProbe, ParserHandlerDescriptor, infer_extension};
use crate::parser::splitter;

pub const JAVASCRIPT: &str = "javascript";
pub const TYPESCRIPT: &str = "typescript";
pub const VERSION: &str = "1.0.0";

const CLASS_NODES: [&str; 2] = ["class_declaration", "abstract_class_declaration"];
const FUNCTION_NODES: [&str; 3] = [
    "function_declaration",
    "generator_function_declaration",
    "function_signature",
];
const VARIABLE_NODES: [&str; 2] = ["lexical_declaration", "variable_declaration"];
const JSX_NODES: [&str; 3] = ["jsx_element", "jsx_fragment", "jsx_self_closing_element"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    JavaScript,
    TypeScript,
}

pub fn javascript_descriptor() -> ParserHandlerDescriptor {
    ParserHandlerDescriptor::new(JAVASCRIPT, VERSION, "JavaScript", || {
        Box::new(JavaScriptHandler::new(Dialect::JavaScript))
    })
    .extensions(&["js", "cjs", "mjs", "jsx"])
    .shebangs(&["node"])
    .probe(|| grammar_probe(JAVASCRIPT, &tree_sitter_javascript::LANGUAGE.into()))
}

pub fn typescript_descriptor() -> ParserHandlerDescriptor {
    ParserHandlerDescriptor::new(TYPESCRIPT, VERSION, "TypeScript", || {
        Box::new(JavaScriptHandler::new(Dialect::TypeScript))
    })
    .extensions(&["ts", "tsx", "cts", "mts"])
    .probe(typescript_probe)
}

fn typescript_probe() -> HandlerProbe {
    let probe = grammar_probe(TYPESCRIPT, &tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
    if probe.status != crate::parser::health::HealthStatus::Ok {
        return probe;
    }
    grammar_probe("tsx", &tree_sitter_typescript::LANGUAGE_TSX.into())
}

#[derive(Debug)]
pub struct JavaScriptHandler {
    dialect: Dialect,
}

impl JavaScriptHandler {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    fn handler_name(&self) -> &'static str {
        match self.dialect {
            Dialect::JavaScript => JAVASCRIPT,
            Dialect::TypeScript => TYPESCRIPT,
        }
    }

    /// Grammar for `path` and whether JSX content is delegated.
    fn grammar(&self, path: &Path) -> (Language, bool) {
        let ext = infer_extension(path);
        match self.dialect {
            Dialect::JavaScript => (
                tree_sitter_javascript::LANGUAGE.into(),
                ext.as_deref() == Some("jsx"),
            ),
            Dialect::TypeScript if ext.as_deref() == Some("tsx") => {
                (tree_sitter_typescript::LANGUAGE_TSX.into(), true)
            }
            Dialect::TypeScript => (tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(), false),
        }
    }
}

/// Strip comment markers and leading `*` gutters.
pub fn normalize_comment(raw: &str) -> String {
    let body = raw.trim();
    let body = body
        .strip_prefix("/**")
        .or_else(|| body.strip_prefix("/*"))
        .map(|b| b.strip_suffix("*/").unwrap_or(b))
        .unwrap_or(body);
    body.lines()
        .map(|line| {
            let line = line.trim();
            let line = line.strip_prefix("//").unwrap_or(line);
            let line = line.strip_prefix('*').unwrap_or(line);
            line.trim()
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// `local as exported` → (local, exported).
fn parse_export_specifier(text: &str) -> (String, String) {
    let parts: Vec<&str> = text.split_whitespace().collect();
    match parts.as_slice() {
        [local, "as", exported] => (local.to_string(), exported.to_string()),
        _ => {
            let name = text.trim().to_string();
            (name.clone(), name)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Export {
    exported: bool,
    default: bool,
}

struct Collector<'a, 'c> {
    name: &'static str,
    path: &'a Path,
    text: &'a str,
    lines: LineIndex,
    ctx: &'a ParseContext<'c>,
    budget: usize,
    module: Option<String>,
    pending: Option<(usize, usize)>,
    result: HandlerResult,
}

impl Collector<'_, '_> {
    fn slice(&self, node: Node<'_>) -> &str {
        &self.text[node.byte_range()]
    }

    fn field_text(&self, node: Node<'_>, field: &str) -> Option<String> {
        node.child_by_field_name(field).map(|n| self.slice(n).trim().to_string())
    }

    fn leading_comment(&self, node: Node<'_>) -> Option<String> {
        let prev = node.prev_sibling()?;
        if prev.kind() != "comment" {
            return None;
        }
        let gap = &self.text[prev.end_byte()..node.start_byte()];
        if gap.matches('\n').count() > 1 {
            return None;
        }
        let doc = normalize_comment(self.slice(prev));
        (!doc.is_empty()).then_some(doc)
    }

    fn push_symbol(
        &mut self,
        name: &str,
        kind: &str,
        node: Node<'_>,
        parent: Option<&str>,
        export: Export,
        mut metadata: Metadata,
    ) -> String {
        let (start, end) = (node.start_byte(), node.end_byte());
        let symbol_id = format!("{}:{name}:{start}:{end}", self.name);
        let (start_line, end_line) = self.lines.span(start, end);
        metadata.put("start_line", start_line);
        metadata.put("end_line", end_line);
        metadata.put("exported", export.exported);
        metadata.put("default_export", export.default);
        let docstring = self.leading_comment(node);
        self.result.symbols.push(HandlerSymbol {
            symbol_id: symbol_id.clone(),
            name: name.to_string(),
            kind: kind.to_string(),
            start_offset: start,
            end_offset: end,
            docstring,
            parent_id: parent.map(str::to_string),
            metadata,
        });
        symbol_id
    }

    /// Emit `start..end` as one logical chunk, split by the token budget.
    fn push_chunk(&mut self, label: &str, kind: &str, start: usize, end: usize, parent: Option<&str>, name: &str) {
        let chunk_id = format!("{}:{label}:{start}:{end}", self.name);
        let mut chunk = HandlerChunk::new(chunk_id, self.text, start, end)
            .with_parent(parent)
            .with_metadata(meta! { "kind" => kind });
        put_lines(&mut chunk.metadata, &self.lines, start, end);
        let parts = splitter::split_chunk(chunk, self.ctx.encoder, self.budget, Some(&self.lines));
        if parts.len() > 1 {
            self.result.warnings.push(splitter::split_warning(name, parts.len()));
        }
        self.result.chunks.extend(parts);
    }

    fn flush_pending(&mut self) {
        if let Some((start, end)) = self.pending.take() {
            let module = self.module.clone();
            self.push_chunk("module-code", "module_code", start, end, module.as_deref(), "module code");
        }
    }

    fn defer(&mut self, node: Node<'_>) {
        self.pending = Some(match self.pending {
            Some((start, _)) => (start, node.end_byte()),
            None => (node.start_byte(), node.end_byte()),
        });
    }

    fn visit_top_level(&mut self, node: Node<'_>) {
        let kind = node.kind();
        let handled = if kind == "export_statement" {
            self.export(node)
        } else {
            self.declaration(node, node, Export::default())
        };
        if !handled {
            self.defer(node);
        }
    }

    fn export(&mut self, node: Node<'_>) -> bool {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        let is_default = children.iter().any(|c| c.kind() == "default");
        let export = Export {
            exported: true,
            default: is_default,
        };

        if let Some(declaration) = node.child_by_field_name("declaration") {
            self.flush_pending();
            if self.declaration(declaration, node, export) {
                return true;
            }
            let module = self.module.clone();
            self.push_chunk("export", "export", node.start_byte(), node.end_byte(), module.as_deref(), "export");
            return true;
        }

        let source = self
            .field_text(node, "source")
            .map(|s| s.trim_matches(['"', '\'', '`']).to_string());

        if let Some(clause) = children.iter().find(|c| c.kind() == "export_clause") {
            self.flush_pending();
            let mut clause_cursor = clause.walk();
            let specifiers: Vec<Node<'_>> = clause
                .named_children(&mut clause_cursor)
                .filter(|c| c.kind() == "export_specifier")
                .collect();
            for spec in specifiers {
                let (local, exported) = parse_export_specifier(self.slice(spec));
                let default = exported == "default";
                let display = if default { local.clone() } else { exported.clone() };
                let mut metadata = meta! {
                    "kind" => "reexport",
                    "local" => local,
                    "export" => exported,
                };
                if let Some(source) = &source {
                    metadata.put("source", source.as_str());
                }
                let parent = self.module.clone();
                let symbol_id = self.push_symbol(
                    &display,
                    "reexport",
                    spec,
                    parent.as_deref(),
                    Export { exported: true, default },
                    metadata,
                );
                self.push_chunk("reexport", "reexport", spec.start_byte(), spec.end_byte(), Some(symbol_id.as_str()), &display);
            }
            return true;
        }

        let namespace = children.iter().any(|c| c.kind() == "*" || c.kind() == "namespace_export");
        let value = node.child_by_field_name("value");
        if namespace || value.is_some() {
            self.flush_pending();
            let (name, mut metadata) = if namespace {
                ("*".to_string(), meta! { "kind" => "reexport", "namespace" => self.slice(node).trim() })
            } else {
                ("default".to_string(), meta! { "kind" => "reexport", "assignment" => self.slice(node).trim() })
            };
            if let Some(source) = &source {
                metadata.put("source", source.as_str());
            }
            let parent = self.module.clone();
            let symbol_id = self.push_symbol(&name, "reexport", node, parent.as_deref(), export, metadata);
            self.push_chunk("reexport", "reexport", node.start_byte(), node.end_byte(), Some(symbol_id.as_str()), &name);
            return true;
        }
        false
    }

    /// Handle a declaration; `outer` is the node whose text becomes the chunk.
    fn declaration(&mut self, node: Node<'_>, outer: Node<'_>, export: Export) -> bool {
        let kind = node.kind();
        if CLASS_NODES.contains(&kind) {
            self.flush_pending();
            self.class(node, outer, export);
        } else if FUNCTION_NODES.contains(&kind) {
            self.flush_pending();
            self.function(node, outer, export);
        } else if VARIABLE_NODES.contains(&kind) {
            self.flush_pending();
            self.variables(node, outer, export);
        } else if let Some(label) = match kind {
            "interface_declaration" => Some("interface"),
            "type_alias_declaration" => Some("type"),
            "enum_declaration" => Some("enum"),
            _ => None,
        } {
            self.flush_pending();
            let name = self.field_text(node, "name").unwrap_or_else(|| "anonymous".to_string());
            let parent = self.module.clone();
            let symbol_id = self.push_symbol(&name, label, node, parent.as_deref(), export, meta! { "kind" => label });
            self.push_chunk(label, label, outer.start_byte(), outer.end_byte(), Some(symbol_id.as_str()), &name);
        } else {
            return false;
        }
        true
    }

    fn function(&mut self, node: Node<'_>, outer: Node<'_>, export: Export) {
        let name = self.field_text(node, "name").unwrap_or_else(|| "default".to_string());
        let is_async = self.slice(node).trim_start().starts_with("async");
        let metadata = meta! {
            "kind" => "function",
            "async" => is_async,
            "generator" => node.kind() == "generator_function_declaration",
        };
        let parent = self.module.clone();
        let symbol_id = self.push_symbol(&name, "function", node, parent.as_deref(), export, metadata);
        self.push_chunk("function", "function", outer.start_byte(), outer.end_byte(), Some(symbol_id.as_str()), &name);
    }

    fn class(&mut self, node: Node<'_>, outer: Node<'_>, export: Export) {
        let name = self.field_text(node, "name").unwrap_or_else(|| "anonymous".to_string());
        let mut metadata = meta! { "kind" => "class" };
        let mut cursor = node.walk();
        if let Some(heritage) = node
            .children(&mut cursor)
            .find(|c| c.kind() == "class_heritage")
        {
            let heritage = self.slice(heritage).trim().trim_start_matches("extends").trim().to_string();
            metadata.put("extends", heritage);
        }
        let parent = self.module.clone();
        let symbol_id = self.push_symbol(&name, "class", node, parent.as_deref(), export, metadata);

        let Some(body) = node.child_by_field_name("body") else {
            self.push_chunk("class", "class", outer.start_byte(), outer.end_byte(), Some(symbol_id.as_str()), &name);
            return;
        };

        let mut body_cursor = body.walk();
        let members: Vec<Node<'_>> = body.named_children(&mut body_cursor).collect();
        let methods: Vec<Node<'_>> = members
            .iter()
            .copied()
            .filter(|m| matches!(m.kind(), "method_definition" | "method_signature" | "abstract_method_signature"))
            .collect();
        let fields: Vec<Node<'_>> = members
            .iter()
            .copied()
            .filter(|m| matches!(m.kind(), "field_definition" | "public_field_definition"))
            .collect();

        if methods.is_empty() && fields.is_empty() {
            self.push_chunk("class", "class", outer.start_byte(), outer.end_byte(), Some(symbol_id.as_str()), &name);
            return;
        }

        if let (Some(first), Some(last)) = (fields.first(), fields.last()) {
            let label = format!("{name} fields");
            self.push_chunk("class-fields", "class_fields", first.start_byte(), last.end_byte(), Some(symbol_id.as_str()), &label);
        }
        for method in methods {
            let method_name = self.field_text(method, "name").unwrap_or_else(|| "anonymous".to_string());
            let qualified = format!("{name}.{method_name}");
            let before = self.result.chunks.len();
            self.push_chunk("method", "class_method", method.start_byte(), method.end_byte(), Some(symbol_id.as_str()), &qualified);
            for chunk in &mut self.result.chunks[before..] {
                chunk.metadata.put("method", method_name.as_str());
                chunk.metadata.put("qualified_name", qualified.as_str());
            }
        }
    }

    fn variables(&mut self, node: Node<'_>, outer: Node<'_>, export: Export) {
        let keyword = self
            .slice(node)
            .split_whitespace()
            .next()
            .unwrap_or("var")
            .to_string();
        let kind = if keyword == "const" { "const" } else { "variable" };
        let mut cursor = node.walk();
        let declarators: Vec<Node<'_>> = node
            .named_children(&mut cursor)
            .filter(|c| c.kind() == "variable_declarator")
            .collect();
        let single = declarators.len() == 1;

        for declarator in declarators {
            let name = self.field_text(declarator, "name").unwrap_or_else(|| keyword.clone());
            let parent = self.module.clone();
            let symbol_id = self.push_symbol(
                &name,
                kind,
                declarator,
                parent.as_deref(),
                export,
                meta! { "kind" => kind, "keyword" => keyword.as_str() },
            );
            let range = if single { outer } else { declarator };
            self.push_chunk(kind, kind, range.start_byte(), range.end_byte(), Some(symbol_id.as_str()), &name);
        }
    }

    /// Innermost emitted symbol enclosing `start..end`.
    fn enclosing_symbol(&self, start: usize, end: usize) -> Option<String> {
        self.result
            .symbols
            .iter()
            .filter(|s| s.start_offset <= start && end <= s.end_offset)
            .min_by_key(|s| s.end_offset - s.start_offset)
            .map(|s| s.symbol_id.clone())
            .or_else(|| self.module.clone())
    }

    fn delegate_jsx(&mut self, root: Node<'_>) {
        let mut outermost = Vec::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if JSX_NODES.contains(&node.kind()) {
                outermost.push(node);
                continue;
            }
            let mut cursor = node.walk();
            let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }

        for node in outermost {
            let (start, end) = (node.start_byte(), node.end_byte());
            let parent = self.enclosing_symbol(start, end);
            let outcome = delegation::delegate(
                self.path,
                self.ctx,
                DelegationRequest {
                    delegate: "html",
                    parent_handler: self.name,
                    component: Some("jsx"),
                    marker: None,
                    text: &self.text[start..end],
                    start_offset: start,
                    end_offset: end,
                    start_line: self.lines.line(start),
                    parent_symbol: parent.as_deref(),
                    parent_chunk: None,
                    metadata: meta! { "kind" => "jsx" },
                },
            );
            self.result.symbols.extend(outcome.symbols);
            self.result.chunks.extend(outcome.chunks);
            self.result.warnings.extend(outcome.warnings);
        }
    }
}

impl ParserHandler for JavaScriptHandler {
    fn name(&self) -> &str {
        self.handler_name()
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn parse(&self, path: &Path, ctx: &ParseContext<'_>) -> HandlerResult {
        let name = self.handler_name();
        let source = match ctx.read_source(path, name) {
            Ok(source) => source,
            Err(err) => return HandlerResult::unreadable(ctx, path, name, &err),
        };
        let (language, jsx) = self.grammar(path);
        let mut parser = match grammar_parser(&language) {
            Ok(parser) => parser,
            Err(reason) => {
                let error = format!("{name} handler requires its tree-sitter grammar: {reason}");
                return HandlerResult::empty(source.file, source.warnings, vec![error]);
            }
        };
        let Some(tree) = parser.parse(&source.text, None) else {
            let error = format!("{}: {name} parse was cancelled", path.display());
            return HandlerResult::empty(source.file, source.warnings, vec![error]);
        };

        let text = source.text.as_str();
        let root = tree.root_node();
        let mut collector = Collector {
            name,
            path,
            text,
            lines: LineIndex::new(text),
            ctx,
            budget: ctx.max_tokens(name),
            module: None,
            pending: None,
            result: HandlerResult::empty(source.file.clone(), source.warnings.clone(), Vec::new()),
        };
        if root.has_error() {
            collector
                .result
                .warnings
                .push(format!("{}: {name} source contains syntax errors", path.display()));
        }

        let mut cursor = root.walk();
        let top_level: Vec<Node<'_>> = root.named_children(&mut cursor).collect();

        // Leading comment block, after an optional hashbang
        let mut index = usize::from(top_level.first().is_some_and(|n| n.kind() == "hash_bang_line"));
        let doc_start = index;
        while top_level.get(index).is_some_and(|n| n.kind() == "comment") {
            index += 1;
        }
        let doc_nodes = &top_level[doc_start..index];
        let docstring = doc_nodes
            .iter()
            .map(|n| normalize_comment(collector.slice(*n)))
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if ctx.depth == 0 {
            let module_name = dotted_name(&source.file.path);
            let symbol_id = format!("{name}:module:{module_name}");
            let (start_line, end_line) = collector.lines.span(0, text.len());
            collector.result.symbols.push(HandlerSymbol {
                symbol_id: symbol_id.clone(),
                name: module_name,
                kind: "module".to_string(),
                start_offset: 0,
                end_offset: text.len(),
                docstring: (!docstring.is_empty()).then(|| docstring.clone()),
                parent_id: None,
                metadata: meta! { "start_line" => start_line, "end_line" => end_line },
            });
            collector.module = Some(symbol_id);
        }
        if let (Some(first), Some(last)) = (doc_nodes.first(), doc_nodes.last()) {
            if !docstring.is_empty() {
                let module = collector.module.clone();
                collector.push_chunk(
                    "module-doc",
                    "module_docstring",
                    first.start_byte(),
                    last.end_byte(),
                    module.as_deref(),
                    "module docstring",
                );
            }
        }

        for node in top_level.iter().skip(index) {
            collector.visit_top_level(*node);
        }
        collector.flush_pending();

        if jsx && ctx.registry.contains("html") {
            collector.delegate_jsx(root);
        }
        collector.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::parser::testing::parse_str;

    const MODULE: &str = "/**\n * Utilities.\n */\nimport fs from 'fs';\n\nexport const answer = 42;\n\nexport function greet(name) {\n  return `hi ${name}`;\n}\n\nclass Counter extends Base {\n  count = 0;\n  increment() {\n    this.count += 1;\n  }\n  reset() {\n    this.count = 0;\n  }\n}\n\nexport { greet as hello, Counter };\nexport * from './other';\n";

    fn by_kind<'r>(result: &'r HandlerResult, kind: &str) -> Vec<&'r HandlerChunk> {
        result
            .chunks
            .iter()
            .filter(|c| c.metadata.get_str("kind") == Some(kind))
            .collect()
    }

    #[test]
    fn test_normalize_comment() {
        assert_eq!(normalize_comment("/**\n * Hello.\n * World\n */"), "Hello.\nWorld");
        assert_eq!(normalize_comment("// line"), "line");
    }

    #[test]
    fn test_module_structure() {
        let result = parse_str(JAVASCRIPT, "src/util.js", MODULE, &Config::default());
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        let module = &result.symbols[0];
        assert_eq!(module.kind, "module");
        assert_eq!(module.name, "src.util");
        assert_eq!(module.docstring.as_deref(), Some("Utilities."));
        assert_eq!(by_kind(&result, "module_docstring").len(), 1);

        let answer = result.symbols.iter().find(|s| s.name == "answer").unwrap();
        assert_eq!(answer.kind, "const");
        assert!(answer.metadata.get_flag("exported"));

        let greet = result.symbols.iter().find(|s| s.name == "greet").unwrap();
        assert!(greet.metadata.get_flag("exported"));
        assert!(!greet.metadata.get_flag("default_export"));

        let counter = result.symbols.iter().find(|s| s.kind == "class").unwrap();
        assert_eq!(counter.metadata.get_str("extends"), Some("Base"));
        let methods = by_kind(&result, "class_method");
        assert_eq!(methods.len(), 2);
        assert!(methods.iter().all(|m| m.parent_symbol_id.as_deref() == Some(counter.symbol_id.as_str())));
        assert_eq!(methods[0].metadata.get_str("qualified_name"), Some("Counter.increment"));
        assert_eq!(by_kind(&result, "class_fields").len(), 1);

        let reexports: Vec<_> = result.symbols.iter().filter(|s| s.kind == "reexport").collect();
        let names: Vec<_> = reexports.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["hello", "Counter", "*"]);

        let imports = by_kind(&result, "module_code");
        assert_eq!(imports.len(), 1);
        assert!(imports[0].text.starts_with("import fs"));
    }

    #[test]
    fn test_typescript_declarations() {
        let source = "export interface Shape { area(): number }\ntype Id = string;\nexport enum Color { Red }\n";
        let result = parse_str(TYPESCRIPT, "types.ts", source, &Config::default());
        let kinds: Vec<_> = result.symbols.iter().map(|s| s.kind.as_str()).collect();
        assert!(kinds.contains(&"interface"));
        assert!(kinds.contains(&"type"));
        let shape = result.symbols.iter().find(|s| s.name == "Shape").unwrap();
        assert!(shape.metadata.get_flag("exported"));
    }

    #[test]
    fn test_tsx_delegates_jsx_without_parent_chunk() {
        let source = "export const App = () => <div className=\"app\"><span>hi</span></div>;\n";
        let result = parse_str(TYPESCRIPT, "App.tsx", source, &Config::default());

        let jsx = result
            .chunks
            .iter()
            .find(|c| c.delegate.as_deref() == Some("html"))
            .unwrap();
        assert!(!jsx.metadata.contains_key("delegate_parent_chunk"));
        let app = result
            .symbols
            .iter()
            .find(|s| s.name == "App" && s.kind == "const")
            .unwrap();
        assert_eq!(jsx.parent_symbol_id.as_deref(), Some(app.symbol_id.as_str()));
        assert_eq!(jsx.metadata.get_str("delegate_parent_symbol"), Some(app.symbol_id.as_str()));
    }

    #[test]
    fn test_tsx_fragment_is_delegated_whole() {
        let source = "export const List = () => (\n  <>\n    <li>one</li>\n    <li>two</li>\n  </>\n);\n";
        let result = parse_str(TYPESCRIPT, "List.tsx", source, &Config::default());

        let delegated: Vec<_> = result
            .chunks
            .iter()
            .filter(|c| c.delegate.as_deref() == Some("html"))
            .collect();
        assert_eq!(delegated.len(), 1);
        assert!(delegated[0].text.starts_with("<>"));
        assert!(delegated[0].text.ends_with("</>"));
    }
}
