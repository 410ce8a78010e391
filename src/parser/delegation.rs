//! Delegation of embedded content to another handler.
//!
//! A handler hands a span (a `<script>` body, a fenced block) to another
//! handler. The span becomes a delegated chunk; the sub-handler's output is
//! merged right after it with namespaced ids and linkage metadata so
//! recomposition can hang it back under the delegated chunk.
use std::path::Path;

use tracing::debug_span;

use crate::parser::handlers::{HandlerChunk, HandlerSymbol, LineIndex, ParseContext};
use crate::parser::metadata::{Metadata, MetadataExt};
use crate::parser::splitter;

const LINE_KEYS: [&str; 3] = ["start_line", "end_line", "line"];

/// Why a delegated span was kept as a plain chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationStatus {
    Delegated,
    Unavailable,
    DepthLimit,
    Failed,
}

impl DelegationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delegated => "delegated",
            Self::Unavailable => "unavailable",
            Self::DepthLimit => "depth_limit",
            Self::Failed => "failed",
        }
    }
}

/// A span to hand over. Offsets are in the delegating handler's view.
#[derive(Debug, Clone)]
pub struct DelegationRequest<'r> {
    pub delegate: &'r str,
    pub parent_handler: &'r str,
    /// Construct kind inside the parent, e.g. `script` or `fence`.
    pub component: Option<&'r str>,
    pub marker: Option<&'r str>,
    pub text: &'r str,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Line (in the delegating view) on which `text` starts.
    pub start_line: usize,
    pub parent_symbol: Option<&'r str>,
    pub parent_chunk: Option<&'r str>,
    /// Extra metadata for the delegated chunk (`kind`, `tag`, ...).
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    pub status: DelegationStatus,
    pub symbols: Vec<HandlerSymbol>,
    pub chunks: Vec<HandlerChunk>,
    pub warnings: Vec<String>,
}

/// `<delegate>:delegate:<parent>[:<component>]:<start>:<end>[:<marker>]`
pub fn delegated_chunk_id(
    delegate: &str,
    parent_handler: &str,
    component: Option<&str>,
    start: usize,
    end: usize,
    marker: Option<&str>,
) -> String {
    let mut id = format!("{delegate}:delegate:{parent_handler}");
    if let Some(component) = component.filter(|c| !c.is_empty()) {
        id.push(':');
        id.push_str(&component.replace(':', "-"));
    }
    id.push_str(&format!(":{start}:{end}"));
    if let Some(marker) = marker.filter(|m| !m.is_empty()) {
        id.push(':');
        id.push_str(marker);
    }
    id
}

/// Linkage keys recorded on a delegated chunk. `None` values are skipped.
pub fn delegated_metadata(
    delegate: &str,
    parent_handler: &str,
    parent_symbol: Option<&str>,
    parent_chunk: Option<&str>,
    extra: &[(&str, Option<&str>)],
) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.put("handler", delegate);
    metadata.put("delegate_parent_handler", parent_handler);
    if let Some(symbol) = parent_symbol {
        metadata.put("delegate_parent_symbol", symbol);
    }
    if let Some(chunk) = parent_chunk {
        metadata.put("delegate_parent_chunk", chunk);
    }
    for (key, value) in extra {
        if let Some(value) = value {
            metadata.put(key, *value);
        }
    }
    metadata
}

fn shift_lines(metadata: &mut Metadata, by: usize) {
    if by == 0 {
        return;
    }
    for key in LINE_KEYS {
        if let Some(line) = metadata.get_int(key) {
            metadata.put(key, line + by as i64);
        }
    }
}

/// Hand `request.text` to its delegate and merge the result.
pub fn delegate(path: &Path, ctx: &ParseContext<'_>, request: DelegationRequest<'_>) -> DelegationOutcome {
    let chunk_id = delegated_chunk_id(
        request.delegate,
        request.parent_handler,
        request.component,
        request.start_offset,
        request.end_offset,
        request.marker,
    );

    let view_lines = LineIndex::new(request.text);
    let (_, last_line) = view_lines.span(0, request.text.len());
    let mut metadata = request.metadata.clone();
    metadata.extend(delegated_metadata(
        request.delegate,
        request.parent_handler,
        request.parent_symbol,
        request.parent_chunk,
        &[],
    ));
    metadata.put("start_line", request.start_line);
    metadata.put("end_line", request.start_line + last_line - 1);

    let shell = HandlerChunk {
        chunk_id: chunk_id.clone(),
        text: request.text.to_string(),
        token_count: 0,
        start_offset: request.start_offset,
        end_offset: request.end_offset,
        part_index: 0,
        parent_symbol_id: request.parent_symbol.map(str::to_string),
        delegate: Some(request.delegate.to_string()),
        metadata,
    };
    let budget = ctx.max_tokens(request.parent_handler);

    if !ctx.registry.is_available(request.delegate) {
        let warning = format!("delegate {} unavailable for {chunk_id}", request.delegate);
        return plain(ctx, shell, budget, DelegationStatus::Unavailable, warning);
    }
    if ctx.depth >= ctx.config.max_delegation_depth {
        let warning = format!(
            "delegation depth limit ({}) reached for {chunk_id}",
            ctx.config.max_delegation_depth
        );
        return plain(ctx, shell, budget, DelegationStatus::DepthLimit, warning);
    }

    let handler = match ctx.cache.get_or_create(ctx.registry, request.delegate) {
        Ok(handler) => handler,
        Err(err) => {
            let warning = format!("delegate {} failed for {chunk_id}: {err}", request.delegate);
            return plain(ctx, shell, budget, DelegationStatus::Failed, warning);
        }
    };

    let result = {
        let _span = debug_span!("delegate", handler = request.delegate, depth = ctx.depth + 1).entered();
        handler.parse(path, &ctx.delegated(request.text))
    };
    if result.has_errors() {
        let warning = format!(
            "delegate {} failed for {chunk_id}: {}",
            request.delegate,
            result.errors.join("; ")
        );
        return plain(ctx, shell, budget, DelegationStatus::Failed, warning);
    }

    let line_shift = request.start_line.saturating_sub(1);
    let ns = |id: &str| format!("{chunk_id}/{id}");

    let symbols = result
        .symbols
        .into_iter()
        .map(|mut symbol| {
            symbol.symbol_id = ns(&symbol.symbol_id);
            symbol.parent_id = match symbol.parent_id.as_deref() {
                Some(parent) => Some(ns(parent)),
                None => request.parent_symbol.map(str::to_string),
            };
            shift_lines(&mut symbol.metadata, line_shift);
            if !symbol.metadata.contains_key("handler") {
                symbol.metadata.put("handler", request.delegate);
            }
            symbol
        })
        .collect();

    let mut chunks = splitter::split_chunk(shell, ctx.encoder, budget, None);
    for mut chunk in result.chunks {
        chunk.chunk_id = ns(&chunk.chunk_id);
        chunk.parent_symbol_id = match chunk.parent_symbol_id.as_deref() {
            Some(parent) => Some(ns(parent)),
            None => request.parent_symbol.map(str::to_string),
        };
        match chunk.metadata.get_str("delegate_parent_chunk").map(&ns) {
            Some(parent_chunk) => {
                chunk.metadata.put("delegate_parent_chunk", parent_chunk);
                if let Some(symbol) = chunk.metadata.get_str("delegate_parent_symbol").map(&ns) {
                    chunk.metadata.put("delegate_parent_symbol", symbol);
                }
            }
            None => {
                chunk.metadata.put("delegate_parent_chunk", chunk_id.as_str());
                chunk.metadata.put("delegate_parent_handler", request.delegate);
                if let Some(symbol) = chunk.parent_symbol_id.as_deref() {
                    chunk.metadata.put("delegate_parent_symbol", symbol);
                }
            }
        }
        if !chunk.metadata.contains_key("handler") {
            chunk.metadata.put("handler", request.delegate);
        }
        shift_lines(&mut chunk.metadata, line_shift);
        chunks.push(chunk);
    }

    DelegationOutcome {
        status: DelegationStatus::Delegated,
        symbols,
        chunks,
        warnings: result.warnings,
    }
}

/// Keep the span as an ordinary chunk of the delegating handler.
fn plain(
    ctx: &ParseContext<'_>,
    mut chunk: HandlerChunk,
    budget: usize,
    status: DelegationStatus,
    warning: String,
) -> DelegationOutcome {
    chunk.delegate = None;
    chunk.metadata.remove("handler");
    chunk.metadata.put("delegate_status", status.as_str());
    DelegationOutcome {
        status,
        symbols: Vec::new(),
        chunks: splitter::split_chunk(chunk, ctx.encoder, budget, None),
        warnings: vec![warning],
    }
}
