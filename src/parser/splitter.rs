//! Token-budget splitting shared by all handlers.
//!
//! Oversized units are cut at line boundaries. A single line that alone
//! exceeds the budget is cut at char boundaries and flagged as truncated;
//! no text is ever dropped, so the parts always concatenate back to the input.
use crate::parser::handlers::{HandlerChunk, LineIndex, put_lines};
use crate::parser::metadata::{Metadata, MetadataExt};
use crate::parser::tokenizer::TokenEncoder;

pub const TRUNCATION_REASON: &str = "line exceeds token budget";

/// One contiguous piece of a split text. Offsets are relative to the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPart {
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub token_count: usize,
    pub truncated: bool,
}

struct PartBuilder<'a> {
    text: &'a str,
    encoder: &'a dyn TokenEncoder,
    parts: Vec<SplitPart>,
}

impl PartBuilder<'_> {
    fn push(&mut self, start: usize, end: usize, truncated: bool) {
        if start >= end {
            return;
        }
        let text = &self.text[start..end];
        self.parts.push(SplitPart {
            start,
            end,
            text: text.to_string(),
            token_count: self.encoder.count(text),
            truncated,
        });
    }

    /// Cut `start..end` (one line) into the largest char-aligned prefixes that fit.
    fn push_oversized_line(&mut self, start: usize, end: usize, budget: usize) {
        let line = &self.text[start..end];
        let mut bounds: Vec<usize> = line.char_indices().map(|(i, _)| i).skip(1).collect();
        bounds.push(line.len());

        let mut from = 0;
        let mut first = 0;
        while from < line.len() {
            // Largest index into `bounds` whose prefix fits the budget.
            let (mut lo, mut hi) = (first, bounds.len() - 1);
            let mut best = first;
            while lo <= hi {
                let mid = lo + (hi - lo) / 2;
                if self.encoder.count(&line[from..bounds[mid]]) <= budget {
                    best = mid;
                    lo = mid + 1;
                } else if mid == 0 {
                    break;
                } else {
                    hi = mid - 1;
                }
            }
            let to = bounds[best];
            self.push(start + from, start + to, true);
            from = to;
            first = best + 1;
        }
    }
}

/// Split `text` so that each part stays within `budget` tokens where possible.
pub fn split_by_tokens(text: &str, encoder: &dyn TokenEncoder, budget: usize) -> Vec<SplitPart> {
    let budget = budget.max(1);
    let total = encoder.count(text);
    if total <= budget {
        return vec![SplitPart {
            start: 0,
            end: text.len(),
            text: text.to_string(),
            token_count: total,
            truncated: false,
        }];
    }

    let mut builder = PartBuilder {
        text,
        encoder,
        parts: Vec::new(),
    };
    let mut current: Option<(usize, usize)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let (line_start, line_end) = (offset, offset + line.len());
        offset = line_end;

        if encoder.count(line) > budget {
            if let Some((s, e)) = current.take() {
                builder.push(s, e, false);
            }
            builder.push_oversized_line(line_start, line_end, budget);
            continue;
        }

        current = match current {
            Some((s, _)) if encoder.count(&text[s..line_end]) > budget => {
                builder.push(s, line_start, false);
                Some((line_start, line_end))
            }
            Some((s, _)) => Some((s, line_end)),
            None => Some((line_start, line_end)),
        };
    }
    if let Some((s, e)) = current {
        builder.push(s, e, false);
    }
    builder.parts
}

/// Stamp part coordinates onto one part's metadata.
pub fn apply_part_metadata(metadata: &mut Metadata, index: usize, total: usize) {
    metadata.put("part_index", index);
    metadata.put("part_total", total);
    if total > 1 {
        metadata.put("overflow", true);
    }
}

pub fn split_warning(name: &str, parts: usize) -> String {
    format!("{name} split into {parts} chunks due to token cap")
}

/// Split a whole chunk into budget-sized parts sharing its `chunk_id`.
///
/// When `lines` is given, each part of a multi-part chunk gets its own
/// `start_line`/`end_line`; this requires `chunk.text` to be the exact view
/// slice at `chunk.start_offset`.
pub fn split_chunk(
    chunk: HandlerChunk,
    encoder: &dyn TokenEncoder,
    budget: usize,
    lines: Option<&LineIndex>,
) -> Vec<HandlerChunk> {
    let parts = split_by_tokens(&chunk.text, encoder, budget);
    let total = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| {
            let mut metadata = chunk.metadata.clone();
            let start = (chunk.start_offset + part.start).min(chunk.end_offset);
            let end = (chunk.start_offset + part.end).min(chunk.end_offset);
            if total > 1 {
                if let Some(lines) = lines {
                    put_lines(&mut metadata, lines, start, end);
                }
            }
            apply_part_metadata(&mut metadata, index, total);
            if part.truncated {
                metadata.put("overflow_is_truncated", true);
                metadata.put("overflow_reason", TRUNCATION_REASON);
            }
            HandlerChunk {
                chunk_id: chunk.chunk_id.clone(),
                text: part.text,
                token_count: part.token_count,
                start_offset: start,
                end_offset: end,
                part_index: index,
                parent_symbol_id: chunk.parent_symbol_id.clone(),
                delegate: chunk.delegate.clone(),
                metadata,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tokenizer::HeuristicEncoder;

    fn joined(parts: &[SplitPart]) -> String {
        parts.iter().map(|p| p.text.as_str()).collect()
    }

    #[test]
    fn test_within_budget_is_single_part() {
        let parts = split_by_tokens("a b c\n", &HeuristicEncoder, 10);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].token_count, 3);
        assert!(!parts[0].truncated);
    }

    #[test]
    fn test_splits_on_lines() {
        let text = "a b c\nd e f\ng h i\n";
        let parts = split_by_tokens(text, &HeuristicEncoder, 4);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.token_count <= 4));
        assert_eq!(joined(&parts), text);
        assert_eq!(parts[1].start, 6);
        assert_eq!(&text[parts[1].start..parts[1].end], "d e f\n");
    }

    #[test]
    fn test_oversized_line_is_truncated_without_loss() {
        let text = "x\na b c d e f g\ny\n";
        let parts = split_by_tokens(text, &HeuristicEncoder, 3);
        assert_eq!(joined(&parts), text);
        assert!(parts.iter().any(|p| p.truncated));
        assert!(parts.iter().all(|p| p.token_count <= 3));
    }

    #[test]
    fn test_split_chunk_part_metadata() {
        let view = "one\ntwo\nthree\nfour\n";
        let lines = LineIndex::new(view);
        let chunk = HandlerChunk::new("body", view, 0, view.len());
        let parts = split_chunk(chunk, &HeuristicEncoder, 2, Some(&lines));

        assert_eq!(parts.len(), 2);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.part_index, i);
            assert_eq!(part.metadata.get_int("part_total"), Some(2));
            assert!(part.metadata.get_flag("overflow"));
            assert_eq!(&view[part.start_offset..part.end_offset], part.text);
        }
        assert_eq!(parts[1].metadata.get_int("start_line"), Some(3));
        assert_eq!(parts[1].metadata.get_int("end_line"), Some(4));
    }

    #[test]
    fn test_split_warning() {
        assert_eq!(
            split_warning("pkg.Foo.bar", 3),
            "pkg.Foo.bar split into 3 chunks due to token cap"
        );
    }
}
