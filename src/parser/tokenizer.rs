/// Token counting used to size chunks.
///
/// The default encoder is a deterministic word-piece approximation. A
/// HuggingFace `tokenizer.json` can be configured instead for exact counts.
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use tokenizers::Tokenizer;
use tracing::info;

use crate::config::Config;
use crate::error::{ParserError, Result};

/// Budget used when a handler's cap is `auto` and nothing more specific exists.
pub const DEFAULT_TOKEN_BUDGET: usize = 2000;

/// Name of the built-in encoder.
pub const DEFAULT_ENCODER: &str = "heuristic";

/// Counts tokens for chunk sizing.
///
/// Implementations must be `Send + Sync`; one encoder is shared by every
/// handler of a run.
pub trait TokenEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// Token ids for `text`.
    fn encode(&self, text: &str) -> Vec<u32>;

    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    /// Budget the encoder considers appropriate for `auto` caps.
    fn default_budget(&self) -> usize {
        DEFAULT_TOKEN_BUDGET
    }
}

/// Deterministic approximation of a BPE tokenizer.
///
/// Alphanumeric runs cost one token per 8 chars; every other
/// non-whitespace char costs one token. Whitespace is free.
#[derive(Debug, Default, Clone)]
pub struct HeuristicEncoder;

const PIECE_CHARS: usize = 8;

fn piece_id(piece: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    piece.hash(&mut hasher);
    (hasher.finish() & u64::from(u32::MAX)) as u32
}

impl TokenEncoder for HeuristicEncoder {
    fn name(&self) -> &str {
        DEFAULT_ENCODER
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut word = String::new();

        let flush = |word: &mut String, ids: &mut Vec<u32>| {
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(PIECE_CHARS) {
                let piece: String = piece.iter().collect();
                ids.push(piece_id(&piece));
            }
            word.clear();
        };

        for ch in text.chars() {
            if ch.is_alphanumeric() || ch == '_' {
                word.push(ch);
                continue;
            }
            flush(&mut word, &mut ids);
            if !ch.is_whitespace() {
                ids.push(piece_id(ch.encode_utf8(&mut [0u8; 4])));
            }
        }
        flush(&mut word, &mut ids);
        ids
    }
}

/// Wrapper around a HuggingFace tokenizer loaded from `tokenizer.json`.
pub struct HfTokenEncoder {
    name: String,
    inner: Tokenizer,
    budget: usize,
}

impl HfTokenEncoder {
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ParserError::Tokenizer(format!(
                "tokenizer file not found: {}",
                path.display()
            )));
        }
        let inner = Tokenizer::from_file(path)
            .map_err(|e| ParserError::Tokenizer(format!("failed to load tokenizer: {e}")))?;
        let budget = inner
            .get_truncation()
            .map(|t| t.max_length)
            .filter(|len| *len > 0)
            .unwrap_or(DEFAULT_TOKEN_BUDGET);
        info!("Loaded tokenizer {} (budget {budget})", path.display());
        Ok(Self {
            name: path.display().to_string(),
            inner,
            budget,
        })
    }
}

impl TokenEncoder for HfTokenEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().to_vec(),
            // Fall back to the approximation rather than reporting zero tokens.
            Err(_) => HeuristicEncoder.encode(text),
        }
    }

    fn default_budget(&self) -> usize {
        self.budget
    }
}

/// Build the encoder configured for this run.
pub fn get_token_encoder(config: &Config) -> Result<Arc<dyn TokenEncoder>> {
    match config.tokenizer_path.as_deref() {
        Some(path) if !path.is_empty() => Ok(Arc::new(HfTokenEncoder::from_file(Path::new(path))?)),
        _ => Ok(Arc::new(HeuristicEncoder)),
    }
}
