//! Content hashing used to detect unchanged chunks between batches.
//!
//! Every digest covers the handler version first, so a handler upgrade
//! invalidates all hashes it produced.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{ParserError, Result};

const DELIMITER: &[u8] = b"\x00";
const READ_BUFFER: usize = 128 * 1024;

fn seeded_hasher<I, B>(handler_version: &str, extra: I) -> Sha256
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    hasher.update(handler_version.as_bytes());
    hasher.update(DELIMITER);
    for payload in extra {
        hasher.update(payload.as_ref());
        hasher.update(DELIMITER);
    }
    hasher
}

/// Hash `text` together with the handler version and extra salt values.
pub fn hash_text<I, B>(text: &str, handler_version: &str, extra: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = seeded_hasher(handler_version, extra);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash a file's bytes using streaming reads.
pub fn hash_file<I, B>(path: &Path, handler_version: &str, extra: I) -> Result<String>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut file = File::open(path).map_err(|e| ParserError::io(path, e))?;
    let mut hasher = seeded_hasher(handler_version, extra);
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buffer).map_err(|e| ParserError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Plain sha256 of raw bytes, used for `HandlerFile::checksum`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Line-ending and edge-whitespace normalization applied before the
/// normalized content hash.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NO_EXTRA: [&str; 0] = [];

    #[test]
    fn test_hash_text_is_stable() {
        let a = hash_text("hello", "1.0.0", NO_EXTRA);
        let b = hash_text("hello", "1.0.0", NO_EXTRA);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_version_and_extra_change_digest() {
        let base = hash_text("hello", "1.0.0", NO_EXTRA);
        assert_ne!(base, hash_text("hello", "1.0.1", NO_EXTRA));
        assert_ne!(base, hash_text("hello", "1.0.0", ["chunk-a"]));
        assert_ne!(
            hash_text("hello", "1.0.0", ["a", "b"]),
            hash_text("hello", "1.0.0", ["ab"])
        );
    }

    #[test]
    fn test_hash_file_matches_hash_text() {
        let mut temp_file = tempfile::NamedTempFile::new().unwrap();
        write!(temp_file, "fn main() {{}}\n").unwrap();

        let from_file = hash_file(temp_file.path(), "2.0.0", ["src/main.rs"]).unwrap();
        let from_text = hash_text("fn main() {}\n", "2.0.0", ["src/main.rs"]);
        assert_eq!(from_file, from_text);
    }

    #[test]
    fn test_hash_file_missing() {
        let result = hash_file(Path::new("/nonexistent/file"), "1.0.0", NO_EXTRA);
        assert!(matches!(result, Err(ParserError::Io { .. })));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  a\r\nb\r  "), "a\nb");
    }
}
