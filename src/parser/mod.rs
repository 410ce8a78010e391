//! Parsing and chunking pipeline.
//!
//! Traversal picks files, the registry resolves one handler per file,
//! handlers emit symbols and chunks (delegating embedded languages), and the
//! persistence layer stages the result into SQLite as versioned chunk slices
//! that [`recomposition`] can stitch back together.

pub mod delegation;
pub mod handlers;
pub mod hashing;
pub mod health;
pub mod manifest;
pub mod metadata;
pub mod persistence;
pub mod recomposition;
pub mod registry;
pub mod service;
pub mod splitter;
pub mod tokenizer;
pub mod traversal;
