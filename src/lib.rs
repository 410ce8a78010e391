//! # chunkloom: incremental source-tree parser
//!
//! Walks configured source trees, picks one handler per file, and turns code,
//! markup and prose into hashed, token-budgeted chunks stored as versioned
//! slices in SQLite.
//!
//! ## Architecture
//!
//! - **[`config`]**: Configuration loading, defaults and validation
//! - **[`db`]**: SQLite store for batches, files, symbols and chunk slices
//! - **[`error`]**: Error type shared by the parser core
//! - **[`parser`]**: Traversal, handler registry, handlers, delegation,
//!   persistence, recomposition, manifest and health checks

pub mod config;
pub mod db;
pub mod error;
pub mod parser;
