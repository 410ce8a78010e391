/// Configuration module for chunkloom.
///
/// Handles loading, validating, and providing default configuration values
/// for the parser: sources, handler toggles, token caps and health thresholds.
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Default value functions ──────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "./parser.db".to_string()
}

fn default_manifest_path() -> String {
    "./manifest.json".to_string()
}

fn default_workspace_ignore_patterns() -> Vec<String> {
    [
        "db.sqlite3",
        "db.sqlite3-journal",
        "db.sqlite3-shm",
        "db.sqlite3-wal",
        "parser.db",
        "parser.db-journal",
        "manifest.json",
        "manifest.json.*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_general_max_tokens() -> TokenLimit {
    TokenLimit::Limit(2000)
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_delegation_depth() -> usize {
    4
}

/// Handler names that ship with the crate.
pub const DEFAULT_HANDLER_NAMES: [&str; 7] = [
    "text",
    "markdown",
    "python",
    "javascript",
    "typescript",
    "html",
    "css",
];

fn default_handlers() -> BTreeMap<String, HandlerConfig> {
    DEFAULT_HANDLER_NAMES
        .iter()
        .map(|name| (name.to_string(), HandlerConfig::default()))
        .collect()
}

fn default_lock_wait_warning_seconds() -> f64 {
    5.0
}

fn default_lock_wait_error_seconds() -> f64 {
    30.0
}

fn default_lock_contention_threshold() -> u64 {
    1
}

// ── Config structs ───────────────────────────────────────────────────

/// Token cap: a positive integer or `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TokenLimitRepr", into = "TokenLimitRepr")]
pub enum TokenLimit {
    Auto,
    Limit(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TokenLimitRepr {
    Int(usize),
    Word(String),
}

impl TryFrom<TokenLimitRepr> for TokenLimit {
    type Error = String;

    fn try_from(value: TokenLimitRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            TokenLimitRepr::Int(0) => Err("token limit must be positive".to_string()),
            TokenLimitRepr::Int(n) => Ok(Self::Limit(n)),
            TokenLimitRepr::Word(w) if w.trim().eq_ignore_ascii_case("auto") => Ok(Self::Auto),
            TokenLimitRepr::Word(w) => Err(format!("token limit must be an integer or 'auto', got {w:?}")),
        }
    }
}

impl From<TokenLimit> for TokenLimitRepr {
    fn from(value: TokenLimit) -> Self {
        match value {
            TokenLimit::Auto => Self::Word("auto".to_string()),
            TokenLimit::Limit(n) => Self::Int(n),
        }
    }
}

/// How ignore rules are combined during traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GitignoreBehavior {
    /// Only `.gitignore` files found in the tree.
    Repo,
    /// Only the configured workspace patterns.
    Workspace,
    #[default]
    Combined,
}

impl fmt::Display for GitignoreBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Repo => "repo",
            Self::Workspace => "workspace",
            Self::Combined => "combined",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HandlerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `None` inherits `general_max_tokens`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<TokenLimit>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_lock_wait_warning_seconds")]
    pub lock_wait_warning_seconds: f64,

    #[serde(default = "default_lock_wait_error_seconds")]
    pub lock_wait_error_seconds: f64,

    #[serde(default = "default_lock_contention_threshold")]
    pub lock_contention_warning: u64,

    #[serde(default = "default_lock_contention_threshold")]
    pub lock_contention_error: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,

    /// Source name -> root directory.
    #[serde(default)]
    pub sources: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub gitignore_behavior: GitignoreBehavior,

    #[serde(default = "default_workspace_ignore_patterns")]
    pub workspace_ignore_patterns: Vec<String>,

    #[serde(default)]
    pub follow_symlinks: bool,

    #[serde(default = "default_general_max_tokens")]
    pub general_max_tokens: TokenLimit,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,

    /// Path to a HuggingFace `tokenizer.json`; the built-in encoder is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<String>,

    #[serde(default = "default_handlers")]
    pub handlers: BTreeMap<String, HandlerConfig>,

    #[serde(default)]
    pub health: HealthConfig,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_db_path(),
            manifest_path: default_manifest_path(),
            sources: BTreeMap::new(),
            gitignore_behavior: GitignoreBehavior::default(),
            workspace_ignore_patterns: default_workspace_ignore_patterns(),
            follow_symlinks: false,
            general_max_tokens: default_general_max_tokens(),
            max_concurrency: default_max_concurrency(),
            max_delegation_depth: default_max_delegation_depth(),
            tokenizer_path: None,
            handlers: default_handlers(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            lock_wait_warning_seconds: default_lock_wait_warning_seconds(),
            lock_wait_error_seconds: default_lock_wait_error_seconds(),
            lock_contention_warning: default_lock_contention_threshold(),
            lock_contention_error: default_lock_contention_threshold(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON or TOML file.
    ///
    /// If `config_path` is empty, defaults to `"chunkloom.json"`. A missing
    /// file yields the default configuration.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "chunkloom.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let mut cfg: Config = if path.ends_with(".toml") {
            toml::from_str(&data).with_context(|| format!("invalid TOML in {path}"))?
        } else {
            serde_json::from_str(&data).with_context(|| format!("invalid JSON in {path}"))?
        };

        info!("Loaded configuration from {path}");

        // Handlers missing from the file keep their defaults
        for name in DEFAULT_HANDLER_NAMES {
            cfg.handlers.entry(name.to_string()).or_default();
        }

        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_concurrency > 0, "max_concurrency must be positive");
        anyhow::ensure!(
            self.max_delegation_depth > 0,
            "max_delegation_depth must be positive"
        );
        anyhow::ensure!(
            self.health.lock_wait_warning_seconds <= self.health.lock_wait_error_seconds,
            "lock_wait_warning_seconds must not exceed lock_wait_error_seconds"
        );
        anyhow::ensure!(
            self.health.lock_contention_warning <= self.health.lock_contention_error,
            "lock_contention_warning must not exceed lock_contention_error"
        );
        for (name, path) in &self.sources {
            if !path.is_dir() {
                warn!("source {name} points at a missing directory: {}", path.display());
            }
        }
        Ok(())
    }

    /// Settings for `handler`, or defaults when it is not configured.
    #[must_use]
    pub fn handler(&self, handler: &str) -> HandlerConfig {
        self.handlers.get(handler).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn is_handler_enabled(&self, handler: &str) -> bool {
        self.handlers.get(handler).is_none_or(|h| h.enabled)
    }

    /// Effective cap for `handler` before `auto` is resolved.
    #[must_use]
    pub fn handler_max_tokens(&self, handler: &str) -> TokenLimit {
        self.handlers
            .get(handler)
            .and_then(|h| h.max_tokens)
            .unwrap_or(self.general_max_tokens)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.enabled);
        assert_eq!(config.general_max_tokens, TokenLimit::Limit(2000));
        assert_eq!(config.gitignore_behavior, GitignoreBehavior::Combined);
        assert_eq!(config.handlers.len(), DEFAULT_HANDLER_NAMES.len());
        assert!(config.is_handler_enabled("python"));
        assert!(config.is_handler_enabled("not-configured"));
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{
            "general_max_tokens": "auto",
            "handlers": {"python": {"enabled": false, "max_tokens": 64}},
            "gitignore_behavior": "repo"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.general_max_tokens, TokenLimit::Auto);
        assert_eq!(config.gitignore_behavior, GitignoreBehavior::Repo);
        assert!(!config.is_handler_enabled("python"));
        assert_eq!(config.handler_max_tokens("python"), TokenLimit::Limit(64));
        assert_eq!(config.handler_max_tokens("css"), TokenLimit::Auto);
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn test_token_limit_rejects_garbage() {
        assert!(serde_json::from_str::<TokenLimit>(r#""lots""#).is_err());
        assert!(serde_json::from_str::<TokenLimit>("0").is_err());
        assert_eq!(
            serde_json::from_str::<TokenLimit>(r#""AUTO""#).unwrap(),
            TokenLimit::Auto
        );
    }

    #[test]
    fn test_load_toml_and_fill_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunkloom.toml");
        std::fs::write(
            &path,
            "max_concurrency = 2\n[handlers.css]\nenabled = false\n",
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert!(!config.is_handler_enabled("css"));
        assert!(config.handlers.contains_key("markdown"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/chunkloom.json").unwrap();
        assert_eq!(config.db_path, "./parser.db");
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.health.lock_wait_warning_seconds = 60.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.general_max_tokens, config.general_max_tokens);
        assert_eq!(parsed.handlers, config.handlers);
        assert_eq!(parsed.health, config.health);
    }
}
