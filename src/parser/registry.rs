//! Handler registry: maps a file to exactly one handler.
//!
//! Resolution order is path override, explicit name, shebang, extension and
//! finally the text handler. Shebang and extension matches fall back to text
//! when the matched handler is disabled or its dependency probe fails.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Serialize;
use tracing::warn;

use crate::config::{Config, HandlerConfig};
use crate::error::{ParserError, Result};
use crate::parser::handlers::{self, ParserHandler};
use crate::parser::health::HealthStatus;

pub const DEFAULT_HANDLER: &str = "text";

pub type HandlerFactory = fn() -> Box<dyn ParserHandler>;
pub type HandlerProbeFn = fn() -> HandlerProbe;

/// Result of checking a handler's runtime dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerProbe {
    pub status: HealthStatus,
    pub summary: String,
    pub warnings: Vec<String>,
}

impl HandlerProbe {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Ok,
            summary: summary.into(),
            warnings: Vec::new(),
        }
    }
}

/// Static description of a handler and how to build it.
#[derive(Debug, Clone)]
pub struct ParserHandlerDescriptor {
    pub name: String,
    pub version: String,
    pub display_name: String,
    pub extensions: Vec<String>,
    pub shebangs: Vec<String>,
    pub factory: HandlerFactory,
    pub probe: Option<HandlerProbeFn>,
}

impl ParserHandlerDescriptor {
    pub fn new(name: &str, version: &str, display_name: &str, factory: HandlerFactory) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            display_name: display_name.to_string(),
            extensions: Vec::new(),
            shebangs: Vec::new(),
            factory,
            probe: None,
        }
    }

    #[must_use]
    pub fn extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        self
    }

    #[must_use]
    pub fn shebangs(mut self, shebangs: &[&str]) -> Self {
        self.shebangs = shebangs.iter().map(|s| s.to_ascii_lowercase()).collect();
        self
    }

    #[must_use]
    pub fn probe(mut self, probe: HandlerProbeFn) -> Self {
        self.probe = Some(probe);
        self
    }
}

/// The handler chosen for one file and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSelection {
    pub name: String,
    pub version: String,
    pub resolved_via: String,
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerAvailability {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub enabled: bool,
    pub status: HealthStatus,
    pub summary: String,
    pub warnings: Vec<String>,
}

pub struct HandlerRegistry {
    descriptors: Vec<ParserHandlerDescriptor>,
    by_name: HashMap<String, usize>,
    by_extension: HashMap<String, usize>,
    by_shebang: HashMap<String, usize>,
    enabled: HashMap<String, bool>,
    probes: Vec<HandlerProbe>,
    overrides: RwLock<HashMap<PathBuf, String>>,
}

impl HandlerRegistry {
    /// Build a registry; probes run once here.
    pub fn new(
        descriptors: Vec<ParserHandlerDescriptor>,
        settings: &BTreeMap<String, HandlerConfig>,
    ) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut by_extension = HashMap::new();
        let mut by_shebang = HashMap::new();

        for (idx, descriptor) in descriptors.iter().enumerate() {
            if by_name.insert(descriptor.name.clone(), idx).is_some() {
                return Err(ParserError::Config(format!(
                    "duplicate handler name {:?}",
                    descriptor.name
                )));
            }
            // First registration wins for shared extensions/shebangs
            for ext in &descriptor.extensions {
                by_extension.entry(ext.clone()).or_insert(idx);
            }
            for shebang in &descriptor.shebangs {
                by_shebang.entry(shebang.clone()).or_insert(idx);
            }
        }
        if !by_name.contains_key(DEFAULT_HANDLER) {
            return Err(ParserError::Config(format!(
                "registry requires a {DEFAULT_HANDLER:?} handler for fallback"
            )));
        }

        let enabled = descriptors
            .iter()
            .map(|d| {
                let on = settings.get(&d.name).is_none_or(|s| s.enabled);
                (d.name.clone(), on)
            })
            .collect();
        let probes = descriptors
            .iter()
            .map(|d| match d.probe {
                Some(probe) => probe(),
                None => HandlerProbe::ok(format!("{} ready", d.name)),
            })
            .collect();

        Ok(Self {
            descriptors,
            by_name,
            by_extension,
            by_shebang,
            enabled,
            probes,
            overrides: RwLock::new(HashMap::new()),
        })
    }

    pub fn descriptors(&self) -> &[ParserHandlerDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, name: &str) -> Option<&ParserHandlerDescriptor> {
        self.by_name.get(name).map(|&idx| &self.descriptors[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Handler name → version for every registered handler.
    pub fn versions(&self) -> BTreeMap<String, String> {
        self.descriptors
            .iter()
            .map(|d| (d.name.clone(), d.version.clone()))
            .collect()
    }

    pub fn set_override(&self, path: impl Into<PathBuf>, handler: &str) -> Result<()> {
        if !self.contains(handler) {
            return Err(ParserError::UnknownHandler(handler.to_string()));
        }
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), handler.to_string());
        Ok(())
    }

    pub fn remove_override(&self, path: &Path) -> Option<String> {
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
    }

    fn override_for(&self, path: &Path) -> Option<String> {
        self.overrides
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    /// Resolve the handler for `path`.
    pub fn resolve(
        &self,
        path: &Path,
        explicit: Option<&str>,
        shebang: Option<&str>,
    ) -> Result<HandlerSelection> {
        if let Some(name) = self.override_for(path) {
            match self.by_name.get(&name) {
                Some(&idx) => return Ok(self.selection(idx, "override", false)),
                None => warn!(
                    "Ignoring override {name:?} for {}: handler not registered",
                    path.display()
                ),
            }
        }

        if let Some(name) = explicit {
            let idx = self
                .by_name
                .get(name)
                .ok_or_else(|| ParserError::UnknownHandler(name.to_string()))?;
            return Ok(self.selection(*idx, "explicit", false));
        }

        if let Some(interp) = shebang.and_then(normalize_shebang) {
            let idx = self.by_shebang.get(&interp).or_else(|| {
                let base = interp.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
                self.by_shebang.get(base)
            });
            if let Some(&idx) = idx {
                return Ok(self.checked(idx, format!("shebang:{interp}")));
            }
        }

        if let Some(ext) = infer_extension(path) {
            if let Some(&idx) = self.by_extension.get(&ext) {
                return Ok(self.checked(idx, format!("extension:{ext}")));
            }
        }

        Ok(self.default_selection("default".to_string(), false))
    }

    fn selection(&self, idx: usize, via: &str, fallback: bool) -> HandlerSelection {
        let descriptor = &self.descriptors[idx];
        HandlerSelection {
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            resolved_via: via.to_string(),
            fallback,
        }
    }

    fn checked(&self, idx: usize, via: String) -> HandlerSelection {
        let name = &self.descriptors[idx].name;
        if !self.is_enabled(name) {
            return self.default_selection("fallback:disabled".to_string(), true);
        }
        if self.probes[idx].status != HealthStatus::Ok {
            return self.default_selection("fallback:dependency".to_string(), true);
        }
        self.selection(idx, &via, false)
    }

    fn default_selection(&self, via: String, fallback: bool) -> HandlerSelection {
        // Presence checked in `new`
        let idx = self.by_name[DEFAULT_HANDLER];
        let probe = &self.probes[idx];
        if probe.status != HealthStatus::Ok {
            let via = format!("unhealthy:{}", probe.summary);
            return self.selection(idx, &via, false);
        }
        self.selection(idx, &via, fallback)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).copied().unwrap_or(false)
    }

    /// Registered, enabled and with a passing probe.
    pub fn is_available(&self, name: &str) -> bool {
        self.by_name
            .get(name)
            .is_some_and(|&idx| self.is_enabled(name) && self.probes[idx].status == HealthStatus::Ok)
    }

    /// Map a language tag such as `py` or `typescript` to a handler name.
    pub fn delegate_for(&self, tag: &str) -> Option<&str> {
        let tag = tag.trim().trim_start_matches('.').to_ascii_lowercase();
        if tag.is_empty() {
            return None;
        }
        self.by_name
            .get(&tag)
            .or_else(|| self.by_extension.get(&tag))
            .map(|&idx| self.descriptors[idx].name.as_str())
    }

    /// Build a fresh instance of handler `name`.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn ParserHandler>> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| ParserError::UnknownHandler(name.to_string()))?;
        Ok((descriptor.factory)())
    }

    pub fn availability(&self) -> Vec<HandlerAvailability> {
        self.descriptors
            .iter()
            .zip(&self.probes)
            .map(|(d, probe)| HandlerAvailability {
                name: d.name.clone(),
                display_name: d.display_name.clone(),
                version: d.version.clone(),
                enabled: self.is_enabled(&d.name),
                status: probe.status,
                summary: probe.summary.clone(),
                warnings: probe.warnings.clone(),
            })
            .collect()
    }
}

/// Interpreter named by a `#!` line, lower-cased.
pub fn normalize_shebang(line: &str) -> Option<String> {
    let body = line.trim().strip_prefix("#!")?;
    let mut parts = body.split_whitespace();
    let mut command = parts.next()?;
    if basename(command) == "env" {
        command = parts.find(|p| !p.starts_with('-') && !p.contains('='))?;
    }
    let interp = basename(command).to_ascii_lowercase();
    (!interp.is_empty()).then_some(interp)
}

fn basename(command: &str) -> &str {
    command.rsplit('/').next().unwrap_or(command)
}

/// Lower-cased final suffix. Dotfiles with a single dot have none.
pub fn infer_extension(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let name = name.strip_prefix('.').unwrap_or(name);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Descriptors for the handlers that ship with the crate.
pub fn default_descriptors() -> Vec<ParserHandlerDescriptor> {
    vec![
        handlers::text::descriptor(),
        handlers::markdown::descriptor(),
        handlers::python::descriptor(),
        handlers::javascript::javascript_descriptor(),
        handlers::javascript::typescript_descriptor(),
        handlers::html::descriptor(),
        handlers::css::descriptor(),
    ]
}

pub fn build_default_registry(config: &Config) -> Result<HandlerRegistry> {
    HandlerRegistry::new(default_descriptors(), &config.handlers)
}
