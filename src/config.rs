//! Run configuration: JSON config file plus CLI overrides.
//!
//! Defaults are safe and privacy-preserving: provider `none`, minimal
//! context, secret-like files always excluded.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::context::{ContextLimits, ContextMode};
use crate::coverage::PhaseFilter;

fn default_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_context_exclude_globs() -> Vec<String> {
    [
        "*.pyc",
        "__pycache__/**",
        ".git/**",
        ".env",
        ".env.*",
        "*.key",
        "*.pem",
        "*secret*",
        "*password*",
        "*credential*",
        ".venv/**",
        "node_modules/**",
        "target/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_coverage_exclude_globs() -> Vec<String> {
    ["*.so", "*.pyd", "vendor/**", ".venv/**", "site-packages/**"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_redact_patterns() -> Vec<String> {
    [
        r"--password[=\s]\S+",
        r"--token[=\s]\S+",
        r"--api[_-]?key[=\s]\S+",
        r"--secret[=\s]\S+",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_context_bytes() -> u64 {
    32_000
}
fn default_context_files() -> usize {
    10
}
fn default_max_tests() -> usize {
    100
}
fn default_max_concurrency() -> usize {
    4
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_cache_ttl_seconds() -> u64 {
    86_400
}
fn default_cache_dir() -> String {
    ".ltr_cache".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Annotation provider: "none" disables annotation entirely.
    pub provider: String,
    pub model: String,
    pub endpoint: String,

    pub context_mode: ContextMode,
    pub context_max_bytes: u64,
    pub context_max_files: usize,
    pub context_exclude_globs: Vec<String>,
    /// Tests that opted out of annotation.
    pub annotation_opt_out: Vec<String>,
    /// Per-test context mode overrides; beat the global mode.
    pub context_mode_overrides: BTreeMap<String, ContextMode>,

    pub max_tests: usize,
    pub max_concurrency: usize,
    pub timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub cache_dir: String,

    pub include_phase: PhaseFilter,
    pub omit_tests_from_coverage: bool,
    pub coverage_exclude_globs: Vec<String>,
    pub case_insensitive_paths: bool,

    pub invocation_redact_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            provider: "none".to_string(),
            model: String::new(),
            endpoint: default_endpoint(),
            context_mode: ContextMode::Minimal,
            context_max_bytes: default_context_bytes(),
            context_max_files: default_context_files(),
            context_exclude_globs: default_context_exclude_globs(),
            annotation_opt_out: Vec::new(),
            context_mode_overrides: BTreeMap::new(),
            max_tests: default_max_tests(),
            max_concurrency: default_max_concurrency(),
            timeout_seconds: default_timeout_seconds(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_dir: default_cache_dir(),
            include_phase: PhaseFilter::Run,
            omit_tests_from_coverage: default_true(),
            coverage_exclude_globs: default_coverage_exclude_globs(),
            case_insensitive_paths: false,
            invocation_redact_patterns: default_redact_patterns(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
        let config: Config = serde_json::from_slice(&bytes).context("parse config JSON")?;
        Ok(config)
    }

    /// Validate the configuration, returning all errors at once.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !matches!(self.provider.as_str(), "none" | "ollama" | "http") {
            errors.push(format!(
                "invalid provider '{}': must be one of none, ollama, http",
                self.provider
            ));
        }
        if self.is_annotation_enabled() && self.model.is_empty() {
            errors.push("model must be set when a provider is enabled".to_string());
        }
        if self.context_max_bytes < 1000 {
            errors.push("context_max_bytes must be at least 1000".to_string());
        }
        if self.max_tests < 1 {
            errors.push("max_tests must be at least 1".to_string());
        }
        if self.max_concurrency < 1 {
            errors.push("max_concurrency must be at least 1".to_string());
        }
        if self.timeout_seconds < 1 {
            errors.push("timeout_seconds must be at least 1".to_string());
        }
        for pattern in self
            .context_exclude_globs
            .iter()
            .chain(&self.coverage_exclude_globs)
        {
            if Glob::new(pattern).is_err() {
                errors.push(format!("invalid glob pattern '{pattern}'"));
            }
        }
        errors
    }

    pub fn is_annotation_enabled(&self) -> bool {
        self.provider != "none"
    }

    pub fn context_limits(&self) -> ContextLimits {
        ContextLimits {
            max_bytes: self.context_max_bytes,
            max_files: self.context_max_files,
        }
    }

    pub fn context_deny_set(&self) -> Result<GlobSet> {
        build_globset(&self.context_exclude_globs)
    }

    pub fn coverage_exclude_set(&self) -> Result<GlobSet> {
        build_globset(&self.coverage_exclude_globs)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("glob pattern '{pattern}'"))?);
    }
    builder.build().context("build glob set")
}
