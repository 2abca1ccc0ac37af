//! Context assembly for annotation prompts.
//!
//! Selects and bounds the source material eligible for annotation. The
//! output is a pure function of the request, repo contents, and limits,
//! so it can feed the cache key directly.

use globset::GlobSet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::{WarningCode, WarningCollector};
use crate::schema::{ContextSummary, CoverageEntry};
use crate::util::{sha256_hex, truncate_string};

/// How much source material is eligible for annotation. The modes form a
/// lattice: `complete` is a strict superset of `balanced`, which is a
/// strict superset of `minimal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    #[default]
    Minimal,
    Balanced,
    Complete,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextMode::Minimal => "minimal",
            ContextMode::Balanced => "balanced",
            ContextMode::Complete => "complete",
        }
    }

    /// Lattice relation: does this mode include everything `other` does?
    pub fn includes(self, other: ContextMode) -> bool {
        self >= other
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextLimits {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        ContextLimits {
            max_bytes: 32_000,
            max_files: 10,
        }
    }
}

/// One test's context request. Per-test overrides take precedence over
/// the global mode; opt-out short-circuits to no payload at all.
#[derive(Debug, Clone)]
pub struct ContextRequest<'a> {
    pub test_id: &'a str,
    pub coverage: &'a [CoverageEntry],
    pub mode: ContextMode,
    pub mode_override: Option<ContextMode>,
    pub opt_out: bool,
}

/// Assembled prompt material plus the hashes the cache key needs.
#[derive(Debug, Clone)]
pub struct ContextPayload {
    pub text: String,
    /// (path, sha256 of the content actually included), in include order.
    pub included_file_hashes: Vec<(String, String)>,
}

struct Candidate {
    path: String,
    content: String,
}

/// Assemble the annotation payload for one test.
///
/// Returns `None` when the test opted out: no payload, no cache lookup,
/// no external call.
pub fn assemble(
    request: &ContextRequest<'_>,
    repo_root: &Path,
    limits: ContextLimits,
    deny: &GlobSet,
    warnings: &mut WarningCollector,
) -> Option<(ContextPayload, ContextSummary)> {
    if request.opt_out {
        return None;
    }
    let mode = request.mode_override.unwrap_or(request.mode);

    let declaring_file = request.test_id.split("::").next().unwrap_or("");
    let file_content = read_repo_file(repo_root, declaring_file, deny, warnings);
    let test_source = file_content
        .as_deref()
        .map(|content| extract_test_source(content, request.test_id))
        .unwrap_or_default();

    let mut text = String::new();
    text.push_str(&format!("test: {}\n", request.test_id));
    text.push_str(&format!("file: {declaring_file}\n"));
    if !test_source.is_empty() {
        text.push_str("--- test source ---\n");
        text.push_str(&test_source);
        text.push('\n');
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    if mode.includes(ContextMode::Balanced) {
        // Imports live at module level, so scan the whole declaring file,
        // not just the extracted test unit.
        for path in imported_files(file_content.as_deref().unwrap_or(""), repo_root) {
            if path == declaring_file {
                continue;
            }
            if let Some(content) = read_repo_file(repo_root, &path, deny, warnings) {
                candidates.push(Candidate {
                    path,
                    content: signature_summary(&content),
                });
            }
        }
    }
    if mode.includes(ContextMode::Complete) {
        for entry in request.coverage {
            if entry.file_path == declaring_file {
                continue;
            }
            if candidates.iter().any(|c| c.path == entry.file_path) {
                continue;
            }
            if let Some(content) = read_repo_file(repo_root, &entry.file_path, deny, warnings) {
                candidates.push(Candidate {
                    path: entry.file_path.clone(),
                    content,
                });
            }
        }
    }

    // Water-fill: metadata is already in, then smaller files first so
    // many small files beat one large file within the byte ceiling.
    candidates.sort_by(|a, b| {
        a.content
            .len()
            .cmp(&b.content.len())
            .then_with(|| a.path.cmp(&b.path))
    });

    let mut truncated = false;
    let mut included_files = Vec::new();
    let mut included_file_hashes = Vec::new();
    let mut budget_used: u64 = 0;
    for candidate in candidates {
        let size = candidate.content.len() as u64;
        if included_files.len() >= limits.max_files || budget_used + size > limits.max_bytes {
            truncated = true;
            tracing::debug!(
                test_id = request.test_id,
                path = candidate.path.as_str(),
                "dropped context file over budget"
            );
            continue;
        }
        budget_used += size;
        text.push_str(&format!("--- {} ---\n", candidate.path));
        text.push_str(&candidate.content);
        if !candidate.content.ends_with('\n') {
            text.push('\n');
        }
        included_file_hashes.push((
            candidate.path.clone(),
            sha256_hex(candidate.content.as_bytes()),
        ));
        included_files.push(candidate.path);
    }

    let summary = ContextSummary {
        mode: mode.as_str().to_string(),
        included_files,
        total_bytes: text.len() as u64,
        truncated,
    };
    Some((
        ContextPayload {
            text,
            included_file_hashes,
        },
        summary,
    ))
}

/// Read a repo-relative file, honoring the deny list and refusing
/// symlinks that resolve outside the repo root.
fn read_repo_file(
    repo_root: &Path,
    relative: &str,
    deny: &GlobSet,
    warnings: &mut WarningCollector,
) -> Option<String> {
    if relative.is_empty() || deny.is_match(relative) {
        return None;
    }
    let full = repo_root.join(relative);
    if !full.is_file() {
        return None;
    }
    let resolved = full.canonicalize().ok()?;
    let root = repo_root.canonicalize().ok()?;
    if !resolved.starts_with(&root) {
        return None;
    }
    let bytes = fs::read(&resolved).ok()?;
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(_) => {
            warnings.record(WarningCode::ContextFileUnreadable, Some(relative.to_string()));
            None
        }
    }
}

/// Extract the test's own source unit from its declaring file.
///
/// The test name is the last `::` segment with any `[param]` suffix
/// stripped; the unit is the declaration line plus its indented block.
fn extract_test_source(file_content: &str, test_id: &str) -> String {
    let name = test_id
        .rsplit("::")
        .next()
        .unwrap_or("")
        .split('[')
        .next()
        .unwrap_or("");
    if name.is_empty() {
        return String::new();
    }

    let lines: Vec<&str> = file_content.lines().collect();
    let mut collected: Vec<&str> = Vec::new();
    let mut base_indent = 0usize;
    let mut in_unit = false;
    for line in &lines {
        if !in_unit {
            let trimmed = line.trim_start();
            let declares = trimmed.starts_with(&format!("def {name}("))
                || trimmed.starts_with(&format!("async def {name}("))
                || trimmed.contains(&format!("fn {name}("));
            if declares {
                in_unit = true;
                base_indent = line.len() - trimmed.len();
                collected.push(line);
            }
            continue;
        }
        if line.trim().is_empty() {
            collected.push(line);
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        if indent > base_indent {
            collected.push(line);
        } else if line.trim() == "}" && indent == base_indent {
            // Closing brace of a brace-delimited unit.
            collected.push(line);
            break;
        } else {
            break;
        }
    }
    collected.join("\n")
}

/// First-party files referenced by the declaring file's import lines.
fn imported_files(declaring_source: &str, repo_root: &Path) -> Vec<String> {
    let import_line =
        Regex::new(r"^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+)|use\s+crate::(\w+))")
            .expect("import regex");
    let mut found = Vec::new();
    for line in declaring_source.lines() {
        let Some(captures) = import_line.captures(line) else {
            continue;
        };
        let module = captures
            .get(1)
            .or_else(|| captures.get(2))
            .or_else(|| captures.get(3))
            .map(|m| m.as_str())
            .unwrap_or("");
        if module.is_empty() {
            continue;
        }
        let base = module.replace('.', "/");
        let first = module.split('.').next().unwrap_or(module);
        for candidate in [
            format!("{base}.py"),
            format!("{base}/__init__.py"),
            format!("src/{first}.rs"),
        ] {
            if repo_root.join(&candidate).is_file() && !found.contains(&candidate) {
                found.push(candidate);
                break;
            }
        }
    }
    found
}

/// Reduce a source file to signatures and one-line docstrings, the
/// balanced-mode stand-in for a full body.
fn signature_summary(content: &str) -> String {
    let mut summary = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        let is_signature = trimmed.starts_with("def ")
            || trimmed.starts_with("async def ")
            || trimmed.starts_with("class ")
            || trimmed.starts_with("fn ")
            || trimmed.starts_with("pub fn ")
            || trimmed.starts_with("pub struct ")
            || trimmed.starts_with("struct ")
            || trimmed.starts_with("impl ")
            || trimmed.starts_with("trait ");
        let is_doc = (trimmed.starts_with("\"\"\"") && trimmed.len() > 3)
            || trimmed.starts_with("///")
            || trimmed.starts_with("//!");
        if is_signature || is_doc {
            summary.push(truncate_string(line, 200));
        }
    }
    summary.join("\n")
}
