//! Report document schema and content hashing.
//!
//! Field order is fixed by struct declaration so canonical serialization
//! is byte-stable across machines and runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ReportWarning;
use crate::util::sha256_hex;

/// Current report schema version.
pub const SCHEMA_VERSION: u32 = 2;
/// Oldest schema version aggregation will still consume.
pub const MIN_COMPATIBLE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Run,
    Teardown,
}

impl Phase {
    pub fn parse(raw: &str) -> Option<Phase> {
        match raw {
            "setup" => Some(Phase::Setup),
            // pytest calls the run phase "call"; accept both spellings.
            "run" | "call" => Some(Phase::Run),
            "teardown" => Some(Phase::Teardown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Xfailed,
    Xpassed,
    Error,
    Rerun,
}

/// One (file, line, test, phase) hit from the coverage source. Ephemeral:
/// consumed by the coverage mapper and never stored in the report.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoverageFact {
    pub file: String,
    pub line: u32,
    pub test_id: String,
    pub phase: Phase,
}

/// Compacted per-(test, file) coverage. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageEntry {
    pub file_path: String,
    pub line_ranges: Vec<[u32; 2]>,
    pub line_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub mode: String,
    pub included_files: Vec<String>,
    pub total_bytes: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub scenario: String,
    pub why_needed: String,
    pub key_assertions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub context_summary: ContextSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub test_id: String,
    pub phase: Phase,
    pub outcome: Outcome,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_epoch_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub coverage: Vec<CoverageEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub xfailed: u32,
    pub xpassed: u32,
    pub error: u32,
    pub rerun: u32,
    pub total_duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub start_time_epoch_ms: u64,
    pub end_time_epoch_ms: u64,
    pub duration_seconds: f64,
    pub tool_name: String,
    pub tool_version: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_dirty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Provenance entry for one aggregation input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub schema_version: u32,
    pub run_meta: RunMeta,
    pub summary: Summary,
    pub tests: Vec<TestRecord>,
    pub warnings: Vec<ReportWarning>,
    pub run_count: u32,
    #[serde(default)]
    pub source_reports: Vec<SourceReport>,
    /// Self-referential content hash; excluded from the hashed region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ReportDocument {
    /// Canonical bytes of the document with the self hash cleared.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut unhashed = self.clone();
        unhashed.sha256 = None;
        serde_json::to_vec_pretty(&unhashed).context("serialize report document")
    }

    /// Compute the content hash over the canonical serialized form.
    pub fn content_hash(&self) -> Result<String> {
        Ok(sha256_hex(&self.canonical_bytes()?))
    }

    /// True when the embedded hash matches the recomputed one.
    pub fn hash_is_valid(&self) -> Result<bool> {
        match &self.sha256 {
            Some(recorded) => Ok(*recorded == self.content_hash()?),
            None => Ok(false),
        }
    }
}
