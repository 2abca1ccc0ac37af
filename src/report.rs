//! Report assembly and atomic output.
//!
//! The document is sorted and hashed before writing; the write itself is
//! temp-file-then-rename so a crash mid-write never leaves a half-written
//! artifact at the canonical path.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{WarningCode, WarningCollector};
use crate::schema::{Outcome, ReportDocument, RunMeta, Summary, TestRecord, SCHEMA_VERSION};

pub const TOOL_NAME: &str = "ltr";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Assemble one canonical report document from this run's records.
///
/// Records are sorted by (test_id, phase) so the content hash is
/// deterministic across machines; zero records still produce a fully
/// valid document.
pub fn assemble_report(
    mut records: Vec<TestRecord>,
    mut warnings: WarningCollector,
    run_meta: RunMeta,
) -> Result<ReportDocument> {
    records.sort_by(|a, b| {
        a.test_id
            .cmp(&b.test_id)
            .then_with(|| a.phase.cmp(&b.phase))
    });
    if records.is_empty() {
        warnings.record(WarningCode::NoTestsCollected, None);
    }
    let summary = build_summary(&records);

    let mut document = ReportDocument {
        schema_version: SCHEMA_VERSION,
        run_meta,
        summary,
        tests: records,
        warnings: warnings.into_warnings(),
        run_count: 1,
        source_reports: Vec::new(),
        sha256: None,
    };
    document.sha256 = Some(document.content_hash()?);
    Ok(document)
}

fn build_summary(records: &[TestRecord]) -> Summary {
    let mut summary = Summary {
        total: records.len() as u32,
        ..Summary::default()
    };
    for record in records {
        summary.total_duration_seconds += record.duration_seconds;
        match record.outcome {
            Outcome::Passed => summary.passed += 1,
            Outcome::Failed => summary.failed += 1,
            Outcome::Skipped => summary.skipped += 1,
            Outcome::Xfailed => summary.xfailed += 1,
            Outcome::Xpassed => summary.xpassed += 1,
            Outcome::Error => summary.error += 1,
            Outcome::Rerun => summary.rerun += 1,
        }
    }
    summary
}

/// Build run metadata. Timestamps live outside the canonical test list
/// but inside the document, so they are fixed once at assembly time.
pub fn build_run_meta(
    start_time_epoch_ms: u64,
    end_time_epoch_ms: u64,
    exit_code: i32,
    run_id: Option<String>,
    group_id: Option<String>,
    invocation: Option<String>,
) -> RunMeta {
    let (git_sha, git_dirty) = git_info();
    RunMeta {
        start_time_epoch_ms,
        end_time_epoch_ms,
        duration_seconds: end_time_epoch_ms.saturating_sub(start_time_epoch_ms) as f64 / 1000.0,
        tool_name: TOOL_NAME.to_string(),
        tool_version: TOOL_VERSION.to_string(),
        exit_code,
        git_sha,
        git_dirty,
        invocation,
        run_id,
        group_id,
    }
}

/// Best-effort git provenance; (None, None) when git is unavailable.
fn git_info() -> (Option<String>, Option<bool>) {
    let sha = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|sha| sha.trim().to_string());
    let Some(sha) = sha else {
        return (None, None);
    };
    let dirty = Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|status| !status.trim().is_empty());
    (Some(sha), dirty)
}

/// Redact secret-bearing arguments from the recorded invocation line.
pub fn redact_invocation(args: &[String], patterns: &[String]) -> String {
    let mut line = args.join(" ");
    for pattern in patterns {
        if let Ok(re) = Regex::new(pattern) {
            line = re.replace_all(&line, "[REDACTED]").into_owned();
        }
    }
    line
}

#[derive(Debug)]
pub struct WriteOutcome {
    pub path: PathBuf,
    /// True when the primary path failed and the fallback was used.
    pub fallback: bool,
}

/// Write the document atomically, falling back to the bare file name in
/// the working directory when the primary path is unusable. Fatal only
/// when the fallback fails too.
pub fn write_report(document: &ReportDocument, path: &Path) -> Result<WriteOutcome> {
    let bytes = serde_json::to_vec_pretty(document).context("serialize report document")?;
    match atomic_write(path, &bytes) {
        Ok(()) => Ok(WriteOutcome {
            path: path.to_path_buf(),
            fallback: false,
        }),
        Err(primary_err) => {
            let fallback = path
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("output path has no file name: {}", path.display()))?;
            tracing::warn!(
                code = WarningCode::OutputFallback.as_str(),
                primary = %path.display(),
                fallback = %fallback.display(),
                "primary output path failed: {primary_err:#}"
            );
            atomic_write(&fallback, &bytes).with_context(|| {
                format!(
                    "write report to {} after primary {} failed",
                    fallback.display(),
                    path.display()
                )
            })?;
            Ok(WriteOutcome {
                path: fallback,
                fallback: true,
            })
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).with_context(|| format!("create {}", parent.display()))?;
    let mut staged =
        tempfile::NamedTempFile::new_in(&parent).context("create staging temp file")?;
    staged.write_all(bytes).context("write staged report")?;
    staged
        .persist(path)
        .with_context(|| format!("publish report to {}", path.display()))?;
    Ok(())
}

/// Load and parse a previously written report document.
pub fn read_report(path: &Path) -> Result<ReportDocument> {
    let bytes = fs::read(path).with_context(|| format!("read report {}", path.display()))?;
    let document: ReportDocument =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    Ok(document)
}
