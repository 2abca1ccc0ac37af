//! Multi-run aggregation of previously produced report documents.

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{WarningCode, WarningCollector};
use crate::report;
use crate::schema::{
    Outcome, ReportDocument, RunMeta, SourceReport, Summary, TestRecord,
    MIN_COMPATIBLE_SCHEMA_VERSION, SCHEMA_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AggregationPolicy {
    /// Keep the newest record per test: rerun/reshard semantics.
    Latest,
    /// Keep the most informative single outcome per test.
    Merge,
    /// Keep every record from every source, stamped with its run id.
    All,
}

/// Precedence for the `merge` policy, most informative first. Failing
/// outcomes outrank passing ones so flakiness is surfaced, not hidden.
fn outcome_rank(outcome: Outcome) -> u8 {
    match outcome {
        Outcome::Error => 0,
        Outcome::Failed => 1,
        Outcome::Rerun => 2,
        Outcome::Xpassed => 3,
        Outcome::Xfailed => 4,
        Outcome::Skipped => 5,
        Outcome::Passed => 6,
    }
}

struct Candidate {
    record: TestRecord,
    source_index: usize,
}

/// One validated aggregation input.
struct Source {
    path: PathBuf,
    sha256: String,
    document: ReportDocument,
}

/// Aggregate all report documents found in `dir` under `policy`.
///
/// Corrupt sources (unreadable, hash mismatch, incompatible schema) are
/// excluded with a warning, never silently merged; aggregation fails only
/// when no valid source remains.
pub fn aggregate_dir(dir: &Path, policy: AggregationPolicy) -> Result<ReportDocument> {
    let mut warnings = WarningCollector::new();
    let sources = load_sources(dir, &mut warnings)?;
    if sources.is_empty() {
        return Err(anyhow!(
            "no valid source reports in {} to aggregate",
            dir.display()
        ));
    }
    aggregate(sources, policy, warnings)
}

fn load_sources(dir: &Path, warnings: &mut WarningCollector) -> Result<Vec<Source>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read aggregation dir {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    // Deterministic input order regardless of directory iteration order.
    paths.sort();

    let mut sources = Vec::new();
    for path in paths {
        let document = match report::read_report(&path) {
            Ok(document) => document,
            Err(err) => {
                warnings.record(
                    WarningCode::SourceUnreadable,
                    Some(format!("{}: {err:#}", path.display())),
                );
                continue;
            }
        };
        match document.hash_is_valid() {
            Ok(true) => {}
            _ => {
                warnings.record(
                    WarningCode::SourceHashMismatch,
                    Some(path.display().to_string()),
                );
                continue;
            }
        }
        if document.schema_version < MIN_COMPATIBLE_SCHEMA_VERSION
            || document.schema_version > SCHEMA_VERSION
        {
            warnings.record(
                WarningCode::SchemaVersionMismatch,
                Some(format!(
                    "{}: schema_version {} unsupported, excluded",
                    path.display(),
                    document.schema_version
                )),
            );
            continue;
        }
        if document.schema_version != SCHEMA_VERSION {
            warnings.record(
                WarningCode::SchemaVersionMismatch,
                Some(format!(
                    "{}: schema_version {} read as {}",
                    path.display(),
                    document.schema_version,
                    SCHEMA_VERSION
                )),
            );
        }
        let sha256 = document
            .sha256
            .clone()
            .unwrap_or_default();
        sources.push(Source {
            path,
            sha256,
            document,
        });
    }
    Ok(sources)
}

fn aggregate(
    sources: Vec<Source>,
    policy: AggregationPolicy,
    warnings: WarningCollector,
) -> Result<ReportDocument> {
    let run_count = sources.len() as u32;
    let source_reports: Vec<SourceReport> = sources
        .iter()
        .map(|source| SourceReport {
            path: source.path.display().to_string(),
            sha256: source.sha256.clone(),
        })
        .collect();

    let mut candidates: Vec<Candidate> = Vec::new();
    for (source_index, source) in sources.iter().enumerate() {
        for record in &source.document.tests {
            let mut record = record.clone();
            if record.run_id.is_none() {
                record.run_id = source.document.run_meta.run_id.clone();
            }
            if record.start_time_epoch_ms.is_none() {
                record.start_time_epoch_ms = Some(source.document.run_meta.start_time_epoch_ms);
            }
            candidates.push(Candidate {
                record,
                source_index,
            });
        }
    }

    let mut records: Vec<TestRecord> = match policy {
        AggregationPolicy::All => candidates.into_iter().map(|c| c.record).collect(),
        AggregationPolicy::Latest => pick_per_group(candidates, newer),
        AggregationPolicy::Merge => pick_per_group(candidates, |a, b| {
            match outcome_rank(a.record.outcome).cmp(&outcome_rank(b.record.outcome)) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => newer(a, b),
            }
        }),
    };
    records.sort_by(|a, b| {
        a.test_id
            .cmp(&b.test_id)
            .then_with(|| a.phase.cmp(&b.phase))
    });

    let run_meta = aggregate_run_meta(&sources);
    let summary = summarize(&records);
    let mut document = ReportDocument {
        schema_version: SCHEMA_VERSION,
        run_meta,
        summary,
        tests: records,
        warnings: warnings.into_warnings(),
        run_count,
        source_reports,
        sha256: None,
    };
    document.sha256 = Some(document.content_hash()?);
    Ok(document)
}

/// True when `a` should replace `b`: later start time, then run id, then
/// source position. The composite order is total, so ties are impossible.
fn newer(a: &Candidate, b: &Candidate) -> bool {
    let key_a = (
        a.record.start_time_epoch_ms.unwrap_or(0),
        a.record.run_id.clone().unwrap_or_default(),
        a.source_index,
    );
    let key_b = (
        b.record.start_time_epoch_ms.unwrap_or(0),
        b.record.run_id.clone().unwrap_or_default(),
        b.source_index,
    );
    key_a > key_b
}

/// Group candidates by (test identity, phase) and keep the winner chosen
/// by `replaces`.
fn pick_per_group(
    candidates: Vec<Candidate>,
    replaces: impl Fn(&Candidate, &Candidate) -> bool,
) -> Vec<TestRecord> {
    let mut groups: BTreeMap<(String, crate::schema::Phase), Candidate> = BTreeMap::new();
    for candidate in candidates {
        let key = (candidate.record.test_id.clone(), candidate.record.phase);
        match groups.get(&key) {
            Some(current) if !replaces(&candidate, current) => {}
            _ => {
                groups.insert(key, candidate);
            }
        }
    }
    groups.into_values().map(|c| c.record).collect()
}

fn aggregate_run_meta(sources: &[Source]) -> RunMeta {
    let start = sources
        .iter()
        .map(|s| s.document.run_meta.start_time_epoch_ms)
        .min()
        .unwrap_or(0);
    let end = sources
        .iter()
        .map(|s| s.document.run_meta.end_time_epoch_ms)
        .max()
        .unwrap_or(0);
    let exit_code = sources
        .iter()
        .map(|s| s.document.run_meta.exit_code)
        .max()
        .unwrap_or(0);
    RunMeta {
        start_time_epoch_ms: start,
        end_time_epoch_ms: end,
        duration_seconds: end.saturating_sub(start) as f64 / 1000.0,
        tool_name: report::TOOL_NAME.to_string(),
        tool_version: report::TOOL_VERSION.to_string(),
        exit_code,
        git_sha: None,
        git_dirty: None,
        invocation: None,
        run_id: None,
        group_id: sources
            .iter()
            .find_map(|s| s.document.run_meta.group_id.clone()),
    }
}

fn summarize(records: &[TestRecord]) -> Summary {
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
