//! Coverage-context mapping: raw line hits to per-test coverage entries.

use globset::GlobSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{WarningCode, WarningCollector};
use crate::ingest::CoverageShard;
use crate::paths;
use crate::ranges;
use crate::schema::{CoverageEntry, CoverageFact, Phase};

/// Which execution phase's coverage facts to keep. The default keeps only
/// the run phase, excluding setup/teardown noise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseFilter {
    Setup,
    #[default]
    Run,
    Teardown,
    All,
}

impl PhaseFilter {
    fn keeps(self, phase: Phase) -> bool {
        match self {
            PhaseFilter::Setup => phase == Phase::Setup,
            PhaseFilter::Run => phase == Phase::Run,
            PhaseFilter::Teardown => phase == Phase::Teardown,
            PhaseFilter::All => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoverageOptions {
    pub phase_filter: PhaseFilter,
    pub repo_root: String,
    pub case_insensitive_paths: bool,
    /// Drop hits against the test's own declaring file.
    pub omit_test_own_file: bool,
    /// Non-source-file policy: vendored paths, compiled extensions, etc.
    pub exclude: GlobSet,
}

/// Counters for silently dropped input, surfaced in logs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapDiagnostics {
    pub excluded_files: u64,
    pub malformed_records: u64,
}

/// Map coverage shards to per-test compacted coverage entries.
///
/// Shards are unioned at the (file, line, test, phase) tuple level before
/// grouping, which makes the merge commutative and idempotent regardless
/// of shard ordering. Empty input signals `NO_COVERAGE_DATA` exactly once
/// and returns an empty mapping, never an error.
pub fn map_coverage(
    shards: Vec<CoverageShard>,
    options: &CoverageOptions,
    warnings: &mut WarningCollector,
) -> (BTreeMap<String, Vec<CoverageEntry>>, MapDiagnostics) {
    let mut diagnostics = MapDiagnostics {
        malformed_records: shards.iter().map(|shard| shard.malformed).sum(),
        ..MapDiagnostics::default()
    };

    let facts: BTreeSet<CoverageFact> = shards.into_iter().flat_map(|shard| shard.facts).collect();
    if facts.is_empty() {
        warnings.record(WarningCode::NoCoverageData, None);
        return (BTreeMap::new(), diagnostics);
    }

    // (test_id, normalized file) -> covered line set.
    let mut groups: BTreeMap<(String, String), BTreeSet<u32>> = BTreeMap::new();
    for fact in facts {
        if !options.phase_filter.keeps(fact.phase) {
            continue;
        }
        let (file, warning) = paths::normalize(
            &fact.file,
            &options.repo_root,
            options.case_insensitive_paths,
        );
        if let Some(code) = warning {
            warnings.record(code, Some(fact.file.clone()));
        }
        if options.exclude.is_match(&file) {
            diagnostics.excluded_files += 1;
            continue;
        }
        if options.omit_test_own_file && file == test_own_file(&fact.test_id, options) {
            continue;
        }
        groups
            .entry((fact.test_id, file))
            .or_default()
            .insert(fact.line);
    }

    let mut mapping: BTreeMap<String, Vec<CoverageEntry>> = BTreeMap::new();
    for ((test_id, file), lines) in groups {
        let line_ranges = ranges::compact(lines);
        let line_count = ranges::line_count(&line_ranges);
        mapping.entry(test_id).or_default().push(CoverageEntry {
            file_path: file,
            line_ranges,
            line_count,
        });
    }
    // BTreeMap iteration already ordered the entries by file path per test.

    tracing::debug!(
        tests = mapping.len(),
        excluded = diagnostics.excluded_files,
        malformed = diagnostics.malformed_records,
        "mapped coverage contexts"
    );
    (mapping, diagnostics)
}

/// The declaring file of a test identity, normalized like coverage paths.
/// Identities are opaque beyond the leading `::`-separated file segment.
fn test_own_file(test_id: &str, options: &CoverageOptions) -> String {
    let file_part = test_id.split("::").next().unwrap_or("");
    paths::normalize(
        file_part,
        &options.repo_root,
        options.case_insensitive_paths,
    )
    .0
}
