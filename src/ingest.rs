//! Telemetry sources: JSONL coverage facts and outcome records.
//!
//! Arrival order is not assumed to be sorted; malformed lines are skipped
//! and counted, never fatal.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::schema::{CoverageFact, Outcome, Phase};

/// One outcome record as emitted by the host test runner.
#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeRecord {
    pub test_id: String,
    pub outcome: Outcome,
    pub duration_seconds: f64,
    pub phase: Phase,
    #[serde(default)]
    pub start_time_epoch_ms: Option<u64>,
    #[serde(default)]
    pub error_summary: Option<String>,
}

/// Raw coverage line as found on disk; the phase is a free-form string so
/// that a single unknown phase does not poison the whole shard.
#[derive(Debug, Deserialize)]
struct RawCoverageFact {
    file: String,
    line: u32,
    test_id: String,
    phase: String,
}

/// Parsed shard contents plus the count of skipped malformed lines.
#[derive(Debug, Default, Clone)]
pub struct CoverageShard {
    pub facts: Vec<CoverageFact>,
    pub malformed: u64,
}

/// Read one coverage shard. A missing or unreadable file is an error the
/// caller degrades to a warning; bad individual lines are only counted.
pub fn read_coverage_shard(path: &Path) -> Result<CoverageShard> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read coverage shard {}", path.display()))?;
    let mut shard = CoverageShard::default();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawCoverageFact = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(_) => {
                shard.malformed += 1;
                continue;
            }
        };
        let Some(phase) = Phase::parse(&raw.phase) else {
            shard.malformed += 1;
            continue;
        };
        if raw.file.is_empty() || raw.test_id.is_empty() || raw.line == 0 {
            shard.malformed += 1;
            continue;
        }
        shard.facts.push(CoverageFact {
            file: raw.file,
            line: raw.line,
            test_id: raw.test_id,
            phase,
        });
    }
    Ok(shard)
}

/// Read the outcome stream. Malformed lines are skipped and counted.
pub fn read_outcomes(path: &Path) -> Result<(Vec<OutcomeRecord>, u64)> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read outcomes {}", path.display()))?;
    let mut records = Vec::new();
    let mut malformed = 0u64;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OutcomeRecord>(line) {
            Ok(record) => records.push(record),
            Err(_) => malformed += 1,
        }
    }
    Ok((records, malformed))
}
