//! Stable warning codes and the per-run warning collector.
//!
//! Warnings are part of the report document, so codes are stable strings
//! and each code is recorded at most once per run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningCode {
    PathOutsideRepo,
    PathUnresolved,
    NoCoverageData,
    CoverageReadFailed,
    NoTestsCollected,
    ContextFileUnreadable,
    OutputFallback,
    SourceHashMismatch,
    SchemaVersionMismatch,
    SourceUnreadable,
}

impl WarningCode {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningCode::PathOutsideRepo => "PATH_OUTSIDE_REPO",
            WarningCode::PathUnresolved => "PATH_UNRESOLVED",
            WarningCode::NoCoverageData => "NO_COVERAGE_DATA",
            WarningCode::CoverageReadFailed => "COVERAGE_READ_FAILED",
            WarningCode::NoTestsCollected => "NO_TESTS_COLLECTED",
            WarningCode::ContextFileUnreadable => "CONTEXT_FILE_UNREADABLE",
            WarningCode::OutputFallback => "OUTPUT_FALLBACK",
            WarningCode::SourceHashMismatch => "SOURCE_HASH_MISMATCH",
            WarningCode::SchemaVersionMismatch => "SCHEMA_VERSION_MISMATCH",
            WarningCode::SourceUnreadable => "SOURCE_UNREADABLE",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            WarningCode::PathOutsideRepo => "path lies outside the repository root",
            WarningCode::PathUnresolved => "path could not be normalized",
            WarningCode::NoCoverageData => "no coverage data was available for this run",
            WarningCode::CoverageReadFailed => "coverage source could not be read",
            WarningCode::NoTestsCollected => "no tests were collected; report may be empty",
            WarningCode::ContextFileUnreadable => "context file could not be read as text",
            WarningCode::OutputFallback => "primary output path failed; wrote fallback artifact",
            WarningCode::SourceHashMismatch => "source report content hash mismatch; excluded",
            WarningCode::SchemaVersionMismatch => "source report schema version differs",
            WarningCode::SourceUnreadable => "source report could not be read; excluded",
        }
    }
}

/// One warning as recorded in the report document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportWarning {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Collects warnings, deduplicated by code within a single run.
///
/// A recurring condition like missing coverage contexts is reported once,
/// not once per test.
#[derive(Debug, Default)]
pub struct WarningCollector {
    warnings: Vec<ReportWarning>,
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, code: WarningCode, detail: Option<String>) {
        if self.warnings.iter().any(|w| w.code == code.as_str()) {
            return;
        }
        tracing::warn!(code = code.as_str(), detail = detail.as_deref(), "{}", code.message());
        self.warnings.push(ReportWarning {
            code: code.as_str().to_string(),
            message: code.message().to_string(),
            detail,
        });
    }

    pub fn into_warnings(self) -> Vec<ReportWarning> {
        self.warnings
    }
}
