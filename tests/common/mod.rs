//! Shared test infrastructure for integration tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A scratch workspace the `ltr` binary runs against.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Workspace {
            dir: tempfile::tempdir().expect("create workspace"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a JSONL telemetry file from raw lines.
    pub fn write_jsonl(&self, name: &str, lines: &[String]) -> PathBuf {
        let path = self.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, lines.join("\n") + "\n").expect("write jsonl");
        path
    }

    /// Run `ltr` with the given args, working directory at the workspace.
    pub fn run_ltr(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_ltr"))
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("run ltr")
    }

    /// Run `ltr` and parse the report it wrote at `out`.
    pub fn run_ltr_expect_report(&self, args: &[&str], out: &Path) -> serde_json::Value {
        let output = self.run_ltr(args);
        assert!(
            output.status.success(),
            "ltr failed: stdout={} stderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let bytes = fs::read(out).expect("read report");
        serde_json::from_slice(&bytes).expect("parse report JSON")
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

pub fn outcome_line(
    test_id: &str,
    outcome: &str,
    phase: &str,
    duration: f64,
    start_ms: Option<u64>,
) -> String {
    let mut value = serde_json::json!({
        "test_id": test_id,
        "outcome": outcome,
        "duration_seconds": duration,
        "phase": phase,
    });
    if let Some(start_ms) = start_ms {
        value["start_time_epoch_ms"] = serde_json::json!(start_ms);
    }
    value.to_string()
}

pub fn coverage_line(file: &str, line: u32, test_id: &str, phase: &str) -> String {
    serde_json::json!({
        "file": file,
        "line": line,
        "test_id": test_id,
        "phase": phase,
    })
    .to_string()
}
