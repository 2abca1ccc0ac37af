//! End-to-end tests for `ltr aggregate` and `ltr sweep-cache`, driving
//! real report documents produced by `ltr report`.

mod common;

use common::{outcome_line, Workspace};
use std::fs;

/// Produce one report under `runs/<name>` with an explicit start time so
/// recency ordering is under test control.
fn write_run(ws: &Workspace, name: &str, run_id: &str, outcome: &str, start_ms: u64) {
    let outcomes = format!("outcomes-{run_id}.jsonl");
    ws.write_jsonl(
        &outcomes,
        &[outcome_line("t.py::test_flaky", outcome, "run", 0.1, Some(start_ms))],
    );
    let out = format!("runs/{name}");
    let output = ws.run_ltr(&[
        "report",
        "--outcomes",
        &outcomes,
        "--out",
        &out,
        "--run-id",
        run_id,
    ]);
    assert!(
        output.status.success(),
        "report failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn aggregate(ws: &Workspace, policy: &str, out: &str) -> serde_json::Value {
    let out_path = ws.path().join(out);
    ws.run_ltr_expect_report(
        &["aggregate", "--dir", "runs", "--policy", policy, "--out", out],
        &out_path,
    )
}

#[test]
fn latest_policy_keeps_the_newest_record() {
    let ws = Workspace::new();
    write_run(&ws, "a.json", "run1", "failed", 1000);
    write_run(&ws, "b.json", "run2", "passed", 2000);

    let merged = aggregate(&ws, "latest", "latest.json");
    assert_eq!(merged["run_count"], 2);
    let tests = merged["tests"].as_array().expect("tests");
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0]["outcome"], "passed");
    assert_eq!(tests[0]["run_id"], "run2");
    assert_eq!(merged["source_reports"].as_array().expect("sources").len(), 2);
}

#[test]
fn merge_policy_surfaces_the_failure_over_a_newer_pass() {
    let ws = Workspace::new();
    write_run(&ws, "a.json", "run1", "failed", 1000);
    write_run(&ws, "b.json", "run2", "passed", 2000);

    let merged = aggregate(&ws, "merge", "merge.json");
    let tests = merged["tests"].as_array().expect("tests");
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0]["outcome"], "failed");
    assert_eq!(tests[0]["run_id"], "run1");
}

#[test]
fn all_policy_keeps_both_records_distinguished_by_run_id() {
    let ws = Workspace::new();
    write_run(&ws, "a.json", "run1", "failed", 1000);
    write_run(&ws, "b.json", "run2", "passed", 2000);

    let merged = aggregate(&ws, "all", "all.json");
    let tests = merged["tests"].as_array().expect("tests");
    assert_eq!(tests.len(), 2);
    assert_eq!(merged["summary"]["total"], 2);
    let run_ids: Vec<&str> = tests
        .iter()
        .filter_map(|t| t["run_id"].as_str())
        .collect();
    assert!(run_ids.contains(&"run1"));
    assert!(run_ids.contains(&"run2"));
}

#[test]
fn tampered_source_is_excluded_with_a_warning() {
    let ws = Workspace::new();
    write_run(&ws, "good.json", "run1", "passed", 1000);

    // Flip a byte of content without refreshing the embedded hash.
    let bad = ws.path().join("runs/bad.json");
    let text = fs::read_to_string(ws.path().join("runs/good.json")).expect("read good");
    fs::write(&bad, text.replace("\"exit_code\": 0", "\"exit_code\": 99")).expect("write bad");

    let merged = aggregate(&ws, "latest", "merged.json");
    assert_eq!(merged["run_count"], 1);
    let warnings = merged["warnings"].as_array().expect("warnings");
    let mismatch = warnings
        .iter()
        .find(|w| w["code"] == "SOURCE_HASH_MISMATCH")
        .expect("hash mismatch warning");
    assert!(mismatch["detail"]
        .as_str()
        .expect("detail")
        .contains("bad.json"));
}

#[test]
fn aggregated_document_carries_its_own_valid_hash() {
    let ws = Workspace::new();
    write_run(&ws, "a.json", "run1", "passed", 1000);
    let merged = aggregate(&ws, "latest", "merged.json");
    let sha256 = merged["sha256"].as_str().expect("sha256");
    assert_eq!(sha256.len(), 64);

    // Re-aggregating the same inputs must be byte-identical.
    let again = aggregate(&ws, "latest", "merged-2.json");
    assert_eq!(merged["sha256"], again["sha256"]);
    assert_eq!(merged["tests"], again["tests"]);
}

#[test]
fn sweep_cache_removes_only_expired_entries() {
    let ws = Workspace::new();
    let cache_dir = ws.path().join("cache");
    fs::create_dir_all(&cache_dir).expect("create cache dir");

    let entry = |key: &str, created: u64, ttl: u64| {
        serde_json::json!({
            "key": key,
            "payload": {
                "scenario": "exercises addition",
                "why_needed": "guards arithmetic",
                "key_assertions": ["sum is 2"],
                "context_summary": {
                    "mode": "minimal",
                    "included_files": [],
                    "total_bytes": 10,
                    "truncated": false,
                },
            },
            "created_at_epoch_ms": created,
            "ttl_seconds": ttl,
        })
    };
    // Expired long ago versus fresh for roughly three millennia.
    fs::write(
        cache_dir.join("old.json"),
        entry("old", 1000, 1).to_string(),
    )
    .expect("write old");
    fs::write(
        cache_dir.join("fresh.json"),
        entry("fresh", 1000, 100_000_000_000).to_string(),
    )
    .expect("write fresh");

    let output = ws.run_ltr(&["sweep-cache", "--cache-dir", "cache"]);
    assert!(
        output.status.success(),
        "sweep failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("removed 1 expired cache entries"), "{stdout}");
    assert!(!cache_dir.join("old.json").exists());
    assert!(cache_dir.join("fresh.json").exists());
}
