//! End-to-end tests for `ltr report`: telemetry files in, one canonical
//! report document out.

mod common;

use common::{coverage_line, outcome_line, Workspace};

#[test]
fn report_joins_outcomes_with_compacted_coverage() {
    let ws = Workspace::new();
    ws.write_jsonl(
        "outcomes.jsonl",
        &[
            outcome_line("tests/test_app.py::test_sum", "passed", "run", 0.2, None),
            outcome_line("tests/test_app.py::test_diff", "failed", "run", 0.4, None),
        ],
    );
    // Two shards with overlapping hits: the union must dedupe.
    ws.write_jsonl(
        "cov-1.jsonl",
        &[
            coverage_line("fileA.py", 3, "tests/test_app.py::test_sum", "run"),
            coverage_line("fileA.py", 4, "tests/test_app.py::test_sum", "run"),
        ],
    );
    ws.write_jsonl(
        "cov-2.jsonl",
        &[
            coverage_line("fileA.py", 4, "tests/test_app.py::test_sum", "run"),
            coverage_line("fileA.py", 9, "tests/test_app.py::test_sum", "run"),
        ],
    );

    let out = ws.path().join("report.json");
    let report = ws.run_ltr_expect_report(
        &[
            "report",
            "--outcomes",
            "outcomes.jsonl",
            "--coverage",
            "cov-1.jsonl",
            "--coverage",
            "cov-2.jsonl",
            "--out",
            "report.json",
            "--run-id",
            "run-1",
        ],
        &out,
    );

    assert_eq!(report["schema_version"], 2);
    assert_eq!(report["summary"]["total"], 2);
    assert_eq!(report["summary"]["passed"], 1);
    assert_eq!(report["summary"]["failed"], 1);
    assert_eq!(report["run_count"], 1);

    let tests = report["tests"].as_array().expect("tests array");
    assert_eq!(tests.len(), 2);
    // Sorted by test identity: test_diff before test_sum.
    assert_eq!(tests[0]["test_id"], "tests/test_app.py::test_diff");
    assert_eq!(tests[1]["test_id"], "tests/test_app.py::test_sum");

    let coverage = tests[1]["coverage"].as_array().expect("coverage");
    assert_eq!(coverage.len(), 1);
    assert_eq!(coverage[0]["file_path"], "fileA.py");
    assert_eq!(
        coverage[0]["line_ranges"],
        serde_json::json!([[3, 4], [9, 9]])
    );
    assert_eq!(coverage[0]["line_count"], 3);

    let sha256 = report["sha256"].as_str().expect("sha256");
    assert_eq!(sha256.len(), 64);
    assert!(sha256.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn empty_run_produces_a_valid_document() {
    let ws = Workspace::new();
    ws.write_jsonl("outcomes.jsonl", &[String::new()]);
    let out = ws.path().join("report.json");
    let report = ws.run_ltr_expect_report(
        &[
            "report",
            "--outcomes",
            "outcomes.jsonl",
            "--out",
            "report.json",
        ],
        &out,
    );
    assert_eq!(report["tests"], serde_json::json!([]));
    assert_eq!(report["summary"]["total"], 0);
    let codes: Vec<&str> = report["warnings"]
        .as_array()
        .expect("warnings")
        .iter()
        .filter_map(|w| w["code"].as_str())
        .collect();
    assert!(codes.contains(&"NO_TESTS_COLLECTED"));
    assert!(codes.contains(&"NO_COVERAGE_DATA"));
}

#[test]
fn missing_coverage_shard_degrades_to_a_warning() {
    let ws = Workspace::new();
    ws.write_jsonl(
        "outcomes.jsonl",
        &[outcome_line("t.py::test_a", "passed", "run", 0.1, None)],
    );
    let out = ws.path().join("report.json");
    let report = ws.run_ltr_expect_report(
        &[
            "report",
            "--outcomes",
            "outcomes.jsonl",
            "--coverage",
            "does-not-exist.jsonl",
            "--out",
            "report.json",
        ],
        &out,
    );
    assert_eq!(report["summary"]["total"], 1);
    let codes: Vec<&str> = report["warnings"]
        .as_array()
        .expect("warnings")
        .iter()
        .filter_map(|w| w["code"].as_str())
        .collect();
    assert!(codes.contains(&"COVERAGE_READ_FAILED"));
}

#[test]
fn setup_and_teardown_coverage_is_filtered_by_default() {
    let ws = Workspace::new();
    ws.write_jsonl(
        "outcomes.jsonl",
        &[outcome_line("t.py::test_a", "passed", "run", 0.1, None)],
    );
    ws.write_jsonl(
        "cov.jsonl",
        &[
            coverage_line("app.py", 1, "t.py::test_a", "setup"),
            coverage_line("app.py", 2, "t.py::test_a", "run"),
            coverage_line("app.py", 3, "t.py::test_a", "teardown"),
        ],
    );
    let out = ws.path().join("report.json");
    let report = ws.run_ltr_expect_report(
        &[
            "report",
            "--outcomes",
            "outcomes.jsonl",
            "--coverage",
            "cov.jsonl",
            "--out",
            "report.json",
        ],
        &out,
    );
    let coverage = report["tests"][0]["coverage"].as_array().expect("coverage");
    assert_eq!(coverage[0]["line_ranges"], serde_json::json!([[2, 2]]));
}

#[test]
fn invalid_config_fails_with_all_errors_listed() {
    let ws = Workspace::new();
    ws.write_jsonl(
        "outcomes.jsonl",
        &[outcome_line("t.py::test_a", "passed", "run", 0.1, None)],
    );
    std::fs::write(
        ws.path().join("config.json"),
        r#"{"provider": "mystery", "max_tests": 0}"#,
    )
    .expect("write config");
    let output = ws.run_ltr(&[
        "report",
        "--outcomes",
        "outcomes.jsonl",
        "--out",
        "report.json",
        "--config",
        "config.json",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid provider"));
    assert!(stderr.contains("max_tests"));
}

#[test]
fn invocation_is_recorded_with_secrets_redacted() {
    let ws = Workspace::new();
    ws.write_jsonl(
        "outcomes.jsonl",
        &[outcome_line("t.py::test_a", "passed", "run", 0.1, None)],
    );
    let out = ws.path().join("report.json");
    let report = ws.run_ltr_expect_report(
        &[
            "report",
            "--outcomes",
            "outcomes.jsonl",
            "--out",
            "report.json",
        ],
        &out,
    );
    let invocation = report["run_meta"]["invocation"].as_str().expect("invocation");
    assert!(invocation.contains("report"));
    assert!(invocation.contains("outcomes.jsonl"));
}
