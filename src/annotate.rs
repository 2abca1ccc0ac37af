//! Annotation orchestration: a bounded worker pool around the cache.
//!
//! Concurrency is a fixed-size thread pool draining a shared queue; the
//! per-call timeout lives in the provider transport, and the global test
//! cap simply leaves remaining tests unannotated.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use anyhow::Result;
use globset::GlobSet;

use crate::cache::{cache_key, AnnotationCache, CacheOutcome};
use crate::config::Config;
use crate::context::{self, ContextPayload, ContextRequest};
use crate::errors::WarningCollector;
use crate::provider::{AnnotationProvider, PROMPT_TEMPLATE_VERSION};
use crate::schema::{Annotation, ContextSummary, TestRecord};

struct Job {
    record_index: usize,
    key: String,
    payload: ContextPayload,
    summary: ContextSummary,
}

/// Annotate records in place. Tests beyond `max_tests` and opted-out
/// tests receive no annotation; provider failures become per-test
/// `Annotation.error` values, never a process failure.
pub fn annotate_records(
    records: &mut [TestRecord],
    config: &Config,
    repo_root: &Path,
    provider: &dyn AnnotationProvider,
    cache: &AnnotationCache,
    warnings: &mut WarningCollector,
) -> Result<()> {
    if !config.is_annotation_enabled() {
        return Ok(());
    }
    let deny = config.context_deny_set()?;
    let jobs = build_jobs(records, config, repo_root, provider, &deny, warnings);
    if jobs.is_empty() {
        return Ok(());
    }

    let queue: Mutex<VecDeque<Job>> = Mutex::new(jobs.into());
    let (results_tx, results_rx) = mpsc::channel::<(usize, Annotation, CacheOutcome)>();
    let workers = config.max_concurrency.max(1);

    thread::scope(|scope| {
        for _ in 0..workers {
            let queue = &queue;
            let results_tx = results_tx.clone();
            scope.spawn(move || loop {
                let job = {
                    let mut queue = queue.lock().unwrap_or_else(|p| p.into_inner());
                    queue.pop_front()
                };
                let Some(job) = job else {
                    break;
                };
                let (annotation, outcome) =
                    cache.get_or_compute(&job.key, config.cache_ttl_seconds, || {
                        compute_annotation(provider, &job.payload, &job.summary)
                    });
                if results_tx.send((job.record_index, annotation, outcome)).is_err() {
                    break;
                }
            });
        }
        drop(results_tx);

        let mut annotated = 0usize;
        let mut failures = 0usize;
        for (record_index, annotation, outcome) in results_rx {
            if annotation.error.is_some() {
                failures += 1;
            }
            annotated += 1;
            tracing::debug!(
                test_id = records[record_index].test_id.as_str(),
                outcome = ?outcome,
                "annotation resolved"
            );
            records[record_index].annotation = Some(annotation);
        }
        tracing::info!(
            annotated,
            failures,
            provider = provider.identity(),
            "annotation pass complete"
        );
    });
    Ok(())
}

/// Assemble contexts and cache keys for every eligible record, honoring
/// the opt-out list, per-test mode overrides, and the global test cap.
fn build_jobs(
    records: &[TestRecord],
    config: &Config,
    repo_root: &Path,
    provider: &dyn AnnotationProvider,
    deny: &GlobSet,
    warnings: &mut WarningCollector,
) -> Vec<Job> {
    let mut jobs = Vec::new();
    for (record_index, record) in records.iter().enumerate() {
        if jobs.len() >= config.max_tests {
            break;
        }
        let request = ContextRequest {
            test_id: &record.test_id,
            coverage: &record.coverage,
            mode: config.context_mode,
            mode_override: config.context_mode_overrides.get(&record.test_id).copied(),
            opt_out: config.annotation_opt_out.contains(&record.test_id),
        };
        let Some((payload, summary)) =
            context::assemble(&request, repo_root, config.context_limits(), deny, warnings)
        else {
            continue;
        };
        let key = cache_key(
            provider.identity(),
            provider.model(),
            PROMPT_TEMPLATE_VERSION,
            &summary,
            &payload.included_file_hashes,
        );
        jobs.push(Job {
            record_index,
            key,
            payload,
            summary,
        });
    }
    jobs
}

fn compute_annotation(
    provider: &dyn AnnotationProvider,
    payload: &ContextPayload,
    summary: &ContextSummary,
) -> Annotation {
    match provider.annotate(payload) {
        Ok(result) => Annotation {
            scenario: result.scenario,
            why_needed: result.why_needed,
            key_assertions: result.key_assertions,
            confidence: result.confidence,
            error: None,
            context_summary: summary.clone(),
        },
        Err(err) => Annotation {
            scenario: String::new(),
            why_needed: String::new(),
            key_assertions: Vec::new(),
            confidence: None,
            error: Some(err.to_string()),
            context_summary: summary.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderAnnotation, ProviderError};
    use crate::schema::{Outcome, Phase};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        calls: AtomicUsize,
        fail: bool,
        model: String,
    }

    impl ScriptedProvider {
        fn new(fail: bool) -> Self {
            Self::with_model(fail, "test-model")
        }

        fn with_model(fail: bool, model: &str) -> Self {
            ScriptedProvider {
                calls: AtomicUsize::new(0),
                fail,
                model: model.to_string(),
            }
        }
    }

    impl AnnotationProvider for ScriptedProvider {
        fn identity(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            &self.model
        }

        fn annotate(&self, _payload: &ContextPayload) -> Result<ProviderAnnotation, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Timeout);
            }
            Ok(ProviderAnnotation {
                scenario: "covers the helper".to_string(),
                why_needed: "guards behavior".to_string(),
                key_assertions: vec!["helper returns 1".to_string()],
                confidence: Some(0.7),
            })
        }
    }

    fn record(test_id: &str) -> TestRecord {
        TestRecord {
            test_id: test_id.to_string(),
            phase: Phase::Run,
            outcome: Outcome::Passed,
            duration_seconds: 0.1,
            start_time_epoch_ms: None,
            error_summary: None,
            run_id: None,
            coverage: Vec::new(),
            annotation: None,
        }
    }

    fn enabled_config() -> Config {
        Config {
            provider: "ollama".to_string(),
            model: "test-model".to_string(),
            ..Config::default()
        }
    }

    fn repo_with_test(dir: &Path) {
        fs::write(
            dir.join("t.py"),
            "def test_a():\n    assert 1 == 1\n\ndef test_b():\n    assert 2 == 2\n",
        )
        .expect("write test file");
    }

    #[test]
    fn disabled_provider_annotates_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut records = vec![record("t.py::test_a")];
        let provider = ScriptedProvider::new(false);
        let cache = AnnotationCache::new();
        let mut warnings = WarningCollector::new();
        annotate_records(
            &mut records,
            &Config::default(),
            dir.path(),
            &provider,
            &cache,
            &mut warnings,
        )
        .expect("annotate");
        assert!(records[0].annotation.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn records_get_annotations_and_failures_stay_per_test() {
        let dir = tempfile::tempdir().expect("tempdir");
        repo_with_test(dir.path());
        let mut records = vec![record("t.py::test_a")];
        let provider = ScriptedProvider::new(false);
        let cache = AnnotationCache::new();
        let mut warnings = WarningCollector::new();
        annotate_records(
            &mut records,
            &enabled_config(),
            dir.path(),
            &provider,
            &cache,
            &mut warnings,
        )
        .expect("annotate");
        let annotation = records[0].annotation.as_ref().expect("annotated");
        assert_eq!(annotation.scenario, "covers the helper");
        assert!(annotation.error.is_none());
        assert_eq!(annotation.context_summary.mode, "minimal");
    }

    #[test]
    fn provider_failure_is_captured_not_raised() {
        let dir = tempfile::tempdir().expect("tempdir");
        repo_with_test(dir.path());
        let mut records = vec![record("t.py::test_a")];
        let provider = ScriptedProvider::new(true);
        let cache = AnnotationCache::new();
        let mut warnings = WarningCollector::new();
        annotate_records(
            &mut records,
            &enabled_config(),
            dir.path(),
            &provider,
            &cache,
            &mut warnings,
        )
        .expect("annotate");
        let annotation = records[0].annotation.as_ref().expect("annotated");
        assert_eq!(annotation.error.as_deref(), Some("provider timeout"));
        assert!(annotation.scenario.is_empty());
    }

    #[test]
    fn max_tests_cap_leaves_remaining_unannotated() {
        let dir = tempfile::tempdir().expect("tempdir");
        repo_with_test(dir.path());
        let mut records = vec![record("t.py::test_a"), record("t.py::test_b")];
        let provider = ScriptedProvider::new(false);
        let cache = AnnotationCache::new();
        let mut warnings = WarningCollector::new();
        let config = Config {
            max_tests: 1,
            ..enabled_config()
        };
        annotate_records(
            &mut records,
            &config,
            dir.path(),
            &provider,
            &cache,
            &mut warnings,
        )
        .expect("annotate");
        assert!(records[0].annotation.is_some());
        assert!(records[1].annotation.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn opted_out_tests_skip_provider_and_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        repo_with_test(dir.path());
        let mut records = vec![record("t.py::test_a")];
        let provider = ScriptedProvider::new(false);
        let cache = AnnotationCache::new();
        let mut warnings = WarningCollector::new();
        let config = Config {
            annotation_opt_out: vec!["t.py::test_a".to_string()],
            ..enabled_config()
        };
        annotate_records(
            &mut records,
            &config,
            dir.path(),
            &provider,
            &cache,
            &mut warnings,
        )
        .expect("annotate");
        assert!(records[0].annotation.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cache_key_tracks_the_provider_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        repo_with_test(dir.path());
        let cache = AnnotationCache::new();
        let mut warnings = WarningCollector::new();

        let mut records = vec![record("t.py::test_a")];
        let first = ScriptedProvider::with_model(false, "model-a");
        annotate_records(
            &mut records,
            &enabled_config(),
            dir.path(),
            &first,
            &cache,
            &mut warnings,
        )
        .expect("annotate");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);

        // A different model must not be served the cached annotation.
        let mut records = vec![record("t.py::test_a")];
        let second = ScriptedProvider::with_model(false, "model-b");
        annotate_records(
            &mut records,
            &enabled_config(),
            dir.path(),
            &second,
            &cache,
            &mut warnings,
        )
        .expect("annotate");
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn identical_tests_share_one_provider_call_via_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        repo_with_test(dir.path());
        // Same test id twice (rerun case): identical context, one call.
        let mut records = vec![record("t.py::test_a"), record("t.py::test_a")];
        let provider = ScriptedProvider::new(false);
        let cache = AnnotationCache::new();
        let mut warnings = WarningCollector::new();
        annotate_records(
            &mut records,
            &enabled_config(),
            dir.path(),
            &provider,
            &cache,
            &mut warnings,
        )
        .expect("annotate");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(records[0].annotation, records[1].annotation);
    }
}
