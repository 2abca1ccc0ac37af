//! `ltr`: deterministic, optionally LM-annotated test report generator.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod aggregate;
mod annotate;
mod cache;
mod config;
mod context;
mod coverage;
mod errors;
mod ingest;
mod paths;
mod provider;
mod ranges;
mod report;
mod schema;
mod util;

use aggregate::AggregationPolicy;
use cache::AnnotationCache;
use config::Config;
use coverage::CoverageOptions;
use errors::{WarningCode, WarningCollector};
use provider::HttpProvider;
use schema::{Phase, TestRecord};

#[derive(Parser, Debug)]
#[command(name = "ltr", version, about = "Deterministic LM-annotated test reports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build one report document from test-run telemetry
    Report(ReportArgs),
    /// Combine previously produced report documents
    Aggregate(AggregateArgs),
    /// Delete expired annotation cache entries
    SweepCache(SweepCacheArgs),
}

#[derive(Parser, Debug)]
struct ReportArgs {
    /// Outcome records, one JSON object per line
    #[arg(long, value_name = "PATH")]
    outcomes: PathBuf,

    /// Coverage fact shards, one JSON object per line (repeatable)
    #[arg(long = "coverage", value_name = "PATH")]
    coverage: Vec<PathBuf>,

    /// Output path for the report document
    #[arg(long, value_name = "PATH")]
    out: PathBuf,

    /// Optional JSON config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Repository root for path normalization and context assembly
    #[arg(long, value_name = "DIR", default_value = ".")]
    repo_root: PathBuf,

    /// Unique run ID recorded in the report
    #[arg(long)]
    run_id: Option<String>,

    /// Group ID tying related runs together
    #[arg(long)]
    group_id: Option<String>,

    /// Exit status of the test run being reported
    #[arg(long, default_value_t = 0)]
    exit_code: i32,
}

#[derive(Parser, Debug)]
struct AggregateArgs {
    /// Directory containing report documents to aggregate
    #[arg(long, value_name = "DIR")]
    dir: PathBuf,

    /// Aggregation policy
    #[arg(long, value_enum, default_value = "latest")]
    policy: AggregationPolicy,

    /// Output path for the aggregated document
    #[arg(long, value_name = "PATH")]
    out: PathBuf,
}

#[derive(Parser, Debug)]
struct SweepCacheArgs {
    /// Optional JSON config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Cache directory; overrides the configured one
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Report(args) => run_report(args),
        Commands::Aggregate(args) => run_aggregate(args),
        Commands::SweepCache(args) => run_sweep_cache(args),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(anyhow!(
            "configuration errors:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {e}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }
    Ok(config)
}

fn run_report(args: ReportArgs) -> Result<()> {
    let started = util::now_epoch_ms();
    let config = load_config(args.config.as_deref())?;
    let mut warnings = WarningCollector::new();

    let (outcomes, malformed_outcomes) = ingest::read_outcomes(&args.outcomes)?;
    if malformed_outcomes > 0 {
        tracing::warn!(malformed_outcomes, "skipped malformed outcome records");
    }

    let mut shards = Vec::new();
    for path in &args.coverage {
        match ingest::read_coverage_shard(path) {
            Ok(shard) => {
                if shard.malformed > 0 {
                    tracing::warn!(
                        shard = %path.display(),
                        malformed = shard.malformed,
                        "skipped malformed coverage records"
                    );
                }
                shards.push(shard);
            }
            Err(err) => {
                warnings.record(
                    WarningCode::CoverageReadFailed,
                    Some(format!("{}: {err:#}", path.display())),
                );
            }
        }
    }

    let repo_root_str = args.repo_root.display().to_string();
    let coverage_options = CoverageOptions {
        phase_filter: config.include_phase,
        repo_root: repo_root_str,
        case_insensitive_paths: config.case_insensitive_paths,
        omit_test_own_file: config.omit_tests_from_coverage,
        exclude: config.coverage_exclude_set()?,
    };
    let (coverage_map, _diagnostics) =
        coverage::map_coverage(shards, &coverage_options, &mut warnings);

    let mut records = build_records(outcomes, coverage_map, args.run_id.clone());

    if config.is_annotation_enabled() {
        let provider = HttpProvider::new(
            &config.provider,
            &config.model,
            &config.endpoint,
            config.timeout_seconds,
        );
        let cache = AnnotationCache::with_disk_dir(Path::new(&config.cache_dir));
        annotate::annotate_records(
            &mut records,
            &config,
            &args.repo_root,
            &provider,
            &cache,
            &mut warnings,
        )?;
    }

    let invocation_args: Vec<String> = std::env::args().collect();
    let invocation =
        report::redact_invocation(&invocation_args, &config.invocation_redact_patterns);
    let run_meta = report::build_run_meta(
        started,
        util::now_epoch_ms(),
        args.exit_code,
        args.run_id,
        args.group_id,
        Some(invocation),
    );

    let document = report::assemble_report(records, warnings, run_meta)?;
    let outcome = report::write_report(&document, &args.out)?;
    if outcome.fallback {
        eprintln!(
            "ltr: primary output path failed; report written to {}",
            outcome.path.display()
        );
    }
    println!("{}", outcome.path.display());
    Ok(())
}

/// Join outcomes with mapped coverage. One record per (test_id, phase)
/// is kept (last arrival wins); coverage attaches to run-phase records.
fn build_records(
    outcomes: Vec<ingest::OutcomeRecord>,
    mut coverage_map: BTreeMap<String, Vec<schema::CoverageEntry>>,
    run_id: Option<String>,
) -> Vec<TestRecord> {
    let mut deduped: BTreeMap<(String, Phase), TestRecord> = BTreeMap::new();
    for outcome in outcomes {
        let record = TestRecord {
            test_id: outcome.test_id.clone(),
            phase: outcome.phase,
            outcome: outcome.outcome,
            duration_seconds: outcome.duration_seconds,
            start_time_epoch_ms: outcome.start_time_epoch_ms,
            error_summary: outcome.error_summary,
            run_id: run_id.clone(),
            coverage: Vec::new(),
            annotation: None,
        };
        deduped.insert((outcome.test_id, outcome.phase), record);
    }
    let mut records: Vec<TestRecord> = deduped.into_values().collect();
    for record in &mut records {
        if record.phase == Phase::Run {
            if let Some(entries) = coverage_map.remove(&record.test_id) {
                record.coverage = entries;
            }
        }
    }
    records
}

fn run_aggregate(args: AggregateArgs) -> Result<()> {
    let document = aggregate::aggregate_dir(&args.dir, args.policy)?;
    let outcome = report::write_report(&document, &args.out)?;
    println!("{}", outcome.path.display());
    Ok(())
}

fn run_sweep_cache(args: SweepCacheArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let dir = args
        .cache_dir
        .unwrap_or_else(|| PathBuf::from(&config.cache_dir));
    let cache = AnnotationCache::with_disk_dir(&dir);
    let removed = cache.sweep();
    println!("removed {removed} expired cache entries");
    Ok(())
}
