use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{info, warn};

use control_plane::analyzer::{self, AnalysisConfig};
use control_plane::clock::SystemClock;
use control_plane::lto::{LatencyTestOrchestrator, LtoConfig};
use control_plane::protocol::{ClientCapabilities, RunStatus, TestSuiteDefinition};
use control_plane::storage::{self, Storage, StorageKind};

#[derive(Parser, Debug)]
#[command(name = "control-plane")]
#[command(about = "Latency test orchestrator for the voice-learning app's server control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Suite to run (see --list-suites for the registered IDs).
    #[arg(long)]
    suite: Option<String>,

    /// Enumerate registered suites and exit.
    #[arg(long)]
    list_suites: bool,

    /// Wall-clock cap on the run, in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Register a synthetic client (default).
    #[arg(long)]
    mock: bool,

    /// Require a real client; this CLI does not ship a real client
    /// transport (spec non-goal: no owned transport framework).
    #[arg(long)]
    no_mock: bool,

    /// Baseline ID to compare the run against.
    #[arg(long)]
    baseline: Option<String>,

    /// Relative-change threshold past which a metric counts as a regression.
    #[arg(long, default_value_t = 0.20)]
    regression_threshold: f64,

    /// Report format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Non-zero exit unless the success rate is 100%.
    #[arg(long)]
    ci: bool,

    /// Non-zero exit if any regression against --baseline is detected.
    #[arg(long)]
    fail_on_regression: bool,

    /// Root directory for file-tree storage. Omit for in-memory storage.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Suppress the periodic completed/total progress lines while a run
    /// is in flight.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum OutputFormat {
    Text,
    Json,
}

/// Process exit codes (spec §6): ok / failure / timeout.
const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_TIMEOUT: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let code = run(args).await?;
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    if args.no_mock {
        anyhow::bail!(
            "--no-mock requires a real client transport, which this CLI does not provide; \
             register one through the library API instead"
        );
    }

    let storage_kind = if args.data_dir.is_some() {
        StorageKind::File
    } else {
        StorageKind::Memory
    };
    let data_dir = args.data_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let store = storage::from_kind(storage_kind, &data_dir).context("failed to open storage backend")?;

    let clock = SystemClock::new().into_arc();
    let orchestrator = LatencyTestOrchestrator::new(Arc::clone(&store), clock, LtoConfig::default());

    for suite in [TestSuiteDefinition::quick_validation()?, TestSuiteDefinition::provider_comparison()?] {
        orchestrator.register_suite(suite).await.context("failed to register default suite")?;
    }

    if args.list_suites {
        for suite in orchestrator.list_suites().await.context("failed to list suites")? {
            println!("{}\t{}\t{}", suite.id, suite.name, suite.description);
        }
        return Ok(EXIT_OK);
    }

    let Some(suite_id) = args.suite.clone() else {
        anyhow::bail!("--suite ID is required (use --list-suites to see available suites)");
    };

    orchestrator
        .register_mock_client("cli-mock-client", mock_capabilities())
        .await;

    info!(suite = %suite_id, timeout_s = args.timeout, "starting test run");
    let run = orchestrator
        .start_test_run(&suite_id)
        .await
        .with_context(|| format!("failed to start suite '{suite_id}'"))?;

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let mut poll = interval(Duration::from_millis(500));
    let final_run = loop {
        poll.tick().await;
        let current = orchestrator
            .get_run(run.id)
            .await
            .context("run disappeared from storage mid-poll")?;
        if !args.no_progress {
            info!(completed = current.completed, total = current.total, status = ?current.status, "run progress");
        }
        if current.status.is_terminal() {
            break current;
        }
        if Instant::now() >= deadline {
            warn!(run_id = %run.id, "run exceeded --timeout, cancelling");
            orchestrator.cancel_run(run.id).await.ok();
            return Ok(EXIT_TIMEOUT);
        }
    };

    let baseline = match &args.baseline {
        Some(id) => Some(
            store
                .get_baseline(id)
                .await
                .with_context(|| format!("failed to load baseline '{id}'"))?
                .with_context(|| format!("baseline '{id}' not found"))?,
        ),
        None => None,
    };

    let analysis_config = AnalysisConfig {
        regression_threshold: args.regression_threshold,
        ..AnalysisConfig::default()
    };
    let report = analyzer::analyze(&final_run, baseline.as_ref(), analysis_config);

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text_report(&final_run, &report),
    }

    let success_rate_ok = report.summary.success_rate >= 1.0;
    let has_regressions = !report.regressions.is_empty();

    if final_run.status == RunStatus::Failed || final_run.status == RunStatus::Cancelled {
        return Ok(EXIT_FAILURE);
    }
    if args.ci && !success_rate_ok {
        return Ok(EXIT_FAILURE);
    }
    if args.fail_on_regression && has_regressions {
        return Ok(EXIT_FAILURE);
    }
    Ok(EXIT_OK)
}

fn mock_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        supported_stt_providers: vec!["mock-stt".to_string(), "provider-a".to_string(), "provider-b".to_string()],
        supported_llm_providers: vec!["mock-llm".to_string()],
        supported_tts_providers: vec!["mock-tts".to_string()],
        precision_timing: true,
        device_metrics: true,
        on_device_ml: false,
        max_concurrent_tests: 10,
    }
}

fn print_text_report(run: &control_plane::protocol::TestRun, report: &control_plane::protocol::AnalysisReport) {
    println!("run {} ({:?})", run.id, run.status);
    println!(
        "  {} / {} completed, success rate {:.1}%",
        run.completed,
        run.total,
        report.summary.success_rate * 100.0
    );
    println!(
        "  median {:.1}ms  p95 {:.1}ms  p99 {:.1}ms",
        report.summary.median_ms, report.summary.p95_ms, report.summary.p99_ms
    );
    if report.regressions.is_empty() {
        println!("  no regressions detected");
    } else {
        for regression in &report.regressions {
            println!(
                "  regression[{:?}] config={} {} {:.1} -> {:.1} ({:+.1}%)",
                regression.severity,
                regression.config_id,
                regression.metric,
                regression.baseline_value,
                regression.current_value,
                regression.relative_change * 100.0
            );
        }
    }
    for recommendation in &report.recommendations {
        println!("  * {recommendation}");
    }
}
