//! Results Analyzer (spec §4.2): pure, no I/O, deterministic given inputs.
//!
//! Lives in its own module with zero `tokio`/`tracing` imports so the
//! "pure function" invariant is auditable at a glance — the same
//! discipline the teacher applies to `protocol::AudioChunk::to_bytes`/
//! `from_bytes`, which stay synchronous even though the rest of the
//! crate is async throughout.

use std::collections::HashMap;

use crate::protocol::{
    AnalysisReport, BaselineMetrics, ConfigId, ConfigStats, PerformanceBaseline, Regression,
    RunSummary, Severity, TestRun,
};
use crate::stats::{relative_change, summarize};

/// Tunable analysis parameters (spec §9 open question: regression
/// severity thresholds "SHOULD be configurable").
#[derive(Debug, Clone, Copy)]
pub struct AnalysisConfig {
    pub regression_threshold: f64,
    pub min_samples: usize,
    pub minor_multiple: f64,
    pub moderate_multiple: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            regression_threshold: 0.20,
            min_samples: 5,
            minor_multiple: 1.5,
            moderate_multiple: 2.0,
        }
    }
}

impl AnalysisConfig {
    fn classify(&self, ratio_of_threshold: f64) -> Severity {
        if ratio_of_threshold <= self.minor_multiple {
            Severity::Minor
        } else if ratio_of_threshold <= self.moderate_multiple {
            Severity::Moderate
        } else {
            Severity::Severe
        }
    }
}

/// Analyzes a terminal [`TestRun`] against an optional baseline, per
/// spec §4.2. `run` must already be in a terminal status; callers (the
/// CLI, LTO's own post-run hook) are responsible for waiting on that.
pub fn analyze(
    run: &TestRun,
    baseline: Option<&PerformanceBaseline>,
    config: AnalysisConfig,
) -> AnalysisReport {
    let successes: Vec<&crate::protocol::TestResult> = run.results.iter().filter(|r| r.success).collect();
    let e2e_samples: Vec<f64> = successes.iter().map(|r| r.end_to_end_ms).collect();
    let summary_stats = summarize(&e2e_samples);

    let success_rate = if run.results.is_empty() {
        0.0
    } else {
        successes.len() as f64 / run.results.len() as f64
    };

    let summary = match summary_stats {
        Some(s) => RunSummary {
            min_ms: s.min,
            max_ms: s.max,
            median_ms: s.median,
            p95_ms: s.p95,
            p99_ms: s.p99,
            success_rate,
        },
        None => RunSummary {
            min_ms: 0.0,
            max_ms: 0.0,
            median_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            success_rate,
        },
    };

    let mut per_config_samples: HashMap<ConfigId, Vec<f64>> = HashMap::new();
    for result in &successes {
        per_config_samples.entry(result.config_id).or_default().push(result.end_to_end_ms);
    }

    let mut per_config = Vec::with_capacity(per_config_samples.len());
    let mut regressions = Vec::new();

    for (config_id, samples) in &per_config_samples {
        let stats = summarize(samples).expect("non-empty by construction");
        let insufficient_data = stats.count < config.min_samples;
        per_config.push(ConfigStats {
            config_id: *config_id,
            median_ms: stats.median,
            p95_ms: stats.p95,
            p99_ms: stats.p99,
            sample_count: stats.count,
            insufficient_data,
        });

        if insufficient_data {
            continue;
        }
        let Some(baseline) = baseline else { continue };
        let Some(baseline_metrics) = baseline.metrics.get(config_id) else { continue };

        regressions.extend(detect_regressions(*config_id, &stats, baseline_metrics, config));
    }
    per_config.sort_by(|a, b| a.config_id.cmp(&b.config_id));

    let recommendations = build_recommendations(&summary, &run.results, &regressions);

    AnalysisReport {
        run_id: run.id,
        summary,
        per_config,
        regressions,
        recommendations,
    }
}

/// Raises a regression for each of median/p99 that exceeds `threshold`
/// relative to the baseline (spec §4.2). Improvements (negative delta)
/// are never reported here.
fn detect_regressions(
    config_id: ConfigId,
    current: &crate::stats::Summary,
    baseline: &BaselineMetrics,
    config: AnalysisConfig,
) -> Vec<Regression> {
    let mut out = Vec::new();
    for (metric, baseline_value, current_value) in [
        ("median_ms", baseline.median_ms, current.median),
        ("p99_ms", baseline.p99_ms, current.p99),
    ] {
        let change = relative_change(baseline_value, current_value);
        if change > config.regression_threshold {
            let ratio_of_threshold = change / config.regression_threshold;
            out.push(Regression {
                config_id,
                metric,
                baseline_value,
                current_value,
                relative_change: change,
                severity: config.classify(ratio_of_threshold),
            });
        }
    }
    out
}

/// Rule-based recommendations ordered by severity (spec §4.2).
fn build_recommendations(
    summary: &RunSummary,
    results: &[crate::protocol::TestResult],
    regressions: &[Regression],
) -> Vec<String> {
    let mut recs = Vec::new();

    if regressions.iter().any(|r| r.severity == Severity::Severe) {
        recs.push("block release".to_string());
    }

    if summary.median_ms > 0.0 && summary.p99_ms / summary.median_ms > 3.0 {
        recs.push("high tail latency, investigate queueing".to_string());
    }

    if summary.success_rate < 0.98 {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for failure in results.iter().filter(|r| !r.success) {
            if let Some(kind) = failure.error_kind {
                *counts.entry(kind.as_str()).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        let top3: Vec<&str> = ranked.into_iter().take(3).map(|(k, _)| k).collect();
        if top3.is_empty() {
            recs.push("investigate failure kinds".to_string());
        } else {
            recs.push(format!("investigate failure kinds {{{}}}", top3.join(", ")));
        }
    }

    recs
}

/// Builds a [`PerformanceBaseline`] from a terminal run's successful
/// results, one entry per config with `>= min_samples` successes. Not
/// named directly in spec §4.2's narrative, but required by §3's
/// `PerformanceBaseline` lifecycle ("written by analyser") and by the
/// CLI's `--baseline` round trip.
pub fn build_baseline(
    id: impl Into<String>,
    run: &TestRun,
    min_samples: usize,
) -> Option<PerformanceBaseline> {
    if !run.status.is_terminal() {
        return None;
    }
    let mut per_config_samples: HashMap<ConfigId, Vec<f64>> = HashMap::new();
    for result in run.results.iter().filter(|r| r.success) {
        per_config_samples.entry(result.config_id).or_default().push(result.end_to_end_ms);
    }

    let mut metrics = HashMap::new();
    for (config_id, samples) in per_config_samples {
        if samples.len() < min_samples {
            continue;
        }
        let stats = summarize(&samples).expect("non-empty by construction");
        metrics.insert(
            config_id,
            BaselineMetrics {
                median_ms: stats.median,
                p95_ms: stats.p95,
                p99_ms: stats.p99,
                sample_count: stats.count,
            },
        );
    }
    if metrics.is_empty() {
        return None;
    }
    Some(PerformanceBaseline {
        id: id.into(),
        created_at: chrono::Utc::now(),
        source_run_id: run.id,
        metrics,
    })
}

/// Computes a two-sample comparison between two latency sample sets
/// (spec §2 "two-sample comparison used by the analyser"), expressed
/// independently of the run/baseline shapes above for ad hoc use (e.g.
/// the CLI comparing two arbitrary runs rather than a run vs. baseline).
pub fn compare_samples(a: &[f64], b: &[f64]) -> Option<(crate::stats::Summary, crate::stats::Summary, f64)> {
    let sa = summarize(a)?;
    let sb = summarize(b)?;
    let delta = relative_change(sa.median, sb.median);
    Some((sa, sb, delta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NetworkProfile, RunStatus, StageLatencies, TestConfiguration, TestResult};
    use uuid::Uuid;

    fn successful_result(run_id: uuid::Uuid, config_id: ConfigId, e2e_ms: f64) -> TestResult {
        let now = chrono::Utc::now();
        TestResult::success(
            run_id,
            config_id,
            "client-1",
            0,
            StageLatencies {
                capture_to_stt_ms: e2e_ms * 0.2,
                stt_to_llm_ms: e2e_ms * 0.4,
                llm_to_tts_ms: e2e_ms * 0.3,
                tts_to_playback_ms: e2e_ms * 0.1,
            },
            now,
            now,
        )
    }

    #[test]
    fn quick_validation_scenario_has_no_regressions_against_matching_baseline() {
        let config = TestConfiguration::new("stt", "llm", "tts", "voice", NetworkProfile::ideal(), 1).unwrap();
        let mut run = TestRun::new("quick_validation", 6);
        run.transition(RunStatus::Running).unwrap();
        for ms in [390.0, 400.0, 410.0, 395.0, 405.0, 400.0] {
            run.push_result(successful_result(run.id, config.id, ms));
        }
        run.transition(RunStatus::Completed).unwrap();

        let mut metrics = HashMap::new();
        metrics.insert(
            config.id,
            BaselineMetrics {
                median_ms: 400.0,
                p95_ms: 410.0,
                p99_ms: 410.0,
                sample_count: 6,
            },
        );
        let baseline = PerformanceBaseline {
            id: "b1".to_string(),
            created_at: chrono::Utc::now(),
            source_run_id: Uuid::new_v4(),
            metrics,
        };

        let report = analyze(&run, Some(&baseline), AnalysisConfig::default());
        assert_eq!(report.summary.success_rate, 1.0);
        assert!(report.regressions.is_empty());
        assert!(report.summary.median_ms >= 350.0 && report.summary.median_ms <= 450.0);
    }

    #[test]
    fn severe_regression_matches_spec_worked_example() {
        let config = TestConfiguration::new("stt", "llm", "tts", "voice", NetworkProfile::ideal(), 1).unwrap();
        let mut run = TestRun::new("suite", 5);
        run.transition(RunStatus::Running).unwrap();
        for _ in 0..5 {
            run.push_result(successful_result(run.id, config.id, 600.0));
        }
        run.transition(RunStatus::Completed).unwrap();

        let mut metrics = HashMap::new();
        metrics.insert(
            config.id,
            BaselineMetrics {
                median_ms: 400.0,
                p95_ms: 400.0,
                p99_ms: 400.0,
                sample_count: 10,
            },
        );
        let baseline = PerformanceBaseline {
            id: "b1".to_string(),
            created_at: chrono::Utc::now(),
            source_run_id: Uuid::new_v4(),
            metrics,
        };

        let report = analyze(&run, Some(&baseline), AnalysisConfig::default());
        assert_eq!(report.regressions.len(), 2); // median_ms and p99_ms both regress
        assert!(report.regressions.iter().all(|r| r.severity == Severity::Severe));
        assert!(report.recommendations.contains(&"block release".to_string()));
    }

    #[test]
    fn insufficient_samples_are_flagged_and_skip_regression_detection() {
        let config = TestConfiguration::new("stt", "llm", "tts", "voice", NetworkProfile::ideal(), 1).unwrap();
        let mut run = TestRun::new("suite", 2);
        run.transition(RunStatus::Running).unwrap();
        run.push_result(successful_result(run.id, config.id, 900.0));
        run.push_result(successful_result(run.id, config.id, 900.0));
        run.transition(RunStatus::Completed).unwrap();

        let mut metrics = HashMap::new();
        metrics.insert(
            config.id,
            BaselineMetrics {
                median_ms: 400.0,
                p95_ms: 400.0,
                p99_ms: 400.0,
                sample_count: 10,
            },
        );
        let baseline = PerformanceBaseline {
            id: "b1".to_string(),
            created_at: chrono::Utc::now(),
            source_run_id: Uuid::new_v4(),
            metrics,
        };

        let report = analyze(&run, Some(&baseline), AnalysisConfig::default());
        assert!(report.per_config[0].insufficient_data);
        assert!(report.regressions.is_empty());
    }

    #[test]
    fn failure_rate_below_threshold_recommends_investigating_top_failure_kinds() {
        let config = TestConfiguration::new("stt", "llm", "tts", "voice", NetworkProfile::ideal(), 1).unwrap();
        let mut run = TestRun::new("suite", 10);
        run.transition(RunStatus::Running).unwrap();
        for _ in 0..8 {
            run.push_result(successful_result(run.id, config.id, 400.0));
        }
        for _ in 0..2 {
            let now = chrono::Utc::now();
            run.push_result(TestResult::failure(
                run.id,
                config.id,
                "client-1",
                0,
                crate::error::ErrorKind::ProviderError,
                now,
                now,
            ));
        }
        run.transition(RunStatus::Failed).unwrap();

        let report = analyze(&run, None, AnalysisConfig::default());
        assert!(report.summary.success_rate < 0.98);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("investigate failure kinds")));
    }

    #[test]
    fn build_baseline_requires_terminal_run_and_min_samples() {
        let config = TestConfiguration::new("stt", "llm", "tts", "voice", NetworkProfile::ideal(), 1).unwrap();
        let mut run = TestRun::new("suite", 1);
        run.push_result(successful_result(run.id, config.id, 400.0));
        assert!(build_baseline("b", &run, 5).is_none()); // not terminal

        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Completed).unwrap();
        assert!(build_baseline("b", &run, 5).is_none()); // below min_samples
        assert!(build_baseline("b", &run, 1).is_some());
    }
}
