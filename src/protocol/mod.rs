//! Shared data model (spec §3): entities exchanged between LTO, AudioBus,
//! the Storage/SessionStore interfaces, and the CLI/WebSocket edges.
//!
//! Every entity here is a plain `serde` struct, `Clone + Debug`, matching
//! the shape the teacher used for its own wire types. Closed tag sets
//! (`ClientType`, `RunStatus`, `IdleState`, regression `Severity`, error
//! kinds) are `enum`s rather than strings so matches stay exhaustive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{ControlPlaneError, ErrorKind};

pub type ConfigId = Uuid;
pub type ScenarioId = Uuid;
pub type SuiteId = String;
pub type RunId = Uuid;
pub type ClientId = String;
pub type SessionId = String;

/// Maximum repetitions a single `TestConfiguration` may request (spec §3).
pub const MAX_REPETITIONS: u32 = 1_000;

// ---------------------------------------------------------------------
// LTO data model
// ---------------------------------------------------------------------

/// One parameter combination under test: a provider triple, a voice, a
/// network profile, and a repetition count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub id: ConfigId,
    pub stt_provider: String,
    pub llm_provider: String,
    pub tts_provider: String,
    pub voice_id: String,
    pub network_profile: NetworkProfile,
    pub repetitions: u32,
}

impl TestConfiguration {
    pub fn new(
        stt_provider: impl Into<String>,
        llm_provider: impl Into<String>,
        tts_provider: impl Into<String>,
        voice_id: impl Into<String>,
        network_profile: NetworkProfile,
        repetitions: u32,
    ) -> Result<Self, ControlPlaneError> {
        let stt_provider = stt_provider.into();
        let llm_provider = llm_provider.into();
        let tts_provider = tts_provider.into();
        if stt_provider.is_empty() || llm_provider.is_empty() || tts_provider.is_empty() {
            return Err(ControlPlaneError::invalid_argument(
                "provider triple must be non-empty",
            ));
        }
        if repetitions < 1 || repetitions > MAX_REPETITIONS {
            return Err(ControlPlaneError::invalid_argument(format!(
                "repetitions must be in [1, {MAX_REPETITIONS}]"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            stt_provider,
            llm_provider,
            tts_provider,
            voice_id: voice_id.into(),
            network_profile,
            repetitions,
        })
    }
}

/// A named, open-ended network condition identifier (spec §3: provider ids
/// are plain newtypes where the source leaves the set open).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NetworkProfile(pub String);

impl NetworkProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn ideal() -> Self {
        Self("ideal".to_string())
    }
}

impl std::fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered list of configurations, ids unique within the scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestScenario {
    pub id: ScenarioId,
    pub name: String,
    pub configurations: Vec<TestConfiguration>,
}

impl TestScenario {
    pub fn new(
        name: impl Into<String>,
        configurations: Vec<TestConfiguration>,
    ) -> Result<Self, ControlPlaneError> {
        let mut seen = std::collections::HashSet::new();
        for config in &configurations {
            if !seen.insert(config.id) {
                return Err(ControlPlaneError::invalid_argument(
                    "duplicate configuration id within scenario",
                ));
            }
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            configurations,
        })
    }
}

/// A registered, immutable suite: an ordered list of scenarios plus the
/// derived total unit count (`Σ configs × repetitions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteDefinition {
    pub id: SuiteId,
    pub name: String,
    pub description: String,
    pub scenarios: Vec<TestScenario>,
    pub total_test_count: u64,
}

impl TestSuiteDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        scenarios: Vec<TestScenario>,
    ) -> Self {
        let total_test_count = scenarios
            .iter()
            .flat_map(|s| s.configurations.iter())
            .map(|c| c.repetitions as u64)
            .sum();
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            scenarios,
            total_test_count,
        }
    }

    /// Flattens the suite into the ordered work queue LTO dispatches from:
    /// `(scenario_index, config_index, repetition_index)` triples, stable
    /// order, matching §4.1 step 1.
    pub fn flatten(&self) -> Vec<WorkUnitSpec> {
        let mut units = Vec::with_capacity(self.total_test_count as usize);
        for (scenario_index, scenario) in self.scenarios.iter().enumerate() {
            for (config_index, config) in scenario.configurations.iter().enumerate() {
                for repetition_index in 0..config.repetitions {
                    units.push(WorkUnitSpec {
                        scenario_index,
                        config_index,
                        repetition_index,
                        config_id: config.id,
                    });
                }
            }
        }
        units
    }

    /// The default `quick_validation` suite (supplemented from
    /// `original_source/`'s `create_quick_validation_suite`): one scenario,
    /// six configurations, one repetition each, against the `ideal` network
    /// profile.
    pub fn quick_validation() -> Result<Self, ControlPlaneError> {
        let mut configs = Vec::with_capacity(6);
        for i in 0..6 {
            configs.push(TestConfiguration::new(
                "mock-stt",
                "mock-llm",
                "mock-tts",
                format!("voice-{i}"),
                NetworkProfile::ideal(),
                1,
            )?);
        }
        let scenario = TestScenario::new("baseline", configs)?;
        Ok(Self::new(
            "quick_validation",
            "Quick Validation",
            "Smoke-test suite: six configurations, one repetition each",
            vec![scenario],
        ))
    }

    /// The default `provider_comparison` suite (supplemented from
    /// `original_source/`'s `create_provider_comparison_suite`): compares
    /// two STT providers head-to-head under an identical LLM/TTS/voice
    /// pairing, three repetitions each.
    pub fn provider_comparison() -> Result<Self, ControlPlaneError> {
        let providers = ["provider-a", "provider-b"];
        let mut configs = Vec::with_capacity(providers.len());
        for provider in providers {
            configs.push(TestConfiguration::new(
                provider,
                "mock-llm",
                "mock-tts",
                "voice-default",
                NetworkProfile::ideal(),
                3,
            )?);
        }
        let scenario = TestScenario::new("stt-comparison", configs)?;
        Ok(Self::new(
            "provider_comparison",
            "Provider Comparison",
            "Head-to-head STT provider comparison",
            vec![scenario],
        ))
    }
}

/// One entry in the flattened LTO work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnitSpec {
    pub scenario_index: usize,
    pub config_index: usize,
    pub repetition_index: u32,
    pub config_id: ConfigId,
}

/// Per-stage latency measurement for one dispatched unit, plus outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub run_id: RunId,
    pub config_id: ConfigId,
    pub client_id: ClientId,
    pub repetition_index: u32,
    pub capture_to_stt_ms: f64,
    pub stt_to_llm_ms: f64,
    pub llm_to_tts_ms: f64,
    pub tts_to_playback_ms: f64,
    pub end_to_end_ms: f64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl TestResult {
    /// Epsilon for the `e2e == Σ stages` invariant (spec §3), in
    /// milliseconds — accounts for floating point summation drift.
    const STAGE_SUM_EPSILON_MS: f64 = 0.5;

    pub fn success(
        run_id: RunId,
        config_id: ConfigId,
        client_id: impl Into<String>,
        repetition_index: u32,
        stages: StageLatencies,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            config_id,
            client_id: client_id.into(),
            repetition_index,
            capture_to_stt_ms: stages.capture_to_stt_ms,
            stt_to_llm_ms: stages.stt_to_llm_ms,
            llm_to_tts_ms: stages.llm_to_tts_ms,
            tts_to_playback_ms: stages.tts_to_playback_ms,
            end_to_end_ms: stages.end_to_end_ms(),
            success: true,
            error_kind: None,
            started_at,
            completed_at,
        }
    }

    pub fn failure(
        run_id: RunId,
        config_id: ConfigId,
        client_id: impl Into<String>,
        repetition_index: u32,
        error_kind: ErrorKind,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            config_id,
            client_id: client_id.into(),
            repetition_index,
            capture_to_stt_ms: 0.0,
            stt_to_llm_ms: 0.0,
            llm_to_tts_ms: 0.0,
            tts_to_playback_ms: 0.0,
            end_to_end_ms: 0.0,
            success: false,
            error_kind: Some(error_kind),
            started_at,
            completed_at,
        }
    }

    /// Checks the invariant from spec §3: successful results carry
    /// non-negative stage latencies that sum to `end_to_end_ms` within
    /// epsilon; failed results must carry an `error_kind`.
    pub fn is_well_formed(&self) -> bool {
        if self.success {
            let stages_sum = self.capture_to_stt_ms
                + self.stt_to_llm_ms
                + self.llm_to_tts_ms
                + self.tts_to_playback_ms;
            self.error_kind.is_none()
                && self.capture_to_stt_ms >= 0.0
                && self.stt_to_llm_ms >= 0.0
                && self.llm_to_tts_ms >= 0.0
                && self.tts_to_playback_ms >= 0.0
                && (stages_sum - self.end_to_end_ms).abs() <= Self::STAGE_SUM_EPSILON_MS
        } else {
            self.error_kind.is_some()
        }
    }
}

/// The four per-stage latencies a mock or real client reports.
#[derive(Debug, Clone, Copy)]
pub struct StageLatencies {
    pub capture_to_stt_ms: f64,
    pub stt_to_llm_ms: f64,
    pub llm_to_tts_ms: f64,
    pub tts_to_playback_ms: f64,
}

impl StageLatencies {
    pub fn end_to_end_ms(&self) -> f64 {
        self.capture_to_stt_ms + self.stt_to_llm_ms + self.llm_to_tts_ms + self.tts_to_playback_ms
    }
}

/// Run lifecycle status (spec §4.1). Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Partial order from spec §8: `PENDING ≺ RUNNING ≺
    /// {COMPLETED,FAILED,CANCELLED}`. Returns whether `self -> next` is a
    /// legal (non-decreasing) transition.
    fn rank(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running => 1,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => 2,
        }
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// One execution of a suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: RunId,
    pub suite_id: SuiteId,
    pub status: RunStatus,
    pub total: u64,
    pub completed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub results: Vec<TestResult>,
}

impl TestRun {
    pub fn new(suite_id: impl Into<String>, total: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            suite_id: suite_id.into(),
            status: RunStatus::Pending,
            total,
            completed: 0,
            started_at: Utc::now(),
            ended_at: None,
            results: Vec::new(),
        }
    }

    /// Transitions `status`, rejecting moves that violate the partial
    /// order from spec §8. Stamps `ended_at` on reaching a terminal state.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), ControlPlaneError> {
        if !self.status.can_transition_to(next) {
            return Err(ControlPlaneError::precondition_violated(format!(
                "illegal run transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn push_result(&mut self, result: TestResult) {
        self.completed += 1;
        self.results.push(result);
    }
}

/// What a registered client declares it can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCapabilities {
    pub supported_stt_providers: Vec<String>,
    pub supported_llm_providers: Vec<String>,
    pub supported_tts_providers: Vec<String>,
    pub precision_timing: bool,
    pub device_metrics: bool,
    pub on_device_ml: bool,
    pub max_concurrent_tests: u32,
}

impl ClientCapabilities {
    pub fn covers(&self, config: &TestConfiguration) -> bool {
        self.supported_stt_providers.contains(&config.stt_provider)
            && self.supported_llm_providers.contains(&config.llm_provider)
            && self.supported_tts_providers.contains(&config.tts_provider)
    }

    pub fn is_well_formed(&self) -> bool {
        !self.supported_stt_providers.is_empty()
            && !self.supported_llm_providers.is_empty()
            && !self.supported_tts_providers.is_empty()
            && self.max_concurrent_tests >= 1
    }
}

/// Closed set of client kinds (spec §9: "named variants from closed
/// tagged sets").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Mock,
    Native,
    Web,
    Embedded,
}

/// Live bookkeeping for one registered client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatus {
    pub client_id: ClientId,
    pub client_type: ClientType,
    pub capabilities: ClientCapabilities,
    pub reachable: bool,
    pub in_flight: u32,
}

impl ClientStatus {
    pub fn new(client_id: impl Into<String>, client_type: ClientType, capabilities: ClientCapabilities) -> Self {
        Self {
            client_id: client_id.into(),
            client_type,
            capabilities,
            reachable: true,
            in_flight: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.capabilities.max_concurrent_tests
    }

    pub fn is_eligible_for(&self, config: &TestConfiguration) -> bool {
        self.reachable && self.has_capacity() && self.capabilities.covers(config)
    }
}

// ---------------------------------------------------------------------
// Results Analyzer data model
// ---------------------------------------------------------------------

/// Frozen per-config statistics used as the regression reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaselineMetrics {
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub sample_count: usize,
}

/// A named, immutable snapshot of per-config baselines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source_run_id: RunId,
    pub metrics: HashMap<ConfigId, BaselineMetrics>,
}

/// Regression severity tiers (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Moderate,
    Severe,
}

impl Severity {
    /// Classifies `ratio` (the regression's multiple of `threshold`) per
    /// spec §4.2: minor ≤1.5×, moderate ≤2×, severe otherwise.
    pub fn classify(ratio_of_threshold: f64) -> Self {
        if ratio_of_threshold <= 1.5 {
            Severity::Minor
        } else if ratio_of_threshold <= 2.0 {
            Severity::Moderate
        } else {
            Severity::Severe
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Regression {
    pub config_id: ConfigId,
    pub metric: &'static str,
    pub baseline_value: f64,
    pub current_value: f64,
    pub relative_change: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigStats {
    pub config_id: ConfigId,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub sample_count: usize,
    pub insufficient_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub min_ms: f64,
    pub max_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub success_rate: f64,
}

/// Derived analysis output; never stored directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub run_id: RunId,
    pub summary: RunSummary,
    pub per_config: Vec<ConfigStats>,
    pub regressions: Vec<Regression>,
    pub recommendations: Vec<String>,
}

// ---------------------------------------------------------------------
// IdleMgr data model
// ---------------------------------------------------------------------

/// A tier of presumed user absence, totally ordered by `level()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    Active,
    Warm,
    Cool,
    Cold,
    Dormant,
}

impl IdleState {
    pub fn level(self) -> u8 {
        match self {
            IdleState::Active => 0,
            IdleState::Warm => 1,
            IdleState::Cool => 2,
            IdleState::Cold => 3,
            IdleState::Dormant => 4,
        }
    }
}

/// Strictly monotone warm < cool < cold < dormant thresholds, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IdleThresholds {
    pub warm_secs: u64,
    pub cool_secs: u64,
    pub cold_secs: u64,
    pub dormant_secs: u64,
}

impl IdleThresholds {
    pub fn new(warm_secs: u64, cool_secs: u64, cold_secs: u64, dormant_secs: u64) -> Result<Self, ControlPlaneError> {
        if !(warm_secs < cool_secs && cool_secs < cold_secs && cold_secs < dormant_secs) {
            return Err(ControlPlaneError::invalid_argument(
                "idle thresholds must satisfy warm < cool < cold < dormant",
            ));
        }
        Ok(Self {
            warm_secs,
            cool_secs,
            cold_secs,
            dormant_secs,
        })
    }

    /// Computes the target state for `idle_secs` elapsed since last
    /// activity, per the table in spec §4.3 (inclusive lower bounds).
    pub fn target_for(&self, idle_secs: u64) -> IdleState {
        if idle_secs >= self.dormant_secs {
            IdleState::Dormant
        } else if idle_secs >= self.cold_secs {
            IdleState::Cold
        } else if idle_secs >= self.cool_secs {
            IdleState::Cool
        } else if idle_secs >= self.warm_secs {
            IdleState::Warm
        } else {
            IdleState::Active
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerMode {
    pub id: String,
    pub name: String,
    pub description: String,
    pub thresholds: IdleThresholds,
    pub enabled: bool,
    pub builtin: bool,
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleTransition {
    pub from: IdleState,
    pub to: IdleState,
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
    pub seconds_idle: u64,
}

// ---------------------------------------------------------------------
// AudioBus data model
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub session_id: SessionId,
    pub user_id: String,
    pub playback: PlaybackState,
    pub voice_config: VoiceConfig,
}

impl UserSession {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            playback: PlaybackState::default(),
            voice_config: VoiceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackState {
    pub curriculum_id: Option<String>,
    pub topic_id: Option<String>,
    pub segment_index: u32,
    pub offset_ms: u64,
    pub is_playing: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            curriculum_id: None,
            topic_id: None,
            segment_index: 0,
            offset_ms: 0,
            is_playing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub voice_id: String,
    pub tts_provider: String,
    pub speed: f32,
    pub extra: HashMap<String, serde_json::Value>,
}

impl VoiceConfig {
    pub const MIN_SPEED: f32 = 0.25;
    pub const MAX_SPEED: f32 = 4.0;
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: "default".to_string(),
            tts_provider: "default".to_string(),
            speed: 1.0,
            extra: HashMap::new(),
        }
    }
}

/// Ordered list of text segments for one `(curriculum_id, topic_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSegmentTable {
    pub curriculum_id: String,
    pub topic_id: String,
    pub segments: Vec<String>,
}

impl TopicSegmentTable {
    pub fn total_segments(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_rejects_empty_provider() {
        let result = TestConfiguration::new("", "llm", "tts", "voice", NetworkProfile::ideal(), 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_configuration_rejects_zero_repetitions() {
        let result = TestConfiguration::new("stt", "llm", "tts", "voice", NetworkProfile::ideal(), 0);
        assert!(result.is_err());
    }

    #[test]
    fn suite_total_test_count_is_sum_of_config_repetitions() {
        let a = TestConfiguration::new("a", "llm", "tts", "voice", NetworkProfile::ideal(), 2).unwrap();
        let b = TestConfiguration::new("b", "llm", "tts", "voice", NetworkProfile::ideal(), 3).unwrap();
        let scenario = TestScenario::new("s", vec![a, b]).unwrap();
        let suite = TestSuiteDefinition::new("suite", "Suite", "desc", vec![scenario]);
        assert_eq!(suite.total_test_count, 5);
        assert_eq!(suite.flatten().len(), 5);
    }

    #[test]
    fn quick_validation_suite_has_six_units() {
        let suite = TestSuiteDefinition::quick_validation().unwrap();
        assert_eq!(suite.total_test_count, 6);
    }

    #[test]
    fn run_status_partial_order_rejects_backwards_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_run_transition_stamps_ended_at_on_terminal() {
        let mut run = TestRun::new("suite", 1);
        run.transition(RunStatus::Running).unwrap();
        assert!(run.ended_at.is_none());
        run.transition(RunStatus::Completed).unwrap();
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_result_well_formed_success_sums_stages() {
        let stages = StageLatencies {
            capture_to_stt_ms: 50.0,
            stt_to_llm_ms: 100.0,
            llm_to_tts_ms: 80.0,
            tts_to_playback_ms: 20.0,
        };
        let now = Utc::now();
        let result = TestResult::success(Uuid::new_v4(), Uuid::new_v4(), "client-1", 0, stages, now, now);
        assert!(result.is_well_formed());
        assert_eq!(result.end_to_end_ms, 250.0);
    }

    #[test]
    fn test_result_failure_requires_error_kind() {
        let now = Utc::now();
        let result = TestResult::failure(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "client-1",
            0,
            ErrorKind::ClientGone,
            now,
            now,
        );
        assert!(result.is_well_formed());
        assert_eq!(result.error_kind, Some(ErrorKind::ClientGone));
    }

    #[test]
    fn idle_thresholds_reject_non_monotone() {
        assert!(IdleThresholds::new(10, 10, 300, 1800).is_err());
        assert!(IdleThresholds::new(10, 60, 300, 1800).is_ok());
    }

    #[test]
    fn idle_thresholds_target_for_is_inclusive_lower_bound() {
        let thresholds = IdleThresholds::new(10, 60, 300, 1800).unwrap();
        assert_eq!(thresholds.target_for(9), IdleState::Active);
        assert_eq!(thresholds.target_for(10), IdleState::Warm);
        assert_eq!(thresholds.target_for(60), IdleState::Cool);
        assert_eq!(thresholds.target_for(300), IdleState::Cold);
        assert_eq!(thresholds.target_for(1800), IdleState::Dormant);
    }

    #[test]
    fn idle_state_total_order_by_level() {
        assert!(IdleState::Active < IdleState::Warm);
        assert!(IdleState::Warm < IdleState::Dormant);
    }

    #[test]
    fn severity_classification_matches_spec_thresholds() {
        assert_eq!(Severity::classify(1.0), Severity::Minor);
        assert_eq!(Severity::classify(1.5), Severity::Minor);
        assert_eq!(Severity::classify(2.0), Severity::Moderate);
        assert_eq!(Severity::classify(2.5), Severity::Severe);
    }

    #[test]
    fn client_eligibility_requires_capacity_and_coverage() {
        let caps = ClientCapabilities {
            supported_stt_providers: vec!["stt".to_string()],
            supported_llm_providers: vec!["llm".to_string()],
            supported_tts_providers: vec!["tts".to_string()],
            precision_timing: false,
            device_metrics: false,
            on_device_ml: false,
            max_concurrent_tests: 1,
        };
        let mut status = ClientStatus::new("c1", ClientType::Mock, caps);
        let config = TestConfiguration::new("stt", "llm", "tts", "voice", NetworkProfile::ideal(), 1).unwrap();
        assert!(status.is_eligible_for(&config));
        status.in_flight = 1;
        assert!(!status.is_eligible_for(&config));
    }

    #[test]
    fn playback_state_default_is_at_rest() {
        let playback = PlaybackState::default();
        assert_eq!(playback.segment_index, 0);
        assert!(!playback.is_playing);
    }
}
