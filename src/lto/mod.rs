//! Latency Test Orchestrator (spec §4.1): suite registry, client registry,
//! run scheduler, per-configuration replica runner, result ingestion,
//! cancellation.
//!
//! Grounded on the teacher's `WorkerPool`/`PythonWorker` pair: the client
//! registry and run registry are `Arc<RwLock<HashMap<...>>>` maps exactly
//! like `tracker::MessageTracker`'s `messages`/`worker_assignments`, the
//! per-unit retry/timeout state machine reuses that tracker's
//! `is_timed_out`/`can_retry`/`mark_*` shape parameterized per spec §4.1,
//! and the scheduler's exponential backoff doubles the same way
//! `PythonWorker::spawn_worker_loop` doubles `backoff`, extended with the
//! ±20% jitter spec §7 requires.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{ControlPlaneError, ErrorKind};
use crate::protocol::{
    ClientCapabilities, ClientId, ClientStatus, ClientType, ConfigId, RunId, RunStatus,
    StageLatencies, TestConfiguration, TestResult, TestRun, TestSuiteDefinition,
};
use crate::storage::{RunFilter, Storage};

/// Per-dispatch payload handed to a [`Client`] (spec §4.1 "Client
/// protocol": "a *unit descriptor* (config + repetition index +
/// deadline)").
#[derive(Debug, Clone)]
pub struct UnitDescriptor {
    pub config: TestConfiguration,
    pub repetition_index: u32,
    pub deadline: DateTime<Utc>,
}

/// What a client hands back (spec §4.1: "a *unit report* (latencies,
/// success, optional error kind)").
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub stages: StageLatencies,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
}

/// Dispatch + liveness capability for a registered client (spec §9:
/// "Re-architect as explicit interfaces: a `Client` capability describing
/// dispatch + cancel + liveness"). Cancellation is modeled at the LTO
/// layer (task abort on `unregister_client`) rather than on this trait,
/// since transport is abstracted away per spec §1.
#[async_trait]
pub trait Client: Send + Sync {
    fn client_id(&self) -> &str;
    async fn dispatch(&self, unit: UnitDescriptor) -> Result<UnitReport, ControlPlaneError>;
}

/// In-process generator client (spec §4.1: "for mock clients LTO may
/// short-circuit the dispatch by calling an in-process generator that
/// samples from a distribution"). Grounded on
/// `utils::create_test_audio_chunk`'s synthetic-data-generation pattern.
pub struct MockClient {
    id: ClientId,
    mean_ms: f64,
    std_dev_ms: f64,
    failure_rate: f64,
}

impl MockClient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mean_ms: 400.0,
            std_dev_ms: 30.0,
            failure_rate: 0.0,
        }
    }

    pub fn with_latency(mut self, mean_ms: f64, std_dev_ms: f64) -> Self {
        self.mean_ms = mean_ms;
        self.std_dev_ms = std_dev_ms;
        self
    }

    /// Probability in `[0, 1]` that a dispatched unit reports
    /// `provider_error` instead of a sampled latency; used to exercise
    /// the retry/failure paths in tests.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate;
        self
    }
}

#[async_trait]
impl Client for MockClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    async fn dispatch(&self, _unit: UnitDescriptor) -> Result<UnitReport, ControlPlaneError> {
        if self.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.failure_rate {
            return Ok(UnitReport {
                stages: zero_stages(),
                success: false,
                error_kind: Some(ErrorKind::ProviderError),
            });
        }
        let e2e = sample_normal(self.mean_ms, self.std_dev_ms).max(1.0);
        Ok(UnitReport {
            stages: StageLatencies {
                capture_to_stt_ms: e2e * 0.2,
                stt_to_llm_ms: e2e * 0.4,
                llm_to_tts_ms: e2e * 0.3,
                tts_to_playback_ms: e2e * 0.1,
            },
            success: true,
            error_kind: None,
        })
    }
}

fn zero_stages() -> StageLatencies {
    StageLatencies {
        capture_to_stt_ms: 0.0,
        stt_to_llm_ms: 0.0,
        llm_to_tts_ms: 0.0,
        tts_to_playback_ms: 0.0,
    }
}

/// Box-Muller sample from `N(mean, std_dev)`.
fn sample_normal(mean: f64, std_dev: f64) -> f64 {
    let mut rng = rand::thread_rng();
    let u1: f64 = rng.gen_range(1e-12..1.0);
    let u2: f64 = rng.gen();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + z0 * std_dev
}

/// Exponential backoff with ±20% jitter, base 250ms, capped at attempt 4
/// (spec §7: "cap 5 attempts, base 250 ms, jitter ±20%").
fn backoff_duration(attempt: u32) -> Duration {
    let base_ms = 250u64.saturating_mul(1u64 << attempt.min(4));
    let jitter = rand::thread_rng().gen_range(-0.2f64..=0.2);
    let ms = (base_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(ms)
}

/// Tunable scheduling parameters (spec §4.1/§5; §9 "SHOULD be
/// configurable" applies equally well here).
#[derive(Debug, Clone, Copy)]
pub struct LtoConfig {
    pub unit_timeout: Duration,
    pub max_retries: u32,
    /// Batches storage writes every `batch_size` results or
    /// `batch_interval`, whichever comes first (spec §4.1 step 5).
    pub batch_size: usize,
    pub batch_interval: Duration,
}

impl Default for LtoConfig {
    fn default() -> Self {
        Self {
            unit_timeout: Duration::from_secs(5),
            max_retries: 2,
            batch_size: 10,
            batch_interval: Duration::from_secs(2),
        }
    }
}

struct RegisteredClient {
    status: RwLock<ClientStatus>,
    handle: Arc<dyn Client>,
}

struct InFlightDispatch {
    abort: AbortHandle,
    config_id: ConfigId,
    repetition_index: u32,
}

struct RunHandle {
    run: RwLock<TestRun>,
    cancelled: Arc<AtomicBool>,
    in_flight: RwLock<HashMap<ClientId, Vec<InFlightDispatch>>>,
    scheduler: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The orchestrator. Cheaply [`Clone`] so a handle can be moved into the
/// per-run scheduler task, matching `IdleMgr`'s `Arc`-backed `Clone`.
#[derive(Clone)]
pub struct LatencyTestOrchestrator {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    clients: Arc<RwLock<HashMap<ClientId, Arc<RegisteredClient>>>>,
    runs: Arc<RwLock<HashMap<RunId, Arc<RunHandle>>>>,
    config: LtoConfig,
}

impl LatencyTestOrchestrator {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, config: LtoConfig) -> Self {
        Self {
            storage,
            clock,
            clients: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    // -- suite registry ----------------------------------------------------

    /// Idempotent by `suite.id`; rejects a redefinition under the same id
    /// (spec §4.1).
    pub async fn register_suite(&self, suite: TestSuiteDefinition) -> Result<(), ControlPlaneError> {
        self.storage.put_suite(suite).await
    }

    pub async fn list_suites(&self) -> Result<Vec<TestSuiteDefinition>, ControlPlaneError> {
        self.storage.list_suites().await
    }

    pub async fn get_suite(&self, id: &str) -> Result<Option<TestSuiteDefinition>, ControlPlaneError> {
        self.storage.get_suite(id).await
    }

    // -- client registry ----------------------------------------------------

    /// Registers (overwriting any prior registration) a client capability
    /// under `client.client_id()`, resetting its in-flight counter to 0
    /// (spec §4.1).
    pub async fn register_client(
        &self,
        client: Arc<dyn Client>,
        client_type: ClientType,
        capabilities: ClientCapabilities,
    ) {
        let id = client.client_id().to_string();
        let status = ClientStatus::new(id.clone(), client_type, capabilities);
        self.clients.write().await.insert(
            id,
            Arc::new(RegisteredClient {
                status: RwLock::new(status),
                handle: client,
            }),
        );
    }

    /// Convenience over [`register_client`] for the `--mock` CLI path
    /// (spec §6).
    pub async fn register_mock_client(&self, id: impl Into<String>, capabilities: ClientCapabilities) {
        let id = id.into();
        self.register_client(Arc::new(MockClient::new(id)), ClientType::Mock, capabilities)
            .await;
    }

    /// Cancels any in-flight dispatches targeting `client_id` and marks
    /// them failed with `client_gone` (spec §4.1).
    pub async fn unregister_client(&self, client_id: &str) {
        self.clients.write().await.remove(client_id);

        let runs = self.runs.read().await;
        for handle in runs.values() {
            let drained = handle.in_flight.write().await.remove(client_id);
            let Some(drained) = drained else { continue };
            for dispatch in drained {
                dispatch.abort.abort();
                let now = self.clock.now_utc();
                let run_id = handle.run.read().await.id;
                let result = TestResult::failure(
                    run_id,
                    dispatch.config_id,
                    client_id,
                    dispatch.repetition_index,
                    ErrorKind::ClientGone,
                    now,
                    now,
                );
                self.record_result(handle, result).await;
            }
        }
    }

    pub async fn client_status(&self, client_id: &str) -> Option<ClientStatus> {
        let clients = self.clients.read().await;
        let rc = clients.get(client_id)?;
        Some(rc.status.read().await.clone())
    }

    // -- runs ---------------------------------------------------------------

    /// Starts a run for `suite_id` (spec §4.1). Fails with
    /// `suite_not_found` or `no_eligible_client`; otherwise persists the
    /// run `PENDING`, transitions it to `RUNNING`, and returns.
    pub async fn start_test_run(&self, suite_id: &str) -> Result<TestRun, ControlPlaneError> {
        let suite = self
            .storage
            .get_suite(suite_id)
            .await?
            .ok_or_else(|| ControlPlaneError::suite_not_found(suite_id))?;

        if !self.has_eligible_client_for(&suite).await {
            return Err(ControlPlaneError::no_eligible_client());
        }

        let mut run = TestRun::new(suite.id.clone(), suite.total_test_count);
        self.storage.put_run(run.clone()).await?;
        run.transition(RunStatus::Running)?;
        self.storage.update_run(run.clone()).await?;

        let run_id = run.id;
        let handle = Arc::new(RunHandle {
            run: RwLock::new(run.clone()),
            cancelled: Arc::new(AtomicBool::new(false)),
            in_flight: RwLock::new(HashMap::new()),
            scheduler: tokio::sync::Mutex::new(None),
        });
        self.runs.write().await.insert(run_id, Arc::clone(&handle));

        let lto = self.clone();
        let join = tokio::spawn(async move {
            lto.run_scheduler(run_id, suite).await;
        });
        *handle.scheduler.lock().await = Some(join);

        Ok(run)
    }

    pub async fn get_run(&self, id: RunId) -> Option<TestRun> {
        let runs = self.runs.read().await;
        if let Some(handle) = runs.get(&id) {
            return Some(handle.run.read().await.clone());
        }
        None
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Vec<TestRun> {
        let runs = self.runs.read().await;
        let mut out = Vec::new();
        for handle in runs.values() {
            let run = handle.run.read().await;
            let suite_matches = match &filter.suite_id {
                Some(id) => *id == run.suite_id,
                None => true,
            };
            let status_matches = match filter.status {
                Some(status) => status == run.status,
                None => true,
            };
            if suite_matches && status_matches {
                out.push(run.clone());
            }
        }
        out
    }

    /// Marks the run terminal-`CANCELLED`, rejects further dispatch of
    /// queued units, and lets already-retrying units observe the flag
    /// before their next attempt (spec §4.1 "Cancellation semantics").
    /// Idempotent.
    pub async fn cancel_run(&self, id: RunId) -> Result<(), ControlPlaneError> {
        let runs = self.runs.read().await;
        let Some(handle) = runs.get(&id) else {
            return Err(ControlPlaneError::invalid_argument(format!("run not found: {id}")));
        };
        {
            let mut run = handle.run.write().await;
            if run.status.is_terminal() {
                return Ok(());
            }
            run.transition(RunStatus::Cancelled)?;
        }
        handle.cancelled.store(true, Ordering::SeqCst);
        self.flush_run(handle).await?;
        Ok(())
    }

    /// Awaits the run's scheduler task to completion and returns the
    /// final run snapshot. Exists mainly for deterministic tests — the
    /// orchestrator's public contract otherwise returns immediately from
    /// `start_test_run` and expects pollers to call `get_run`.
    pub async fn await_run(&self, id: RunId) -> Option<TestRun> {
        let join = {
            let runs = self.runs.read().await;
            let handle = runs.get(&id)?;
            handle.scheduler.lock().await.take()
        };
        if let Some(join) = join {
            let _ = join.await;
        }
        self.get_run(id).await
    }

    // -- internals ------------------------------------------------------------

    async fn has_eligible_client_for(&self, suite: &TestSuiteDefinition) -> bool {
        let clients = self.clients.read().await;
        for scenario in &suite.scenarios {
            for config in &scenario.configurations {
                for rc in clients.values() {
                    if rc.status.read().await.capabilities.covers(config) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Whether any currently-registered client's static capabilities cover
    /// `config`, ignoring capacity. Used to distinguish "every covering
    /// client is momentarily busy" (keep waiting) from "no client left that
    /// could ever run this" (fail it) once the queue stalls.
    async fn any_client_covers(&self, config: &TestConfiguration) -> bool {
        let clients = self.clients.read().await;
        for rc in clients.values() {
            if rc.status.read().await.capabilities.covers(config) {
                return true;
            }
        }
        false
    }

    /// Atomically finds the best eligible client for `config` (smallest
    /// in-flight, lexicographic client id tie-break, spec §4.1 step 3) and
    /// claims a capacity slot on it.
    async fn try_claim_client(&self, config: &TestConfiguration) -> Option<(ClientId, Arc<dyn Client>)> {
        let clients = self.clients.read().await;
        let mut candidates: Vec<(ClientId, u32)> = Vec::new();
        for (id, rc) in clients.iter() {
            let status = rc.status.read().await;
            if status.is_eligible_for(config) {
                candidates.push((id.clone(), status.in_flight));
            }
        }
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        for (id, _) in candidates {
            if let Some(rc) = clients.get(&id) {
                let mut status = rc.status.write().await;
                if status.is_eligible_for(config) {
                    status.in_flight += 1;
                    return Some((id, Arc::clone(&rc.handle)));
                }
            }
        }
        None
    }

    async fn release_client(&self, client_id: &str) {
        let clients = self.clients.read().await;
        if let Some(rc) = clients.get(client_id) {
            let mut status = rc.status.write().await;
            status.in_flight = status.in_flight.saturating_sub(1);
        }
    }

    async fn record_result(&self, handle: &RunHandle, result: TestResult) {
        {
            let mut map = handle.in_flight.write().await;
            if let Some(v) = map.get_mut(&result.client_id) {
                v.retain(|d| !(d.config_id == result.config_id && d.repetition_index == result.repetition_index));
            }
        }
        let mut run = handle.run.write().await;
        run.push_result(result);
    }

    async fn flush_run(&self, handle: &RunHandle) -> Result<(), ControlPlaneError> {
        let snapshot = handle.run.read().await.clone();
        self.storage.update_run(snapshot).await
    }

    async fn finalize_run(&self, handle: &RunHandle) {
        {
            let mut run = handle.run.write().await;
            if !run.status.is_terminal() {
                let next = if run.completed < run.total {
                    RunStatus::Failed
                } else if run.results.iter().any(|r| !r.success) {
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                };
                if let Err(e) = run.transition(next) {
                    warn!(run_id = %run.id, error = %e, "failed to finalize run status");
                }
            }
        }
        if let Err(e) = self.flush_run(handle).await {
            warn!(error = %e, "failed to persist final run state");
        }
    }

    async fn run_scheduler(&self, run_id: RunId, suite: TestSuiteDefinition) {
        let handle = {
            let runs = self.runs.read().await;
            match runs.get(&run_id) {
                Some(h) => Arc::clone(h),
                None => return,
            }
        };

        let mut queue: VecDeque<(ConfigId, u32)> = suite
            .flatten()
            .into_iter()
            .map(|unit| (unit.config_id, unit.repetition_index))
            .collect();
        let config_by_id: HashMap<ConfigId, TestConfiguration> = suite
            .scenarios
            .iter()
            .flat_map(|s| s.configurations.iter())
            .map(|c| (c.id, c.clone()))
            .collect();

        let mut joinset: JoinSet<TestResult> = JoinSet::new();
        let mut last_flush = self.clock.now_monotonic();
        let mut since_flush = 0usize;

        info!(run_id = %run_id, units = queue.len(), "lto scheduler started");

        loop {
            while !handle.cancelled.load(Ordering::SeqCst) {
                let Some((config_id, repetition_index)) = queue.front().copied() else {
                    break;
                };
                let config = config_by_id.get(&config_id).expect("config present in suite").clone();
                match self.try_claim_client(&config).await {
                    Some((client_id, client)) => {
                        queue.pop_front();
                        let cancelled = Arc::clone(&handle.cancelled);
                        let ctx = DispatchContext {
                            run_id,
                            config: config.clone(),
                            client_id: client_id.clone(),
                            repetition_index,
                            unit_timeout: self.config.unit_timeout,
                            max_retries: self.config.max_retries,
                            clock: Arc::clone(&self.clock),
                            cancelled,
                        };
                        let lto = self.clone();
                        let abort_client_id = client_id.clone();
                        let abort = joinset.spawn(async move {
                            let result = dispatch_unit_with_retries(client, ctx).await;
                            lto.release_client(&abort_client_id).await;
                            result
                        });
                        handle
                            .in_flight
                            .write()
                            .await
                            .entry(client_id)
                            .or_default()
                            .push(InFlightDispatch { abort, config_id, repetition_index });
                    }
                    None => break,
                }
            }

            if queue.is_empty() && joinset.is_empty() {
                break;
            }
            if handle.cancelled.load(Ordering::SeqCst) && joinset.is_empty() {
                break;
            }

            if joinset.is_empty() {
                // Queue non-empty but no client currently has capacity. If
                // at least one registered client still covers the head
                // config, that's transient (the client will free up);
                // back off briefly and re-check. If none does (e.g. the
                // only covering client just unregistered), the queue will
                // never drain on its own: fail the stuck units as
                // client_gone and let the run finalize (spec §4.1).
                let mut stuck = false;
                while let Some(&(config_id, repetition_index)) = queue.front() {
                    let config = config_by_id.get(&config_id).expect("config present in suite");
                    if self.any_client_covers(config).await {
                        break;
                    }
                    queue.pop_front();
                    stuck = true;
                    let now = self.clock.now_utc();
                    let result = TestResult::failure(
                        run_id,
                        config_id,
                        "none",
                        repetition_index,
                        ErrorKind::ClientGone,
                        now,
                        now,
                    );
                    self.record_result(&handle, result).await;
                    since_flush += 1;
                }
                if stuck {
                    continue;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
                continue;
            }

            match joinset.join_next().await {
                Some(Ok(result)) => {
                    self.record_result(&handle, result).await;
                    since_flush += 1;
                }
                Some(Err(join_err)) => {
                    if !join_err.is_cancelled() {
                        warn!(run_id = %run_id, error = %join_err, "dispatch task failed unexpectedly");
                    }
                }
                None => {}
            }

            if since_flush >= self.config.batch_size
                || self.clock.now_monotonic().saturating_duration_since(last_flush) >= self.config.batch_interval
            {
                if let Err(e) = self.flush_run(&handle).await {
                    warn!(run_id = %run_id, error = %e, "batched run flush failed");
                }
                since_flush = 0;
                last_flush = self.clock.now_monotonic();
            }
        }

        self.finalize_run(&handle).await;
        debug!(run_id = %run_id, "lto scheduler finished");
    }
}

#[derive(Clone)]
struct DispatchContext {
    run_id: RunId,
    config: TestConfiguration,
    client_id: ClientId,
    repetition_index: u32,
    unit_timeout: Duration,
    max_retries: u32,
    clock: Arc<dyn Clock>,
    cancelled: Arc<AtomicBool>,
}

/// Dispatches one unit, retrying transient failures/timeouts up to
/// `max_retries` with jittered exponential backoff (spec §4.1 step 4,
/// §7). Always returns a (possibly failed) [`TestResult`]; never panics.
async fn dispatch_unit_with_retries(client: Arc<dyn Client>, ctx: DispatchContext) -> TestResult {
    let started_at = ctx.clock.now_utc();
    let mut attempt = 0u32;

    loop {
        if ctx.cancelled.load(Ordering::SeqCst) {
            return TestResult::failure(
                ctx.run_id,
                ctx.config.id,
                ctx.client_id.clone(),
                ctx.repetition_index,
                ErrorKind::Cancelled,
                started_at,
                ctx.clock.now_utc(),
            );
        }

        let deadline = ctx.clock.now_utc()
            + chrono::Duration::from_std(ctx.unit_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let descriptor = UnitDescriptor {
            config: ctx.config.clone(),
            repetition_index: ctx.repetition_index,
            deadline,
        };

        match tokio::time::timeout(ctx.unit_timeout, client.dispatch(descriptor)).await {
            Ok(Ok(report)) => {
                let completed_at = ctx.clock.now_utc();
                return if report.success {
                    TestResult::success(
                        ctx.run_id,
                        ctx.config.id,
                        ctx.client_id.clone(),
                        ctx.repetition_index,
                        report.stages,
                        started_at,
                        completed_at,
                    )
                } else {
                    TestResult::failure(
                        ctx.run_id,
                        ctx.config.id,
                        ctx.client_id.clone(),
                        ctx.repetition_index,
                        report.error_kind.unwrap_or(ErrorKind::UnitFailed),
                        started_at,
                        completed_at,
                    )
                };
            }
            Ok(Err(err)) => {
                if err.kind.is_transient() && attempt < ctx.max_retries {
                    tokio::time::sleep(backoff_duration(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return TestResult::failure(
                    ctx.run_id,
                    ctx.config.id,
                    ctx.client_id.clone(),
                    ctx.repetition_index,
                    err.kind,
                    started_at,
                    ctx.clock.now_utc(),
                );
            }
            Err(_elapsed) => {
                if attempt < ctx.max_retries {
                    tokio::time::sleep(backoff_duration(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return TestResult::failure(
                    ctx.run_id,
                    ctx.config.id,
                    ctx.client_id.clone(),
                    ctx.repetition_index,
                    ErrorKind::UnitTimeout,
                    started_at,
                    ctx.clock.now_utc(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::protocol::NetworkProfile;
    use crate::storage::MemoryStorage;

    fn mock_capabilities() -> ClientCapabilities {
        ClientCapabilities {
            supported_stt_providers: vec!["mock-stt".to_string()],
            supported_llm_providers: vec!["mock-llm".to_string()],
            supported_tts_providers: vec!["mock-tts".to_string()],
            precision_timing: false,
            device_metrics: false,
            on_device_ml: false,
            max_concurrent_tests: 4,
        }
    }

    fn orchestrator() -> LatencyTestOrchestrator {
        LatencyTestOrchestrator::new(Arc::new(MemoryStorage::new()), Arc::new(SystemClock), LtoConfig::default())
    }

    #[tokio::test]
    async fn quick_validation_suite_completes_with_all_results() {
        let lto = orchestrator();
        lto.register_suite(TestSuiteDefinition::quick_validation().unwrap())
            .await
            .unwrap();
        lto.register_mock_client("mock-1", mock_capabilities()).await;

        let run = lto.start_test_run("quick_validation").await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let finished = lto.await_run(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.completed, 6);
        assert_eq!(finished.results.len(), 6);
        assert!(finished.results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn start_test_run_without_eligible_client_fails() {
        let lto = orchestrator();
        lto.register_suite(TestSuiteDefinition::quick_validation().unwrap())
            .await
            .unwrap();
        let err = lto.start_test_run("quick_validation").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ClientNotEligible);
    }

    #[tokio::test]
    async fn start_test_run_with_unknown_suite_fails() {
        let lto = orchestrator();
        let err = lto.start_test_run("does-not-exist").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SuiteNotFound);
    }

    #[tokio::test]
    async fn unregistering_client_mid_run_fails_remaining_units_with_client_gone() {
        let lto = orchestrator();
        let mut configs = Vec::new();
        for i in 0..3 {
            configs.push(
                TestConfiguration::new("mock-stt", "mock-llm", "mock-tts", format!("v{i}"), NetworkProfile::ideal(), 1)
                    .unwrap(),
            );
        }
        let scenario = crate::protocol::TestScenario::new("s", configs).unwrap();
        let suite = TestSuiteDefinition::new("one-at-a-time", "One at a time", "d", vec![scenario]);
        lto.register_suite(suite).await.unwrap();

        let mut caps = mock_capabilities();
        caps.max_concurrent_tests = 1;
        lto.register_client(
            Arc::new(MockClient::new("slow-client").with_latency(50.0, 1.0)),
            ClientType::Mock,
            caps,
        )
        .await;

        let run = lto.start_test_run("one-at-a-time").await.unwrap();
        // Give the scheduler a moment to claim the first unit, then yank the client.
        tokio::time::sleep(Duration::from_millis(5)).await;
        lto.unregister_client("slow-client").await;

        let finished = lto.await_run(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert!(finished.results.iter().any(|r| r.error_kind == Some(ErrorKind::ClientGone)));
    }

    #[tokio::test]
    async fn cancel_run_is_idempotent_and_sticky() {
        let lto = orchestrator();
        lto.register_suite(TestSuiteDefinition::quick_validation().unwrap())
            .await
            .unwrap();
        lto.register_mock_client("mock-1", mock_capabilities()).await;
        let run = lto.start_test_run("quick_validation").await.unwrap();

        lto.cancel_run(run.id).await.unwrap();
        lto.cancel_run(run.id).await.unwrap();
        let final_run = lto.await_run(run.id).await.unwrap();
        assert_eq!(final_run.status, RunStatus::Cancelled);
    }
}
