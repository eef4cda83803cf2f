//! Tiered Idle State Manager (spec §4.3): a five-level idle state machine
//! driven by a wall-clock activity timer, governed by switchable power
//! modes, exposing registration hooks that unload/pre-warm heavyweight
//! services at state transitions.
//!
//! Grounded on the teacher's `PythonWorker`/`QueueMonitor` pair:
//! the monitor loop reuses the `tokio::time::interval` +
//! `broadcast`-shutdown shape from `PythonWorker::spawn_heartbeat_monitor`,
//! and handler dispatch generalizes `monitor.rs`'s `WorkerStatusType`
//! match-on-a-tagged-enum into a registry of invoke-with-transition
//! capabilities (spec §9 redesign note).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::ControlPlaneError;
use crate::protocol::{IdleState, IdleThresholds, IdleTransition, PowerMode};

/// Minimum bound on the transition history ring buffer (spec §4.3).
const MIN_HISTORY_CAPACITY: usize = 100;
const HISTORY_CAPACITY: usize = 256;

/// The monitor wakes at most once a second (spec §4.3).
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// A handler invoked on a state transition. May suspend; registries hold
/// these as trait objects rather than bare function pointers so both
/// closures and struct-backed callbacks satisfy the same contract
/// (spec §9).
pub type TransitionHandler = Arc<dyn Fn(IdleTransition) -> BoxFuture<'static, ()> + Send + Sync>;

/// A partial update to [`IdleThresholds`], mirroring `set_thresholds`'s
/// "dict merged over current" semantics (spec §4.3) in a statically typed
/// form.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdUpdate {
    pub warm_secs: Option<u64>,
    pub cool_secs: Option<u64>,
    pub cold_secs: Option<u64>,
    pub dormant_secs: Option<u64>,
}

/// A partial update to a [`PowerMode`]'s mutable fields, used by
/// `update_profile`.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub thresholds: Option<ThresholdUpdate>,
    pub enabled: Option<bool>,
}

struct IdleMgrState {
    current: IdleState,
    thresholds: IdleThresholds,
    enabled: bool,
    last_activity: Instant,
    last_activity_type: String,
    keep_awake_until: Option<Instant>,
    history: VecDeque<IdleTransition>,
}

struct MonitorHandle {
    shutdown: broadcast::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

/// The idle state machine. Cheaply [`Clone`] (every field is `Arc`-backed)
/// so a handle can be moved into the monitor task the same way the
/// teacher's `WorkerPool` shares `Arc<Vec<PythonWorker>>` with its spawned
/// loops.
#[derive(Clone)]
pub struct IdleMgr {
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<IdleMgrState>>,
    power_modes: Arc<RwLock<HashMap<String, PowerMode>>>,
    active_mode_id: Arc<RwLock<String>>,
    state_handlers: Arc<RwLock<HashMap<IdleState, Vec<TransitionHandler>>>>,
    global_handlers: Arc<RwLock<Vec<TransitionHandler>>>,
    monitor: Arc<Mutex<Option<MonitorHandle>>>,
}

impl IdleMgr {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let balanced = builtin_balanced();
        let thresholds = balanced.thresholds;
        let enabled = balanced.enabled;
        let power_modes = builtin_power_modes();

        let now = clock.now_monotonic();
        Self {
            clock,
            state: Arc::new(RwLock::new(IdleMgrState {
                current: IdleState::Active,
                thresholds,
                enabled,
                last_activity: now,
                last_activity_type: "init".to_string(),
                keep_awake_until: None,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            })),
            power_modes: Arc::new(RwLock::new(power_modes)),
            active_mode_id: Arc::new(RwLock::new("balanced".to_string())),
            state_handlers: Arc::new(RwLock::new(HashMap::new())),
            global_handlers: Arc::new(RwLock::new(Vec::new())),
            monitor: Arc::new(Mutex::new(None)),
        }
    }

    // -- activity & keep-awake ------------------------------------------

    /// Records activity, resetting the idle timer. If the reset would
    /// re-enter a lower-level state than the current one, that transition
    /// happens immediately rather than waiting for the next monitor tick
    /// (spec §4.3 "Activity").
    pub async fn record_activity(&self, activity_type: impl Into<String>, source: impl Into<String>) {
        let activity_type = activity_type.into();
        let source = source.into();
        let now = self.clock.now_monotonic();

        let (current, target) = {
            let mut state = self.state.write().await;
            state.last_activity = now;
            state.last_activity_type = activity_type.clone();
            let target = self.target_for_idle(&state, Duration::ZERO, now);
            (state.current, target)
        };

        debug!(activity_type = %activity_type, source = %source, "idle activity recorded");

        if target.level() < current.level() {
            self.perform_transition(target, format!("activity:{activity_type}"), 0)
                .await;
        }
    }

    /// Sets a floor: while `now < keep_awake_until`, the monitor clamps
    /// the computed target to `ACTIVE` (spec §4.3 "Keep-awake").
    pub async fn keep_awake(&self, seconds: u64) {
        let until = self.clock.now_monotonic() + Duration::from_secs(seconds);
        self.state.write().await.keep_awake_until = Some(until);
    }

    pub async fn cancel_keep_awake(&self) {
        self.state.write().await.keep_awake_until = None;
    }

    pub async fn current_state(&self) -> IdleState {
        self.state.read().await.current
    }

    // -- monitor loop -----------------------------------------------------

    /// Starts the background monitor. Idempotent (spec §5 "`start()` is
    /// idempotent").
    pub async fn start(&self) {
        let mut guard = self.monitor.lock().await;
        if guard.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let handle = self.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        handle.evaluate_now().await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });
        *guard = Some(MonitorHandle { shutdown: shutdown_tx, join });
    }

    /// Cancels the monitor and awaits its exit (spec §5 "`stop()` cancels
    /// the monitor and awaits its exit").
    pub async fn stop(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.join.await {
                warn!(error = %e, "idle monitor task panicked during shutdown");
            }
        }
    }

    /// One evaluation of the state machine: recompute the target state
    /// from elapsed idle time and transition if it differs from current.
    /// Exposed so tests can drive the machine deterministically against a
    /// [`crate::clock::ManualClock`] without a real sleep, instead of only
    /// through the background `start()` loop.
    pub async fn evaluate_now(&self) {
        let now = self.clock.now_monotonic();
        let (current, target, idle_secs) = {
            let state = self.state.read().await;
            let idle = now.saturating_duration_since(state.last_activity);
            let target = self.target_for_idle(&state, idle, now);
            (state.current, target, idle.as_secs())
        };
        if target != current {
            self.perform_transition(target, "monitor_tick".to_string(), idle_secs).await;
        }
    }

    fn target_for_idle(&self, state: &IdleMgrState, idle: Duration, now: Instant) -> IdleState {
        if !state.enabled {
            return IdleState::Active;
        }
        if let Some(until) = state.keep_awake_until {
            if now < until {
                return IdleState::Active;
            }
        }
        state.thresholds.target_for(idle.as_secs())
    }

    async fn perform_transition(&self, to: IdleState, trigger: String, seconds_idle: u64) {
        let transition = {
            let mut state = self.state.write().await;
            let from = state.current;
            if from == to {
                return;
            }
            state.current = to;
            let transition = IdleTransition {
                from,
                to,
                trigger,
                timestamp: self.clock.now_utc(),
                seconds_idle,
            };
            if state.history.len() >= HISTORY_CAPACITY {
                state.history.pop_front();
            }
            state.history.push_back(transition.clone());
            transition
        };
        debug!(from = ?transition.from, to = ?transition.to, trigger = %transition.trigger, "idle transition");
        self.invoke_transition(transition).await;
    }

    /// Newest-first transition history, capped at `limit`.
    pub async fn get_transition_history(&self, limit: usize) -> Vec<IdleTransition> {
        let state = self.state.read().await;
        state.history.iter().rev().take(limit).cloned().collect()
    }

    // -- handler registries ------------------------------------------------

    pub async fn register_state_handler(&self, state: IdleState, handler: TransitionHandler) {
        self.state_handlers.write().await.entry(state).or_default().push(handler);
    }

    pub async fn register_global_handler(&self, handler: TransitionHandler) {
        self.global_handlers.write().await.push(handler);
    }

    /// Typed service hook: invoked on entering `COLD`, meant to unload the
    /// LLM (spec §4.3 "Service hooks" example `on_enter_COLD_unload_llm`).
    pub async fn on_enter_cold_unload_llm<F, Fut>(&self, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_state_handler(
            IdleState::Cold,
            Arc::new(move |_transition| {
                let f = Arc::clone(&f);
                Box::pin(async move { f().await }) as BoxFuture<'static, ()>
            }),
        )
        .await;
    }

    /// Typed service hook: invoked on entering `ACTIVE`, meant to pre-warm
    /// TTS (spec §4.3 example `on_enter_ACTIVE_prewarm_tts`). Pre-warm
    /// callbacks are launched fire-and-forget (spec: "must be internally
    /// cancellation-safe").
    pub async fn on_enter_active_prewarm_tts<F, Fut>(&self, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_state_handler(
            IdleState::Active,
            Arc::new(move |_transition| {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    tokio::spawn(async move { f().await });
                }) as BoxFuture<'static, ()>
            }),
        )
        .await;
    }

    /// Spawns every registered handler for `transition`, then logs (but
    /// does not propagate) any panic — a handler failing must not prevent
    /// the others from running (spec §4.3).
    async fn invoke_transition(&self, transition: IdleTransition) {
        let globals = self.global_handlers.read().await.clone();
        let per_state = self
            .state_handlers
            .read()
            .await
            .get(&transition.to)
            .cloned()
            .unwrap_or_default();

        for handler in globals.into_iter().chain(per_state) {
            let t = transition.clone();
            let task = tokio::spawn(async move { handler(t).await });
            let ctx = transition.clone();
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    error!(
                        from = ?ctx.from, to = ?ctx.to, trigger = %ctx.trigger,
                        error = %e, "idle transition handler panicked"
                    );
                }
            });
        }
    }

    // -- power modes --------------------------------------------------------

    /// Swaps thresholds + enabled flag atomically from a registered power
    /// mode (spec §4.3 `set_mode`). A no-op if `id` is already active
    /// (spec §8 idempotence).
    pub async fn set_mode(&self, id: &str) -> Result<(), ControlPlaneError> {
        let mode = self
            .power_modes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::invalid_argument(format!("unknown power mode: {id}")))?;

        let mut active = self.active_mode_id.write().await;
        if *active == id {
            return Ok(());
        }
        *active = id.to_string();
        drop(active);

        let mut state = self.state.write().await;
        state.thresholds = mode.thresholds;
        state.enabled = mode.enabled;
        Ok(())
    }

    pub async fn active_mode(&self) -> String {
        self.active_mode_id.read().await.clone()
    }

    /// Switches to the implicit `custom` mode with `update` merged over
    /// the current thresholds (spec §4.3 `set_thresholds`).
    pub async fn set_thresholds(&self, update: ThresholdUpdate) -> Result<(), ControlPlaneError> {
        let mut state = self.state.write().await;
        let current = state.thresholds;
        let merged = IdleThresholds::new(
            update.warm_secs.unwrap_or(current.warm_secs),
            update.cool_secs.unwrap_or(current.cool_secs),
            update.cold_secs.unwrap_or(current.cold_secs),
            update.dormant_secs.unwrap_or(current.dormant_secs),
        )?;
        state.thresholds = merged;
        state.enabled = true;
        drop(state);
        *self.active_mode_id.write().await = "custom".to_string();
        Ok(())
    }

    pub async fn create_profile(&self, profile: PowerMode) -> Result<(), ControlPlaneError> {
        let mut modes = self.power_modes.write().await;
        if modes.contains_key(&profile.id) {
            return Err(ControlPlaneError::invalid_argument(format!(
                "power mode {} already exists",
                profile.id
            )));
        }
        modes.insert(profile.id.clone(), profile);
        Ok(())
    }

    pub async fn update_profile(&self, id: &str, update: ProfileUpdate) -> Result<PowerMode, ControlPlaneError> {
        let mut modes = self.power_modes.write().await;
        let mode = modes
            .get_mut(id)
            .ok_or_else(|| ControlPlaneError::invalid_argument(format!("unknown power mode: {id}")))?;
        if mode.builtin {
            return Err(ControlPlaneError::precondition_violated(format!(
                "builtin power mode {id} is immutable"
            )));
        }
        if let Some(name) = update.name {
            mode.name = name;
        }
        if let Some(description) = update.description {
            mode.description = description;
        }
        if let Some(enabled) = update.enabled {
            mode.enabled = enabled;
        }
        if let Some(t) = update.thresholds {
            let current = mode.thresholds;
            mode.thresholds = IdleThresholds::new(
                t.warm_secs.unwrap_or(current.warm_secs),
                t.cool_secs.unwrap_or(current.cool_secs),
                t.cold_secs.unwrap_or(current.cold_secs),
                t.dormant_secs.unwrap_or(current.dormant_secs),
            )?;
        }
        Ok(mode.clone())
    }

    /// Deletes a user-defined profile; deleting the active profile
    /// switches to `balanced` (spec §4.3).
    pub async fn delete_profile(&self, id: &str) -> Result<(), ControlPlaneError> {
        {
            let modes = self.power_modes.read().await;
            let mode = modes
                .get(id)
                .ok_or_else(|| ControlPlaneError::invalid_argument(format!("unknown power mode: {id}")))?;
            if mode.builtin {
                return Err(ControlPlaneError::precondition_violated(format!(
                    "builtin power mode {id} cannot be deleted"
                )));
            }
        }
        self.power_modes.write().await.remove(id);
        let is_active = *self.active_mode_id.read().await == id;
        if is_active {
            self.set_mode("balanced").await?;
        }
        Ok(())
    }

    pub async fn duplicate_profile(
        &self,
        id: &str,
        new_id: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Result<PowerMode, ControlPlaneError> {
        let mut modes = self.power_modes.write().await;
        let source = modes
            .get(id)
            .ok_or_else(|| ControlPlaneError::invalid_argument(format!("unknown power mode: {id}")))?
            .clone();
        let new_id = new_id.into();
        if modes.contains_key(&new_id) {
            return Err(ControlPlaneError::invalid_argument(format!(
                "power mode {new_id} already exists"
            )));
        }
        let duplicate = PowerMode {
            id: new_id.clone(),
            name: new_name.into(),
            description: source.description,
            thresholds: source.thresholds,
            enabled: source.enabled,
            builtin: false,
        };
        modes.insert(new_id, duplicate.clone());
        Ok(duplicate)
    }

    pub async fn list_profiles(&self) -> Vec<PowerMode> {
        self.power_modes.read().await.values().cloned().collect()
    }
}

fn builtin_balanced() -> PowerMode {
    PowerMode {
        id: "balanced".to_string(),
        name: "Balanced".to_string(),
        description: "Default thresholds suited to everyday use".to_string(),
        thresholds: IdleThresholds::new(10, 60, 300, 1800).expect("builtin thresholds are monotone"),
        enabled: true,
        builtin: true,
    }
}

/// Builtin modes named in spec §4.3: `performance` (disabled),
/// `balanced`, `power_saver` (tighter thresholds), `development`,
/// `presentation`.
fn builtin_power_modes() -> HashMap<String, PowerMode> {
    let mut modes = HashMap::new();
    modes.insert(
        "performance".to_string(),
        PowerMode {
            id: "performance".to_string(),
            name: "Performance".to_string(),
            description: "Idle tiering disabled; services stay warm".to_string(),
            thresholds: IdleThresholds::new(3600, 7200, 14400, 28800).expect("builtin thresholds are monotone"),
            enabled: false,
            builtin: true,
        },
    );
    let balanced = builtin_balanced();
    modes.insert(balanced.id.clone(), balanced);
    modes.insert(
        "power_saver".to_string(),
        PowerMode {
            id: "power_saver".to_string(),
            name: "Power Saver".to_string(),
            description: "Tighter thresholds, reclaims resources aggressively".to_string(),
            thresholds: IdleThresholds::new(5, 20, 60, 300).expect("builtin thresholds are monotone"),
            enabled: true,
            builtin: true,
        },
    );
    modes.insert(
        "development".to_string(),
        PowerMode {
            id: "development".to_string(),
            name: "Development".to_string(),
            description: "Looser thresholds so local debugging isn't interrupted".to_string(),
            thresholds: IdleThresholds::new(30, 120, 600, 3600).expect("builtin thresholds are monotone"),
            enabled: true,
            builtin: true,
        },
    );
    modes.insert(
        "presentation".to_string(),
        PowerMode {
            id: "presentation".to_string(),
            name: "Presentation".to_string(),
            description: "Idle tiering disabled for the duration of a demo".to_string(),
            thresholds: IdleThresholds::new(3600, 7200, 14400, 28800).expect("builtin thresholds are monotone"),
            enabled: false,
            builtin: true,
        },
    );
    modes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (IdleMgr, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let mgr = IdleMgr::new(clock.clone() as Arc<dyn Clock>);
        (mgr, clock)
    }

    #[tokio::test]
    async fn idle_walk_hits_every_tier_at_expected_offsets() {
        let (mgr, clock) = manager();
        mgr.set_thresholds(ThresholdUpdate {
            warm_secs: Some(10),
            cool_secs: Some(60),
            cold_secs: Some(300),
            dormant_secs: Some(1800),
        })
        .await
        .unwrap();

        clock.set_millis_since_start(10_000);
        mgr.evaluate_now().await;
        assert_eq!(mgr.current_state().await, IdleState::Warm);

        clock.set_millis_since_start(60_000);
        mgr.evaluate_now().await;
        assert_eq!(mgr.current_state().await, IdleState::Cool);

        clock.set_millis_since_start(300_000);
        mgr.evaluate_now().await;
        assert_eq!(mgr.current_state().await, IdleState::Cold);

        clock.set_millis_since_start(1_800_000);
        mgr.evaluate_now().await;
        assert_eq!(mgr.current_state().await, IdleState::Dormant);
    }

    #[tokio::test]
    async fn record_activity_wakes_immediately_without_waiting_for_tick() {
        let (mgr, clock) = manager();
        clock.set_millis_since_start(100_000);
        mgr.evaluate_now().await;
        assert_eq!(mgr.current_state().await, IdleState::Cool);

        mgr.record_activity("user_input", "test").await;
        assert_eq!(mgr.current_state().await, IdleState::Active);
    }

    #[tokio::test]
    async fn keep_awake_clamps_to_active_until_it_expires() {
        let (mgr, clock) = manager();
        mgr.keep_awake(120).await;

        clock.set_millis_since_start(30_000);
        mgr.evaluate_now().await;
        assert_eq!(mgr.current_state().await, IdleState::Active);

        clock.set_millis_since_start(125_000);
        mgr.evaluate_now().await;
        assert_eq!(mgr.current_state().await, IdleState::Warm);
    }

    #[tokio::test]
    async fn set_mode_twice_is_a_no_op_on_the_second_call() {
        let (mgr, _clock) = manager();
        mgr.set_mode("power_saver").await.unwrap();
        let history_len_before = mgr.get_transition_history(100).await.len();
        mgr.set_mode("power_saver").await.unwrap();
        assert_eq!(mgr.get_transition_history(100).await.len(), history_len_before);
        assert_eq!(mgr.active_mode().await, "power_saver");
    }

    #[tokio::test]
    async fn set_thresholds_rejects_non_monotone_merge() {
        let (mgr, _clock) = manager();
        let result = mgr
            .set_thresholds(ThresholdUpdate {
                warm_secs: Some(100),
                cool_secs: Some(50),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn deleting_active_profile_falls_back_to_balanced() {
        let (mgr, _clock) = manager();
        mgr.create_profile(PowerMode {
            id: "custom-1".to_string(),
            name: "Custom".to_string(),
            description: String::new(),
            thresholds: IdleThresholds::new(1, 2, 3, 4).unwrap(),
            enabled: true,
            builtin: false,
        })
        .await
        .unwrap();
        mgr.set_mode("custom-1").await.unwrap();
        mgr.delete_profile("custom-1").await.unwrap();
        assert_eq!(mgr.active_mode().await, "balanced");
    }

    #[tokio::test]
    async fn builtin_profiles_cannot_be_deleted_or_updated() {
        let (mgr, _clock) = manager();
        assert!(mgr.delete_profile("balanced").await.is_err());
        assert!(mgr
            .update_profile("balanced", ProfileUpdate { enabled: Some(false), ..Default::default() })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn handler_panics_do_not_prevent_other_handlers_from_running() {
        let (mgr, clock) = manager();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_ok = Arc::clone(&ran);
        mgr.register_state_handler(
            IdleState::Warm,
            Arc::new(move |_t| {
                let ran_ok = Arc::clone(&ran_ok);
                Box::pin(async move {
                    ran_ok.fetch_add(1, Ordering::SeqCst);
                }) as BoxFuture<'static, ()>
            }),
        )
        .await;
        mgr.register_state_handler(
            IdleState::Warm,
            Arc::new(move |_t| Box::pin(async move { panic!("boom") }) as BoxFuture<'static, ()>),
        )
        .await;

        clock.set_millis_since_start(10_000);
        mgr.evaluate_now().await;
        // Give the spawned handler tasks a chance to run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_awaits_exit() {
        let (mgr, _clock) = manager();
        mgr.start().await;
        mgr.start().await;
        mgr.stop().await;
    }
}
