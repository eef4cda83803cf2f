//! Storage interface (spec §4.5): put/get/list/delete over typed records —
//! suites, runs, results, baselines. Generalizes the teacher's `Queue<T>`
//! trait shape (`queue::Queue`) from a single untyped FIFO into the set of
//! typed operations the spec names.
//!
//! Two implementations ship: [`MemoryStorage`], the in-process reference
//! used by tests and the `--mock` CLI path, and [`FileStorage`], a
//! tree-of-files backend using write-to-temp-then-rename for atomicity
//! (spec §6 "Persisted layout"). A relational backend stays interface-only
//! per spec §4.5 and §1 Non-goals.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ControlPlaneError;
use crate::protocol::{PerformanceBaseline, RunId, SuiteId, TestResult, TestRun, TestSuiteDefinition};

/// A filter over `list_runs` (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub suite_id: Option<SuiteId>,
    pub status: Option<crate::protocol::RunStatus>,
}

impl RunFilter {
    fn matches(&self, run: &TestRun) -> bool {
        let suite_matches = match &self.suite_id {
            Some(id) => id == &run.suite_id,
            None => true,
        };
        let status_matches = match self.status {
            Some(status) => status == run.status,
            None => true,
        };
        suite_matches && status_matches
    }
}

/// Typed record storage backend. `Send + Sync` so it can be shared behind
/// an `Arc` across LTO's background tasks, same role the teacher's
/// `Queue<T>` plays for worker tasks.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_suite(&self, suite: TestSuiteDefinition) -> Result<(), ControlPlaneError>;
    async fn get_suite(&self, id: &str) -> Result<Option<TestSuiteDefinition>, ControlPlaneError>;
    async fn list_suites(&self) -> Result<Vec<TestSuiteDefinition>, ControlPlaneError>;

    async fn put_run(&self, run: TestRun) -> Result<(), ControlPlaneError>;
    async fn update_run(&self, run: TestRun) -> Result<(), ControlPlaneError>;
    async fn get_run(&self, id: RunId) -> Result<Option<TestRun>, ControlPlaneError>;
    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<TestRun>, ControlPlaneError>;
    async fn append_result(&self, run_id: RunId, result: TestResult) -> Result<(), ControlPlaneError>;

    async fn put_baseline(&self, baseline: PerformanceBaseline) -> Result<(), ControlPlaneError>;
    async fn get_baseline(&self, id: &str) -> Result<Option<PerformanceBaseline>, ControlPlaneError>;
    async fn list_baselines(&self) -> Result<Vec<PerformanceBaseline>, ControlPlaneError>;
}

/// Which backend to construct; mirrors `original_source/`'s
/// `create_latency_storage` factory function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    File,
}

/// Constructs a boxed [`Storage`] for `kind`, rooted at `data_dir` when
/// `kind == StorageKind::File`.
pub fn from_kind(kind: StorageKind, data_dir: &Path) -> Result<Arc<dyn Storage>, ControlPlaneError> {
    match kind {
        StorageKind::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageKind::File => Ok(Arc::new(FileStorage::new(data_dir)?)),
    }
}

/// In-process reference implementation, the role `SledQueue::new_temp()`
/// plays for the teacher's tests.
#[derive(Default)]
pub struct MemoryStorage {
    suites: RwLock<HashMap<SuiteId, TestSuiteDefinition>>,
    runs: RwLock<HashMap<RunId, TestRun>>,
    baselines: RwLock<HashMap<String, PerformanceBaseline>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_suite(&self, suite: TestSuiteDefinition) -> Result<(), ControlPlaneError> {
        let mut suites = self.suites.write().await;
        if let Some(existing) = suites.get(&suite.id) {
            if existing.scenarios.len() != suite.scenarios.len()
                || existing.total_test_count != suite.total_test_count
            {
                return Err(ControlPlaneError::invalid_argument(format!(
                    "suite {} already registered with a different definition",
                    suite.id
                )));
            }
            return Ok(());
        }
        suites.insert(suite.id.clone(), suite);
        Ok(())
    }

    async fn get_suite(&self, id: &str) -> Result<Option<TestSuiteDefinition>, ControlPlaneError> {
        Ok(self.suites.read().await.get(id).cloned())
    }

    async fn list_suites(&self) -> Result<Vec<TestSuiteDefinition>, ControlPlaneError> {
        Ok(self.suites.read().await.values().cloned().collect())
    }

    async fn put_run(&self, run: TestRun) -> Result<(), ControlPlaneError> {
        self.runs.write().await.insert(run.id, run);
        Ok(())
    }

    async fn update_run(&self, run: TestRun) -> Result<(), ControlPlaneError> {
        self.runs.write().await.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<TestRun>, ControlPlaneError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<TestRun>, ControlPlaneError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect())
    }

    async fn append_result(&self, run_id: RunId, result: TestResult) -> Result<(), ControlPlaneError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| ControlPlaneError::internal(format!("append_result: run {run_id} not found")))?;
        run.push_result(result);
        Ok(())
    }

    async fn put_baseline(&self, baseline: PerformanceBaseline) -> Result<(), ControlPlaneError> {
        self.baselines.write().await.insert(baseline.id.clone(), baseline);
        Ok(())
    }

    async fn get_baseline(&self, id: &str) -> Result<Option<PerformanceBaseline>, ControlPlaneError> {
        Ok(self.baselines.read().await.get(id).cloned())
    }

    async fn list_baselines(&self) -> Result<Vec<PerformanceBaseline>, ControlPlaneError> {
        Ok(self.baselines.read().await.values().cloned().collect())
    }
}

/// Tree-of-files backend: `root/{suites,runs,baselines}/<id>.json`, one
/// file per record, written via write-to-temp + rename. Grounded on the
/// teacher's `SledQueue::new`/`sled::open` real-backend construction,
/// generalized from a KV tree to one file per entity.
pub struct FileStorage {
    root: PathBuf,
    // Runs are mutated frequently (append_result); guard the read-modify-
    // write cycle the same way MemoryStorage guards its map.
    run_lock: tokio::sync::Mutex<()>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ControlPlaneError> {
        let root = root.into();
        for sub in ["suites", "runs", "baselines"] {
            std::fs::create_dir_all(root.join(sub)).map_err(|e| {
                ControlPlaneError::storage_unavailable(format!("creating {sub} dir: {e}"))
            })?;
        }
        Ok(Self {
            root,
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path_for(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{id}.json"))
    }

    async fn write_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), ControlPlaneError> {
        let serialized = serde_json::to_vec_pretty(value)
            .map_err(|e| ControlPlaneError::internal(format!("serializing record: {e}")))?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &serialized)
            .await
            .map_err(|e| ControlPlaneError::storage_unavailable(format!("writing {}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| ControlPlaneError::storage_unavailable(format!("renaming into {}: {e}", path.display())))?;
        Ok(())
    }

    async fn read_one<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ControlPlaneError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| ControlPlaneError::internal(format!("deserializing {}: {e}", path.display())))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ControlPlaneError::storage_unavailable(format!(
                "reading {}: {e}",
                path.display()
            ))),
        }
    }

    async fn list_dir<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, ControlPlaneError> {
        let dir = self.root.join(kind);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ControlPlaneError::storage_unavailable(format!("reading {}: {e}", dir.display())))?;
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ControlPlaneError::storage_unavailable(format!("iterating {}: {e}", dir.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_one(&path).await {
                Ok(Some(value)) => out.push(value),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn put_suite(&self, suite: TestSuiteDefinition) -> Result<(), ControlPlaneError> {
        let path = self.path_for("suites", &suite.id);
        if let Some(existing) = Self::read_one::<TestSuiteDefinition>(&path).await? {
            if existing.scenarios.len() != suite.scenarios.len()
                || existing.total_test_count != suite.total_test_count
            {
                return Err(ControlPlaneError::invalid_argument(format!(
                    "suite {} already registered with a different definition",
                    suite.id
                )));
            }
            return Ok(());
        }
        debug!(suite_id = %suite.id, "persisting suite");
        Self::write_atomic(&path, &suite).await
    }

    async fn get_suite(&self, id: &str) -> Result<Option<TestSuiteDefinition>, ControlPlaneError> {
        Self::read_one(&self.path_for("suites", id)).await
    }

    async fn list_suites(&self) -> Result<Vec<TestSuiteDefinition>, ControlPlaneError> {
        self.list_dir("suites").await
    }

    async fn put_run(&self, run: TestRun) -> Result<(), ControlPlaneError> {
        let _guard = self.run_lock.lock().await;
        let path = self.path_for("runs", &run.id.to_string());
        Self::write_atomic(&path, &run).await
    }

    async fn update_run(&self, run: TestRun) -> Result<(), ControlPlaneError> {
        let _guard = self.run_lock.lock().await;
        let path = self.path_for("runs", &run.id.to_string());
        Self::write_atomic(&path, &run).await
    }

    async fn get_run(&self, id: RunId) -> Result<Option<TestRun>, ControlPlaneError> {
        Self::read_one(&self.path_for("runs", &id.to_string())).await
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<TestRun>, ControlPlaneError> {
        let runs: Vec<TestRun> = self.list_dir("runs").await?;
        Ok(runs.into_iter().filter(|run| filter.matches(run)).collect())
    }

    async fn append_result(&self, run_id: RunId, result: TestResult) -> Result<(), ControlPlaneError> {
        let _guard = self.run_lock.lock().await;
        let path = self.path_for("runs", &run_id.to_string());
        let mut run = Self::read_one::<TestRun>(&path)
            .await?
            .ok_or_else(|| ControlPlaneError::internal(format!("append_result: run {run_id} not found")))?;
        run.push_result(result);
        Self::write_atomic(&path, &run).await
    }

    async fn put_baseline(&self, baseline: PerformanceBaseline) -> Result<(), ControlPlaneError> {
        let path = self.path_for("baselines", &baseline.id);
        Self::write_atomic(&path, &baseline).await
    }

    async fn get_baseline(&self, id: &str) -> Result<Option<PerformanceBaseline>, ControlPlaneError> {
        Self::read_one(&self.path_for("baselines", id)).await
    }

    async fn list_baselines(&self) -> Result<Vec<PerformanceBaseline>, ControlPlaneError> {
        self.list_dir("baselines").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TestSuiteDefinition;

    #[tokio::test]
    async fn memory_storage_get_put_round_trip() {
        let storage = MemoryStorage::new();
        let suite = TestSuiteDefinition::quick_validation().unwrap();
        storage.put_suite(suite.clone()).await.unwrap();
        let fetched = storage.get_suite(&suite.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, suite.id);
        assert_eq!(fetched.total_test_count, suite.total_test_count);
    }

    #[tokio::test]
    async fn memory_storage_put_suite_is_idempotent_for_identical_definition() {
        let storage = MemoryStorage::new();
        let suite = TestSuiteDefinition::quick_validation().unwrap();
        storage.put_suite(suite.clone()).await.unwrap();
        storage.put_suite(suite.clone()).await.unwrap();
        assert_eq!(storage.list_suites().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_storage_append_result_increments_completed() {
        let storage = MemoryStorage::new();
        let run = TestRun::new("quick_validation", 1);
        let run_id = run.id;
        storage.put_run(run).await.unwrap();

        let now = chrono::Utc::now();
        let stages = crate::protocol::StageLatencies {
            capture_to_stt_ms: 10.0,
            stt_to_llm_ms: 10.0,
            llm_to_tts_ms: 10.0,
            tts_to_playback_ms: 10.0,
        };
        let result = TestResult::success(run_id, uuid::Uuid::new_v4(), "client-1", 0, stages, now, now);
        storage.append_result(run_id, result).await.unwrap();

        let run = storage.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.completed, 1);
        assert_eq!(run.results.len(), 1);
    }

    #[tokio::test]
    async fn file_storage_round_trips_suite_via_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let suite = TestSuiteDefinition::quick_validation().unwrap();
        storage.put_suite(suite.clone()).await.unwrap();

        let fetched = storage.get_suite(&suite.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, suite.id);
        assert!(dir.path().join("suites").join(format!("{}.json", suite.id)).exists());
        assert!(!dir.path().join("suites").join(format!("{}.json.tmp", suite.id)).exists());
    }

    #[tokio::test]
    async fn file_storage_list_runs_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let mut running = TestRun::new("quick_validation", 1);
        running.transition(crate::protocol::RunStatus::Running).unwrap();
        storage.put_run(running.clone()).await.unwrap();

        let pending = TestRun::new("quick_validation", 1);
        storage.put_run(pending).await.unwrap();

        let filter = RunFilter {
            suite_id: None,
            status: Some(crate::protocol::RunStatus::Running),
        };
        let results = storage.list_runs(filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, running.id);
    }
}
