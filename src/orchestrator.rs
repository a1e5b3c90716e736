//! Orchestrator for background mutation tasks
//!
//! Each task is keyed by the resource it mutates. At most one task per key
//! is live: a second submission is rejected, or queued behind the first
//! under [`DuplicatePolicy::Queue`]. Work runs on the blocking pool and
//! reports progress through [`TaskContext`]. Cancellation is cooperative:
//! a cancelled task stops at its next checkpoint, and engine calls already
//! issued are not undone.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::engine::ProgressObserver;
use crate::models::{estimate_eta, TaskError, TaskInfo, TaskState};
use crate::{Error, Result};

/// What to do when a key already has a live task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    #[default]
    Reject,
    Queue,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reject" => Ok(DuplicatePolicy::Reject),
            "queue" => Ok(DuplicatePolicy::Queue),
            other => Err(Error::Config(format!("unknown duplicate policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub duplicate_policy: DuplicatePolicy,
    /// How long finished tasks stay queryable
    pub task_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Reject,
            task_retention: Duration::from_secs(600),
        }
    }
}

/// Description of a task to submit
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub resource_key: String,
    pub metadata: serde_json::Value,
    /// How long a caller should wait for completion before answering
    pub wait_for: Duration,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, resource_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_key: resource_key.into(),
            metadata: serde_json::Value::Null,
            wait_for: Duration::ZERO,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_wait_for(mut self, wait_for: Duration) -> Self {
        self.wait_for = wait_for;
        self
    }
}

struct TaskEntry {
    info: TaskInfo,
    cancel: Arc<AtomicBool>,
    updates: watch::Sender<TaskInfo>,
}

impl TaskEntry {
    fn publish(&self) {
        self.updates.send_replace(self.info.clone());
    }
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, TaskEntry>,
    /// Live task ids per resource key, oldest first
    live: HashMap<String, VecDeque<String>>,
}

impl Registry {
    fn update(&mut self, id: &str, f: impl FnOnce(&mut TaskInfo)) {
        if let Some(entry) = self.tasks.get_mut(id) {
            f(&mut entry.info);
            entry.publish();
        }
    }

    fn is_first(&self, key: &str, id: &str) -> bool {
        self.live
            .get(key)
            .and_then(|ids| ids.front())
            .is_some_and(|first| first == id)
    }

    fn release_key(&mut self, key: &str, id: &str) {
        if let Some(ids) = self.live.get_mut(key) {
            ids.retain(|live| live != id);
            if ids.is_empty() {
                self.live.remove(key);
            }
        }
    }
}

/// Wakes queued workers when a resource key changes hands
#[derive(Default)]
struct Turns {
    lock: Mutex<()>,
    changed: Condvar,
}

impl Turns {
    fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while !ready() {
            self.changed.wait(&mut guard);
        }
    }

    fn notify(&self) {
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }
}

/// Registry and launcher of background tasks
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<RwLock<Registry>>,
    turns: Arc<Turns>,
    config: OrchestratorConfig,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Create an orchestrator with default settings
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            turns: Arc::new(Turns::default()),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register a task and run `op` on a blocking worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<T, F>(&self, spec: TaskSpec, op: F) -> Result<TaskHandle>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        self.prune();

        let info = TaskInfo::new(spec.name, spec.resource_key, spec.metadata);
        let id = info.id.clone();
        let key = info.resource_key.clone();
        let (updates, rx) = watch::channel(info.clone());
        let cancel = Arc::new(AtomicBool::new(false));

        {
            let mut registry = self.registry.write();
            let live = registry.live.entry(key.clone()).or_default();
            if let Some(running) = live.front() {
                if self.config.duplicate_policy == DuplicatePolicy::Reject {
                    return Err(Error::DuplicateInFlight {
                        resource_key: key,
                        task_id: running.clone(),
                    });
                }
            }
            live.push_back(id.clone());
            registry.tasks.insert(
                id.clone(),
                TaskEntry {
                    info: info.clone(),
                    cancel: cancel.clone(),
                    updates,
                },
            );
        }

        tracing::info!(task = %id, name = %info.name, resource = %key, "task submitted");

        let ctx = TaskContext {
            id: id.clone(),
            cancel,
            registry: self.registry.clone(),
        };
        let turns = self.turns.clone();
        tokio::task::spawn_blocking(move || {
            turns.wait_until(|| ctx.is_cancelled() || ctx.registry.read().is_first(&key, &ctx.id));
            run_task(&ctx, &key, op);
            turns.notify();
        });

        Ok(TaskHandle {
            id,
            wait_for: spec.wait_for,
            rx,
        })
    }

    /// Task by id, with a fresh ETA
    pub fn get(&self, id: &str) -> Result<TaskInfo> {
        self.registry
            .read()
            .tasks
            .get(id)
            .map(|entry| snapshot(&entry.info))
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Tasks whose name matches `filter`; a trailing `*` matches a prefix
    pub fn list(&self, filter: Option<&str>) -> Vec<TaskInfo> {
        self.prune();
        let registry = self.registry.read();
        let mut tasks: Vec<TaskInfo> = registry
            .tasks
            .values()
            .filter(|entry| filter.map_or(true, |f| name_matches(f, &entry.info.name)))
            .map(|entry| snapshot(&entry.info))
            .collect();
        tasks.sort_by_key(|t| t.begin_time);
        tasks
    }

    /// Ask a task to stop; finished tasks are left as they are
    pub fn cancel(&self, id: &str) -> Result<TaskInfo> {
        let info = {
            let registry = self.registry.read();
            let entry = registry
                .tasks
                .get(id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            if !entry.info.is_finished() {
                entry.cancel.store(true, Ordering::SeqCst);
                tracing::info!(task = %id, "task cancellation requested");
            }
            snapshot(&entry.info)
        };
        self.turns.notify();
        Ok(info)
    }

    /// Evict finished tasks older than the retention period
    pub fn prune(&self) {
        let now = Utc::now();
        let retention = self.config.task_retention;
        let mut registry = self.registry.write();
        let before = registry.tasks.len();
        registry.tasks.retain(|_, entry| match entry.info.end_time {
            Some(end) if entry.info.is_finished() => (now - end)
                .to_std()
                .map(|age| age < retention)
                .unwrap_or(true),
            _ => true,
        });
        let evicted = before - registry.tasks.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted finished tasks");
        }
    }
}

fn name_matches(filter: &str, name: &str) -> bool {
    match filter.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => filter == name,
    }
}

fn snapshot(info: &TaskInfo) -> TaskInfo {
    let mut info = info.clone();
    if info.state == TaskState::Running {
        if let Some(start) = info.start_time {
            let elapsed = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
            info.eta_secs = estimate_eta(elapsed, info.progress);
        }
    }
    info
}

fn run_task<T, F>(ctx: &TaskContext, key: &str, op: F)
where
    T: Serialize,
    F: FnOnce(&TaskContext) -> Result<T>,
{
    if ctx.is_cancelled() {
        tracing::info!(task = %ctx.id, "task cancelled before it started");
        finish(ctx, key, TaskState::Cancelled, None, Some(TaskError::cancelled(key)));
        return;
    }
    ctx.registry.write().update(&ctx.id, |info| {
        info.state = TaskState::Running;
        info.start_time = Some(Utc::now());
    });
    tracing::info!(task = %ctx.id, resource = %key, "task started");

    match std::panic::catch_unwind(AssertUnwindSafe(|| op(ctx))) {
        Ok(Ok(value)) => {
            let result = serde_json::to_value(value).ok();
            tracing::info!(task = %ctx.id, "task succeeded");
            finish(ctx, key, TaskState::Success, result, None);
        }
        Ok(Err(e)) => {
            let error = TaskError::from_error(&e, key);
            if error.kind == crate::ErrorKind::Cancelled {
                tracing::info!(task = %ctx.id, "task cancelled");
                finish(ctx, key, TaskState::Cancelled, None, Some(error));
            } else {
                tracing::warn!(task = %ctx.id, error = %e, "task failed");
                finish(ctx, key, TaskState::Failed, None, Some(error));
            }
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            tracing::error!(task = %ctx.id, panic = %message, "task panicked");
            finish(ctx, key, TaskState::Failed, None, Some(TaskError::panicked(message, key)));
        }
    }
}

/// Record the outcome; the key is free before any waiter sees it
fn finish(
    ctx: &TaskContext,
    key: &str,
    state: TaskState,
    result: Option<serde_json::Value>,
    error: Option<TaskError>,
) {
    let mut registry = ctx.registry.write();
    registry.release_key(key, &ctx.id);
    registry.update(&ctx.id, |info| {
        info.state = state;
        info.end_time = Some(Utc::now());
        info.eta_secs = None;
        if state == TaskState::Success {
            info.progress = 100;
        }
        info.result = result;
        info.error = error;
    });
}

/// Handed to a running task for progress and cancellation
pub struct TaskContext {
    id: String,
    cancel: Arc<AtomicBool>,
    registry: Arc<RwLock<Registry>>,
}

impl TaskContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` when cancellation was requested
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub fn set_progress(&self, percent: u8) {
        let percent = percent.min(100);
        self.registry.write().update(&self.id, |info| {
            if !info.state.is_finished() {
                info.progress = percent;
            }
        });
    }

    /// Observer that maps engine progress onto `start..=end` percent
    pub fn range(&self, start: u8, end: u8) -> ProgressRange<'_> {
        ProgressRange {
            ctx: self,
            start: start.min(100),
            end: end.clamp(start.min(100), 100),
        }
    }
}

impl ProgressObserver for TaskContext {
    fn update(&self, done: u64, total: u64) -> bool {
        self.range(0, 100).update(done, total)
    }
}

/// Slice of a task's progress bar
pub struct ProgressRange<'a> {
    ctx: &'a TaskContext,
    start: u8,
    end: u8,
}

impl ProgressObserver for ProgressRange<'_> {
    fn update(&self, done: u64, total: u64) -> bool {
        if total > 0 {
            let span = u64::from(self.end - self.start);
            let step = span * done.min(total) / total;
            self.ctx.set_progress(self.start + step as u8);
        }
        !self.ctx.is_cancelled()
    }
}

/// Caller side of a submitted task
pub struct TaskHandle {
    id: String,
    wait_for: Duration,
    rx: watch::Receiver<TaskInfo>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> TaskInfo {
        self.rx.borrow().clone()
    }

    /// Wait until the task finishes
    pub async fn wait(&mut self) -> TaskInfo {
        loop {
            {
                let info = self.rx.borrow_and_update();
                if info.is_finished() {
                    return info.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return self.info();
            }
        }
    }

    /// Wait at most `timeout`, then return whatever state the task is in
    pub async fn wait_timeout(&mut self, timeout: Duration) -> TaskInfo {
        if timeout.is_zero() {
            return self.info();
        }
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(info) => info,
            Err(_) => self.info(),
        }
    }

    /// Wait as long as the task asked callers to
    pub async fn settle(&mut self) -> TaskInfo {
        self.wait_timeout(self.wait_for).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{errno, EngineError};
    use crate::ErrorKind;
    use std::sync::mpsc;

    fn spec(key: &str) -> TaskSpec {
        TaskSpec::new("rbd/test", key)
    }

    #[tokio::test]
    async fn test_submit_runs_to_success() {
        let orch = Orchestrator::new();
        let mut handle = orch.submit(spec("rbd/img"), |_| Ok(42)).unwrap();
        let info = handle.wait().await;
        assert_eq!(info.state, TaskState::Success);
        assert_eq!(info.progress, 100);
        assert_eq!(info.result, Some(serde_json::json!(42)));
        assert!(info.end_time.is_some());
        assert_eq!(orch.get(handle.id()).unwrap().state, TaskState::Success);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_while_live() {
        let orch = Orchestrator::new();
        let (release, blocked) = mpsc::channel::<()>();
        let mut first = orch
            .submit(spec("rbd/img"), move |_| {
                blocked.recv().ok();
                Ok(())
            })
            .unwrap();

        let err = orch.submit(spec("rbd/img"), |_| Ok(())).err().unwrap();
        match err {
            Error::DuplicateInFlight { resource_key, task_id } => {
                assert_eq!(resource_key, "rbd/img");
                assert_eq!(task_id, first.id());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(orch.submit(spec("rbd/other"), |_| Ok(())).is_ok());

        release.send(()).unwrap();
        assert_eq!(first.wait().await.state, TaskState::Success);
        let mut again = orch.submit(spec("rbd/img"), |_| Ok(())).unwrap();
        assert_eq!(again.wait().await.state, TaskState::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resubmit_after_wait_is_not_duplicate() {
        let orch = Orchestrator::new();
        for _ in 0..200 {
            let mut handle = orch.submit(spec("rbd/img"), |_| Ok(())).unwrap();
            assert_eq!(handle.wait().await.state, TaskState::Success);
            let mut again = orch.submit(spec("rbd/img"), |_| Ok(())).unwrap();
            assert_eq!(again.wait().await.state, TaskState::Success);
        }
    }

    #[tokio::test]
    async fn test_queue_policy_runs_one_at_a_time() {
        let orch = Orchestrator::with_config(OrchestratorConfig {
            duplicate_policy: DuplicatePolicy::Queue,
            ..Default::default()
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, blocked) = mpsc::channel::<()>();

        let log = order.clone();
        let mut first = orch
            .submit(spec("rbd/img"), move |_| {
                blocked.recv().ok();
                log.lock().push("first");
                Ok(())
            })
            .unwrap();
        let log = order.clone();
        let mut second = orch
            .submit(spec("rbd/img"), move |_| {
                log.lock().push("second");
                Ok(())
            })
            .unwrap();

        assert_eq!(second.info().state, TaskState::Pending);
        release.send(()).unwrap();
        first.wait().await;
        assert_eq!(second.wait().await.state, TaskState::Success);
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_at_checkpoint() {
        let orch = Orchestrator::new();
        let mut handle = orch
            .submit(spec("rbd/img"), |ctx| -> Result<()> {
                loop {
                    ctx.checkpoint()?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();
        orch.cancel(handle.id()).unwrap();
        let info = handle.wait().await;
        assert_eq!(info.state, TaskState::Cancelled);
        assert_eq!(info.error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_engine_errors_are_normalized() {
        let orch = Orchestrator::new();
        let mut handle = orch
            .submit(spec("rbd/img"), |_| -> Result<()> {
                Err(EngineError::new(errno::EDOM, "order out of range").into())
            })
            .unwrap();
        let info = handle.wait().await;
        assert_eq!(info.state, TaskState::Failed);
        let error = info.error.unwrap();
        assert_eq!(error.kind, ErrorKind::RemoteEngineError);
        assert_eq!(error.code, "EDOM");
        assert_eq!(error.resource_key, "rbd/img");
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failure() {
        let orch = Orchestrator::new();
        let mut handle = orch
            .submit(spec("rbd/img"), |_| -> Result<()> { panic!("engine exploded") })
            .unwrap();
        let info = handle.wait().await;
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(info.error.unwrap().message, "engine exploded");
        assert!(orch.submit(spec("rbd/img"), |_| Ok(())).is_ok());
    }

    #[tokio::test]
    async fn test_progress_range_and_eta() {
        let orch = Orchestrator::new();
        let (release, blocked) = mpsc::channel::<()>();
        let (reported, progressed) = mpsc::channel::<()>();
        let handle = orch
            .submit(spec("rbd/img"), move |ctx| {
                assert!(ctx.range(50, 100).update(1, 2));
                reported.send(()).ok();
                blocked.recv().ok();
                Ok(())
            })
            .unwrap();
        tokio::task::spawn_blocking(move || progressed.recv())
            .await
            .unwrap()
            .unwrap();
        let info = orch.get(handle.id()).unwrap();
        assert_eq!(info.state, TaskState::Running);
        assert_eq!(info.progress, 75);
        assert!(info.eta_secs.is_some());
        release.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_finished_tasks_are_evicted_after_retention() {
        let orch = Orchestrator::with_config(OrchestratorConfig {
            task_retention: Duration::ZERO,
            ..Default::default()
        });
        let mut handle = orch.submit(spec("rbd/img"), |_| Ok(())).unwrap();
        handle.wait().await;
        std::thread::sleep(Duration::from_millis(5));
        orch.prune();
        assert!(matches!(orch.get(handle.id()), Err(Error::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_by_name() {
        let orch = Orchestrator::new();
        let mut a = orch.submit(TaskSpec::new("rbd/create", "rbd/a"), |_| Ok(())).unwrap();
        let mut b = orch.submit(TaskSpec::new("rbd/trash/purge", "*"), |_| Ok(())).unwrap();
        a.wait().await;
        b.wait().await;
        assert_eq!(orch.list(None).len(), 2);
        assert_eq!(orch.list(Some("rbd/create")).len(), 1);
        assert_eq!(orch.list(Some("rbd/trash/*")).len(), 1);
        assert_eq!(orch.list(Some("rbd/*")).len(), 2);
        assert!(orch.list(Some("rbd/edit")).is_empty());
    }

    #[tokio::test]
    async fn test_wait_timeout_returns_running_task() {
        let orch = Orchestrator::new();
        let (release, blocked) = mpsc::channel::<()>();
        let mut handle = orch
            .submit(spec("rbd/img").with_wait_for(Duration::from_millis(20)), move |_| {
                blocked.recv().ok();
                Ok(())
            })
            .unwrap();
        let info = handle.settle().await;
        assert!(!info.is_finished());
        release.send(()).unwrap();
        assert_eq!(handle.wait().await.state, TaskState::Success);
    }
}
