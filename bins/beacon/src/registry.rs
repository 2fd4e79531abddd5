use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Result;
use beacon_core::cfg::DEFAULT_PORT;
use beacon_core::id::next_id;
use beacon_core::store::{format_ts, restore_tasks, PersistedTask, Snapshot, SnapshotStore};
use beacon_core::task::{NewTask, TaskSpec, TaskStatus, TaskView, ValidationError};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::runner::HttpExecutor;
use crate::scheduler::{spawn_loop, LoopTask};

/// Why an add was refused. Nothing is left behind in either case.
#[derive(Debug, Error)]
pub enum AddError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("persist snapshot: {0:#}")]
    Persist(anyhow::Error),
}

/// In-memory set of tasks and the owner of their execution loops.
///
/// Every mutation holds the write lock across the in-memory change and the
/// snapshot write, so the file always matches some state the registry
/// actually had. That also means a slow disk stalls all management
/// calls (loops keep ticking; they never touch this lock).
pub struct TaskRegistry {
    inner: RwLock<Inner>,
    store: SnapshotStore,
    executor: HttpExecutor,
}

struct Inner {
    tasks: HashMap<String, Entry>,
    port: u16,
}

struct Entry {
    id: String,
    spec: TaskSpec,
    created_at: DateTime<Utc>,
    paused: bool,
    runs: Arc<AtomicU64>,
    // Some(..) exactly when !paused.
    cancel: Option<CancellationToken>,
}

impl Entry {
    fn new(id: String, spec: TaskSpec, created_at: DateTime<Utc>, enabled: bool) -> Self {
        Self {
            id,
            spec,
            created_at,
            paused: !enabled,
            runs: Arc::new(AtomicU64::new(0)),
            cancel: enabled.then(CancellationToken::new),
        }
    }

    fn launch(&self, executor: &HttpExecutor) {
        if let Some(cancel) = &self.cancel {
            let task = LoopTask {
                id: self.id.clone(),
                method: self.spec.method,
                url: self.spec.url.clone(),
                interval: Duration::from_secs(self.spec.interval_seconds),
                runs: self.runs.clone(),
            };
            spawn_loop(task, executor.clone(), cancel.clone());
        }
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.paused = true;
    }

    fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            interval_seconds: self.spec.interval_seconds,
            url: self.spec.url.clone(),
            method: self.spec.method,
            description: self.spec.description.clone(),
            status: if self.paused { TaskStatus::Paused } else { TaskStatus::Running },
            run_count: self.runs.load(Ordering::Relaxed),
        }
    }

    fn persisted(&self, updated_at: &str) -> PersistedTask {
        PersistedTask {
            id: self.id.clone(),
            interval_seconds: self.spec.interval_seconds as i64,
            url: self.spec.url.clone(),
            method: self.spec.method.to_string(),
            description: self.spec.description.clone(),
            enabled: !self.paused,
            created_at: format_ts(self.created_at),
            updated_at: updated_at.to_string(),
        }
    }
}

impl TaskRegistry {
    /// Empty registry writing to `store`. Call [`TaskRegistry::restore`] to load it.
    ///
    /// Loops are spawned with `tokio::spawn`, so mutating calls must run
    /// inside a Tokio runtime.
    pub fn new(store: SnapshotStore, executor: HttpExecutor) -> Self {
        Self {
            inner: RwLock::new(Inner { tasks: HashMap::new(), port: DEFAULT_PORT }),
            store,
            executor,
        }
    }

    /// Port taken from the snapshot at restore time.
    pub fn port(&self) -> u16 {
        self.read().port
    }

    /// Load the snapshot (creating a default one if missing) and start a loop
    /// for every enabled task. Entries that fail validation are skipped; a
    /// malformed file is an error and leaves the registry untouched.
    pub fn restore(&self) -> Result<usize> {
        let snap = self.store.read()?;
        let mut inner = self.write();
        inner.port = snap.effective_port();
        info!("using port: {}", inner.port);

        let mut restored = 0;
        for rt in restore_tasks(&snap) {
            if inner.tasks.contains_key(&rt.id) {
                warn!("[restore] skip {}: already registered", rt.id);
                continue;
            }
            let created_at = rt.created_at.unwrap_or_else(Utc::now);
            let entry = Entry::new(rt.id, rt.spec, created_at, rt.enabled);
            let state = if entry.paused { "PAUSED " } else { "RUNNING" };
            info!(
                "[restore] {} id={} {} {} every {}s",
                state, entry.id, entry.spec.method, entry.spec.url, entry.spec.interval_seconds
            );
            entry.launch(&self.executor);
            inner.tasks.insert(entry.id.clone(), entry);
            restored += 1;
        }
        info!("[restore] done: restored={}, file={}", restored, self.store.path().display());
        Ok(restored)
    }

    /// Validate, register and start a task. All-or-nothing: if the snapshot
    /// cannot be written the task is dropped again and no loop ever starts.
    pub fn add(&self, req: &NewTask) -> Result<String, AddError> {
        let spec = req.validate()?;
        let id = next_id();

        let mut inner = self.write();
        inner.tasks.insert(id.clone(), Entry::new(id.clone(), spec, Utc::now(), true));

        if let Err(e) = self.persist_locked(&inner) {
            inner.tasks.remove(&id);
            warn!("task add rolled back id={} err={:#}", id, e);
            return Err(AddError::Persist(e));
        }

        if let Some(entry) = inner.tasks.get(&id) {
            entry.launch(&self.executor);
            info!(
                "task added id={} {} {} every {}s",
                id, entry.spec.method, entry.spec.url, entry.spec.interval_seconds
            );
        }
        Ok(id)
    }

    /// Stop and forget a task. Returns `false` if the id is unknown.
    ///
    /// A failed snapshot write is only logged: the removal stands and the
    /// file catches up on the next successful write.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.write();
        let Some(mut entry) = inner.tasks.remove(id) else {
            return false;
        };
        entry.stop();
        if let Err(e) = self.persist_locked(&inner) {
            warn!("task remove id={} not persisted: {:#}", id, e);
        }
        info!("task removed id={}", id);
        true
    }

    /// Stop a task's loop for good. Idempotent; `false` only for unknown ids.
    ///
    /// Like [`TaskRegistry::remove`], a failed snapshot write is logged and
    /// not rolled back.
    pub fn pause(&self, id: &str) -> bool {
        let mut inner = self.write();
        let Some(entry) = inner.tasks.get_mut(id) else {
            return false;
        };
        if entry.paused {
            return true;
        }
        entry.stop();
        if let Err(e) = self.persist_locked(&inner) {
            warn!("task pause id={} not persisted: {:#}", id, e);
        }
        info!("task paused id={}", id);
        true
    }

    /// All tasks, sorted by id.
    pub fn list(&self) -> Vec<TaskView> {
        let inner = self.read();
        let mut out: Vec<TaskView> = inner.tasks.values().map(Entry::view).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// One task by id.
    pub fn get(&self, id: &str) -> Option<TaskView> {
        self.read().tasks.get(id).map(Entry::view)
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        let now = format_ts(Utc::now());
        let tasks = inner.tasks.values().map(|e| e.persisted(&now)).collect();
        self.store.write(&Snapshot::from_tasks(inner.port, tasks))
    }

    // A panic while holding the lock can't leave the map half-updated in a
    // way later calls care about, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
