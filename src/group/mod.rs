//! Bounded-concurrency task group.
//!
//! Split into focused submodules:
//! - [`lifecycle`] - Admission, promotion, run completion and shutdown
//! - [`control`] - Pause, resume, cancel and remove
//! - [`events`] - [`TaskEvent`] and [`TaskListener`], delivered through a [`CommandQueue`]
//!
//! All membership state lives behind one mutex. Promotion and the end-of-run step both take
//! it, so the running count can never overshoot the ceiling while an add races a completion.
//! Events are handed to the group's command queue while that mutex is held; the queue's own
//! lock is a leaf that never calls back into the group, and holding ours is what keeps a
//! task's events in the order its transitions happened. The one exception is a queued or
//! paused task being cancelled: it leaves the group under the lock, and its last two events
//! follow once its partial file has been deleted on the blocking pool.

mod control;
mod events;
mod lifecycle;


use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::command_queue::CommandQueue;
use crate::error::{Error, Result};
use crate::task::{DownloadTask, RunSettings, Transport};
use crate::types::{GroupStats, TaskId, TaskState};

pub use events::{TaskEvent, TaskListener};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Runs at most `max_running` tasks at once, promoting the backlog in FIFO order
///
/// Cloning is cheap; clones share the same group.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    id: u64,
    max_running: usize,
    settings: RunSettings,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    events: CommandQueue,
    listeners: Arc<RwLock<Vec<Arc<dyn TaskListener>>>>,
    state: Mutex<GroupState>,
    stats_tx: watch::Sender<GroupStats>,
    /// Idle tasks cancelled whose files are still being deleted
    retiring: watch::Sender<usize>,
}

/// Membership, guarded by `GroupInner::state`
#[derive(Default)]
struct GroupState {
    /// Every live task in admission order; paused tasks keep their slot in this list
    entries: Vec<Arc<DownloadTask>>,
    running: HashSet<TaskId>,
    completed: u64,
    shutting_down: bool,
}

impl GroupState {
    fn position(&self, task: TaskId) -> Option<usize> {
        self.entries.iter().position(|t| t.id() == task)
    }

    fn stats(&self) -> GroupStats {
        let mut stats = GroupStats {
            running: self.running.len(),
            completed: self.completed,
            ..GroupStats::default()
        };
        for task in &self.entries {
            match task.state() {
                TaskState::Queued => stats.queued += 1,
                TaskState::Paused => stats.paused += 1,
                _ => {}
            }
        }
        stats
    }
}

impl TaskGroup {
    /// Create a group on the current tokio runtime
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `max_running` is zero
    /// - [`Error::NoRuntime`] outside a tokio runtime
    pub fn new(
        max_running: usize,
        stall_timeout: Option<Duration>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        if max_running == 0 {
            return Err(Error::Config {
                message: "a task group needs at least one running slot".to_string(),
                key: Some("max_concurrent_downloads".to_string()),
            });
        }

        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let events = CommandQueue::with_handle(runtime.clone());
        let (stats_tx, _stats_rx) = watch::channel(GroupStats::default());
        let (retiring, _retiring_rx) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(GroupInner {
                id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
                max_running,
                settings: RunSettings { stall_timeout },
                transport,
                runtime,
                events,
                listeners: Arc::new(RwLock::new(Vec::new())),
                state: Mutex::new(GroupState::default()),
                stats_tx,
                retiring,
            }),
        })
    }

    /// Concurrency ceiling
    pub fn max_running(&self) -> usize {
        self.inner.max_running
    }

    /// Register a listener; it sees every event emitted after this call
    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Current occupancy
    pub fn stats(&self) -> GroupStats {
        self.inner.lock().stats()
    }

    /// Live tasks in backlog order (running, queued and paused)
    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.inner.lock().entries.clone()
    }

    /// Whether `task` is a live member of this group
    pub fn contains(&self, task: &DownloadTask) -> bool {
        self.inner.lock().position(task.id()).is_some()
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.inner.id)
            .field("max_running", &self.inner.max_running)
            .field("stats", &self.stats())
            .finish()
    }
}

impl GroupInner {
    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_stats(&self, state: &GroupState) {
        self.stats_tx.send_replace(state.stats());
    }
}
