//! Task lifecycle events and their delivery.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use super::GroupInner;
use crate::command_queue::panic_message;
use crate::task::{DownloadTask, Progress, Transition};
use crate::types::TaskState;

/// Something that happened to a task in a [`TaskGroup`](super::TaskGroup)
#[derive(Clone, Debug)]
pub enum TaskEvent {
    /// `Queued → Running`
    Started {
        /// The task
        task: Arc<DownloadTask>,
    },
    /// A rate-limited progress sample
    Progress {
        /// The task
        task: Arc<DownloadTask>,
        /// The sample
        progress: Progress,
    },
    /// Any state transition
    StateChanged {
        /// The task
        task: Arc<DownloadTask>,
        /// Previous state
        old: TaskState,
        /// New state
        new: TaskState,
    },
    /// Terminal state reached; fires exactly once per task
    Stopped {
        /// The task
        task: Arc<DownloadTask>,
        /// `Completed`, `Cancelled` or `Failed`
        state: TaskState,
        /// Failure message for `Failed`
        error: Option<String>,
    },
}

impl TaskEvent {
    /// The task this event refers to
    pub fn task(&self) -> &Arc<DownloadTask> {
        match self {
            TaskEvent::Started { task }
            | TaskEvent::Progress { task, .. }
            | TaskEvent::StateChanged { task, .. }
            | TaskEvent::Stopped { task, .. } => task,
        }
    }

    pub(super) fn changed(task: &Arc<DownloadTask>, transition: Transition) -> Self {
        TaskEvent::StateChanged {
            task: Arc::clone(task),
            old: transition.old,
            new: transition.new,
        }
    }
}

/// Receives [`TaskEvent`]s
///
/// Callbacks run one at a time, in emission order, on the group's event consumer, never on
/// the caller's thread. A panicking listener is logged and skipped.
pub trait TaskListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &TaskEvent);
}

impl<F> TaskListener for F
where
    F: Fn(&TaskEvent) + Send + Sync,
{
    fn on_event(&self, event: &TaskEvent) {
        self(event)
    }
}

impl GroupInner {
    /// Queue `events` for delivery as one command
    pub(super) fn emit(&self, events: Vec<TaskEvent>) {
        if events.is_empty() {
            return;
        }

        let listeners = Arc::clone(&self.listeners);
        let count = events.len();
        if !self.events.submit(move || dispatch(&listeners, &events)) {
            tracing::warn!(group_id = self.id, count, "Dropping task events after shutdown");
        }
    }
}

fn dispatch(listeners: &RwLock<Vec<Arc<dyn TaskListener>>>, events: &[TaskEvent]) {
    let listeners = listeners
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    for event in events {
        for listener in &listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                tracing::error!(
                    task_id = event.task().id().0,
                    panic = panic_message(&*panic),
                    "Task listener panicked"
                );
            }
        }
    }
}
