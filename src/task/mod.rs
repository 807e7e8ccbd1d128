//! Download task: identity, state machine and the cooperative stop protocol.
//!
//! Split into focused submodules:
//! - [`transport`] - The [`Transport`] seam and the reqwest-backed [`HttpTransport`]
//! - [`runner`] - The transfer loop that streams a [`Body`] into the destination file
//!
//! A [`DownloadTask`] is driven by a [`TaskGroup`](crate::group::TaskGroup); every mutating
//! transition is crate-private so the group stays the only writer. Stop requests are
//! recorded on the task and signalled through a [`CancellationToken`] that the runner checks
//! at each chunk boundary; the state only leaves `Running`/`Cancelling` once that run has
//! actually unwound.

mod runner;
mod transport;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::paths::{self, Destination};
use crate::types::{Payload, TaskId, TaskState};

pub(crate) use runner::{
    RunOutcome, RunReport, RunSettings, discard_cancelled, discard_partial, run,
};
pub use transport::{Body, ByteStream, HttpTransport, Transport};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A progress sample taken by the runner
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    /// Bytes on disk so far, including any resumed prefix
    pub bytes_received: u64,
    /// Total size, if the server announced one
    pub total_bytes: Option<u64>,
    /// `bytes_received / total_bytes`, if the total is known
    pub fraction: Option<f64>,
    /// Average bytes per second over the current run
    pub rate_bps: u64,
}

/// A state transition, reported to listeners as `StateChanged`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) old: TaskState,
    pub(crate) new: TaskState,
}

/// Why the current run was asked to stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopRequest {
    Pause,
    Cancel,
}

/// Point-in-time view of a task
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSnapshot {
    /// Current state
    pub state: TaskState,
    /// Bytes on disk
    pub bytes_received: u64,
    /// Total size, if known
    pub total_bytes: Option<u64>,
    /// Completed fraction, if the total size is known
    pub fraction: Option<f64>,
    /// Failure message once the task is `Failed`
    pub error: Option<String>,
}

/// One schedulable transfer of a URL into a local file
pub struct DownloadTask {
    id: TaskId,
    name: String,
    url: Url,
    path: PathBuf,
    payload: Payload,
    inner: Mutex<TaskInner>,
}

struct TaskInner {
    state: TaskState,
    group: Option<u64>,
    stop: Option<StopRequest>,
    token: Option<CancellationToken>,
    /// Final state decided by the runner, applied by the group's finish step
    settled: Option<TaskState>,
    bytes_received: u64,
    total_bytes: Option<u64>,
    error: Option<String>,
}

impl DownloadTask {
    /// Create a task for `url`, written to `path`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `url` is not absolute and hierarchical.
    pub fn new(
        url: &str,
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        payload: Payload,
    ) -> Result<Self> {
        let url = paths::parse_url(url)?;
        Ok(Self::build(url, path.into(), name.into(), payload))
    }

    /// Create a task from a derived [`Destination`]; an empty `name` falls back to the file name
    pub fn from_destination(destination: Destination, name: &str, payload: Payload) -> Self {
        let name = if name.trim().is_empty() {
            destination.file_name
        } else {
            name.to_string()
        };
        Self::build(destination.url, destination.path, name, payload)
    }

    fn build(url: Url, path: PathBuf, name: String, payload: Payload) -> Self {
        Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            url,
            path,
            payload,
            inner: Mutex::new(TaskInner {
                state: TaskState::Created,
                group: None,
                stop: None,
                token: None,
                settled: None,
                bytes_received: 0,
                total_bytes: None,
                error: None,
            }),
        }
    }

    /// Unique handle
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote source
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Destination file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Caller-supplied value
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    /// Completed fraction, if the total size is known
    pub fn progress(&self) -> Option<f64> {
        let inner = self.lock();
        fraction(inner.bytes_received, inner.total_bytes)
    }

    /// Failure message, once `Failed`
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// Consistent view of state and progress
    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.lock();
        TaskSnapshot {
            state: inner.state,
            bytes_received: inner.bytes_received,
            total_bytes: inner.total_bytes,
            fraction: fraction(inner.bytes_received, inner.total_bytes),
            error: inner.error.clone(),
        }
    }

    /// Whether the task has been admitted to a group
    pub fn is_associated(&self) -> bool {
        self.lock().group.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalid(&self, operation: &str, state: TaskState) -> Error {
        Error::InvalidState {
            task: self.id,
            operation: operation.to_string(),
            current_state: state.to_string(),
        }
    }

    /// `Created → Queued`, binding the task to `group`
    pub(crate) fn admit(&self, group: u64) -> Result<Transition> {
        let mut inner = self.lock();
        if inner.group.is_some() {
            return Err(Error::AlreadyAssociated { task: self.id });
        }
        if inner.state != TaskState::Created {
            return Err(self.invalid("queue", inner.state));
        }
        inner.group = Some(group);
        Ok(set_state(&mut inner, TaskState::Queued))
    }

    /// `Queued → Running`; returns the token for this run
    pub(crate) fn begin_run(&self) -> Result<(Transition, CancellationToken)> {
        let mut inner = self.lock();
        if inner.state != TaskState::Queued {
            return Err(self.invalid("start", inner.state));
        }
        let token = CancellationToken::new();
        inner.token = Some(token.clone());
        inner.stop = None;
        inner.settled = None;
        inner.error = None;
        Ok((set_state(&mut inner, TaskState::Running), token))
    }

    /// Ask the task to pause
    ///
    /// A queued task pauses immediately. A running task is signalled and reaches `Paused`
    /// once its transfer unwinds, so `Ok(None)` is returned. Pausing a paused task is a no-op.
    pub(crate) fn request_pause(&self) -> Result<Option<Transition>> {
        let mut inner = self.lock();
        match inner.state {
            TaskState::Queued => Ok(Some(set_state(&mut inner, TaskState::Paused))),
            TaskState::Paused => Ok(None),
            TaskState::Running => {
                if inner.stop.is_none() && inner.settled.is_none() {
                    inner.stop = Some(StopRequest::Pause);
                    if let Some(token) = &inner.token {
                        token.cancel();
                    }
                }
                Ok(None)
            }
            state => Err(self.invalid("pause", state)),
        }
    }

    /// Ask the task to cancel
    ///
    /// Queued and paused tasks become `Cancelled` at once. A running task moves to
    /// `Cancelling` and is signalled; it becomes `Cancelled` when the transfer unwinds.
    /// A cancel overrides a pending pause.
    pub(crate) fn request_cancel(&self) -> Result<Option<Transition>> {
        let mut inner = self.lock();
        match inner.state {
            TaskState::Queued | TaskState::Paused => {
                Ok(Some(set_state(&mut inner, TaskState::Cancelled)))
            }
            TaskState::Running if inner.settled.is_none() => {
                inner.stop = Some(StopRequest::Cancel);
                if let Some(token) = &inner.token {
                    token.cancel();
                }
                Ok(Some(set_state(&mut inner, TaskState::Cancelling)))
            }
            // The run already decided its outcome; the finish step is imminent.
            TaskState::Running | TaskState::Cancelling => Ok(None),
            state => Err(self.invalid("cancel", state)),
        }
    }

    /// `Paused → Queued`
    ///
    /// Resuming a live task is a no-op, including one whose pause is still unwinding.
    pub(crate) fn resume(&self) -> Result<Option<Transition>> {
        let mut inner = self.lock();
        match inner.state {
            TaskState::Paused => Ok(Some(set_state(&mut inner, TaskState::Queued))),
            TaskState::Queued | TaskState::Running => Ok(None),
            state => Err(self.invalid("resume", state)),
        }
    }

    pub(crate) fn record_progress(&self, bytes_received: u64, total_bytes: Option<u64>) {
        let mut inner = self.lock();
        inner.bytes_received = bytes_received;
        inner.total_bytes = total_bytes;
    }

    /// Decide how the current run ends; later stop requests no longer influence it
    pub(crate) fn settle(&self, outcome: &RunOutcome) -> TaskState {
        let mut inner = self.lock();
        let final_state = match (inner.stop, outcome) {
            (Some(StopRequest::Cancel), _) => TaskState::Cancelled,
            (_, RunOutcome::Finished) => TaskState::Completed,
            (_, RunOutcome::Failed(_)) => TaskState::Failed,
            (Some(StopRequest::Pause), RunOutcome::Interrupted) => TaskState::Paused,
            (None, RunOutcome::Interrupted) => TaskState::Cancelled,
        };
        inner.settled = Some(final_state);
        final_state
    }

    /// Apply the settled state at the end of a run
    pub(crate) fn complete_run(&self, error: Option<String>) -> Transition {
        let mut inner = self.lock();
        let final_state = inner.settled.take().unwrap_or(TaskState::Failed);
        inner.token = None;
        inner.stop = None;
        inner.error = error;
        set_state(&mut inner, final_state)
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url.as_str())
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

fn set_state(inner: &mut TaskInner, new: TaskState) -> Transition {
    let old = std::mem::replace(&mut inner.state, new);
    Transition { old, new }
}

pub(crate) fn fraction(received: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(0) | None => None,
        Some(total) => Some((received as f64 / total as f64).min(1.0)),
    }
}
