//! Core types for enclosure-dl

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// External item identifier (e.g. a podcast item's database row id)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<ItemId> for i64 {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque task handle, unique per process and stable for the task's lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state
///
/// `Created → Queued → Running → {Paused, Cancelling → Cancelled, Completed, Failed}`,
/// with `Paused → Queued` on resume. `Completed`, `Cancelled` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Constructed but not yet admitted into a group
    Created,
    /// Waiting in the backlog for a free slot
    Queued,
    /// Occupying a concurrency slot
    Running,
    /// Suspended by request; keeps its backlog position and partial file
    Paused,
    /// Cancel requested, waiting for the transfer to unwind
    Cancelling,
    /// Cancelled and unwound
    Cancelled,
    /// Transfer finished and passed the size check
    Completed,
    /// Transfer hit an error
    Failed,
}

impl TaskState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }

    /// Lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Cancelling => "cancelling",
            TaskState::Cancelled => "cancelled",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied value carried through a task's lifetime and handed back in events
///
/// Cloning is cheap; the value itself is shared.
#[derive(Clone, Default)]
pub struct Payload(Option<Arc<dyn Any + Send + Sync>>);

impl Payload {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    /// An empty payload
    pub fn none() -> Self {
        Self(None)
    }

    /// Whether no value was supplied
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the value if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Payload(..)"),
            None => f.write_str("Payload(None)"),
        }
    }
}

/// A request to download one item
#[derive(Clone, Debug)]
pub struct QueueRequest {
    /// External identifier used for deduplication
    pub id: ItemId,
    /// Absolute URL of the remote file
    pub url: String,
    /// Name shown to users; falls back to the decoded file name when empty
    pub display_name: String,
    /// Value handed back in every event for this item
    pub payload: Payload,
}

impl QueueRequest {
    /// Create a request with no display name and no payload
    pub fn new(id: impl Into<ItemId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            display_name: String::new(),
            payload: Payload::none(),
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// Event emitted during the download lifecycle
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Item accepted and handed to the task group
    Queued {
        /// Item ID
        id: ItemId,
        /// Display name
        name: String,
    },

    /// Task promoted into a running slot
    Started {
        /// Item ID
        id: ItemId,
        /// Caller payload
        #[serde(skip)]
        payload: Payload,
    },

    /// Transfer progress
    Progress {
        /// Item ID
        id: ItemId,
        /// Caller payload
        #[serde(skip)]
        payload: Payload,
        /// Completed fraction (0.0 to 1.0), if the total size is known
        #[serde(skip_serializing_if = "Option::is_none")]
        fraction: Option<f64>,
        /// Bytes on disk so far
        bytes_received: u64,
        /// Total size, if known
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
        /// Average transfer rate of the current run
        rate_bps: u64,
    },

    /// Any task state transition
    StateChanged {
        /// Item ID
        id: ItemId,
        /// Previous state
        old: TaskState,
        /// New state
        new: TaskState,
    },

    /// Task reached a terminal state; fires exactly once per task
    Stopped {
        /// Item ID
        id: ItemId,
        /// Caller payload
        #[serde(skip)]
        payload: Payload,
        /// Final state (`Completed`, `Cancelled` or `Failed`)
        state: TaskState,
        /// Error message when `state` is `Failed`
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Event {
    /// The item this event refers to
    pub fn item_id(&self) -> ItemId {
        match self {
            Event::Queued { id, .. }
            | Event::Started { id, .. }
            | Event::Progress { id, .. }
            | Event::StateChanged { id, .. }
            | Event::Stopped { id, .. } => *id,
        }
    }
}

/// Snapshot of a task group's occupancy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Tasks occupying a slot
    pub running: usize,
    /// Tasks waiting in the backlog
    pub queued: usize,
    /// Paused tasks still holding a backlog position
    pub paused: usize,
    /// Tasks that finished with `Completed` since the group was created
    pub completed: u64,
}
