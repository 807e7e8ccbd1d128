//! Identifier-keyed download manager split into focused submodules.
//!
//! The `DownloadManager` struct and its methods are organized by domain:
//! - [`queue`] - Admission, deduplication and lookups
//! - [`control`] - Pause, resume and cancel by item id
//! - [`lifecycle`] - Shutdown coordination
//!
//! The manager owns the item-id map; the [`TaskGroup`] owns the tasks. The map lock is only
//! held for lookups and inserts, never while calling into the group, and the group's events
//! reach it through a [`TaskListener`] running on the group's event consumer.

mod control;
mod lifecycle;
mod queue;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::{TaskEvent, TaskGroup, TaskListener};
use crate::task::{DownloadTask, HttpTransport, Transport};
use crate::types::{Event, ItemId, TaskId};

/// Main download manager (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct DownloadManager {
    /// Configuration (wrapped in Arc for sharing across tasks)
    config: Arc<Config>,
    /// Event broadcast channel sender (multiple subscribers supported)
    event_tx: broadcast::Sender<Event>,
    /// The bounded group every task runs in
    group: TaskGroup,
    /// Live item id to task mapping
    items: Arc<Mutex<ItemMap>>,
}

/// Both directions of the id mapping, kept in step under one lock
#[derive(Default)]
struct ItemMap {
    by_item: HashMap<ItemId, Arc<DownloadTask>>,
    by_task: HashMap<TaskId, ItemId>,
}

impl ItemMap {
    /// The mapped task, unless it has already reached a terminal state
    fn live(&self, id: ItemId) -> Option<&Arc<DownloadTask>> {
        self.by_item.get(&id).filter(|task| !task.state().is_terminal())
    }

    /// Map `id` to `task`
    ///
    /// A terminal task replaced here keeps its `by_task` entry until its own `Stopped` is
    /// delivered, so that event still reaches subscribers.
    fn insert(&mut self, id: ItemId, task: Arc<DownloadTask>) {
        self.by_item.insert(id, Arc::clone(&task));
        self.by_task.insert(task.id(), id);
    }

    /// Drop the mapping for `task`, leaving a newer task for the same item alone
    fn remove_task(&mut self, task: TaskId) -> Option<ItemId> {
        let id = self.by_task.remove(&task)?;
        if self.by_item.get(&id).is_some_and(|t| t.id() == task) {
            self.by_item.remove(&id);
        }
        Some(id)
    }
}

impl DownloadManager {
    /// Create a manager that fetches over HTTP
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Creates the temp directory (failure is fatal)
    /// - Builds the HTTP client
    /// - Sets up the task group and the event broadcast channel
    pub async fn new(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.http)?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Create a manager with a custom [`Transport`]
    pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(config.temp_dir())
            .await
            .map_err(|e| Error::TempDir {
                path: config.temp_dir().to_path_buf(),
                source: e,
            })?;

        let (event_tx, _rx) = broadcast::channel(config.download.event_buffer);
        let group = TaskGroup::new(
            config.download.max_concurrent_downloads,
            config.download.stall_timeout,
            transport,
        )?;
        let items = Arc::new(Mutex::new(ItemMap::default()));

        group.add_listener(Arc::new(EventBridge {
            items: Arc::clone(&items),
            event_tx: event_tx.clone(),
        }));

        tracing::info!(
            temp_dir = %config.temp_dir().display(),
            max_concurrent = config.download.max_concurrent_downloads,
            "Download manager initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            event_tx,
            group,
            items,
        })
    }

    /// Subscribe to download events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// Events are buffered, but a subscriber that falls behind by more than
    /// `event_buffer` events receives a `RecvError::Lagged` error.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use enclosure_dl::{Config, DownloadManager, Event};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let manager = DownloadManager::new(Config::default()).await?;
    ///
    ///     let mut events = manager.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = events.recv().await {
    ///             if let Event::Stopped { id, state, .. } = event {
    ///                 println!("item {id} finished as {state}");
    ///             }
    ///         }
    ///     });
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying task group
    pub fn group(&self) -> &TaskGroup {
        &self.group
    }

    fn lock_items(&self) -> MutexGuard<'_, ItemMap> {
        lock(&self.items)
    }

    fn emit(&self, event: Event) {
        // No subscribers is not an error
        self.event_tx.send(event).ok();
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("temp_dir", &self.config.download.temp_dir)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

fn lock(items: &Mutex<ItemMap>) -> MutexGuard<'_, ItemMap> {
    items.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Translates group events into item-keyed [`Event`]s and retires finished mappings
struct EventBridge {
    items: Arc<Mutex<ItemMap>>,
    event_tx: broadcast::Sender<Event>,
}

impl TaskListener for EventBridge {
    fn on_event(&self, event: &TaskEvent) {
        let task = event.task();
        let id = {
            let mut items = lock(&self.items);
            if let TaskEvent::Stopped { .. } = event {
                items.remove_task(task.id())
            } else {
                items.by_task.get(&task.id()).copied()
            }
        };
        let Some(id) = id else {
            tracing::debug!(task_id = task.id().0, "Event for unmapped task");
            return;
        };

        let mapped = match event {
            TaskEvent::Started { task } => Event::Started {
                id,
                payload: task.payload().clone(),
            },
            TaskEvent::Progress { task, progress } => Event::Progress {
                id,
                payload: task.payload().clone(),
                fraction: progress.fraction,
                bytes_received: progress.bytes_received,
                total_bytes: progress.total_bytes,
                rate_bps: progress.rate_bps,
            },
            TaskEvent::StateChanged { old, new, .. } => Event::StateChanged {
                id,
                old: *old,
                new: *new,
            },
            TaskEvent::Stopped { task, state, error } => {
                tracing::info!(item_id = id.0, state = %state, "Download stopped");
                Event::Stopped {
                    id,
                    payload: task.payload().clone(),
                    state: *state,
                    error: error.clone(),
                }
            }
        };
        self.event_tx.send(mapped).ok();
    }
}
