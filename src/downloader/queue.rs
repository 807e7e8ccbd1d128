//! Admission, deduplication and lookups.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::paths;
use crate::task::{DownloadTask, TaskSnapshot};
use crate::types::{Event, ItemId, QueueRequest, TaskState};

use super::DownloadManager;

impl DownloadManager {
    /// Queue one item
    ///
    /// Returns `false` if a live task already exists for `request.id`; the request is then
    /// ignored. A failed, cancelled or completed item can be queued again.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`](crate::Error::InvalidUrl) if the URL is malformed; nothing is queued
    /// - [`Error::ShuttingDown`](crate::Error::ShuttingDown) after shutdown has begun
    pub fn queue(&self, request: QueueRequest) -> Result<bool> {
        Ok(!self.queue_many(std::iter::once(request))?.is_empty())
    }

    /// Queue several items in order, returning the ids that were newly queued
    ///
    /// Ids that are already live, or repeated within the batch, are skipped. Every URL is
    /// checked before anything is queued, so one malformed URL rejects the whole batch.
    pub fn queue_many(
        &self,
        requests: impl IntoIterator<Item = QueueRequest>,
    ) -> Result<Vec<ItemId>> {
        let temp_dir = self.config.temp_dir();

        let fresh = {
            let mut items = self.lock_items();

            // 1. Build tasks for unseen ids
            let mut seen = HashSet::new();
            let mut fresh = Vec::new();
            for request in requests {
                if items.live(request.id).is_some() || !seen.insert(request.id) {
                    tracing::debug!(item_id = request.id.0, "Item already queued, skipping");
                    continue;
                }
                let destination = paths::derive_destination(temp_dir, &request.url)?;
                let task = DownloadTask::from_destination(
                    destination,
                    &request.display_name,
                    request.payload,
                );
                fresh.push((request.id, Arc::new(task)));
            }

            // 2. Map them before the group can report on them
            for (id, task) in &fresh {
                items.insert(*id, Arc::clone(task));
            }
            fresh
        };

        if fresh.is_empty() {
            return Ok(Vec::new());
        }

        for (id, task) in &fresh {
            self.emit(Event::Queued {
                id: *id,
                name: task.name().to_string(),
            });
        }

        // 3. Hand over to the group
        if let Err(e) = self
            .group
            .add_many(fresh.iter().map(|(_, task)| Arc::clone(task)))
        {
            tracing::warn!(count = fresh.len(), error = %e, "Task group refused downloads");
            let mut items = self.lock_items();
            for (id, task) in &fresh {
                items.remove_task(task.id());
                self.emit(Event::Stopped {
                    id: *id,
                    payload: task.payload().clone(),
                    state: TaskState::Cancelled,
                    error: Some(e.to_string()),
                });
            }
            return Err(e);
        }

        tracing::info!(count = fresh.len(), "Queued downloads");
        Ok(fresh.into_iter().map(|(id, _)| id).collect())
    }

    /// Whether a live task exists for `id`
    pub fn contains(&self, id: ItemId) -> bool {
        self.lock_items().live(id).is_some()
    }

    /// Current state of the task for `id`, or `None` if nothing is mapped
    pub fn status(&self, id: ItemId) -> Option<TaskState> {
        self.lock_items().by_item.get(&id).map(|task| task.state())
    }

    /// State and progress of the task for `id`
    pub fn snapshot(&self, id: ItemId) -> Option<TaskSnapshot> {
        self.lock_items().by_item.get(&id).map(|task| task.snapshot())
    }

    /// The live task for `id`
    pub fn task(&self, id: ItemId) -> Option<Arc<DownloadTask>> {
        self.lock_items().live(id).cloned()
    }

    /// Live item ids in backlog order
    ///
    /// Running, queued and paused items are included; feeding the list back through
    /// [`queue_many`](Self::queue_many) after a restart restores the backlog order.
    pub fn queued_ids(&self) -> Vec<ItemId> {
        let tasks = self.group.tasks();
        let items = self.lock_items();
        tasks
            .iter()
            .filter_map(|task| items.by_task.get(&task.id()).copied())
            .collect()
    }
}
