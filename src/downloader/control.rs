//! Download control by item id (pause/resume/cancel).

use crate::error::{Error, Result};
use crate::group::TaskGroup;
use crate::task::DownloadTask;
use crate::types::ItemId;

use super::DownloadManager;

impl DownloadManager {
    /// Pause the download for `id`
    ///
    /// Returns `false` if no live task is mapped. The partial file is kept and the item keeps
    /// its backlog position.
    pub fn pause(&self, id: ItemId) -> Result<bool> {
        self.forward(id, "pause", TaskGroup::pause)
    }

    /// Resume the download for `id`
    ///
    /// Returns `false` if no live task is mapped.
    pub fn resume(&self, id: ItemId) -> Result<bool> {
        self.forward(id, "resume", TaskGroup::resume)
    }

    /// Cancel the download for `id` and discard its partial file
    ///
    /// Returns `false` if no live task is mapped. The mapping is dropped when the task's
    /// `Stopped` event fires, after which the id can be queued again.
    pub fn cancel(&self, id: ItemId) -> Result<bool> {
        self.forward(id, "cancel", TaskGroup::cancel)
    }

    /// Look the task up under the map lock, then call the group without it
    fn forward(
        &self,
        id: ItemId,
        operation: &str,
        op: impl FnOnce(&TaskGroup, &DownloadTask) -> Result<()>,
    ) -> Result<bool> {
        let Some(task) = self.lock_items().live(id).cloned() else {
            tracing::debug!(item_id = id.0, operation, "No live download for item");
            return Ok(false);
        };

        match op(&self.group, &task) {
            Ok(()) => {
                tracing::debug!(item_id = id.0, task_id = task.id().0, operation, "Forwarded");
                Ok(true)
            }
            // Finished between the lookup and the call
            Err(Error::NotInGroup { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
