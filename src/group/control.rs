//! Pause, resume, cancel and remove.

use std::sync::Arc;

use super::{GroupState, TaskEvent, TaskGroup};
use crate::error::{Error, Result};
use crate::task::DownloadTask;
use crate::types::TaskId;

impl TaskGroup {
    /// Pause a task
    ///
    /// A queued task is paused in place. A running task is signalled, keeps its partial file
    /// and frees its slot once the transfer unwinds. It keeps its backlog position either way.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInGroup`] if the task is not a live member
    /// - [`Error::InvalidState`] if the task is cancelling
    pub fn pause(&self, task: &DownloadTask) -> Result<()> {
        let state = self.inner.lock();
        let task = member(&state, task.id())?;

        if let Some(transition) = task.request_pause()? {
            self.inner.emit(vec![TaskEvent::changed(&task, transition)]);
            self.inner.publish_stats(&state);
        }

        tracing::debug!(task_id = task.id().0, "Pause requested");
        Ok(())
    }

    /// Resume a paused task
    ///
    /// The task becomes queued again at its original backlog position, ahead of anything
    /// added after it. Resuming a live task is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInGroup`] if the task is not a live member
    /// - [`Error::InvalidState`] if the task is cancelling
    pub fn resume(&self, task: &DownloadTask) -> Result<()> {
        let mut state = self.inner.lock();
        let task = member(&state, task.id())?;

        if let Some(transition) = task.resume()? {
            tracing::debug!(task_id = task.id().0, "Task resumed");
            self.inner.emit(vec![TaskEvent::changed(&task, transition)]);
            self.inner.promote(&mut state);
            self.inner.publish_stats(&state);
        }
        Ok(())
    }

    /// Cancel a task
    ///
    /// Queued and paused tasks are cancelled immediately; their `Stopped` event follows once
    /// the partial file is deleted. A running task moves to `Cancelling`; its `Stopped` event
    /// fires once the transfer has unwound and its partial file is gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInGroup`] if the task is not a live member.
    pub fn cancel(&self, task: &DownloadTask) -> Result<()> {
        let mut state = self.inner.lock();
        let task = member(&state, task.id())?;

        let mut retired = None;
        if state.running.contains(&task.id()) {
            if let Some(transition) = task.request_cancel()? {
                tracing::debug!(task_id = task.id().0, "Cancel signalled");
                self.inner.emit(vec![TaskEvent::changed(&task, transition)]);
            }
        } else {
            retired = self.inner.cancel_idle(&mut state, &task);
        }

        self.inner.publish_stats(&state);
        drop(state);

        self.inner.retire(retired.into_iter().collect());
        Ok(())
    }

    /// Remove a task from the group
    ///
    /// Same as [`cancel`](Self::cancel): a queued entry leaves the backlog without affecting
    /// the others, a running one is cancelled and leaves once stopped.
    pub fn remove(&self, task: &DownloadTask) -> Result<()> {
        self.cancel(task)
    }
}

fn member(state: &GroupState, task: TaskId) -> Result<Arc<DownloadTask>> {
    state
        .position(task)
        .map(|pos| Arc::clone(&state.entries[pos]))
        .ok_or(Error::NotInGroup { task })
}
