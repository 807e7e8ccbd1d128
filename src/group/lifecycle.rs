//! Admission, promotion, end-of-run handling and shutdown.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{GroupInner, GroupState, TaskEvent, TaskGroup};
use crate::command_queue::panic_message;
use crate::error::{Error, Result};
use crate::task::{DownloadTask, Progress, RunOutcome, RunReport, Transition};
use crate::types::TaskState;

impl TaskGroup {
    /// Append `task` to the backlog and fill any free slots
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown) has begun
    /// - [`Error::AlreadyAssociated`] if the task was added to a group before
    pub fn add(&self, task: Arc<DownloadTask>) -> Result<()> {
        self.add_many(std::iter::once(task))
    }

    /// Append several tasks, preserving their relative order
    ///
    /// The batch is checked up front; if any task is rejected none are added.
    pub fn add_many(&self, tasks: impl IntoIterator<Item = Arc<DownloadTask>>) -> Result<()> {
        let tasks: Vec<_> = tasks.into_iter().collect();
        let mut state = self.inner.lock();
        if state.shutting_down {
            return Err(Error::ShuttingDown);
        }

        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if task.is_associated() || !seen.insert(task.id()) {
                tracing::error!(
                    group_id = self.inner.id,
                    task_id = task.id().0,
                    "Task added to a group twice"
                );
                return Err(Error::AlreadyAssociated { task: task.id() });
            }
        }

        let mut events = Vec::with_capacity(tasks.len());
        let mut failure = None;
        for task in tasks {
            match task.admit(self.inner.id) {
                Ok(transition) => {
                    events.push(TaskEvent::changed(&task, transition));
                    state.entries.push(task);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.inner.emit(events);
        self.inner.promote(&mut state);
        self.inner.publish_stats(&state);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolve once nothing is running or queued and every event so far has been delivered
    ///
    /// Paused tasks do not keep the group busy.
    pub async fn wait_idle(&self) {
        let mut stats_rx = self.inner.stats_tx.subscribe();
        let _ = stats_rx
            .wait_for(|stats| stats.running == 0 && stats.queued == 0)
            .await;
        self.inner.retired().await;
        self.inner.events.wait_idle().await;
    }

    /// Cancel everything and wait until every running task has unwound
    ///
    /// Queued and paused tasks are cancelled at once. Running tasks are signalled and
    /// awaited. The event consumer is then drained and stopped.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutdownFromConsumer`] if called from a [`TaskListener`](super::TaskListener)
    /// - [`Error::AlreadyShutDown`] on a second call
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.events.is_consumer_thread() {
            tracing::error!(
                group_id = self.inner.id,
                "Task group shutdown requested from its own event consumer"
            );
            return Err(Error::ShutdownFromConsumer);
        }

        let mut retired = Vec::new();
        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return Err(Error::AlreadyShutDown);
            }
            state.shutting_down = true;

            tracing::info!(
                group_id = self.inner.id,
                running = state.running.len(),
                backlog = state.entries.len() - state.running.len(),
                "Shutting down task group"
            );

            let mut events = Vec::new();
            for task in state.entries.clone() {
                if state.running.contains(&task.id()) {
                    match task.request_cancel() {
                        Ok(Some(transition)) => events.push(TaskEvent::changed(&task, transition)),
                        Ok(None) => {}
                        Err(e) => tracing::warn!(
                            task_id = task.id().0,
                            error = %e,
                            "Could not signal running task"
                        ),
                    }
                } else {
                    retired.extend(self.inner.cancel_idle(&mut state, &task));
                }
            }

            self.inner.emit(events);
            self.inner.publish_stats(&state);
        }
        self.inner.retire(retired);

        let mut stats_rx = self.inner.stats_tx.subscribe();
        let _ = stats_rx.wait_for(|stats| stats.running == 0).await;
        self.inner.retired().await;

        self.inner.events.shutdown().await?;
        tracing::info!(group_id = self.inner.id, "Task group shut down");
        Ok(())
    }
}

impl GroupInner {
    /// Move queued entries into free slots, first queued entry first
    pub(super) fn promote(self: &Arc<Self>, state: &mut GroupState) {
        if state.shutting_down {
            return;
        }

        while state.running.len() < self.max_running {
            let Some(task) = state
                .entries
                .iter()
                .find(|t| t.state() == TaskState::Queued)
                .cloned()
            else {
                break;
            };

            let (transition, token) = match task.begin_run() {
                Ok(started) => started,
                Err(e) => {
                    tracing::error!(task_id = task.id().0, error = %e, "Failed to promote task");
                    break;
                }
            };

            state.running.insert(task.id());
            tracing::debug!(
                group_id = self.id,
                task_id = task.id().0,
                running = state.running.len(),
                "Promoted task"
            );
            self.emit(vec![
                TaskEvent::changed(&task, transition),
                TaskEvent::Started {
                    task: Arc::clone(&task),
                },
            ]);
            self.spawn_run(task, token);
        }
    }

    fn spawn_run(self: &Arc<Self>, task: Arc<DownloadTask>, token: CancellationToken) {
        let group = Arc::clone(self);
        self.runtime.spawn(async move {
            tracing::info!(task_id = task.id().0, url = %task.url(), "Task started");

            let progress_group = Arc::clone(&group);
            let progress_task = Arc::clone(&task);
            let mut on_progress = move |progress: Progress| {
                progress_group.emit(vec![TaskEvent::Progress {
                    task: Arc::clone(&progress_task),
                    progress,
                }]);
            };

            let run = crate::task::run(
                &task,
                group.transport.as_ref(),
                token,
                group.settings,
                &mut on_progress,
            );
            let report = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(report) => report,
                Err(panic) => {
                    let message = panic_message(&*panic).to_string();
                    tracing::error!(task_id = task.id().0, panic = %message, "Transfer panicked");
                    let error = Error::Panicked(message).to_string();
                    let outcome = RunOutcome::Failed(Error::Panicked(error.clone()));
                    let state = task.settle(&outcome);
                    if state == TaskState::Cancelled {
                        crate::task::discard_cancelled(&task).await;
                    }
                    RunReport {
                        state,
                        error: (state == TaskState::Failed).then_some(error),
                    }
                }
            };

            group.finish_run(&task, report);
        });
    }

    /// End-of-run step: free the slot, publish the outcome, promote the next task
    fn finish_run(self: &Arc<Self>, task: &Arc<DownloadTask>, report: RunReport) {
        let mut state = self.lock();
        state.running.remove(&task.id());

        let transition = task.complete_run(report.error.clone());
        let mut events = vec![TaskEvent::changed(task, transition)];
        let mut retired = None;

        if transition.new.is_terminal() {
            if let Some(pos) = state.position(task.id()) {
                state.entries.remove(pos);
            }
            if transition.new == TaskState::Completed {
                state.completed += 1;
            }
            tracing::info!(
                task_id = task.id().0,
                state = %transition.new,
                error = report.error.as_deref().unwrap_or(""),
                "Task stopped"
            );
            events.push(TaskEvent::Stopped {
                task: Arc::clone(task),
                state: transition.new,
                error: report.error,
            });
        } else if state.shutting_down {
            // Paused just before shutdown signalled it; it still has to go
            retired = self.cancel_idle(&mut state, task);
        } else {
            tracing::info!(task_id = task.id().0, state = %transition.new, "Task suspended");
        }

        self.emit(events);
        self.promote(&mut state);
        self.publish_stats(&state);
        drop(state);

        self.retire(retired.into_iter().collect());
    }

    /// Cancel a queued or paused member in place
    ///
    /// The task leaves the group at once. Its file is deleted and its last events emitted by
    /// [`retire`](Self::retire), which the caller runs after releasing the lock.
    pub(super) fn cancel_idle(
        &self,
        state: &mut GroupState,
        task: &Arc<DownloadTask>,
    ) -> Option<Retired> {
        let transition = match task.request_cancel() {
            Ok(Some(transition)) => transition,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(task_id = task.id().0, error = %e, "Could not cancel task");
                return None;
            }
        };

        if let Some(pos) = state.position(task.id()) {
            state.entries.remove(pos);
        }
        self.retiring.send_modify(|n| *n += 1);
        tracing::info!(task_id = task.id().0, "Task cancelled before running");

        Some(Retired {
            task: Arc::clone(task),
            transition,
        })
    }

    /// Delete the files of cancelled idle tasks on the blocking pool, then report them
    pub(super) fn retire(self: &Arc<Self>, retired: Vec<Retired>) {
        if retired.is_empty() {
            return;
        }

        let group = Arc::clone(self);
        self.runtime.spawn(async move {
            let paths: Vec<PathBuf> = retired
                .iter()
                .map(|r| r.task.path().to_path_buf())
                .collect();
            let cleanup = tokio::task::spawn_blocking(move || {
                for path in &paths {
                    crate::task::discard_partial(path);
                }
            });
            if let Err(e) = cleanup.await {
                tracing::warn!(error = %e, "Partial file cleanup did not run");
            }

            let count = retired.len();
            let events = retired
                .into_iter()
                .flat_map(|r| {
                    [
                        TaskEvent::changed(&r.task, r.transition),
                        TaskEvent::Stopped {
                            task: Arc::clone(&r.task),
                            state: r.transition.new,
                            error: None,
                        },
                    ]
                })
                .collect();
            group.emit(events);
            group.retiring.send_modify(|n| *n -= count);
        });
    }

    /// Resolve once no cancelled idle task is still being cleaned up
    async fn retired(&self) {
        let mut retiring = self.retiring.subscribe();
        let _ = retiring.wait_for(|n| *n == 0).await;
    }
}

/// A member cancelled while idle, waiting for its file to go before `Stopped` is emitted
pub(super) struct Retired {
    task: Arc<DownloadTask>,
    transition: Transition,
}
