//! Transfer loop for a single run of a task.

use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::transport::{ByteStream, Transport};
use super::{DownloadTask, Progress, fraction};
use crate::error::{Error, Result};
use crate::types::TaskState;

/// Minimum spacing of progress samples when the total size is unknown
const UNKNOWN_SIZE_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Per-run knobs taken from [`DownloadConfig`](crate::config::DownloadConfig)
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RunSettings {
    pub(crate) stall_timeout: Option<Duration>,
}

/// How the transfer loop ended, before stop requests are taken into account
#[derive(Debug)]
pub(crate) enum RunOutcome {
    /// Stream exhausted and the size check passed
    Finished,
    /// The token fired at a checkpoint
    Interrupted,
    /// Any error that prevents completion
    Failed(Error),
}

/// Result of one run, handed to the group's finish step
#[derive(Debug)]
pub(crate) struct RunReport {
    pub(crate) state: TaskState,
    pub(crate) error: Option<String>,
}

/// Drive one run of `task` to its end
///
/// Never fails: errors are folded into the report. A cancelled run removes its partial file
/// before returning, so `Cancelled` is only ever reported for a task with nothing left on disk.
pub(crate) async fn run(
    task: &DownloadTask,
    transport: &dyn Transport,
    token: CancellationToken,
    settings: RunSettings,
    on_progress: &mut (dyn FnMut(Progress) + Send),
) -> RunReport {
    let outcome = match transfer(task, transport, &token, settings, on_progress).await {
        Ok(outcome) => outcome,
        Err(e) => RunOutcome::Failed(e),
    };

    let state = task.settle(&outcome);
    let error = match outcome {
        RunOutcome::Failed(e) if state == TaskState::Failed => {
            tracing::warn!(task_id = task.id().0, url = %task.url(), error = %e, "Transfer failed");
            Some(e.to_string())
        }
        _ => None,
    };

    if state == TaskState::Cancelled {
        discard_cancelled(task).await;
    }

    RunReport { state, error }
}

/// Remove a cancelled task's partial file on the blocking pool
pub(crate) async fn discard_cancelled(task: &DownloadTask) {
    let path = task.path().to_path_buf();
    if let Err(e) = tokio::task::spawn_blocking(move || discard_partial(&path)).await {
        tracing::warn!(task_id = task.id().0, error = %e, "Partial file cleanup did not run");
    }
}

async fn transfer(
    task: &DownloadTask,
    transport: &dyn Transport,
    token: &CancellationToken,
    settings: RunSettings,
    on_progress: &mut (dyn FnMut(Progress) + Send),
) -> Result<RunOutcome> {
    let path = task.path();
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let offset = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    let body = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(RunOutcome::Interrupted),
        body = transport.open(task.url(), offset) => body?,
    };

    let (mut file, start) = if body.resumed && offset > 0 {
        (OpenOptions::new().append(true).open(path).await?, offset)
    } else {
        (File::create(path).await?, 0)
    };

    let total = body.content_length.map(|len| start + len);
    if total == Some(0) {
        return Err(Error::EmptyResponse);
    }

    tracing::debug!(
        task_id = task.id().0,
        offset = start,
        total = ?total,
        "Transfer opened"
    );

    task.record_progress(start, total);
    let mut chunks = body.chunks;
    let mut received = start;
    let mut meter = ProgressMeter::new(start, total);

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                file.flush().await?;
                return Ok(RunOutcome::Interrupted);
            }
            next = next_chunk(&mut chunks, settings.stall_timeout) => next?,
        };

        let Some(chunk) = next else { break };
        if let Some(expected) = total
            && received + chunk.len() as u64 > expected
        {
            file.flush().await?;
            return Err(Error::Oversized { expected });
        }
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;

        task.record_progress(received, total);
        if let Some(progress) = meter.sample(received) {
            on_progress(progress);
        }
    }

    file.flush().await?;

    if let Some(expected) = total
        && received < expected
    {
        return Err(Error::Truncated { expected, received });
    }

    Ok(RunOutcome::Finished)
}

async fn next_chunk(
    chunks: &mut ByteStream,
    stall_timeout: Option<Duration>,
) -> Result<Option<Bytes>> {
    match stall_timeout {
        Some(idle) => match tokio::time::timeout(idle, chunks.next()).await {
            Ok(next) => next.transpose(),
            Err(_) => Err(Error::Stalled { idle }),
        },
        None => chunks.next().await.transpose(),
    }
}

/// Delete a cancelled task's file and, if that leaves it empty, its directory
///
/// Blocking; the runner calls it through `spawn_blocking`.
pub(crate) fn discard_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
            return;
        }
    }

    if let Some(dir) = path.parent()
        && let Err(e) = std::fs::remove_dir(dir)
        && e.kind() != ErrorKind::NotFound
    {
        tracing::debug!(dir = %dir.display(), error = %e, "Left download directory in place");
    }
}

/// Rate-limits progress samples
struct ProgressMeter {
    started: Instant,
    start_bytes: u64,
    total: Option<u64>,
    last_percent: Option<u64>,
    last_sample: Instant,
}

impl ProgressMeter {
    fn new(start_bytes: u64, total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            start_bytes,
            total,
            last_percent: total.map(|t| percent(start_bytes, t)),
            last_sample: now,
        }
    }

    /// A sample on every whole-percent change, or every 500 ms when the size is unknown
    fn sample(&mut self, received: u64) -> Option<Progress> {
        let due = match self.total {
            Some(total) => {
                let now_percent = percent(received, total);
                let changed = self.last_percent != Some(now_percent);
                self.last_percent = Some(now_percent);
                changed
            }
            None => self.last_sample.elapsed() >= UNKNOWN_SIZE_PROGRESS_INTERVAL,
        };
        if !due {
            return None;
        }

        self.last_sample = Instant::now();
        Some(Progress {
            bytes_received: received,
            total_bytes: self.total,
            fraction: fraction(received, self.total),
            rate_bps: self.rate(received),
        })
    }

    fn rate(&self, received: u64) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0;
        }
        (received.saturating_sub(self.start_bytes) as f64 / elapsed) as u64
    }
}

fn percent(received: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    received.saturating_mul(100) / total
}
