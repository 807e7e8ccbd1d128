//! Shared test helpers for creating DownloadManager instances in tests.

use crate::config::Config;
use crate::downloader::DownloadManager;
use crate::task::test_helpers::ScriptedTransport;
use crate::types::{Event, ItemId, TaskState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::broadcast;

pub(crate) const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Helper to create a test DownloadManager backed by a scripted transport.
/// Returns the manager, the transport and the tempdir (which must be kept alive).
pub(crate) async fn create_test_manager(
    max_concurrent: usize,
) -> (DownloadManager, Arc<ScriptedTransport>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();

    let mut config = Config::default();
    config.download.temp_dir = temp_dir.path().join("temp");
    config.download.max_concurrent_downloads = max_concurrent;
    config.download.stall_timeout = None;

    let transport = ScriptedTransport::new();
    let manager = DownloadManager::with_transport(config, transport.clone())
        .await
        .unwrap();

    (manager, transport, temp_dir)
}

pub(crate) fn url(name: &str) -> String {
    format!("http://feeds.example.com/audio/{name}.mp3")
}

/// Receive events until `Stopped` for `id`, returning its final state and error
pub(crate) async fn wait_for_stop(
    events: &mut broadcast::Receiver<Event>,
    id: ItemId,
) -> (TaskState, Option<String>) {
    let stop = async {
        loop {
            match events.recv().await.unwrap() {
                Event::Stopped {
                    id: stopped,
                    state,
                    error,
                    ..
                } if stopped == id => return (state, error),
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), stop)
        .await
        .expect("timed out waiting for Stopped")
}

/// Everything currently buffered on `events`
pub(crate) fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
