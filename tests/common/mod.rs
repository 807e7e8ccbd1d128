//! Common test utilities for enclosure-dl integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use enclosure_dl::{Body, Config, DownloadManager, Event, ItemId, Result, TaskState, Transport};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};
use url::Url;

pub const BODY: &[u8] = b"The quick brown fox jumps over the lazy dog";

/// Serves [`BODY`] for every URL, sending the first 8 bytes at once and the rest only after
/// [`GatedTransport::release`] is called for that URL
#[derive(Default)]
pub struct GatedTransport {
    gates: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let the transfer for `url` run to the end
    pub fn release(&self, url: &str) {
        self.gate(url).send_replace(true);
    }

    fn gate(&self, url: &str) -> watch::Sender<bool> {
        let key = Url::parse(url)
            .map(String::from)
            .unwrap_or_else(|_| url.to_string());
        let mut gates = self.gates.lock().unwrap();
        gates
            .entry(key)
            .or_insert_with(|| watch::channel(false).0)
            .clone()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn open(&self, url: &Url, offset: u64) -> Result<Body> {
        let mut gate = self.gate(url.as_str()).subscribe();
        let rest = &BODY[offset.min(BODY.len() as u64) as usize..];
        let split = rest.len().min(8);
        let head = Bytes::copy_from_slice(&rest[..split]);
        let tail = Bytes::copy_from_slice(&rest[split..]);

        let chunks = futures::stream::once(async move { Ok(head) })
            .chain(futures::stream::once(async move {
                let _ = gate.wait_for(|released| *released).await;
                Ok(tail)
            }))
            .boxed();

        Ok(Body {
            resumed: offset > 0,
            content_length: Some(rest.len() as u64),
            chunks,
        })
    }
}

pub fn episode_url(n: u32) -> String {
    format!("https://cdn.example.org/shows/daily/episode-{n}.mp3")
}

/// A manager over `transport` with its temp directory inside a fresh tempdir
pub async fn create_manager(
    max_concurrent: usize,
    transport: Arc<dyn Transport>,
) -> (DownloadManager, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.download.temp_dir = temp_dir.path().join("downloads");
    config.download.max_concurrent_downloads = max_concurrent;

    let manager = DownloadManager::with_transport(config, transport)
        .await
        .unwrap();
    (manager, temp_dir)
}

/// Receive events until one matches, failing after five seconds
pub async fn next_matching(
    events: &mut broadcast::Receiver<Event>,
    mut matches: impl FnMut(&Event) -> bool,
) -> Event {
    let wait = async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

/// Wait for the `Stopped` event of `id` and return its state and error
pub async fn wait_for_stop(
    events: &mut broadcast::Receiver<Event>,
    id: ItemId,
) -> (TaskState, Option<String>) {
    let event = next_matching(events, |event| {
        matches!(event, Event::Stopped { id: stopped, .. } if *stopped == id)
    })
    .await;
    match event {
        Event::Stopped { state, error, .. } => (state, error),
        other => panic!("expected Stopped, got {:?}", other),
    }
}
