//! Scripted transport for driving tasks, groups and the manager without a network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::watch;
use url::Url;

use super::transport::{Body, Transport};
use crate::error::{Error, Result};

/// A latch the scripted body waits on before every chunk after the first
pub(crate) struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(false);
        Arc::new(Self { tx })
    }

    pub(crate) fn release(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// How one URL responds
#[derive(Clone)]
pub(crate) struct Script {
    body: Vec<u8>,
    chunk_size: usize,
    announce_length: bool,
    honor_range: bool,
    gate: Option<Arc<Gate>>,
    cut_after: Option<usize>,
    announced: Option<u64>,
    status: Option<u16>,
}

impl Script {
    /// Serve `body` in 4-byte chunks with a Content-Length, honoring ranges
    pub(crate) fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            chunk_size: 4,
            announce_length: true,
            honor_range: true,
            gate: None,
            cut_after: None,
            announced: None,
            status: None,
        }
    }

    /// Answer every request with an HTTP error
    pub(crate) fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::new(Vec::new())
        }
    }

    /// Send the first chunk, then block until `gate` is released
    pub(crate) fn held(mut self, gate: &Arc<Gate>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    pub(crate) fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub(crate) fn without_length(mut self) -> Self {
        self.announce_length = false;
        self
    }

    pub(crate) fn ignore_range(mut self) -> Self {
        self.honor_range = false;
        self
    }

    /// Announce `len` as the Content-Length whatever the body holds
    pub(crate) fn announce(mut self, len: u64) -> Self {
        self.announced = Some(len);
        self
    }

    /// Close the stream after `bytes`, still announcing the full length
    pub(crate) fn cut_after(mut self, bytes: usize) -> Self {
        self.cut_after = Some(bytes);
        self
    }
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    opens: Mutex<Vec<(String, u64)>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, url: &str, script: Script) {
        let url = Url::parse(url).unwrap().to_string();
        self.scripts.lock().unwrap().insert(url, script);
    }

    /// Every `(url, offset)` the transport was asked to open, in order
    pub(crate) fn opens(&self) -> Vec<(String, u64)> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &Url, offset: u64) -> Result<Body> {
        self.opens
            .lock()
            .unwrap()
            .push((url.to_string(), offset));

        let script = self.scripts.lock().unwrap().get(url.as_str()).cloned();
        let Some(script) = script else {
            return Err(Error::HttpStatus {
                status: 404,
                url: url.to_string(),
            });
        };
        if let Some(status) = script.status {
            return Err(Error::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let start = if script.honor_range && (offset as usize) <= script.body.len() {
            offset as usize
        } else {
            0
        };
        let remaining = &script.body[start..];
        let content_length = script
            .announced
            .or(script.announce_length.then_some(remaining.len() as u64));

        let sent = script
            .cut_after
            .map_or(remaining.len(), |cut| cut.min(remaining.len()));
        let chunks: Vec<Bytes> = remaining[..sent]
            .chunks(script.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();

        let gate = script.gate.clone();
        let stream = futures::stream::iter(chunks.into_iter().enumerate())
            .then(move |(index, chunk)| {
                let gate = gate.clone();
                async move {
                    if index > 0
                        && let Some(gate) = gate
                    {
                        gate.wait().await;
                    }
                    Ok(chunk)
                }
            })
            .boxed();

        Ok(Body {
            resumed: start > 0,
            content_length,
            chunks: stream,
        })
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub(crate) async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
