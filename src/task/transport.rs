//! Byte-stream transports.

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use url::Url;

use crate::config::HttpConfig;
use crate::error::{Error, Result};

/// The chunks of a response body
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An opened response body
pub struct Body {
    /// Whether the body continues from the requested offset (`false` means it starts at byte 0)
    pub resumed: bool,
    /// Length of this body, if announced
    pub content_length: Option<u64>,
    /// The body itself
    pub chunks: ByteStream,
}

impl Body {
    /// A body with no bytes; `resumed` is set and the length is `Some(0)`
    pub fn already_complete() -> Self {
        Self {
            resumed: true,
            content_length: Some(0),
            chunks: futures::stream::empty().boxed(),
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("resumed", &self.resumed)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Abstraction over fetching a URL, enabling testability
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open `url`, asking for the bytes from `offset` onward
    ///
    /// Implementations that cannot resume return a body with `resumed == false`; the runner
    /// then rewrites the file from the start.
    async fn open(&self, url: &Url, offset: u64) -> Result<Body>;
}

/// Production [`Transport`] backed by reqwest
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client from [`HttpConfig`]
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &Url, offset: u64) -> Result<Body> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();

        let resumed = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                let start = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_start);
                if let Some(start) = start
                    && start != offset
                {
                    tracing::warn!(
                        url = %url,
                        requested = offset,
                        served = start,
                        "Server resumed from the wrong offset"
                    );
                    return Err(Error::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                true
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                // `bytes */<len>` equal to what we hold means the file is already whole
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_unsatisfied_range_total);
                if total == Some(offset) {
                    tracing::debug!(url = %url, offset, "Partial file already complete");
                    return Ok(Body::already_complete());
                }
                return Err(Error::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            s if s.is_success() => false,
            s => {
                return Err(Error::HttpStatus {
                    status: s.as_u16(),
                    url: url.to_string(),
                });
            }
        };

        let content_length = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(Body {
            resumed,
            content_length,
            chunks,
        })
    }
}

/// Start offset of `bytes <start>-<end>/<total>`
fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// Total of `bytes */<total>`
fn parse_unsatisfied_range_total(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes ")?;
    range.strip_prefix("*/")?.trim().parse().ok()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_start() {
        assert_eq!(parse_content_range_start("bytes 100-199/200"), Some(100));
        assert_eq!(parse_content_range_start("bytes 0-0/*"), Some(0));
        assert_eq!(parse_content_range_start("items 1-2/3"), None);
        assert_eq!(parse_content_range_start("bytes */200"), None);
    }

    #[test]
    fn test_parse_unsatisfied_range_total() {
        assert_eq!(parse_unsatisfied_range_total("bytes */4096"), Some(4096));
        assert_eq!(parse_unsatisfied_range_total("bytes 0-1/2"), None);
    }

    #[tokio::test]
    async fn test_already_complete_body_is_empty() {
        let mut body = Body::already_complete();
        assert!(body.resumed);
        assert_eq!(body.content_length, Some(0));
        assert!(body.chunks.next().await.is_none());
    }
}
