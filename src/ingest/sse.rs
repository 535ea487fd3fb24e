//! Server-sent events transport for the provider's `/sse/games` feed.
//!
//! ```text
//!  Provider ──chunks──▶ FrameDecoder ──SseFrame──▶ StreamSubscriber
//!                        (buffers until blank line)
//! ```

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{StreamDecodeError, StreamError};

/// Raw body chunks of one streaming session.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, StreamError>>;

/// Something that can open a push-event session.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a new session. `last_event_id` is the last `id:` seen on a
    /// previous session, so the server can replay what was missed.
    async fn connect(&self, last_event_id: Option<&str>) -> Result<ByteStream, StreamError>;

    /// Endpoint, for logging.
    fn url(&self) -> &str;
}

/// HTTP event-stream source backed by reqwest.
pub struct SseSource {
    http: Client,
    url: String,
    user_agent: String,
}

impl SseSource {
    pub fn new(base_url: &str, user_agent: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        // No overall timeout: the response body never ends on its own.
        let http = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(SseSource {
            http,
            url: format!("{}/sse/games", base_url.trim_end_matches('/')),
            user_agent: user_agent.to_string(),
        })
    }
}

#[async_trait]
impl EventSource for SseSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self, last_event_id: Option<&str>) -> Result<ByteStream, StreamError> {
        let mut req = self
            .http
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::USER_AGENT, &self.user_agent);
        if let Some(id) = last_event_id {
            debug!("Resuming event stream after id {}", id);
            req = req.header("Last-Event-ID", id);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(StreamError::Status(resp.status().as_u16()));
        }

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/event-stream");
        if !content_type.starts_with("text/event-stream") {
            return Err(StreamError::Protocol(format!(
                "expected text/event-stream, got {}",
                content_type
            )));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(StreamError::from))
            .boxed())
    }
}

/// One dispatched event: `event:` type, joined `data:` lines and optional `id:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    /// Parse the text of one frame (without its terminating blank line).
    /// Returns `None` for frames that carry nothing, e.g. keep-alive comments.
    pub fn parse(text: &str) -> Option<SseFrame> {
        let mut event: Option<String> = None;
        let mut data: Vec<&str> = Vec::new();
        let mut id: Option<String> = None;

        for line in text.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                "id" if !value.contains('\0') => id = Some(value.to_string()),
                _ => {}
            }
        }

        if event.is_none() && data.is_empty() && id.is_none() {
            return None;
        }
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
            id,
        })
    }
}

/// Accumulates body chunks and yields complete frames.
///
/// Frames may be split across chunks at any byte, including inside a UTF-8
/// sequence or between the `\r` and `\n` of a CRLF.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buf.drain(..end + 2).take(end).collect();
            match String::from_utf8(raw) {
                Ok(text) => frames.extend(SseFrame::parse(&text)),
                Err(e) => {
                    let lossy = String::from_utf8_lossy(e.as_bytes()).into_owned();
                    warn!("Dropping frame {:?}: {}", lossy, StreamDecodeError::from(e));
                }
            }
        }
        frames
    }

    /// Bytes received but not yet terminated by a blank line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
