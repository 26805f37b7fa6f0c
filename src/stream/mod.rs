//! Streaming client for the chat engine's SSE endpoint.
//!
//! Each session runs as its own task and hands its results back through two
//! channels: ordered reply segments, and at most one terminal error. Both
//! channels close when the task stops.

pub mod frame;
pub mod segmenter;

use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::future::Future;
use std::pin::pin;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};
use crate::models::ChatRequest;
use frame::{KNOWN_EVENTS, StreamFrame};
use segmenter::Segmenter;

/// Receiving ends for one streaming session
#[derive(Debug)]
pub struct SessionChannels {
    pub segments: mpsc::Receiver<String>,
    pub errors: mpsc::Receiver<RelayError>,
}

#[derive(Clone)]
pub struct ChatEngineClient {
    http: Client,
    url: String,
    session_timeout: Duration,
    segment_buffer: usize,
}

impl ChatEngineClient {
    pub fn new(url: &str, session_timeout: Duration, segment_buffer: usize) -> Self {
        Self {
            http: Client::new(),
            url: url.to_string(),
            session_timeout,
            segment_buffer,
        }
    }

    /// Start a streaming session. Returns immediately; the request is sent
    /// from the spawned session task.
    pub fn open_session(&self, request: ChatRequest) -> SessionChannels {
        let http = self.http.clone();
        let url = self.url.clone();
        spawn_session(
            async move {
                tracing::info!(
                    session_id = %request.session_id,
                    visitor = %request.visitor_biz_id,
                    "Sending query to chat engine"
                );
                let response = http
                    .post(&url)
                    .header(ACCEPT, "text/event-stream")
                    .header(CACHE_CONTROL, "no-cache")
                    .json(&request)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(RelayError::EngineStatus(response.status().as_u16()));
                }
                Ok(response.bytes_stream().map_err(RelayError::from))
            },
            self.segment_buffer,
            self.session_timeout,
        )
    }
}

/// Run one session on a detached task under a single absolute deadline.
///
/// `connect` yields the response body as byte chunks. Segments go out in
/// production order; the first failure, if any, is reported once on the
/// error channel.
pub fn spawn_session<F, S, B>(connect: F, segment_buffer: usize, deadline: Duration) -> SessionChannels
where
    F: Future<Output = Result<S>> + Send + 'static,
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let (segment_tx, segments) = mpsc::channel(segment_buffer.max(1));
    let (error_tx, errors) = mpsc::channel(1);

    tokio::spawn(async move {
        let session = async {
            let chunks = connect.await?;
            consume(chunks, &segment_tx).await
        };
        let outcome = match tokio::time::timeout(deadline, session).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Deadline(deadline)),
        };

        match outcome {
            Ok(()) => tracing::debug!("Chat engine stream finished"),
            Err(RelayError::ChannelClosed) => {
                tracing::debug!("Segment receiver went away, stopping stream");
            }
            Err(e) => {
                tracing::warn!("Chat engine session failed: {}", e);
                let _ = error_tx.try_send(e);
            }
        }
        // Both senders drop here, closing each channel exactly once.
    });

    SessionChannels { segments, errors }
}

async fn consume<S, B>(chunks: S, segments: &mpsc::Sender<String>) -> Result<()>
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
{
    let mut chunks = pin!(chunks);
    let mut lines = LineDecoder::default();
    let mut segmenter = Segmenter::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        for line in lines.push(chunk.as_ref()) {
            handle_line(&line, &mut segmenter, segments).await?;
        }
    }
    if let Some(line) = lines.finish() {
        handle_line(&line, &mut segmenter, segments).await?;
    }

    if let Some(tail) = segmenter.finish() {
        emit(segments, tail).await?;
    }
    Ok(())
}

async fn handle_line(
    line: &str,
    segmenter: &mut Segmenter,
    segments: &mpsc::Sender<String>,
) -> Result<()> {
    if line.trim().is_empty() {
        return Ok(());
    }

    if let Some(event) = line.strip_prefix("event:") {
        let event = event.trim();
        if !KNOWN_EVENTS.contains(&event) {
            tracing::info!(event, "Inspect unrecognised event type");
        }
        return Ok(());
    }

    let Some(data) = line.strip_prefix("data:") else {
        tracing::debug!(line, "Skipping non-data line");
        return Ok(());
    };

    let frame = StreamFrame::decode(data)?;
    tracing::trace!(kind = frame.kind(), "Received frame");
    match frame {
        StreamFrame::Error { error } => {
            tracing::warn!(code = error.code, "Chat engine reported error: {}", error.message);
            Err(RelayError::Engine {
                code: error.code,
                message: error.message,
            })
        }
        StreamFrame::Unknown => {
            tracing::info!(data = data.trim(), "Inspect unrecognised frame");
            Ok(())
        }
        frame => {
            for segment in segmenter.push(&frame) {
                emit(segments, segment).await?;
            }
            Ok(())
        }
    }
}

async fn emit(segments: &mpsc::Sender<String>, segment: String) -> Result<()> {
    if segment.is_empty() {
        return Ok(());
    }
    segments
        .send(segment)
        .await
        .map_err(|_| RelayError::ChannelClosed)
}

/// Splits a byte stream into lines regardless of how it was chunked.
#[derive(Debug, Default)]
struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // Bytes already buffered hold no newline, so only the new chunk is scanned.
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);
        let Some(last) = self.buf[scan_from..].iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let end = scan_from + last;
        let lines = self.buf[..end].split(|&b| b == b'\n').map(decode_line).collect();
        self.buf.drain(..=end);
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
