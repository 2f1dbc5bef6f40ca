//! Server-sent events framing and the shared streaming driver.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{FinishReason, StreamEvent};

/// Capacity of the per-round event channel
pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 100;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences and events split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush an event left open when the stream ended without a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Provider-specific translation of SSE payloads into [`StreamEvent`]s
pub(crate) trait StreamParser: Send + 'static {
    fn on_event(&mut self, event: SseEvent) -> Vec<StreamEvent>;

    /// Called when the byte stream ends; must produce a `Done` if none was sent
    fn on_end(&mut self) -> Vec<StreamEvent>;

    fn is_done(&self) -> bool;
}

/// Pump an HTTP response body through `parser` on a background task.
///
/// The receiver sees exactly one `Done`. Transport errors end the stream with
/// `Done { reason: Error }`; cancellation drops the response.
pub(crate) fn spawn_sse_stream<P: StreamParser>(
    response: reqwest::Response,
    mut parser: P,
    cancel: CancellationToken,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let mut body = response.bytes_stream();

    tokio::spawn(async move {
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Provider stream cancelled");
                    let _ = tx.try_send(StreamEvent::Done {
                        reason: FinishReason::Error,
                        detail: Some("cancelled".to_string()),
                    });
                    return;
                }
                chunk = body.next() => chunk,
            };

            let events = match chunk {
                Some(Ok(bytes)) => decoder
                    .push(&bytes)
                    .into_iter()
                    .flat_map(|event| parser.on_event(event))
                    .collect::<Vec<_>>(),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Provider stream error");
                    let _ = tx
                        .send(StreamEvent::Done {
                            reason: FinishReason::Error,
                            detail: Some(format!("stream error: {}", e)),
                        })
                        .await;
                    return;
                }
                None => {
                    let mut tail: Vec<StreamEvent> = decoder
                        .finish()
                        .map(|event| parser.on_event(event))
                        .unwrap_or_default();
                    if !parser.is_done() {
                        tail.extend(parser.on_end());
                    }
                    for event in tail {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
            };

            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if parser.is_done() {
                return;
            }
        }
    });

    rx
}
