//! Server-sent event decoding
//!
//! Three layers:
//! - [`SseLineBuffer`] reassembles byte chunks into text lines
//! - [`StreamDecoder`] turns `data:` lines into [`StreamEvent`]s and keeps the
//!   aggregated [`StreamingResult`]
//! - [`pump_stream`] drives both over a byte stream, honouring cancellation
//!   between frames
//!
//! Decoder states: `AwaitingStart -> Streaming -> Done`, with `Error` reachable
//! from any non-terminal state.

use super::models::{StreamEvent, StreamFrame, StreamingResult};
use crate::error::ErrorKind;
use crate::metrics::Metrics;
use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Splits an incoming byte stream into lines.
///
/// A line is only yielded once its terminating `\n` has arrived, so multi-byte
/// UTF-8 sequences split across chunks are reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: BytesMut,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line = self.pending.split_to(pos);
            self.pending.advance(1);
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever is left once the stream ends without a trailing newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        let text = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        Some(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitingStart,
    Streaming,
    Done,
    Error,
}

/// Incremental decoder for one streamed message
#[derive(Debug)]
pub struct StreamDecoder {
    state: DecoderState,
    accumulated: String,
    message_id: Option<String>,
    error: Option<ErrorKind>,
    truncated: bool,
    cancelled: bool,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitingStart,
            accumulated: String::new(),
            message_id: None,
            error: None,
            truncated: false,
            cancelled: false,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, DecoderState::Done | DecoderState::Error)
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated
    }

    /// Feed one line of the response body.
    ///
    /// Blank lines, `event:` lines and comments carry nothing the decoder
    /// needs and are skipped. Lines after a terminal state are ignored.
    pub fn feed_line(&mut self, line: &str) -> Option<StreamEvent> {
        if self.is_terminal() {
            return None;
        }

        let payload = line.strip_prefix(DATA_PREFIX)?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();
        if payload.is_empty() {
            return None;
        }
        if payload == DONE_SENTINEL {
            return Some(self.finish());
        }

        let frame: StreamFrame = match serde_json::from_str(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed stream event: {}", e);
                return Some(self.fail(ErrorKind::ParsingError));
            }
        };

        match frame {
            StreamFrame::MessageStart { message } => {
                debug!("Stream started: message {}", message.id);
                self.accumulated.clear();
                self.message_id = Some(message.id.clone());
                self.state = DecoderState::Streaming;
                Some(StreamEvent::MessageStart { id: message.id })
            }
            StreamFrame::ContentBlockDelta { delta } => {
                let text = delta.text.filter(|t| !t.is_empty())?;
                self.accumulated.push_str(&text);
                self.state = DecoderState::Streaming;
                Some(StreamEvent::ContentDelta { text })
            }
            StreamFrame::ContentBlockStart
            | StreamFrame::ContentBlockStop
            | StreamFrame::MessageDelta
            | StreamFrame::Ping => None,
            StreamFrame::MessageStop => Some(self.finish()),
            StreamFrame::Error { error } => {
                warn!(
                    "Provider reported stream error {}: {}",
                    error.error_type, error.message
                );
                Some(self.fail(error.kind()))
            }
            StreamFrame::Unknown => {
                let event_type = serde_json::from_str::<serde_json::Value>(payload)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
                    .unwrap_or_default();
                debug!("Ignoring unrecognized stream event type '{}'", event_type);
                None
            }
        }
    }

    /// The connection failed before a stop frame.
    ///
    /// Accumulated text is kept as a best-effort completion; with nothing
    /// accumulated the stream fails as a transient network error.
    pub fn transport_failed(&mut self) -> Option<StreamEvent> {
        if self.is_terminal() {
            return None;
        }
        if self.accumulated.is_empty() {
            Some(self.fail(ErrorKind::TransientNetwork))
        } else {
            self.truncated = true;
            Some(self.finish())
        }
    }

    /// The body ended without a stop frame; handled like a dropped connection
    pub fn end_of_stream(&mut self) -> Option<StreamEvent> {
        self.transport_failed()
    }

    /// Stop without completing: no stop event, accumulated text discarded
    pub fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.accumulated.clear();
        self.cancelled = true;
        self.error = Some(ErrorKind::Cancelled);
        self.state = DecoderState::Done;
    }

    pub fn result(&self) -> StreamingResult {
        StreamingResult {
            accumulated_text: self.accumulated.clone(),
            is_complete: self.state == DecoderState::Done && !self.cancelled,
            message_id: self.message_id.clone(),
            error: self.error,
            truncated: self.truncated,
        }
    }

    pub fn into_result(self) -> StreamingResult {
        StreamingResult {
            is_complete: self.state == DecoderState::Done && !self.cancelled,
            accumulated_text: self.accumulated,
            message_id: self.message_id,
            error: self.error,
            truncated: self.truncated,
        }
    }

    fn finish(&mut self) -> StreamEvent {
        self.state = DecoderState::Done;
        StreamEvent::MessageStop {
            text: self.accumulated.clone(),
        }
    }

    fn fail(&mut self, cause: ErrorKind) -> StreamEvent {
        self.state = DecoderState::Error;
        self.error = Some(cause);
        StreamEvent::Error { cause }
    }
}

/// Drive a decoder over a byte stream, forwarding events to `events`.
///
/// Cancellation is checked before every line, while waiting for bytes and
/// while waiting for room in `events`, so a consumer that stops reading never
/// holds up a cancelled pump. A closed receiver does not stop decoding; the
/// returned result is always complete.
pub async fn pump_stream<S, B, E>(
    source: S,
    mut decoder: StreamDecoder,
    cancel: CancellationToken,
    events: mpsc::Sender<StreamEvent>,
    metrics: Option<Arc<Metrics>>,
) -> StreamingResult
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    tokio::pin!(source);
    let mut lines = SseLineBuffer::new();
    let metrics = metrics.as_deref();

    'read: loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                decoder.cancel();
                break 'read;
            }
            next = source.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                for line in lines.push(chunk.as_ref()) {
                    if cancel.is_cancelled() {
                        decoder.cancel();
                        break 'read;
                    }
                    if let Some(event) = decoder.feed_line(&line) {
                        if !forward_event(event, &events, &cancel, metrics).await {
                            decoder.cancel();
                            break 'read;
                        }
                    }
                    if decoder.is_terminal() {
                        break 'read;
                    }
                }
            }
            Some(Err(e)) => {
                warn!("Stream transport failed: {}", e);
                if let Some(event) = decoder.transport_failed() {
                    forward_event(event, &events, &cancel, metrics).await;
                }
                break 'read;
            }
            None => {
                if let Some(line) = lines.finish() {
                    if let Some(event) = decoder.feed_line(&line) {
                        if !forward_event(event, &events, &cancel, metrics).await {
                            decoder.cancel();
                            break 'read;
                        }
                    }
                }
                if let Some(event) = decoder.end_of_stream() {
                    warn!("Stream ended without a stop event");
                    forward_event(event, &events, &cancel, metrics).await;
                }
                break 'read;
            }
        }
    }

    decoder.into_result()
}

/// Send one event; false when cancelled while waiting for channel capacity
async fn forward_event(
    event: StreamEvent,
    events: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    metrics: Option<&Metrics>,
) -> bool {
    if let Some(metrics) = metrics {
        metrics
            .stream_events
            .with_label_values(&[event.label()])
            .inc();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Cancelled while the consumer was not reading");
            false
        }
        _ = events.send(event) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn data(json: &str) -> String {
        format!("data: {}", json)
    }

    fn start(id: &str) -> String {
        data(&format!(
            r#"{{"type":"message_start","message":{{"id":"{}","role":"assistant","content":[]}}}}"#,
            id
        ))
    }

    fn delta(text: &str) -> String {
        data(&format!(
            r#"{{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":"{}"}}}}"#,
            text
        ))
    }

    fn stop() -> String {
        data(r#"{"type":"message_stop"}"#)
    }

    fn sse_body(lines: &[String]) -> String {
        lines.iter().map(|l| format!("{}\n\n", l)).collect()
    }

    fn feed_all(decoder: &mut StreamDecoder, lines: &[String]) -> Vec<StreamEvent> {
        lines.iter().filter_map(|l| decoder.feed_line(l)).collect()
    }

    #[test]
    fn test_reconstructs_message() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(&mut decoder, &[start("m1"), delta("Hel"), delta("lo"), stop()]);

        assert_eq!(
            events,
            vec![
                StreamEvent::MessageStart { id: "m1".into() },
                StreamEvent::ContentDelta { text: "Hel".into() },
                StreamEvent::ContentDelta { text: "lo".into() },
                StreamEvent::MessageStop { text: "Hello".into() },
            ]
        );
        let result = decoder.into_result();
        assert_eq!(result.accumulated_text, "Hello");
        assert!(result.is_complete);
        assert_eq!(result.message_id.as_deref(), Some("m1"));
        assert!(result.error.is_none());
        assert!(result.is_success());
    }

    #[test]
    fn test_done_sentinel_finishes() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(&mut decoder, &[start("m2"), delta("ok"), "data: [DONE]".to_string()]);
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop { text: "ok".into() }));
        assert_eq!(decoder.state(), DecoderState::Done);
    }

    #[test]
    fn test_structural_and_empty_events_are_silent() {
        let mut decoder = StreamDecoder::new();
        let lines = vec![
            "event: message_start".to_string(),
            start("m3"),
            String::new(),
            ": keep-alive comment".to_string(),
            data(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            data(r#"{"type":"ping"}"#),
            delta(""),
            data(r#"{"type":"content_block_stop","index":0}"#),
            data(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#),
        ];
        let events = feed_all(&mut decoder, &lines);
        assert_eq!(events, vec![StreamEvent::MessageStart { id: "m3".into() }]);
        assert_eq!(decoder.state(), DecoderState::Streaming);
    }

    #[test]
    fn test_message_start_resets_accumulator() {
        let mut decoder = StreamDecoder::new();
        feed_all(&mut decoder, &[delta("stale"), start("m4"), delta("fresh")]);
        assert_eq!(decoder.accumulated_text(), "fresh");
    }

    #[test]
    fn test_unknown_event_type_is_ignored() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(
            &mut decoder,
            &[start("m5"), data(r#"{"type":"citations_delta","citation":{}}"#), delta("x"), stop()],
        );
        assert_eq!(events.len(), 3);
        assert!(decoder.result().is_success());
    }

    #[test]
    fn test_malformed_json_is_terminal_error() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(&mut decoder, &[start("m6"), delta("part"), data("{not json"), delta("more")]);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Error {
                cause: ErrorKind::ParsingError
            })
        );
        assert_eq!(decoder.state(), DecoderState::Error);
        let result = decoder.result();
        assert!(!result.is_complete);
        assert_eq!(result.error, Some(ErrorKind::ParsingError));
        assert_eq!(result.accumulated_text, "part");
    }

    #[test]
    fn test_provider_error_frame() {
        let mut decoder = StreamDecoder::new();
        let event = decoder.feed_line(&data(
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
        ));
        assert_eq!(
            event,
            Some(StreamEvent::Error {
                cause: ErrorKind::RateLimitExceeded
            })
        );
    }

    #[test]
    fn test_transport_failure_keeps_partial_text() {
        let mut decoder = StreamDecoder::new();
        feed_all(&mut decoder, &[start("m7"), delta("partial")]);
        assert_eq!(
            decoder.transport_failed(),
            Some(StreamEvent::MessageStop {
                text: "partial".into()
            })
        );
        let result = decoder.into_result();
        assert!(result.is_complete);
        assert!(result.truncated);
        assert_eq!(result.accumulated_text, "partial");
    }

    #[test]
    fn test_transport_failure_without_text() {
        let mut decoder = StreamDecoder::new();
        feed_all(&mut decoder, &[start("m8")]);
        assert_eq!(
            decoder.transport_failed(),
            Some(StreamEvent::Error {
                cause: ErrorKind::TransientNetwork
            })
        );
        assert_eq!(decoder.transport_failed(), None);
    }

    #[test]
    fn test_cancel_discards_text() {
        let mut decoder = StreamDecoder::new();
        feed_all(&mut decoder, &[start("m9"), delta("Hel"), delta("lo")]);
        decoder.cancel();

        assert_eq!(decoder.state(), DecoderState::Done);
        assert_eq!(decoder.feed_line(&stop()), None);
        let result = decoder.into_result();
        assert!(!result.is_complete);
        assert!(!result.is_success());
        assert_eq!(result.accumulated_text, "");
        assert_eq!(result.error, Some(ErrorKind::Cancelled));
    }

    #[test]
    fn test_line_buffer_reassembles_split_chunks() {
        let mut buffer = SseLineBuffer::new();
        let text = "data: héllo\r\ndata: wörld\n";
        let bytes = text.as_bytes();
        // Split inside the two-byte 'é'
        let split = text.find('é').unwrap() + 1;

        let mut lines = buffer.push(&bytes[..split]);
        assert!(lines.is_empty());
        lines.extend(buffer.push(&bytes[split..]));
        assert_eq!(lines, vec!["data: héllo".to_string(), "data: wörld".to_string()]);
        assert_eq!(buffer.finish(), None);

        buffer.push(b"data: tail");
        assert_eq!(buffer.finish(), Some("data: tail".to_string()));
    }

    #[tokio::test]
    async fn test_pump_over_chunked_stream() {
        let body = sse_body(&[start("m10"), delta("Hel"), delta("lo"), stop()]);
        let chunks: Vec<Result<Vec<u8>, String>> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();

        let (tx, mut rx) = mpsc::channel(64);
        let result = pump_stream(
            stream::iter(chunks),
            StreamDecoder::new(),
            CancellationToken::new(),
            tx,
            None,
        )
        .await;

        assert_eq!(result.accumulated_text, "Hello");
        assert!(result.is_success());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_pump_dropped_connection_completes_partially() {
        let chunks: Vec<Result<String, String>> = vec![
            Ok(sse_body(&[start("m11"), delta("half")])),
            Err("connection reset".to_string()),
        ];
        let (tx, mut rx) = mpsc::channel(64);
        let result = pump_stream(
            stream::iter(chunks),
            StreamDecoder::new(),
            CancellationToken::new(),
            tx,
            None,
        )
        .await;

        assert!(result.is_complete);
        assert!(result.truncated);
        assert_eq!(result.accumulated_text, "half");
        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(StreamEvent::MessageStop { text: "half".into() }));
    }

    #[tokio::test]
    async fn test_pump_cancellation_observed_at_frame_boundary() {
        let token = CancellationToken::new();
        let frames = vec![
            sse_body(&[start("m12")]),
            sse_body(&[delta("one")]),
            sse_body(&[delta("two")]),
            sse_body(&[delta("three")]),
            sse_body(&[stop()]),
        ];
        // Cancellation is requested while the fourth frame is in flight
        let trigger = token.clone();
        let source = stream::iter(frames.into_iter().enumerate()).map(move |(idx, frame)| {
            if idx == 3 {
                trigger.cancel();
            }
            Ok::<_, String>(frame)
        });

        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, mut rx) = mpsc::channel(64);
        let result = pump_stream(source, StreamDecoder::new(), token, tx, Some(metrics.clone())).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::MessageStart { id: "m12".into() },
                StreamEvent::ContentDelta { text: "one".into() },
                StreamEvent::ContentDelta { text: "two".into() },
            ]
        );
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::MessageStop { .. })));
        assert_eq!(result.error, Some(ErrorKind::Cancelled));
        assert_eq!(result.accumulated_text, "");
        assert_eq!(
            metrics
                .stream_events
                .with_label_values(&["content_delta"])
                .get(),
            2.0
        );
    }

    #[tokio::test]
    async fn test_pump_eof_without_stop_or_text() {
        let chunks: Vec<Result<String, String>> = vec![Ok(sse_body(&[start("m13")]))];
        let (tx, _rx) = mpsc::channel(64);
        let result = pump_stream(
            stream::iter(chunks),
            StreamDecoder::new(),
            CancellationToken::new(),
            tx,
            None,
        )
        .await;
        assert!(!result.is_complete);
        assert_eq!(result.error, Some(ErrorKind::TransientNetwork));
    }

    #[tokio::test]
    async fn test_pump_cancelled_while_consumer_idle() {
        let mut frames = vec![sse_body(&[start("m14")])];
        for i in 0..200 {
            frames.push(sse_body(&[delta(&format!("d{} ", i))]));
        }
        frames.push(sse_body(&[stop()]));
        let chunks: Vec<Result<String, String>> = frames.into_iter().map(Ok).collect();

        let token = CancellationToken::new();
        // Nobody reads: the pump fills the channel and waits for room
        let (tx, rx) = mpsc::channel(4);
        let pump = tokio::spawn(pump_stream(
            stream::iter(chunks),
            StreamDecoder::new(),
            token.clone(),
            tx,
            None,
        ));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pump.is_finished());
        token.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), pump)
            .await
            .expect("pump must stop once cancelled")
            .unwrap();
        assert_eq!(result.error, Some(ErrorKind::Cancelled));
        assert_eq!(result.accumulated_text, "");
        assert!(!result.is_complete);
        drop(rx);
    }
}
