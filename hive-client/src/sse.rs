//! Consumer side of the daemon's server-sent event feeds.

use crate::api::EventStream;
use crate::debug_log::StreamDebugLog;
use crate::error::ClientError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::debug;

/// Incremental `text/event-stream` parser. Bytes may arrive split anywhere,
/// including inside a UTF-8 sequence; only `data:` fields are kept.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the payloads of every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(frame) = self.take_line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a final frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.take_line(&line);
        }
        self.dispatch()
    }

    fn take_line(&mut self, line: &str) -> Option<String> {
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
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let frame = self.data.join("\n");
        self.data.clear();
        Some(frame)
    }
}

struct DecodeState {
    bytes: Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    finished: bool,
    debug_log: StreamDebugLog,
    label: String,
}

/// Turns a raw SSE body into typed events. Frames that fail to decode are
/// skipped; a transport error ends the stream after being yielded once.
pub fn decode_stream<T, S>(bytes: S, debug_log: StreamDebugLog, label: &str) -> EventStream<T>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<Bytes, ClientError>> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
        debug_log,
        label: label.to_string(),
    };
    let events = futures::stream::unfold(state, |mut state| async move {
        loop {
            while let Some(payload) = state.ready.pop_front() {
                match serde_json::from_str::<T>(&payload) {
                    Ok(event) => return Some((Ok(event), state)),
                    Err(err) => {
                        debug!(stream = %state.label, error = %err, "skipping undecodable frame");
                        state.debug_log.record(
                            "invalid_frame",
                            json!({
                                "stream": state.label,
                                "error": err.to_string(),
                                "payload": payload,
                            }),
                        );
                    }
                }
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.push(&chunk);
                    state.ready.extend(frames);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    state.debug_log.record(
                        "stream_error",
                        json!({"stream": state.label, "error": err.to_string()}),
                    );
                    return Some((Err(err), state));
                }
                None => {
                    state.finished = true;
                    let last = state.decoder.finish();
                    state.ready.extend(last);
                    state
                        .debug_log
                        .record("stream_end", json!({"stream": state.label}));
                }
            }
        }
    });
    Box::pin(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Tick {
        n: u32,
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, ClientError>> + Send + 'static {
        let owned: Vec<Result<Bytes, ClientError>> = parts
            .iter()
            .map(|part| Ok(Bytes::from(part.to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    #[test]
    fn frames_survive_arbitrary_splits() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"da").is_empty());
        assert!(decoder.push(b"ta: {\"n\":").is_empty());
        assert!(decoder.push(b"1}\r").is_empty());
        assert_eq!(decoder.push(b"\n\r\ndata: x\n\n"), vec!["{\"n\":1}", "x"]);
    }

    #[test]
    fn multi_line_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(
            b": keep-alive\n\nevent: log\nid: 4\ndata: first\ndata:second\ndata\n\n",
        );
        assert_eq!(frames, vec!["first\nsecond\n"]);
    }

    #[test]
    fn split_utf8_sequence_is_reassembled() {
        let mut decoder = SseDecoder::new();
        let text = "data: héllo\n\n".as_bytes();
        let split = text.iter().position(|byte| *byte == 0xc3).unwrap() + 1;
        assert!(decoder.push(&text[..split]).is_empty());
        assert_eq!(decoder.push(&text[split..]), vec!["héllo"]);
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn invalid_frame_is_skipped_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("stream-debug.log");
        let debug_log = StreamDebugLog::open(&log_path).unwrap();
        let body = chunks(&[
            "data: {\"n\":1}\n\n",
            "data: {not json}\n\ndata: {\"n\"",
            ":2}\n\n: keep-alive\n\n",
            "data: {\"n\":3}\n\n",
        ]);
        let events: Vec<Tick> = decode_stream::<Tick, _>(body, debug_log, "test")
            .map(|event| event.unwrap())
            .collect()
            .await;
        assert_eq!(events, vec![Tick { n: 1 }, Tick { n: 2 }, Tick { n: 3 }]);

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("invalid_frame"));
        assert!(log.contains("{not json}"));
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"n\":1}\n\n")),
            Err(ClientError::Transport("reset".into())),
            Ok(Bytes::from_static(b"data: {\"n\":2}\n\n")),
        ]);
        let mut events = decode_stream::<Tick, _>(body, StreamDebugLog::disabled(), "test");
        assert_eq!(events.next().await.unwrap().unwrap(), Tick { n: 1 });
        assert!(events.next().await.unwrap().is_err());
        assert!(events.next().await.is_none());
    }
}
