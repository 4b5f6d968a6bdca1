//! Streaming chat completions: the provider call and its SSE decode.
//!
//! [`OpenAiClient::stream`] opens one streaming completion request and
//! yields a lazy, ordered sequence of [`StreamEvent`] values. Each network
//! chunk may contain zero, one, or several newline-delimited sub-messages;
//! a sub-message equal to the reserved `[DONE]` literal ends the sequence,
//! anything else is decoded as a structured delta. Unparseable sub-messages
//! are logged and skipped; they never terminate or fail the stream.

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{CompletionError, FramingError};
use crate::{ChatRequest, OpenAiClient, PromptMessage};

/// The reserved terminator literal ending a provider stream.
pub const DONE_LITERAL: &str = "[DONE]";

/// Bounded depth of the event channel. Small on purpose: the relay is
/// allowed to block rather than buffer when the client is slow.
const EVENT_CHANNEL_DEPTH: usize = 16;

/// A single event from the provider stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// First structured delta seen; carries the provider's assigned id.
    /// Correlation only: the persisted reply id is generated independently.
    Started { provider_id: String },
    /// One incremental piece of generated text.
    TextDelta(String),
    /// The stream completed normally.
    Done,
}

/// Lazy, ordered event sequence for one completion request.
pub type CompletionStream = ReceiverStream<Result<StreamEvent, CompletionError>>;

impl OpenAiClient {
    /// Open a streaming completion request.
    ///
    /// Rejects an empty prompt before any I/O. Temperature is pinned to 0
    /// and `max_tokens` set to the caller's response budget. The returned
    /// stream ends with [`StreamEvent::Done`] on the `[DONE]` terminator,
    /// or with one terminal `Err` if the transport breaks first. Dropping
    /// the stream unsubscribes: the reader task stops and the underlying
    /// request is cancelled.
    pub async fn stream(
        &self,
        messages: Vec<PromptMessage>,
        response_budget: u32,
    ) -> Result<CompletionStream, CompletionError> {
        if messages.is_empty() {
            return Err(CompletionError::BadRequest(
                "refusing to stream an empty prompt".into(),
            ));
        }

        let body = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: 0.0,
            max_tokens: response_budget,
            stream: true,
        };
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            max_tokens = body.max_tokens,
            "opening streaming completion"
        );

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Transport(format!("streaming request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Transport(format!(
                "provider HTTP {status}: {text}"
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        tokio::spawn(read_stream(resp, tx));
        Ok(ReceiverStream::new(rx))
    }
}

/// Reader task: network chunks in, parsed events out.
///
/// Returns when the terminator arrives, the transport breaks, or the
/// consumer drops the receiving half (which also cancels the request by
/// dropping the response).
async fn read_stream(
    mut resp: reqwest::Response,
    tx: mpsc::Sender<Result<StreamEvent, CompletionError>>,
) {
    let mut buffer = LineBuffer::new();
    let mut started = false;

    loop {
        let chunk = match resp.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                let _ = tx
                    .send(Err(CompletionError::Transport(format!(
                        "failed to read streaming chunk: {e}"
                    ))))
                    .await;
                return;
            }
        };

        buffer.push(&chunk);
        while let Some(line) = buffer.next_line() {
            if dispatch_line(&line, &tx, &mut started).await.is_break() {
                return;
            }
        }
    }

    // An incomplete final line can still hold one last sub-message.
    let remainder = buffer.take_remainder();
    if !remainder.is_empty() && dispatch_line(&remainder, &tx, &mut started).await.is_break() {
        return;
    }

    // The provider closed the connection without the terminator.
    let _ = tx
        .send(Err(CompletionError::Transport(
            "provider closed the stream before the [DONE] terminator".into(),
        )))
        .await;
}

/// Feed one SSE line to the consumer. `Break` means stop reading entirely,
/// either because the terminator arrived or the consumer went away.
async fn dispatch_line(
    line: &str,
    tx: &mpsc::Sender<Result<StreamEvent, CompletionError>>,
    started: &mut bool,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    if line.is_empty() || line.starts_with(':') {
        return ControlFlow::Continue(());
    }
    let Some(data) = line.strip_prefix("data: ") else {
        return ControlFlow::Continue(());
    };
    if data == DONE_LITERAL {
        let _ = tx.send(Ok(StreamEvent::Done)).await;
        return ControlFlow::Break(());
    }

    match parse_delta(data) {
        Ok(parsed) => {
            if !*started && let Some(id) = parsed.provider_id {
                *started = true;
                if tx.send(Ok(StreamEvent::Started { provider_id: id })).await.is_err() {
                    return ControlFlow::Break(());
                }
            }
            if let Some(content) = parsed.content
                && !content.is_empty()
                && tx.send(Ok(StreamEvent::TextDelta(content))).await.is_err()
            {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
        Err(err) => {
            // Best-effort resilience to garbled network writes.
            warn!(%err, "skipping unparseable provider chunk");
            ControlFlow::Continue(())
        }
    }
}

// ── Chunk decode ───────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct StreamChunk {
    id: Option<String>,
    choices: Option<Vec<StreamChoice>>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

/// Decoded fields of one structured delta.
#[derive(Debug, PartialEq, Eq)]
struct ParsedDelta {
    provider_id: Option<String>,
    content: Option<String>,
}

/// Decode one `data:` payload. A payload that is valid JSON but carries no
/// delta content decodes to an empty [`ParsedDelta`], not an error.
fn parse_delta(data: &str) -> Result<ParsedDelta, FramingError> {
    let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| FramingError {
        reason: e.to_string(),
        payload: data.to_string(),
    })?;
    let content = chunk
        .choices
        .and_then(|choices| choices.into_iter().next())
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content);
    Ok(ParsedDelta {
        provider_id: chunk.id,
        content,
    })
}

// ── Line buffering ─────────────────────────────────────────────────

/// Reassembles newline-delimited sub-messages from arbitrarily split
/// network chunks.
struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    fn new() -> Self {
        Self { buf: String::new() }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
    }

    /// The next complete line, trimmed, if one is buffered.
    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.find('\n')?;
        let line: String = self.buf.drain(..=pos).collect();
        Some(line.trim().to_string())
    }

    /// Whatever trails the final newline, trimmed.
    fn take_remainder(&mut self) -> String {
        std::mem::take(&mut self.buf).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MODEL;

    #[test]
    fn parse_delta_extracts_content_and_id() {
        let data = r#"{"id":"chatcmpl-42","choices":[{"delta":{"content":"Hel"}}]}"#;
        let parsed = parse_delta(data).unwrap();
        assert_eq!(parsed.provider_id.as_deref(), Some("chatcmpl-42"));
        assert_eq!(parsed.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn parse_delta_tolerates_missing_content() {
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        let parsed = parse_delta(data).unwrap();
        assert!(parsed.content.is_none());
    }

    #[test]
    fn parse_delta_rejects_garbage() {
        let err = parse_delta("{not json at all").unwrap_err();
        assert_eq!(err.payload, "{not json at all");
    }

    #[test]
    fn line_buffer_reassembles_split_lines() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"data: {\"id\":");
        assert!(buffer.next_line().is_none());
        buffer.push(b"\"x\"}\ndata: [DO");
        assert_eq!(buffer.next_line().as_deref(), Some("data: {\"id\":\"x\"}"));
        assert!(buffer.next_line().is_none());
        buffer.push(b"NE]\n");
        assert_eq!(buffer.next_line().as_deref(), Some("data: [DONE]"));
    }

    #[test]
    fn line_buffer_yields_trailing_remainder() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"data: tail-without-newline");
        assert!(buffer.next_line().is_none());
        assert_eq!(buffer.take_remainder(), "data: tail-without-newline");
        assert_eq!(buffer.take_remainder(), "");
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_before_io() {
        let client = OpenAiClient::new("sk-test", DEFAULT_MODEL)
            .unwrap()
            .with_base_url("http://127.0.0.1:1/v1");
        let err = client.stream(vec![], 256).await.unwrap_err();
        assert!(matches!(err, CompletionError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unreachable_provider_is_a_transport_error() {
        let client = OpenAiClient::new("sk-test", DEFAULT_MODEL)
            .unwrap()
            .with_base_url("http://127.0.0.1:1/v1");
        let err = client
            .stream(vec![PromptMessage::user("hi")], 256)
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Transport(_)));
    }
}
