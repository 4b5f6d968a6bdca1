//! Per-request completion pipeline: relay and reply persistence.
//!
//! One task per request reads a single provider event sequence and does two
//! things with it, in order and without buffering: forwards each text delta
//! to the client as one SSE frame, and appends it to a request-scoped
//! accumulator. When the terminal sentinel arrives, exactly one `assistant`
//! message is written to the store and the `[DONE]` frame is emitted. A
//! request that ends any other way (client disconnect, transport failure)
//! persists nothing.
//!
//! Everything about an in-flight request lives in this task: the
//! accumulator, the generated reply id, and the teardown guard. Nothing is
//! shared across requests.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::MessageRole;
use crate::api::streaming::{CompletionStream, StreamEvent};
use crate::error::CompletionError;
use crate::prompt::PromptBudgeter;
use crate::store::{ConversationStore, NewMessage};
use crate::tokens::TokenCounter;
use crate::OpenAiClient;

// ── Wire format ────────────────────────────────────────────────────

/// Default event name for relayed fragments.
pub const MESSAGE_EVENT: &str = "message";

/// Event name for a terminal pipeline error.
pub const ERROR_EVENT: &str = "error";

/// Terminal payload signalling stream completion to the client.
pub const DONE_PAYLOAD: &str = "[DONE]";

/// Outbound frame stream handed to the HTTP layer.
pub type FrameStream = ReceiverStream<SseFrame>;

/// One outbound server-sent event: a named event plus a one-line payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: String,
}

impl SseFrame {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: MESSAGE_EVENT,
            data: data.into(),
        }
    }

    pub fn done() -> Self {
        Self::message(DONE_PAYLOAD)
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self {
            event: ERROR_EVENT,
            data: data.into(),
        }
    }

    /// Exact wire bytes: `event: <name>\ndata: <payload>\n\n`.
    pub fn render(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

// ── Request-scoped state ───────────────────────────────────────────

/// Accumulator for the reply being generated. The id is generated here,
/// independently of the provider's id, and becomes the persisted message id.
struct PendingReply {
    id: String,
    text: String,
}

impl PendingReply {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: String::new(),
        }
    }

    fn push(&mut self, delta: &str) {
        self.text.push_str(delta);
    }
}

/// Idempotent teardown guard. `close` logs and transitions exactly once,
/// even when cancellation races natural completion; the drop hook covers
/// abnormal exits.
struct RelayGuard {
    conversation_id: String,
    closed: bool,
}

impl RelayGuard {
    fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            closed: false,
        }
    }

    /// Returns true only on the first invocation.
    fn close(&mut self, reason: &'static str) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        debug!(conversation_id = %self.conversation_id, reason, "relay closed");
        true
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.close("dropped");
    }
}

/// What one relay run did, for logging and tests.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RelaySummary {
    /// Id of the persisted reply, when the terminal sentinel was reached
    /// and the store write succeeded.
    pub persisted: Option<String>,
    pub reason: &'static str,
    /// Number of state transitions the teardown guard performed.
    pub cleanups: u32,
}

// ── Pipeline ───────────────────────────────────────────────────────

/// The per-request completion pipeline.
///
/// [`run`](Self::run) performs the whole flow for one request: fetch
/// history, budget the prompt, open the provider stream, and hand the
/// event sequence to a relay task whose output is the SSE frame stream.
pub struct CompletionPipeline {
    store: Arc<dyn ConversationStore>,
    client: Arc<OpenAiClient>,
    counter: Arc<TokenCounter>,
}

impl CompletionPipeline {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: Arc<OpenAiClient>,
        counter: Arc<TokenCounter>,
    ) -> Self {
        Self {
            store,
            client,
            counter,
        }
    }

    /// Run one completion request, returning the outbound frame stream.
    ///
    /// Fails before contacting the provider when the conversation cannot be
    /// read or the prompt cannot fit its budget. After this returns, all
    /// failures surface in-band as one terminal `error` frame.
    pub async fn run(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<FrameStream, CompletionError> {
        let history = self.store.history(owner_id, conversation_id).await?;
        let plan = PromptBudgeter::new(&self.counter).build(owner_id, &history)?;
        let events = self.client.stream(plan.messages, plan.response_budget).await?;

        let (tx, rx) = mpsc::channel(16);
        let store = Arc::clone(&self.store);
        let owner_id = owner_id.to_string();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            relay(events, tx, store, &owner_id, &conversation_id).await;
        });
        Ok(ReceiverStream::new(rx))
    }
}

/// Relay loop: provider events in, SSE frames out, one persisted reply on
/// the terminal sentinel.
pub(crate) async fn relay(
    mut events: CompletionStream,
    tx: mpsc::Sender<SseFrame>,
    store: Arc<dyn ConversationStore>,
    owner_id: &str,
    conversation_id: &str,
) -> RelaySummary {
    let mut reply = PendingReply::new();
    let mut guard = RelayGuard::new(conversation_id);
    let mut cleanups = 0u32;

    loop {
        // Watching the outbound channel makes a client disconnect stop the
        // relay promptly; dropping `events` unsubscribes from the provider.
        let event = tokio::select! {
            _ = tx.closed() => {
                cleanups += guard.close("client disconnected") as u32;
                return RelaySummary { persisted: None, reason: "client disconnected", cleanups };
            }
            event = events.next() => event,
        };

        match event {
            Some(Ok(StreamEvent::Started { provider_id })) => {
                debug!(%provider_id, reply_id = %reply.id, "provider stream started");
            }
            Some(Ok(StreamEvent::TextDelta(delta))) => {
                reply.push(&delta);
                if tx.send(SseFrame::message(delta)).await.is_err() {
                    cleanups += guard.close("client disconnected") as u32;
                    return RelaySummary {
                        persisted: None,
                        reason: "client disconnected",
                        cleanups,
                    };
                }
            }
            Some(Ok(StreamEvent::Done)) => {
                let persisted = match store
                    .insert_message(NewMessage {
                        id: &reply.id,
                        role: MessageRole::Assistant,
                        content: &reply.text,
                        owner_id,
                        conversation_id,
                    })
                    .await
                {
                    Ok(saved) => {
                        info!(
                            message_id = %saved.id,
                            conversation_id,
                            chars = saved.content.len(),
                            "assistant reply persisted"
                        );
                        let _ = tx.send(SseFrame::done()).await;
                        Some(saved.id)
                    }
                    Err(e) => {
                        // The client already saw the full reply; report the
                        // fault in-band instead of crashing the process.
                        error!(error = %e, conversation_id, "failed to persist assistant reply");
                        let _ = tx.send(SseFrame::error("failed to persist reply")).await;
                        None
                    }
                };
                cleanups += guard.close("stream complete") as u32;
                return RelaySummary {
                    persisted,
                    reason: "stream complete",
                    cleanups,
                };
            }
            Some(Err(e)) => {
                error!(error = %e, conversation_id, "provider stream failed");
                let _ = tx.send(SseFrame::error(e.to_string())).await;
                cleanups += guard.close("transport error") as u32;
                return RelaySummary {
                    persisted: None,
                    reason: "transport error",
                    cleanups,
                };
            }
            None => {
                // Producer vanished without a terminal event.
                let _ = tx
                    .send(SseFrame::error("provider stream ended unexpectedly"))
                    .await;
                cleanups += guard.close("stream ended") as u32;
                return RelaySummary {
                    persisted: None,
                    reason: "stream ended",
                    cleanups,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConversationStore, MemoryStore};

    /// Scripted provider stream plus the relay wiring around it.
    async fn run_relay(
        events: Vec<Result<StreamEvent, CompletionError>>,
        store: Arc<dyn ConversationStore>,
        conversation_id: &str,
    ) -> (Vec<SseFrame>, RelaySummary) {
        let (event_tx, event_rx) = mpsc::channel(32);
        for event in events {
            event_tx.send(event).await.unwrap();
        }
        drop(event_tx);

        let (frame_tx, mut frame_rx) = mpsc::channel(32);
        let summary = relay(
            ReceiverStream::new(event_rx),
            frame_tx,
            store,
            "owner-1",
            conversation_id,
        )
        .await;

        let mut frames = Vec::new();
        while let Ok(frame) = frame_rx.try_recv() {
            frames.push(frame);
        }
        (frames, summary)
    }

    #[test]
    fn frame_render_is_bit_exact() {
        assert_eq!(
            SseFrame::message("Hello").render(),
            "event: message\ndata: Hello\n\n"
        );
        assert_eq!(SseFrame::done().render(), "event: message\ndata: [DONE]\n\n");
        assert_eq!(SseFrame::error("boom").render(), "event: error\ndata: boom\n\n");
    }

    #[tokio::test]
    async fn fragments_concatenate_and_persist_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let conversation = store.create_conversation("owner-1", "chat").await.unwrap();

        let (frames, summary) = run_relay(
            vec![
                Ok(StreamEvent::Started {
                    provider_id: "chatcmpl-1".into(),
                }),
                Ok(StreamEvent::TextDelta("Hel".into())),
                Ok(StreamEvent::TextDelta("lo".into())),
                Ok(StreamEvent::TextDelta(" world".into())),
                Ok(StreamEvent::Done),
            ],
            store.clone(),
            &conversation.id,
        )
        .await;

        assert_eq!(frames.len(), 4, "three deltas plus the terminal frame");
        assert_eq!(frames[0], SseFrame::message("Hel"));
        assert_eq!(frames[3], SseFrame::done());

        let history = store.history("owner-1", &conversation.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Hello world");
        assert_eq!(history[0].role, MessageRole::Assistant);
        assert_eq!(summary.persisted.as_deref(), Some(history[0].id.as_str()));
        assert_eq!(summary.cleanups, 1);
    }

    #[tokio::test]
    async fn cancellation_persists_nothing_and_cleans_up_once() {
        let store = Arc::new(MemoryStore::new());
        let conversation = store.create_conversation("owner-1", "chat").await.unwrap();

        let (event_tx, event_rx) = mpsc::channel(8);
        event_tx
            .send(Ok(StreamEvent::TextDelta("partial".into())))
            .await
            .unwrap();

        let (frame_tx, frame_rx) = mpsc::channel::<SseFrame>(8);
        // The client goes away before any terminator arrives.
        drop(frame_rx);

        let summary = relay(
            ReceiverStream::new(event_rx),
            frame_tx,
            store.clone(),
            "owner-1",
            &conversation.id,
        )
        .await;

        assert_eq!(summary.reason, "client disconnected");
        assert_eq!(summary.cleanups, 1);
        assert!(summary.persisted.is_none());
        assert!(
            store
                .history("owner-1", &conversation.id)
                .await
                .unwrap()
                .is_empty(),
            "no partial reply may be persisted"
        );
    }

    #[tokio::test]
    async fn transport_error_emits_terminal_error_frame() {
        let store = Arc::new(MemoryStore::new());
        let conversation = store.create_conversation("owner-1", "chat").await.unwrap();

        let (frames, summary) = run_relay(
            vec![
                Ok(StreamEvent::TextDelta("Hel".into())),
                Err(CompletionError::Transport("connection reset".into())),
            ],
            store.clone(),
            &conversation.id,
        )
        .await;

        assert_eq!(frames[0], SseFrame::message("Hel"));
        assert_eq!(frames[1].event, ERROR_EVENT);
        assert!(summary.persisted.is_none());
        assert!(
            store
                .history("owner-1", &conversation.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_error_frame() {
        // No conversation created: the insert on Done will fail.
        let store = Arc::new(MemoryStore::new());

        let (frames, summary) = run_relay(
            vec![
                Ok(StreamEvent::TextDelta("Hello!".into())),
                Ok(StreamEvent::Done),
            ],
            store,
            "missing-conversation",
        )
        .await;

        assert_eq!(frames[0], SseFrame::message("Hello!"));
        assert_eq!(frames[1].event, ERROR_EVENT);
        assert!(summary.persisted.is_none());
        assert_eq!(summary.reason, "stream complete");
    }

    #[tokio::test]
    async fn empty_reply_still_persists_on_done() {
        let store = Arc::new(MemoryStore::new());
        let conversation = store.create_conversation("owner-1", "chat").await.unwrap();

        let (frames, summary) = run_relay(
            vec![Ok(StreamEvent::Done)],
            store.clone(),
            &conversation.id,
        )
        .await;

        assert_eq!(frames, vec![SseFrame::done()]);
        assert!(summary.persisted.is_some());
        let history = store.history("owner-1", &conversation.id).await.unwrap();
        assert_eq!(history[0].content, "");
    }
}
