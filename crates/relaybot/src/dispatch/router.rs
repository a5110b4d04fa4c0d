//! Routing of dequeued events through the dispatch engine to the
//! messaging API.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{ApiError, MessagingApi, OutboundMessage, ReplyTarget, StreamChunk, StreamReceipt};
use crate::gateway::{EventHandler, QueuedEvent};
use crate::reply::{ChunkSink, PacerConfig, ReplyDecision, ReplyRateLimiter, StreamPacer};

/// User-visible notice when the engine does not answer in time.
const TIMEOUT_NOTICE: &str = "The reply took too long to generate. Please try again.";

/// User-visible notice when the engine fails outright on a plain turn.
const FAILURE_NOTICE: &str = "Something went wrong while generating a reply.";

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("send failed: {0}")]
    Send(#[from] ApiError),
}

/// Consumes inbound events: one engine call per event, raced against the
/// generation timeout, with streaming or plain delivery.
pub struct MessageRouter {
    api: Arc<dyn MessagingApi>,
    engine: Arc<dyn super::DispatchEngine>,
    limiter: Arc<ReplyRateLimiter>,
    generation_timeout: Duration,
    pacer_config: PacerConfig,
}

impl MessageRouter {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        engine: Arc<dyn super::DispatchEngine>,
        limiter: Arc<ReplyRateLimiter>,
        generation_timeout: Duration,
        pacer_config: PacerConfig,
    ) -> Self {
        Self {
            api,
            engine,
            limiter,
            generation_timeout,
            pacer_config,
        }
    }

    async fn process(&self, event: QueuedEvent) -> Result<(), RouterError> {
        let target = event.reply_target();

        // A streaming turn consumes its passive-reply allowance up front:
        // every chunk binds to the same inbound id, so the quota question
        // is per turn, not per chunk.
        let pacer = if self.api.supports_streaming(&target) {
            match self.limiter.check(&event.event_id) {
                ReplyDecision::Allowed { remaining } => {
                    debug!(
                        event_id = %event.event_id,
                        remaining,
                        "Streaming reply turn"
                    );
                    self.limiter.record(&event.event_id);
                    let sink = Arc::new(ApiChunkSink {
                        api: Arc::clone(&self.api),
                        target: target.clone(),
                        reply_to: event.event_id.clone(),
                    });
                    Some(StreamPacer::new(sink, self.pacer_config.clone()))
                }
                ReplyDecision::Denied { reason } => {
                    debug!(
                        event_id = %event.event_id,
                        reason = ?reason,
                        "Passive quota unavailable, turn will deliver proactively"
                    );
                    None
                }
            }
        } else {
            None
        };

        let (partial_tx, mut partial_rx) = mpsc::channel::<String>(32);

        let outcome = tokio::time::timeout(self.generation_timeout, async {
            let mut respond_fut = pin!(self.engine.respond(&event, partial_tx));
            let mut partials_done = false;
            loop {
                tokio::select! {
                    result = &mut respond_fut => break result,
                    maybe = partial_rx.recv(), if !partials_done => {
                        match maybe {
                            Some(text) => {
                                if let Some(pacer) = &pacer {
                                    let _ = pacer.update(&text).await;
                                }
                            }
                            None => partials_done = true,
                        }
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(final_text)) => {
                if let Some(pacer) = &pacer {
                    let _ = pacer.update(&final_text).await;
                    let _ = pacer.finish().await;
                } else {
                    self.deliver_plain(&event, &target, &final_text).await?;
                }
            }
            Ok(Err(e)) => {
                warn!(event_id = %event.event_id, error = %e, "Dispatch engine failed");
                if let Some(pacer) = &pacer {
                    let _ = pacer.fail("reply generation failed").await;
                } else {
                    self.deliver_plain(&event, &target, FAILURE_NOTICE).await?;
                }
            }
            Err(_elapsed) => {
                warn!(
                    event_id = %event.event_id,
                    timeout_secs = self.generation_timeout.as_secs(),
                    "Generation timed out, sending degraded notice"
                );
                // Anything partially streamed is finalized exactly once;
                // a second finalize would report Ended and send nothing.
                if let Some(pacer) = &pacer {
                    let _ = pacer.fail(TIMEOUT_NOTICE).await;
                } else {
                    self.deliver_plain(&event, &target, TIMEOUT_NOTICE).await?;
                }
            }
        }

        Ok(())
    }

    /// One full-text send: passive reply while the quota holds, otherwise
    /// a transparent proactive fallback. Quota outcomes are never surfaced
    /// to the user as errors.
    async fn deliver_plain(
        &self,
        event: &QueuedEvent,
        target: &ReplyTarget,
        text: &str,
    ) -> Result<(), RouterError> {
        let message = OutboundMessage::text(text);
        match self.limiter.check(&event.event_id) {
            ReplyDecision::Allowed { .. } => {
                self.api
                    .send_reply(target, &event.event_id, &message)
                    .await?;
                self.limiter.record(&event.event_id);
            }
            ReplyDecision::Denied { reason } => {
                info!(
                    event_id = %event.event_id,
                    reason = ?reason,
                    "Falling back to proactive send"
                );
                self.api.send_proactive(target, &message).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for MessageRouter {
    type Error = RouterError;

    async fn handle(&self, event: QueuedEvent) -> Result<(), RouterError> {
        self.process(event).await
    }
}

/// Adapts the messaging API's chunk-send call to one turn's stream.
struct ApiChunkSink {
    api: Arc<dyn MessagingApi>,
    target: ReplyTarget,
    reply_to: String,
}

#[async_trait]
impl ChunkSink for ApiChunkSink {
    async fn send(&self, chunk: StreamChunk) -> Result<StreamReceipt, ApiError> {
        self.api
            .send_stream_chunk(&self.target, &self.reply_to, &chunk)
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChunkKind, MessageReceipt};
    use crate::dispatch::{DispatchEngine, DispatchError};
    use crate::gateway::InboundKind;
    use std::sync::Mutex as StdMutex;

    // ── Fakes ───────────────────────────────────────────────────────────

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Reply { reply_to: String, content: String },
        Proactive { content: String },
        Chunk { content: String, kind: ChunkKind },
    }

    struct FakeApi {
        sent: StdMutex<Vec<Sent>>,
        streaming: bool,
    }

    impl FakeApi {
        fn new(streaming: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                streaming,
            })
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingApi for FakeApi {
        async fn send_reply(
            &self,
            _target: &ReplyTarget,
            reply_to: &str,
            message: &OutboundMessage,
        ) -> Result<MessageReceipt, ApiError> {
            self.sent.lock().unwrap().push(Sent::Reply {
                reply_to: reply_to.to_string(),
                content: message.content.clone(),
            });
            Ok(MessageReceipt {
                message_id: "out-1".to_string(),
            })
        }

        async fn send_proactive(
            &self,
            _target: &ReplyTarget,
            message: &OutboundMessage,
        ) -> Result<MessageReceipt, ApiError> {
            self.sent.lock().unwrap().push(Sent::Proactive {
                content: message.content.clone(),
            });
            Ok(MessageReceipt {
                message_id: "out-2".to_string(),
            })
        }

        async fn send_stream_chunk(
            &self,
            _target: &ReplyTarget,
            _reply_to: &str,
            chunk: &StreamChunk,
        ) -> Result<StreamReceipt, ApiError> {
            self.sent.lock().unwrap().push(Sent::Chunk {
                content: chunk.content.clone(),
                kind: chunk.kind,
            });
            Ok(StreamReceipt {
                stream_id: "st-1".to_string(),
            })
        }

        fn supports_streaming(&self, _target: &ReplyTarget) -> bool {
            self.streaming
        }
    }

    enum Script {
        Deliver { partials: Vec<&'static str>, final_text: &'static str },
        Fail,
        Hang,
    }

    struct ScriptedEngine(Script);

    #[async_trait]
    impl DispatchEngine for ScriptedEngine {
        async fn respond(
            &self,
            _event: &QueuedEvent,
            partials: mpsc::Sender<String>,
        ) -> Result<String, DispatchError> {
            match &self.0 {
                Script::Deliver {
                    partials: steps,
                    final_text,
                } => {
                    for step in steps {
                        let _ = partials.send((*step).to_string()).await;
                    }
                    Ok((*final_text).to_string())
                }
                Script::Fail => Err(DispatchError::Generation("boom".to_string())),
                Script::Hang => {
                    drop(partials);
                    futures::future::pending().await
                }
            }
        }
    }

    fn event(id: &str) -> QueuedEvent {
        QueuedEvent {
            kind: InboundKind::Direct,
            sender_id: "u1".to_string(),
            sender_name: None,
            content: "hi".to_string(),
            event_id: id.to_string(),
            timestamp: chrono::Utc::now(),
            group_id: None,
            channel_id: None,
            guild_id: None,
            attachments: Vec::new(),
        }
    }

    fn router(api: Arc<FakeApi>, script: Script) -> MessageRouter {
        MessageRouter::new(
            api,
            Arc::new(ScriptedEngine(script)),
            Arc::new(ReplyRateLimiter::new(5, Duration::from_secs(300))),
            Duration::from_secs(60),
            PacerConfig::default(),
        )
    }

    // ── Plain path ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn non_streaming_target_gets_one_passive_reply() {
        let api = FakeApi::new(false);
        let r = router(
            Arc::clone(&api),
            Script::Deliver {
                partials: vec!["partial"],
                final_text: "final answer",
            },
        );

        r.process(event("msg-1")).await.unwrap();

        assert_eq!(
            api.sent(),
            vec![Sent::Reply {
                reply_to: "msg-1".to_string(),
                content: "final answer".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn exhausted_quota_falls_back_to_proactive() {
        let api = FakeApi::new(false);
        let limiter = Arc::new(ReplyRateLimiter::new(1, Duration::from_secs(300)));
        limiter.record("msg-1");
        let r = MessageRouter::new(
            Arc::clone(&api) as Arc<dyn MessagingApi>,
            Arc::new(ScriptedEngine(Script::Deliver {
                partials: vec![],
                final_text: "answer",
            })),
            limiter,
            Duration::from_secs(60),
            PacerConfig::default(),
        );

        r.process(event("msg-1")).await.unwrap();

        assert_eq!(
            api.sent(),
            vec![Sent::Proactive {
                content: "answer".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn engine_failure_sends_degraded_notice() {
        let api = FakeApi::new(false);
        let r = router(Arc::clone(&api), Script::Fail);

        r.process(event("msg-1")).await.unwrap();

        let sent = api.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Reply { content, .. } if content == FAILURE_NOTICE));
    }

    // ── Streaming path ──────────────────────────────────────────────────

    #[tokio::test]
    async fn streaming_turn_chunks_then_done() {
        let api = FakeApi::new(true);
        let r = router(
            Arc::clone(&api),
            Script::Deliver {
                partials: vec!["Hello"],
                final_text: "Hello, world",
            },
        );

        r.process(event("msg-1")).await.unwrap();

        let sent = api.sent();
        assert_eq!(
            sent[0],
            Sent::Chunk {
                content: "Hello".to_string(),
                kind: ChunkKind::Content,
            }
        );
        assert_eq!(
            sent.last().unwrap(),
            &Sent::Chunk {
                content: ", world".to_string(),
                kind: ChunkKind::Done,
            }
        );
    }

    #[tokio::test]
    async fn streaming_engine_failure_annotates_the_stream() {
        let api = FakeApi::new(true);
        let r = router(Arc::clone(&api), Script::Fail);

        r.process(event("msg-1")).await.unwrap();

        let sent = api.sent();
        let Sent::Chunk { content, kind } = sent.last().unwrap() else {
            panic!("expected a terminal chunk");
        };
        assert_eq!(*kind, ChunkKind::Done);
        assert!(content.contains("reply generation failed"));
    }

    #[tokio::test]
    async fn streaming_turn_consumes_one_quota_slot() {
        let api = FakeApi::new(true);
        let limiter = Arc::new(ReplyRateLimiter::new(5, Duration::from_secs(300)));
        let r = MessageRouter::new(
            Arc::clone(&api) as Arc<dyn MessagingApi>,
            Arc::new(ScriptedEngine(Script::Deliver {
                partials: vec![],
                final_text: "hi",
            })),
            Arc::clone(&limiter),
            Duration::from_secs(60),
            PacerConfig::default(),
        );

        r.process(event("msg-1")).await.unwrap();

        assert_eq!(
            limiter.check("msg-1"),
            ReplyDecision::Allowed { remaining: 4 }
        );
    }

    // ── Timeout path ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn hung_engine_times_out_with_notice() {
        let api = FakeApi::new(false);
        let r = router(Arc::clone(&api), Script::Hang);

        r.process(event("msg-1")).await.unwrap();

        let sent = api.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Reply { content, .. } if content == TIMEOUT_NOTICE));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_engine_on_streaming_turn_finalizes_once() {
        let api = FakeApi::new(true);
        let r = router(Arc::clone(&api), Script::Hang);

        r.process(event("msg-1")).await.unwrap();

        let sent = api.sent();
        let done_count = sent
            .iter()
            .filter(|s| matches!(s, Sent::Chunk { kind: ChunkKind::Done, .. }))
            .count();
        assert_eq!(done_count, 1, "exactly one terminal chunk");
        let Sent::Chunk { content, .. } = sent.last().unwrap() else {
            panic!("expected terminal chunk");
        };
        assert!(content.contains(TIMEOUT_NOTICE));
    }
}
