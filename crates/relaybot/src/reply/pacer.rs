//! Streaming reply pacer.
//!
//! The transport has no real streaming: each "chunk" is one network call,
//! and the generator feed is irregular — notifications carry the cumulative
//! text of the current logical segment, and a new segment can start with an
//! unrelated, shorter buffer. The pacer turns that feed into a well-formed
//! chunk sequence: immediate first send, minimum spacing after that,
//! keepalives while the generator is quiet, and a hard cap on the lifetime
//! of the whole stream.
//!
//! Exactly one network call is ever in flight per pacer. A notification
//! that arrives mid-flight lands in a single pending slot (later arrivals
//! supersede earlier ones) and is folded in when the flight completes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ApiError, ChunkKind, StreamChunk, StreamReceipt};

/// Characters of the sent prefix compared when deciding whether a
/// notification starts a new segment.
const RESET_PREFIX_CHARS: usize = 10;

/// Granularity of the driver task that flushes buffered content and
/// schedules keepalives.
const DRIVER_TICK: Duration = Duration::from_millis(200);

// ============================================================================
// Boundary
// ============================================================================

/// The single-shot chunk-send primitive the pacer paces.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send(&self, chunk: StreamChunk) -> Result<StreamReceipt, ApiError>;
}

// ============================================================================
// Config and context
// ============================================================================

#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Minimum spacing between sends after the first.
    pub min_send_interval: Duration,
    /// Silence after the last content chunk before the first keepalive.
    pub keepalive_initial: Duration,
    /// Gap between consecutive keepalives.
    pub keepalive_gap: Duration,
    /// Consecutive keepalives allowed since the last content chunk.
    pub max_keepalives: u32,
    /// Hard cap on the stream's lifetime, measured from the first send.
    pub max_stream_duration: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_send_interval: Duration::from_millis(1000),
            keepalive_initial: Duration::from_millis(4000),
            keepalive_gap: Duration::from_millis(8000),
            max_keepalives: 5,
            max_stream_duration: Duration::from_secs(90),
        }
    }
}

impl From<&crate::config::StreamConfig> for PacerConfig {
    fn from(cfg: &crate::config::StreamConfig) -> Self {
        Self {
            min_send_interval: cfg.min_send_interval(),
            keepalive_initial: cfg.keepalive_initial(),
            keepalive_gap: cfg.keepalive_gap(),
            max_keepalives: cfg.max_keepalives,
            max_stream_duration: cfg.max_stream_duration(),
        }
    }
}

/// Where one stream stands: chunk index, server stream id, terminal flag.
/// Immutable once `ended` is set.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub index: u32,
    pub stream_id: Option<String>,
    pub ended: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacerError {
    #[error("stream already ended")]
    Ended,
}

// ============================================================================
// StreamPacer
// ============================================================================

struct Inner {
    /// Frozen segments (at their send offsets) plus separators.
    transcript: String,
    /// Cumulative text of the live segment, as last notified.
    segment: String,
    /// Characters of `segment` already sent.
    sent_chars: usize,
    context: StreamContext,
    /// Notification that arrived while a send was in flight.
    pending: Option<String>,
    sending: bool,
    started_at: Option<Instant>,
    last_send_at: Option<Instant>,
    last_content_at: Option<Instant>,
    keepalives_since_content: u32,
}

struct Shared {
    config: PacerConfig,
    sink: Arc<dyn ChunkSink>,
    inner: Mutex<Inner>,
    /// Signalled whenever an in-flight send completes.
    send_done: Notify,
}

/// Paces one conversation turn's streamed reply. One instance per turn.
pub struct StreamPacer {
    shared: Arc<Shared>,
    driver: tokio::task::JoinHandle<()>,
}

impl StreamPacer {
    pub fn new(sink: Arc<dyn ChunkSink>, config: PacerConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            sink,
            inner: Mutex::new(Inner {
                transcript: String::new(),
                segment: String::new(),
                sent_chars: 0,
                context: StreamContext::default(),
                pending: None,
                sending: false,
                started_at: None,
                last_send_at: None,
                last_content_at: None,
                keepalives_since_content: 0,
            }),
            send_done: Notify::new(),
        });
        let driver = tokio::spawn(run_driver(Arc::clone(&shared)));
        Self { shared, driver }
    }

    /// Feed one partial-update notification: the cumulative text of the
    /// current logical segment.
    pub async fn update(&self, text: &str) -> Result<(), PacerError> {
        let send_now = {
            let mut inner = self.shared.inner.lock().await;
            if inner.context.ended {
                return Err(PacerError::Ended);
            }
            if inner.sending {
                inner.pending = Some(text.to_string());
                return Ok(());
            }
            apply_notification(&mut inner, text);

            if inner.started_at.is_none() {
                inner.started_at = Some(Instant::now());
                true
            } else {
                inner
                    .last_send_at
                    .is_none_or(|t| t.elapsed() >= self.shared.config.min_send_interval)
            }
        };

        if send_now {
            send_content(&self.shared).await;
        }
        Ok(())
    }

    /// Normal end: flush the unsent remainder of the current segment and
    /// send the terminal marker. A second call reports [`PacerError::Ended`]
    /// without touching the network.
    pub async fn finish(&self) -> Result<(), PacerError> {
        finalize(&self.shared, None).await
    }

    /// Error-path end: like [`Self::finish`], with an inline error
    /// annotation appended to the flushed text.
    pub async fn fail(&self, note: &str) -> Result<(), PacerError> {
        finalize(&self.shared, Some(note)).await
    }

    /// Snapshot of the stream context.
    pub async fn context(&self) -> StreamContext {
        self.shared.inner.lock().await.context.clone()
    }

    /// The logical transcript: frozen segments plus the sent part of the
    /// live segment (plus, after the end, the flushed remainder).
    pub async fn transcript(&self) -> String {
        let inner = self.shared.inner.lock().await;
        if inner.context.ended {
            inner.transcript.clone()
        } else {
            let sent: String = inner.segment.chars().take(inner.sent_chars).collect();
            format!("{}{}", inner.transcript, sent)
        }
    }
}

impl Drop for StreamPacer {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ============================================================================
// Notification handling
// ============================================================================

/// Fold a notification into the live segment, detecting segment resets.
///
/// A notification is a new segment when previously-sent text is non-empty
/// and the new text is either shorter than what was sent or disagrees on
/// the first `min(RESET_PREFIX_CHARS, sent)` characters. The rule is
/// best-effort; a short unrelated continuation can be misread either way.
fn apply_notification(inner: &mut Inner, text: &str) {
    if inner.sent_chars > 0 {
        let new_chars = text.chars().count();
        let prefix_len = inner.sent_chars.min(RESET_PREFIX_CHARS);
        let prefix_matches = text
            .chars()
            .take(prefix_len)
            .eq(inner.segment.chars().take(prefix_len));

        if new_chars < inner.sent_chars || !prefix_matches {
            // Freeze the prior segment at its send offset.
            let sent: String = inner.segment.chars().take(inner.sent_chars).collect();
            inner.transcript.push_str(&sent);
            if !inner.transcript.ends_with("\n\n") {
                inner.transcript.push_str("\n\n");
            }
            inner.sent_chars = 0;
            debug!("Segment reset detected in stream feed");
        }
    }
    inner.segment = text.to_string();
}

// ============================================================================
// Send paths
// ============================================================================

/// Send the unsent remainder of the live segment as one content chunk.
async fn send_content(shared: &Shared) {
    let (chunk, delta_chars) = {
        let mut inner = shared.inner.lock().await;
        if inner.context.ended || inner.sending {
            return;
        }
        let delta: String = inner.segment.chars().skip(inner.sent_chars).collect();
        if delta.is_empty() {
            return;
        }
        inner.sending = true;
        let delta_chars = delta.chars().count();
        (
            StreamChunk {
                content: delta,
                index: inner.context.index,
                stream_id: inner.context.stream_id.clone(),
                kind: ChunkKind::Content,
            },
            delta_chars,
        )
    };

    let result = shared.sink.send(chunk).await;

    let mut inner = shared.inner.lock().await;
    inner.sending = false;
    let now = Instant::now();
    match result {
        Ok(receipt) => {
            inner.context.stream_id.get_or_insert(receipt.stream_id);
            inner.context.index += 1;
            inner.sent_chars += delta_chars;
            inner.last_send_at = Some(now);
            inner.last_content_at = Some(now);
            inner.keepalives_since_content = 0;
        }
        Err(e) => {
            // Keep the send offset so the next tick retries this delta;
            // the stream duration cap bounds how long that can go on.
            warn!(error = %e, "Stream content chunk failed");
            inner.last_send_at = Some(now);
        }
    }
    if let Some(text) = inner.pending.take() {
        apply_notification(&mut inner, &text);
    }
    drop(inner);
    shared.send_done.notify_waiters();
}

/// Send one zero-content keepalive chunk.
async fn send_keepalive(shared: &Shared) {
    let chunk = {
        let mut inner = shared.inner.lock().await;
        if inner.context.ended || inner.sending {
            return;
        }
        inner.sending = true;
        StreamChunk {
            content: String::new(),
            index: inner.context.index,
            stream_id: inner.context.stream_id.clone(),
            kind: ChunkKind::KeepAlive,
        }
    };

    let result = shared.sink.send(chunk).await;

    let mut inner = shared.inner.lock().await;
    inner.sending = false;
    inner.last_send_at = Some(Instant::now());
    inner.keepalives_since_content += 1;
    match result {
        Ok(receipt) => {
            inner.context.stream_id.get_or_insert(receipt.stream_id);
            inner.context.index += 1;
        }
        Err(e) => warn!(error = %e, "Stream keepalive failed"),
    }
    if let Some(text) = inner.pending.take() {
        apply_notification(&mut inner, &text);
    }
    drop(inner);
    shared.send_done.notify_waiters();
}

/// End the stream: claim the terminal state, wait out any in-flight send,
/// then flush the remainder (plus an optional error annotation) with the
/// end marker.
async fn finalize(shared: &Shared, note: Option<&str>) -> Result<(), PacerError> {
    // `ended` is only set while no send is in flight, so the index can
    // never advance afterwards.
    loop {
        {
            let mut inner = shared.inner.lock().await;
            if inner.context.ended {
                return Err(PacerError::Ended);
            }
            if !inner.sending {
                inner.context.ended = true;
                break;
            }
        }
        shared.send_done.notified().await;
    }

    let chunk = {
        let mut inner = shared.inner.lock().await;
        if let Some(text) = inner.pending.take() {
            apply_notification(&mut inner, &text);
        }
        let mut content: String = inner.segment.chars().skip(inner.sent_chars).collect();
        if let Some(note) = note {
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(&format!("[error: {note}]"));
        }

        let sent: String = inner.segment.chars().take(inner.sent_chars).collect();
        inner.transcript.push_str(&sent);
        inner.transcript.push_str(&content);

        StreamChunk {
            content,
            index: inner.context.index,
            stream_id: inner.context.stream_id.clone(),
            kind: ChunkKind::Done,
        }
    };

    if let Err(e) = shared.sink.send(chunk).await {
        warn!(error = %e, "Terminal stream chunk failed");
    }
    shared.send_done.notify_waiters();
    Ok(())
}

// ============================================================================
// Driver
// ============================================================================

/// Background loop: flushes buffered content once the pacing interval
/// allows it, schedules keepalives, and enforces the duration cap.
async fn run_driver(shared: Arc<Shared>) {
    enum Action {
        Idle,
        Flush,
        KeepAlive,
        ForceEnd,
    }

    let mut interval = tokio::time::interval(DRIVER_TICK);
    loop {
        interval.tick().await;

        let action = {
            let inner = shared.inner.lock().await;
            if inner.context.ended {
                break;
            }
            let Some(started_at) = inner.started_at else {
                continue;
            };
            let now = Instant::now();

            if now.duration_since(started_at) >= shared.config.max_stream_duration {
                Action::ForceEnd
            } else if inner.sending {
                Action::Idle
            } else if inner.segment.chars().count() > inner.sent_chars {
                let due = inner
                    .last_send_at
                    .is_none_or(|t| now.duration_since(t) >= shared.config.min_send_interval);
                if due { Action::Flush } else { Action::Idle }
            } else if inner.keepalives_since_content < shared.config.max_keepalives {
                let due_at = if inner.keepalives_since_content == 0 {
                    inner.last_content_at.map(|t| t + shared.config.keepalive_initial)
                } else {
                    inner.last_send_at.map(|t| t + shared.config.keepalive_gap)
                };
                match due_at {
                    Some(at) if now >= at => Action::KeepAlive,
                    _ => Action::Idle,
                }
            } else {
                Action::Idle
            }
        };

        match action {
            Action::Idle => {}
            Action::Flush => send_content(&shared).await,
            Action::KeepAlive => send_keepalive(&shared).await,
            Action::ForceEnd => {
                debug!("Stream duration cap reached, forcing end marker");
                let _ = finalize(&shared, None).await;
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
