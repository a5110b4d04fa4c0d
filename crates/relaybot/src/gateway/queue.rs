//! Bounded inbound queue between the wire handler and the consumer loop.
//!
//! The wire handler must never stall behind message processing — a late
//! heartbeat costs the whole connection, a dropped chat message costs one
//! reply. Enqueue is therefore non-blocking: when the queue is full the
//! oldest item is discarded with a warning.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::event::QueuedEvent;

// ============================================================================
// EventHandler
// ============================================================================

/// Processes one dequeued event. Failures are isolated per item: the
/// consumer logs them and moves on.
#[async_trait]
pub trait EventHandler: Send + Sync {
    type Error: std::fmt::Display;

    async fn handle(&self, event: QueuedEvent) -> Result<(), Self::Error>;
}

// ============================================================================
// InboundQueue
// ============================================================================

/// Fixed-capacity FIFO with drop-oldest overflow.
#[derive(Clone)]
pub struct InboundQueue {
    inner: Arc<Mutex<VecDeque<QueuedEvent>>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            notify: Arc::new(Notify::new()),
            capacity,
        }
    }

    /// Enqueue without blocking. Returns `false` when the oldest item was
    /// dropped to make room.
    pub async fn push(&self, event: QueuedEvent) -> bool {
        let mut queue = self.inner.lock().await;
        let mut fit = true;
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    event_id = %dropped.event_id,
                    capacity = self.capacity,
                    "Inbound queue full, dropping oldest event"
                );
            }
            fit = false;
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
        fit
    }

    /// Dequeue the next event, waiting while the queue is empty.
    pub async fn pop(&self) -> QueuedEvent {
        loop {
            if let Some(event) = self.inner.lock().await.pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

// ============================================================================
// Consumer loop
// ============================================================================

/// Spawn the single consumer loop for `queue`.
///
/// Runs until `cancel` fires. One item at a time; a handler failure is
/// logged and the loop continues with the next item.
pub fn spawn_consumer<H>(
    queue: InboundQueue,
    handler: Arc<H>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    H: EventHandler + 'static,
{
    tokio::spawn(async move {
        debug!("Inbound queue consumer started");
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = queue.pop() => event,
            };

            let event_id = event.event_id.clone();
            if let Err(e) = handler.handle(event).await {
                error!(event_id = %event_id, error = %e, "Event processing failed");
            }
        }
        debug!("Inbound queue consumer stopped");
    })
}
