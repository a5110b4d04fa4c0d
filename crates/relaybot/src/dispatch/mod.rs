//! Dispatch boundary: the upstream engine that turns an inbound message
//! into reply text.
//!
//! The engine produces zero or more partial-reply notifications — each
//! carrying the cumulative text of the current logical segment — and
//! exactly one terminal deliver (the full reply) or error per inbound
//! event. The [`router::MessageRouter`] sits between the inbound queue and
//! the engine, and owns what happens to the output: streamed through the
//! pacer where the target supports it, one plain send where it does not,
//! passive reply where quota allows it, proactive fallback where it does
//! not.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::gateway::QueuedEvent;

mod router;

pub use router::{MessageRouter, RouterError};

/// The reply-generation collaborator.
#[async_trait]
pub trait DispatchEngine: Send + Sync {
    /// Generate a reply to `event`.
    ///
    /// Partial notifications go through `partials` as they accumulate; the
    /// return value is the terminal deliver. Implementations send each
    /// partial as the cumulative text of the current segment, not a delta.
    async fn respond(
        &self,
        event: &QueuedEvent,
        partials: mpsc::Sender<String>,
    ) -> Result<String, DispatchError>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("reply generation failed: {0}")]
    Generation(String),
}

/// Reference engine: echoes the inbound text. Lets the binary run end to
/// end without an upstream generator and gives tests a live engine.
pub struct EchoEngine;

#[async_trait]
impl DispatchEngine for EchoEngine {
    async fn respond(
        &self,
        event: &QueuedEvent,
        partials: mpsc::Sender<String>,
    ) -> Result<String, DispatchError> {
        let text = format!("Echo: {}", event.content);
        let _ = partials.send(text.clone()).await;
        Ok(text)
    }
}
