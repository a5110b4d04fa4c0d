//! Messaging API boundary.
//!
//! The runtime consumes three operations from the platform's HTTP API:
//! passive-reply send (bound to an inbound message id), proactive send
//! (unprompted, separately quota-limited server-side), and streaming chunk
//! send (the first call returns a server-assigned stream id, later calls
//! carry index + id). Everything the core needs is expressed through the
//! [`MessagingApi`] and [`AccessProvider`] traits; the `http` module holds
//! the thin reqwest-backed implementations.

use async_trait::async_trait;
use thiserror::Error;

mod http;
mod token;

pub use http::HttpMessagingApi;
pub use token::HttpAccessProvider;

// ============================================================================
// Targets and messages
// ============================================================================

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    /// One-to-one conversation with a user.
    Direct { open_id: String },
    /// Group conversation.
    Group { group_open_id: String },
    /// Guild text channel.
    Channel { channel_id: String },
}

impl ReplyTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "c2c",
            Self::Group { .. } => "group",
            Self::Channel { .. } => "channel",
        }
    }
}

/// A complete outbound message body.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub content: String,
    pub image_url: Option<String>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image_url: None,
        }
    }
}

/// Receipt for a completed single-shot send.
#[derive(Debug, Clone)]
pub struct MessageReceipt {
    pub message_id: String,
}

// ============================================================================
// Streaming chunks
// ============================================================================

/// What a chunk contributes to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Incremental content.
    Content,
    /// Zero-content send that only keeps the stream session alive.
    KeepAlive,
    /// Terminal marker; may carry trailing content.
    Done,
}

/// One invocation of the single-shot chunk-send primitive.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content: String,
    /// Position in the stream; assigned by the pacer, strictly increasing.
    pub index: u32,
    /// Server stream id; `None` only on the first chunk of a stream.
    pub stream_id: Option<String>,
    pub kind: ChunkKind,
}

/// Receipt for a chunk send; echoes the server stream id.
#[derive(Debug, Clone)]
pub struct StreamReceipt {
    pub stream_id: String,
}

// ============================================================================
// Traits
// ============================================================================

/// The platform's message-send surface.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Passive reply bound to the inbound message id `reply_to`.
    async fn send_reply(
        &self,
        target: &ReplyTarget,
        reply_to: &str,
        message: &OutboundMessage,
    ) -> Result<MessageReceipt, ApiError>;

    /// Proactive send with no reply-to id.
    async fn send_proactive(
        &self,
        target: &ReplyTarget,
        message: &OutboundMessage,
    ) -> Result<MessageReceipt, ApiError>;

    /// One streaming chunk. The first chunk of a stream has no stream id
    /// and the receipt carries the server-assigned one.
    async fn send_stream_chunk(
        &self,
        target: &ReplyTarget,
        reply_to: &str,
        chunk: &StreamChunk,
    ) -> Result<StreamReceipt, ApiError>;

    /// Whether this target can receive a chunked stream at all.
    fn supports_streaming(&self, target: &ReplyTarget) -> bool;
}

/// Credential and endpoint discovery for the gateway connection.
#[async_trait]
pub trait AccessProvider: Send + Sync {
    /// A currently-valid access token, refreshed as needed.
    async fn token(&self) -> Result<String, ApiError>;

    /// The gateway socket URL to connect to.
    async fn gateway_url(&self) -> Result<String, ApiError>;

    /// Drop any cached token so the next [`Self::token`] call re-exchanges
    /// credentials.
    async fn force_refresh(&self);
}

// ============================================================================
// ApiError
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("rate limited by server")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("invalid gateway url: {0}")]
    InvalidGatewayUrl(String),
}

impl ApiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
