//! Gateway connection layer.
//!
//! One supervisor per bot account owns one socket to the messaging
//! gateway and drives the whole connection lifecycle:
//!
//! ```text
//!  DISCONNECTED → CONNECTING → AWAITING_HELLO → IDENTIFYING | RESUMING
//!        ▲                                             │
//!        │                                             ▼
//!  RECONNECT_SCHEDULED ◄─── close / error ◄──────── READY
//! ```
//!
//! `STOPPED` is terminal and is only reached through external shutdown or
//! a fatal account condition (banned, offline).
//!
//! # Event flow
//!
//! ```text
//!  Gateway socket frame
//!       │  DISPATCH (message create)
//!       ▼
//!  event::normalize()                       [event.rs]
//!       │  QueuedEvent
//!       ▼
//!  InboundQueue::push()                     [queue.rs]
//!       │  bounded, drop-oldest, never blocks the wire handler
//!       ▼
//!  consumer loop → EventHandler::handle()   [queue.rs → dispatch::MessageRouter]
//! ```
//!
//! Reconnection pacing (delay table, attempt budget, quick-disconnect
//! guard) lives in [`reconnect`]; the per-connection heartbeat timer in
//! [`heartbeat`].

pub mod event;
mod heartbeat;
pub mod queue;
mod reconnect;
mod supervisor;

pub use event::{Attachment, InboundKind, QueuedEvent};
pub use queue::{EventHandler, InboundQueue, spawn_consumer};
pub use supervisor::{ConnectionSupervisor, GatewayError, SupervisorConfig};
