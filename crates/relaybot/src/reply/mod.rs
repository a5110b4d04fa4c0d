//! Outbound reply pacing and quota enforcement.
//!
//! Two independent disciplines apply to replies:
//!
//! - The [`ReplyRateLimiter`] enforces the platform's passive-reply rule:
//!   at most N replies bound to one inbound message id, inside a window
//!   that starts at the first reply. Exhaustion is not an error; callers
//!   switch to the proactive send path.
//! - The [`StreamPacer`] turns an irregular, segment-resetting generation
//!   feed into a well-formed chunk stream with keepalives and hard caps,
//!   over a transport whose "stream" is really a sequence of single-shot
//!   sends.

mod limiter;
mod pacer;

pub use limiter::{Clock, FallbackReason, ReplyDecision, ReplyRateLimiter, SystemClock};
pub use pacer::{ChunkSink, PacerConfig, PacerError, StreamContext, StreamPacer};
