//! The gateway frame envelope and its payload builders.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opcodes carried in the `op` field of a [`GatewayFrame`].
pub mod opcode {
    /// Server event dispatch; carries `eventType` and a sequence number.
    pub const DISPATCH: u8 = 0;
    /// Client heartbeat carrying the last-seen sequence number.
    pub const HEARTBEAT: u8 = 1;
    /// Client handshake for a fresh session.
    pub const IDENTIFY: u8 = 2;
    /// Client handshake resuming a prior session from a sequence number.
    pub const RESUME: u8 = 6;
    /// Server request to close and reconnect, preserving the session.
    pub const RECONNECT: u8 = 7;
    /// Server rejection of the session; payload is a resumable flag.
    pub const INVALID_SESSION: u8 = 9;
    /// Server greeting; payload carries the heartbeat interval.
    pub const HELLO: u8 = 10;
    /// Server acknowledgement of a client heartbeat.
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// A single frame on the gateway socket.
///
/// Every frame is a JSON object `{op, d, sequence?, eventType?}`. Sequence
/// numbers only appear on server frames and increase monotonically within a
/// session; `eventType` is only present on [`opcode::DISPATCH`] frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(
        rename = "eventType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub event_type: Option<String>,
}

impl GatewayFrame {
    /// Parse a frame from raw socket text.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(FrameError::Malformed)
    }

    /// Serialize the frame for the socket.
    pub fn to_wire(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Malformed)
    }
}

/// Error produced while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed gateway frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame op {op} missing payload")]
    MissingPayload { op: u8 },
}

/// Payload of the server [`opcode::HELLO`] frame.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
}

/// Payload of the `READY` dispatch event.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    pub user: ReadyUser,
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

/// The bot identity echoed back in `READY`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Build an [`opcode::IDENTIFY`] frame for a fresh handshake.
pub fn build_identify(token: &str, capability_mask: u64, shard: [u32; 2]) -> GatewayFrame {
    GatewayFrame {
        op: opcode::IDENTIFY,
        d: Some(serde_json::json!({
            "token": token,
            "intents": capability_mask,
            "shard": shard,
        })),
        sequence: None,
        event_type: None,
    }
}

/// Build an [`opcode::RESUME`] frame continuing a prior session.
pub fn build_resume(token: &str, session_id: &str, seq: u64) -> GatewayFrame {
    GatewayFrame {
        op: opcode::RESUME,
        d: Some(serde_json::json!({
            "token": token,
            "session_id": session_id,
            "seq": seq,
        })),
        sequence: None,
        event_type: None,
    }
}

/// Build an [`opcode::HEARTBEAT`] frame carrying the last-seen sequence.
///
/// A `None` sequence serializes as JSON null, which the server accepts
/// before the first dispatch has arrived.
pub fn build_heartbeat(seq: Option<u64>) -> GatewayFrame {
    GatewayFrame {
        op: opcode::HEARTBEAT,
        d: Some(seq.map_or(Value::Null, Value::from)),
        sequence: None,
        event_type: None,
    }
}
