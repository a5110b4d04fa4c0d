//! Wire protocol types for the Relaybot messaging gateway.
//!
//! This crate is deliberately small and dependency-light: it defines the
//! frame envelope exchanged over the gateway socket, the opcode and close
//! code vocabulary, and the capability-level table the runtime negotiates
//! against. The connection state machine itself lives in the `relaybot`
//! crate; anything that needs to speak the wire format without pulling in
//! the runtime can depend on this crate alone.

mod capability;
mod close;
mod frame;

pub use capability::{CAPABILITY_LEVELS, CapabilityLevel, level, narrower, narrowest_index};
pub use close::{CloseDisposition, classify_close};
pub use frame::{
    FrameError, GatewayFrame, HelloPayload, ReadyPayload, ReadyUser, build_heartbeat,
    build_identify, build_resume, opcode,
};
