//! Per-connection heartbeat task.
//!
//! One timer per live socket, at the interval the server announced in
//! Hello. Each beat carries the last-seen sequence number. The supervisor
//! aborts the task when the connection ends and spawns a fresh one on the
//! next connection, so an interval change can never leave two timers
//! running.

use std::sync::Arc;
use std::time::Duration;

use relaybot_gateway_protocol::{GatewayFrame, build_heartbeat};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Spawn the heartbeat timer for one connection.
pub(super) fn spawn_heartbeat(
    interval_ms: u64,
    sequence: Arc<Mutex<Option<u64>>>,
    outbound_tx: mpsc::Sender<GatewayFrame>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        debug!(interval_ms, "Heartbeat timer started");
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        // The first tick fires immediately; skip it so the first beat lands
        // one full interval after Hello.
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let seq = *sequence.lock().await;
                    trace!(seq = ?seq, "Sending heartbeat");
                    if outbound_tx.send(build_heartbeat(seq)).await.is_err() {
                        // Writer is gone; the connection is tearing down.
                        break;
                    }
                }
            }
        }
        debug!("Heartbeat timer stopped");
    })
}
