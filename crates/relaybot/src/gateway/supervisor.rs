//! The connection supervisor: handshake, resume, capability negotiation,
//! and failure-classified reconnection for one bot account.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use relaybot_gateway_protocol::{
    CloseDisposition, GatewayFrame, HelloPayload, ReadyPayload, build_heartbeat, build_identify,
    build_resume, classify_close, level, narrower, narrowest_index, opcode,
};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::api::{AccessProvider, ApiError};
use crate::store::{SessionRecord, SessionStore};

use super::event;
use super::heartbeat::spawn_heartbeat;
use super::queue::InboundQueue;
use super::reconnect::ReconnectPolicy;

/// Delay before retrying a handshake the server flagged as resumable.
const INVALID_SESSION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Jitter added to reconnect sleeps so a fleet of restarts spreads out.
const RECONNECT_JITTER_MS: u64 = 1000;

/// Type alias for the split WebSocket reader.
type WsReader = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

type WsWriter = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// The bot account this supervisor connects on behalf of.
    pub account_id: String,
    pub max_reconnect_attempts: u32,
    pub hello_timeout: Duration,
    /// Minimum spacing between sequence-advance persistence writes.
    pub seq_persist_interval: Duration,
    pub shard: [u32; 2],
}

impl SupervisorConfig {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            max_reconnect_attempts: 30,
            hello_timeout: Duration::from_secs(30),
            seq_persist_interval: Duration::from_secs(30),
            shard: [0, 1],
        }
    }

    pub fn from_gateway_config(
        account_id: impl Into<String>,
        gateway: &crate::config::GatewayConfig,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            max_reconnect_attempts: gateway.max_reconnect_attempts,
            hello_timeout: gateway.hello_timeout(),
            seq_persist_interval: gateway.seq_persist_interval(),
            shard: [0, 1],
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("no Hello within the handshake timeout")]
    HelloTimeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("account is banned; not reconnecting")]
    AccountBanned,

    #[error("account is offline or sandbox-restricted; not reconnecting")]
    AccountOffline,

    #[error("reconnect attempt budget exhausted")]
    ReconnectBudgetExhausted,
}

// ============================================================================
// Loop actions
// ============================================================================

/// What the outer reconnection loop should do after a connection ends.
#[derive(Debug)]
enum LoopAction {
    /// External shutdown; return cleanly.
    Shutdown,
    /// Server asked for a clean stop (close 1000).
    Stop,
    /// Fatal account condition; stop permanently.
    Fatal(GatewayError),
    /// Reconnect through the backoff policy. `resume` picks the handshake
    /// the next attempt leads with.
    Retry { resume: bool },
    /// Resumable invalid session: short fixed delay, session kept.
    InvalidSessionRetry,
    /// Server-signaled rate limit: one fixed long delay.
    RateLimited,
}

// ============================================================================
// ConnectionSupervisor
// ============================================================================

/// Owns the socket for one account and runs the connection state machine.
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    store: Arc<dyn SessionStore>,
    access: Arc<dyn AccessProvider>,
    queue: InboundQueue,
    cancel: CancellationToken,
    reconnect: ReconnectPolicy,
    /// Shared with the heartbeat task.
    sequence: Arc<Mutex<Option<u64>>>,
    session_id: Option<String>,
    capability_index: usize,
    connected_at: DateTime<Utc>,
    last_seq_persist: Option<Instant>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        store: Arc<dyn SessionStore>,
        access: Arc<dyn AccessProvider>,
        queue: InboundQueue,
        cancel: CancellationToken,
    ) -> Self {
        let reconnect = ReconnectPolicy::new(config.max_reconnect_attempts);
        Self {
            config,
            store,
            access,
            queue,
            cancel,
            reconnect,
            sequence: Arc::new(Mutex::new(None)),
            session_id: None,
            capability_index: 0,
            connected_at: Utc::now(),
            last_seq_persist: None,
        }
    }

    /// Run until shutdown, a clean server stop, a fatal account error, or
    /// an exhausted reconnect budget.
    pub async fn run(&mut self) -> Result<(), GatewayError> {
        self.seed_from_store().await;

        loop {
            if self.cancel.is_cancelled() {
                self.persist_now().await;
                return Ok(());
            }

            if self.reconnect.refresh_token_on_next_connect {
                info!("Forcing credential refresh before next connect");
                self.access.force_refresh().await;
            }

            let action = match self.connect_and_run().await {
                Ok(action) => action,
                Err(e) => self.action_for_error(e),
            };

            match action {
                LoopAction::Shutdown => {
                    info!("Gateway supervisor shutting down");
                    // Flush any sequence advance still held by the
                    // persistence throttle.
                    self.persist_now().await;
                    return Ok(());
                }
                LoopAction::Stop => {
                    info!("Server requested clean stop");
                    self.persist_now().await;
                    return Ok(());
                }
                LoopAction::Fatal(e) => {
                    error!(error = %e, "Fatal gateway condition, stopping permanently");
                    return Err(e);
                }
                LoopAction::Retry { resume } => {
                    if !resume {
                        self.invalidate_session().await;
                    }
                    let Some(delay) = self.reconnect.next_delay() else {
                        return Err(GatewayError::ReconnectBudgetExhausted);
                    };
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        resume, "Reconnecting after backoff"
                    );
                    if !self.sleep_or_shutdown(with_jitter(delay)).await {
                        return Ok(());
                    }
                }
                LoopAction::InvalidSessionRetry => {
                    info!("Invalid session flagged resumable, retrying handshake shortly");
                    if !self
                        .sleep_or_shutdown(with_jitter(INVALID_SESSION_RETRY_DELAY))
                        .await
                    {
                        return Ok(());
                    }
                }
                LoopAction::RateLimited => {
                    let Some(delay) = self.reconnect.rate_limited_delay() else {
                        return Err(GatewayError::ReconnectBudgetExhausted);
                    };
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        "Server rate limit, holding off"
                    );
                    if !self.sleep_or_shutdown(delay).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Seed runtime state from the persisted record, if it belongs to this
    /// account.
    async fn seed_from_store(&mut self) {
        match self.store.load(&self.config.account_id).await {
            Ok(Some(record)) => {
                self.capability_index = record.capability_index.min(narrowest_index());
                if record.resumable_for(&self.config.account_id) {
                    info!(
                        session_id = %record.session_id,
                        seq = ?record.last_seq,
                        capability = level(self.capability_index).name,
                        "Seeding session for resume"
                    );
                    *self.sequence.lock().await = record.last_seq;
                    self.session_id = Some(record.session_id);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not load session record, starting fresh"),
        }
    }

    /// Single connection attempt: discover, connect, handshake, event loop.
    async fn connect_and_run(&mut self) -> Result<LoopAction, GatewayError> {
        let url = self.access.gateway_url().await?;
        let token = self.access.token().await?;

        debug!(url = %url, "Connecting to gateway");
        let (socket, _response) = tokio_tungstenite::connect_async(&url).await?;
        self.reconnect.on_connect();
        let (ws_writer, mut ws_reader) = socket.split();

        let hello = self.wait_for_hello(&mut ws_reader).await?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<GatewayFrame>(64);
        let conn_cancel = self.cancel.child_token();
        let mut writer_handle = spawn_writer(ws_writer, outbound_rx);
        let heartbeat_handle = spawn_heartbeat(
            hello.heartbeat_interval,
            Arc::clone(&self.sequence),
            outbound_tx.clone(),
            conn_cancel.clone(),
        );

        let auth = self.build_auth_frame(&token).await;
        outbound_tx
            .send(auth)
            .await
            .map_err(|_| GatewayError::Protocol("writer channel closed during handshake".into()))?;

        let action = self.event_loop(&mut ws_reader, &outbound_tx).await;

        // Tear down this connection's tasks before the next attempt; a
        // fresh heartbeat timer replaces this one atomically.
        conn_cancel.cancel();
        heartbeat_handle.abort();
        drop(outbound_tx);
        tokio::select! {
            _ = &mut writer_handle => {}
            () = tokio::time::sleep(Duration::from_secs(2)) => {
                writer_handle.abort();
            }
        }

        action
    }

    /// Wait for the server Hello after the socket opens.
    async fn wait_for_hello(&self, ws_reader: &mut WsReader) -> Result<HelloPayload, GatewayError> {
        let hello_fut = async {
            loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frame = GatewayFrame::parse(&text)
                            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
                        if frame.op == opcode::HELLO {
                            let data = frame.d.ok_or_else(|| {
                                GatewayError::Protocol("Hello missing payload".into())
                            })?;
                            let hello: HelloPayload = serde_json::from_value(data)
                                .map_err(|e| GatewayError::Protocol(e.to_string()))?;
                            return Ok(hello);
                        }
                        debug!(op = frame.op, "Ignoring pre-Hello frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(GatewayError::Transport(e)),
                    None => {
                        return Err(GatewayError::Protocol(
                            "connection closed before Hello".into(),
                        ));
                    }
                }
            }
        };

        tokio::time::timeout(self.config.hello_timeout, hello_fut)
            .await
            .map_err(|_| GatewayError::HelloTimeout)?
    }

    /// Resume when a usable session exists, identify otherwise.
    async fn build_auth_frame(&self, token: &str) -> GatewayFrame {
        let seq = *self.sequence.lock().await;
        match (&self.session_id, seq) {
            (Some(session_id), Some(seq)) => {
                info!(session_id = %session_id, seq, "Resuming gateway session");
                build_resume(token, session_id, seq)
            }
            _ => {
                let capability = level(self.capability_index);
                info!(
                    capability = capability.name,
                    "Identifying with fresh session"
                );
                build_identify(token, capability.bitmask, self.config.shard)
            }
        }
    }

    /// Main per-connection loop: read frames until something ends the
    /// connection.
    async fn event_loop(
        &mut self,
        ws_reader: &mut WsReader,
        outbound_tx: &mpsc::Sender<GatewayFrame>,
    ) -> Result<LoopAction, GatewayError> {
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    return Ok(LoopAction::Shutdown);
                }

                message = ws_reader.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            let frame = match GatewayFrame::parse(&text) {
                                Ok(f) => f,
                                Err(e) => {
                                    warn!(error = %e, "Dropping malformed gateway frame");
                                    continue;
                                }
                            };
                            if let Some(action) = self.handle_frame(frame, outbound_tx).await? {
                                return Ok(action);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map_or(1000, |f| f.code.into());
                            return Ok(self.handle_close_code(code));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket read error");
                            return Ok(self.retry_action());
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return Ok(self.retry_action());
                        }
                    }
                }
            }
        }
    }

    /// Handle one inbound frame. `Some(action)` ends the connection.
    async fn handle_frame(
        &mut self,
        frame: GatewayFrame,
        outbound_tx: &mpsc::Sender<GatewayFrame>,
    ) -> Result<Option<LoopAction>, GatewayError> {
        // Sequence numbers can ride on any frame and must always advance
        // the resume point.
        if let Some(seq) = frame.sequence {
            self.apply_sequence(seq).await;
        }

        match frame.op {
            opcode::DISPATCH => self.handle_dispatch(frame).await.map(|()| None),
            opcode::HEARTBEAT => {
                // Server-initiated heartbeat request; answer right away.
                let seq = *self.sequence.lock().await;
                let _ = outbound_tx.send(build_heartbeat(seq)).await;
                Ok(None)
            }
            opcode::HEARTBEAT_ACK => {
                trace!("Heartbeat acknowledged");
                Ok(None)
            }
            opcode::RECONNECT => {
                info!("Server requested reconnect");
                Ok(Some(LoopAction::Retry { resume: true }))
            }
            opcode::INVALID_SESSION => Ok(Some(self.handle_invalid_session(&frame).await)),
            opcode::HELLO => {
                warn!("Unexpected Hello mid-session");
                Ok(None)
            }
            other => {
                debug!(op = other, "Unknown gateway opcode");
                Ok(None)
            }
        }
    }

    /// Handle a dispatch frame: handshake completion events and message
    /// normalization.
    async fn handle_dispatch(&mut self, frame: GatewayFrame) -> Result<(), GatewayError> {
        let event_type = frame.event_type.as_deref().unwrap_or("");
        match event_type {
            "READY" => {
                let data = frame
                    .d
                    .ok_or_else(|| GatewayError::Protocol("READY missing payload".into()))?;
                let ready: ReadyPayload = serde_json::from_value(data)
                    .map_err(|e| GatewayError::Protocol(e.to_string()))?;
                self.on_ready(ready).await;
            }
            "RESUMED" => {
                self.on_resumed().await;
            }
            _ => {
                if let Some(data) = &frame.d
                    && let Some(event) = event::normalize(event_type, data)
                {
                    // Never block the wire handler on processing; the
                    // queue sheds load by dropping its oldest item.
                    self.queue.push(event).await;
                } else {
                    trace!(event = event_type, "Ignoring gateway dispatch");
                }
            }
        }
        Ok(())
    }

    /// A completed fresh handshake: capture the session, mark the current
    /// capability level as last-known-good, persist immediately.
    async fn on_ready(&mut self, ready: ReadyPayload) {
        info!(
            session_id = %ready.session_id,
            bot_user_id = %ready.user.id,
            capability = level(self.capability_index).name,
            "Gateway session established (READY)"
        );
        self.session_id = Some(ready.session_id);
        self.connected_at = Utc::now();
        self.reconnect.on_handshake_complete();
        self.persist_now().await;
    }

    /// A completed resume: refresh the connection timestamp and persist.
    async fn on_resumed(&mut self) {
        info!("Gateway session resumed");
        self.connected_at = Utc::now();
        self.reconnect.on_handshake_complete();
        self.persist_now().await;
    }

    /// Invalid session: resumable keeps the record and retries shortly;
    /// unrecoverable clears it and narrows capability one step, flagging a
    /// credential refresh once the table bottoms out.
    async fn handle_invalid_session(&mut self, frame: &GatewayFrame) -> LoopAction {
        let resumable = frame
            .d
            .as_ref()
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if resumable {
            info!("Invalid session (resumable), keeping record");
            return LoopAction::InvalidSessionRetry;
        }

        info!("Invalid session (unrecoverable), discarding record");
        self.invalidate_session().await;

        match narrower(self.capability_index) {
            Some(next) => {
                warn!(
                    from = level(self.capability_index).name,
                    to = level(next).name,
                    "Narrowing capability level"
                );
                self.capability_index = next;
            }
            None => {
                warn!("Already at narrowest capability, forcing credential refresh");
                self.reconnect.refresh_token_on_next_connect = true;
            }
        }

        LoopAction::Retry { resume: false }
    }

    /// Classify a close code into the next loop action.
    fn handle_close_code(&mut self, code: u16) -> LoopAction {
        match classify_close(code) {
            CloseDisposition::Normal => {
                info!(code, "Normal close");
                LoopAction::Stop
            }
            CloseDisposition::Resume => {
                info!(code, "Close permits resume");
                LoopAction::Retry { resume: true }
            }
            CloseDisposition::Reidentify => {
                warn!(code, "Server internal error, will re-identify");
                LoopAction::Retry { resume: false }
            }
            CloseDisposition::AccountOffline => {
                LoopAction::Fatal(GatewayError::AccountOffline)
            }
            CloseDisposition::AccountBanned => LoopAction::Fatal(GatewayError::AccountBanned),
            CloseDisposition::Retry => {
                warn!(code, "Abnormal close");
                self.retry_action()
            }
        }
    }

    /// Standard retry: resume when a session is held, identify otherwise.
    fn retry_action(&self) -> LoopAction {
        LoopAction::Retry {
            resume: self.session_id.is_some(),
        }
    }

    fn action_for_error(&self, error: GatewayError) -> LoopAction {
        match &error {
            GatewayError::Api(e) if e.is_rate_limited() => LoopAction::RateLimited,
            _ => {
                warn!(error = %error, "Gateway connection error");
                self.retry_action()
            }
        }
    }

    /// Update the last-seen sequence; persist at reduced frequency to
    /// bound write amplification.
    async fn apply_sequence(&mut self, seq: u64) {
        *self.sequence.lock().await = Some(seq);

        let due = self
            .last_seq_persist
            .is_none_or(|t| t.elapsed() >= self.config.seq_persist_interval);
        if due && self.session_id.is_some() {
            self.persist_now().await;
        }
    }

    /// Persist the session record immediately, bypassing the throttle.
    async fn persist_now(&mut self) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        let record = SessionRecord {
            account_id: self.config.account_id.clone(),
            session_id,
            last_seq: *self.sequence.lock().await,
            last_connected_at: self.connected_at,
            capability_index: self.capability_index,
            saved_at: Utc::now(),
        };
        if let Err(e) = self.store.save(&record).await {
            warn!(error = %e, "Failed to persist session record");
        }
        self.last_seq_persist = Some(Instant::now());
    }

    /// Drop the session in memory and in the store. Session-identity
    /// transitions persist immediately.
    async fn invalidate_session(&mut self) {
        if self.session_id.take().is_some() {
            *self.sequence.lock().await = None;
        }
        if let Err(e) = self.store.clear(&self.config.account_id).await {
            warn!(error = %e, "Failed to clear session record");
        }
    }

    /// Sleep for `duration`, returning `false` if shutdown fired first.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    delay + Duration::from_millis(rand::rng().random_range(0..=RECONNECT_JITTER_MS))
}

/// Writer task: drains the outbound channel into the socket.
fn spawn_writer(
    mut ws_writer: WsWriter,
    mut outbound_rx: mpsc::Receiver<GatewayFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let json = match frame.to_wire() {
                Ok(j) => j,
                Err(e) => {
                    error!(error = %e, "Failed to serialize gateway frame");
                    continue;
                }
            };
            if let Err(e) = ws_writer.send(Message::Text(json.into())).await {
                debug!(error = %e, "Writer task: send failed");
                break;
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
