//! Binary entry point: wire the config into the runtime and run the
//! supervisor until an interrupt or a fatal account condition.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaybot::api::{AccessProvider, HttpAccessProvider, HttpMessagingApi};
use relaybot::config::Config;
use relaybot::dispatch::{EchoEngine, MessageRouter};
use relaybot::gateway::{ConnectionSupervisor, InboundQueue, SupervisorConfig, spawn_consumer};
use relaybot::reply::{PacerConfig, ReplyRateLimiter};
use relaybot::store::FileSessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("RELAYBOT_CONFIG").unwrap_or_else(|_| "relaybot.yaml".to_string());
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("loading config from {config_path}"))?;

    let http = reqwest::Client::new();
    let access: Arc<dyn AccessProvider> = Arc::new(HttpAccessProvider::new(
        http.clone(),
        config.account.api_base.clone(),
        config.account.app_id.clone(),
        config.account.client_secret.clone(),
    ));
    let api = Arc::new(HttpMessagingApi::new(
        http,
        config.account.api_base.clone(),
        Arc::clone(&access),
    ));
    let store = Arc::new(FileSessionStore::new(config.store_dir.clone()));
    let limiter = Arc::new(ReplyRateLimiter::new(
        config.reply.max_passive_replies,
        config.reply.passive_window(),
    ));

    let queue = InboundQueue::new(config.gateway.queue_capacity);
    let cancel = CancellationToken::new();

    let router = Arc::new(MessageRouter::new(
        api,
        Arc::new(EchoEngine),
        limiter,
        config.reply.generation_timeout(),
        PacerConfig::from(&config.stream),
    ));
    let consumer = spawn_consumer(queue.clone(), router, cancel.clone());

    let mut supervisor = ConnectionSupervisor::new(
        SupervisorConfig::from_gateway_config(config.account.app_id.clone(), &config.gateway),
        store,
        access,
        queue,
        cancel.clone(),
    );
    let mut supervisor_task = tokio::spawn(async move { supervisor.run().await });

    info!(account_id = %config.account.app_id, "Relaybot started");

    let mut outcome = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
        result = &mut supervisor_task => {
            match result {
                Ok(Ok(())) => info!("Gateway supervisor finished"),
                Ok(Err(e)) => {
                    error!(error = %e, "Gateway supervisor stopped");
                    outcome = Err(anyhow::Error::new(e));
                }
                Err(e) => {
                    error!(error = %e, "Gateway supervisor panicked");
                    outcome = Err(anyhow::Error::new(e));
                }
            }
        }
    }

    // One cancellation cascades: reconnect timers, the socket, the queue
    // consumer, and any per-turn keepalive timers.
    cancel.cancel();
    let _ = consumer.await;
    if !supervisor_task.is_finished() {
        let _ = supervisor_task.await;
    }

    outcome
}
