//! Peril log server
//!
//! Declares the shared topology, consumes the durable `game_logs` queue and
//! broadcasts a pause signal on start-up. Runs until Ctrl-C, then broadcasts
//! resume before leaving.
//!
//! Without the `amqp` feature everything runs on the in-process broker.

use std::sync::Arc;

use peril_pubsub::broker::Connection;
use peril_pubsub::config::{Settings, load_config};
use peril_pubsub::pubsub::{
    AckDecision, Bincode, DurabilityClass, Publisher, SubscribeOptions, declare_base_topology,
    subscribe,
};
use peril_pubsub::routing::{GAME_LOG_SLUG, GameLog, PAUSE_KEY, PlayingState, broadcast_binding};
use peril_pubsub::utils::{self, Result};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            utils::logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    utils::logging::init_from(&settings.logging);

    if let Err(e) = run(settings).await {
        error!("Server failed: {}", e);
    }
}

#[cfg(feature = "amqp")]
async fn connect(settings: &Settings) -> Result<Arc<dyn Connection>> {
    use peril_pubsub::pubsub::retry::BackoffPolicy;

    let policy = BackoffPolicy::from(&settings.retry);
    let connection = peril_pubsub::broker::amqp::connect(&settings.broker.url, &policy).await?;
    Ok(Arc::new(connection))
}

#[cfg(not(feature = "amqp"))]
async fn connect(_settings: &Settings) -> Result<Arc<dyn Connection>> {
    info!("amqp feature disabled, using the in-process broker");
    Ok(Arc::new(peril_pubsub::broker::MemoryBroker::new()))
}

async fn run(settings: Settings) -> Result<()> {
    let connection = connect(&settings).await?;
    declare_base_topology(connection.as_ref(), &settings.broker).await?;

    let options = SubscribeOptions::from_settings(&settings, DurabilityClass::Durable);
    let logs = subscribe::<Bincode, GameLog, _>(
        connection.as_ref(),
        &settings.broker.exchange,
        GAME_LOG_SLUG,
        &broadcast_binding(GAME_LOG_SLUG),
        DurabilityClass::Durable,
        options,
        |log: GameLog| {
            info!(username = %log.username, at = %log.current_time, "{}", log.message);
            AckDecision::Ack
        },
    )
    .await?;

    let publisher = Publisher::new(connection.open_session().await?, settings.broker.exchange.clone());
    publisher
        .publish_json(PAUSE_KEY, &PlayingState::paused())
        .await?;
    info!("Pause signal sent. Waiting for game logs, press Ctrl-C to exit.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
        () = logs.finished() => {
            error!("Game log subscription exited unexpectedly.");
        }
    }

    // release clients still waiting on the pause
    publisher
        .publish_json(PAUSE_KEY, &PlayingState::resumed())
        .await?;
    info!("Resume signal sent.");

    let stats = logs.shutdown().await;
    info!(?stats, "game log subscription stopped");
    publisher.close().await?;
    connection.close().await
}
