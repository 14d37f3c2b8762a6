//! Routing-key conventions and the plain values exchanged over the bus.
//!
//! All traffic goes through one topic exchange. Streams are told apart by
//! routing key only:
//!
//! - `pause`: the shared control key, one transient queue per player
//! - `army_moves.{username}`: per-player moves, consumed via `army_moves.*`
//! - `game_logs.{username}`: durable audit log, competitively consumed
//!   from the `game_logs` queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pubsub::topology::queue_name;

pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";
pub const DEAD_LETTER_QUEUE: &str = "peril_dlq";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Directed key for messages about `username` under `prefix`.
pub fn directed_key(prefix: &str, username: &str) -> String {
    format!("{prefix}.{username}")
}

/// Binding that matches every identity's directed key under `prefix`.
pub fn broadcast_binding(prefix: &str) -> String {
    format!("{prefix}.*")
}

/// The transient queue on which `username` receives pause/resume signals.
pub fn pause_queue(username: &str) -> String {
    queue_name(PAUSE_KEY, username)
}

/// The transient queue on which `username` sees every player's moves.
pub fn army_moves_queue(username: &str) -> String {
    queue_name(ARMY_MOVES_PREFIX, username)
}

/// Pause/resume control signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

impl PlayingState {
    pub fn paused() -> Self {
        Self { is_paused: true }
    }

    pub fn resumed() -> Self {
        Self { is_paused: false }
    }
}

/// One audit-log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLog {
    pub current_time: DateTime<Utc>,
    pub message: String,
    pub username: String,
}

impl GameLog {
    pub fn new(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            current_time: Utc::now(),
            message: message.into(),
            username: username.into(),
        }
    }

    pub fn routing_key(&self) -> String {
        directed_key(GAME_LOG_SLUG, &self.username)
    }
}
