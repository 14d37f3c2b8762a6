//! Publishing.
//!
//! Publishing is fire-and-forget at the protocol level: no publisher
//! confirms, no mandatory flag. `Ok(())` means the broker accepted the frame,
//! nothing more. Whether a message survives a restart depends only on the
//! durability of the queue it lands in. Nothing here retries.

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::serializer::{Bincode, Json, Serializer};
use crate::broker::{Message, Session};
use crate::utils::error::Result;

/// Builds the message `publish` would send, without sending it.
pub fn encode_message<S: Serializer, T: Serialize + ?Sized>(
    routing_key: &str,
    value: &T,
) -> Result<Message> {
    let payload = S::encode(value)?;
    Ok(Message::new(routing_key, S::CONTENT_TYPE, payload)
        .with_message_id(Uuid::new_v4().to_string())
        .with_timestamp(chrono::Utc::now().timestamp_millis()))
}

/// Encodes `value` with `S` and publishes it on `session`.
pub async fn publish<S: Serializer, T: Serialize + ?Sized>(
    session: &dyn Session,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()> {
    let message = encode_message::<S, T>(routing_key, value)?;
    let size = message.payload.len();
    session.publish(exchange, message).await?;
    debug!(exchange, routing_key, content_type = S::CONTENT_TYPE, size, "published");
    Ok(())
}

pub async fn publish_json<T: Serialize + ?Sized>(
    session: &dyn Session,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()> {
    publish::<Json, T>(session, exchange, routing_key, value).await
}

pub async fn publish_bincode<T: Serialize + ?Sized>(
    session: &dyn Session,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()> {
    publish::<Bincode, T>(session, exchange, routing_key, value).await
}

/// A publishing session that can be shared between tasks.
///
/// Sessions are not safe for concurrent use, so every publish takes the
/// session lock for the duration of one frame.
pub struct Publisher {
    session: Mutex<Box<dyn Session>>,
    exchange: String,
}

impl Publisher {
    pub fn new(session: Box<dyn Session>, exchange: impl Into<String>) -> Self {
        Self {
            session: Mutex::new(session),
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn publish<S: Serializer, T: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        value: &T,
    ) -> Result<()> {
        // encode outside the lock
        let message = encode_message::<S, T>(routing_key, value)?;
        let session = self.session.lock().await;
        session.publish(&self.exchange, message).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(&self, routing_key: &str, value: &T) -> Result<()> {
        self.publish::<Json, T>(routing_key, value).await
    }

    pub async fn publish_bincode<T: Serialize + ?Sized>(&self, routing_key: &str, value: &T) -> Result<()> {
        self.publish::<Bincode, T>(routing_key, value).await
    }

    /// Closes the underlying session.
    pub async fn close(self) -> Result<()> {
        self.session.into_inner().close().await
    }
}
