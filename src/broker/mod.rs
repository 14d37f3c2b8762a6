//! Broker client abstraction.
//!
//! The pub/sub layer never talks to a concrete client library. It goes
//! through three object-safe traits:
//!
//! - [`Connection`]: the single long-lived, process-wide handle. It is shared
//!   (usually as `Arc<dyn Connection>`) and only ever hands out sessions.
//! - [`Session`]: a channel-scoped context used to declare topology, publish
//!   and consume. A session is exclusively owned by whoever opened it.
//! - [`Acker`]: the acknowledgment capability attached to each [`Delivery`].
//!
//! Two backends implement them: [`memory::MemoryBroker`], a complete
//! in-process topic broker, and (with the `amqp` feature) an AMQP 0-9-1
//! client built on `lapin`.

pub mod engine;
pub mod memory;
pub mod message;
pub mod topic;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::utils::error::Result;

pub use memory::{MemoryBroker, MemorySession};
pub use message::{Delivery, Message};

/// Queue argument naming the exchange that receives rejected or expired messages.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Header carrying how many times a message has already been delivered.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Stream of deliveries produced by [`Session::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Exchange routing strategies understood by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Pattern match on dot-delimited routing keys (`*`, `#`).
    Topic,
    /// Every bound queue receives every message.
    Fanout,
    /// Binding key must equal the routing key.
    Direct,
}

/// Parameters of a queue declaration.
///
/// Two declarations of the same queue name are equivalent only if every
/// field matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub dead_letter_exchange: Option<String>,
}

/// What the broker reports back after a successful declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// The process-wide broker handle.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new session. Each concurrent publisher or subscriber gets its own.
    async fn open_session(&self) -> Result<Box<dyn Session>>;

    /// Closes the connection and every session opened from it.
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// A channel-scoped broker context. Not for concurrent use.
#[async_trait]
pub trait Session: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<QueueInfo>;

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    /// Bounds the unacknowledged deliveries handed to consumers started
    /// afterwards on this session.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Non-mandatory, unconfirmed publish. Returning `Ok` only means the frame
    /// was accepted.
    async fn publish(&self, exchange: &str, message: Message) -> Result<()>;

    /// Starts a manual-ack consumer on `queue`. An empty `consumer_tag` lets
    /// the broker pick one.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Closes the session. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}
