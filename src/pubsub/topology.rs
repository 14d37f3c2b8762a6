//! Queue topology: durability classes, deterministic queue names, and the
//! binder that declares and binds a subscription's queue.

use tracing::{debug, info};

use crate::broker::{Connection, ExchangeKind, QueueDeclaration, Session};
use crate::config::BrokerSettings;
use crate::utils::error::Result;

/// Dead-letter exchange attached to every queue unless configured otherwise.
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "peril_dlx";

/// How long a queue lives and who may consume from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityClass {
    /// Survives broker restarts, shared by competing consumers.
    Durable,
    /// Exclusive to the declaring session and deleted with it.
    Transient,
}

impl DurabilityClass {
    pub fn durable(self) -> bool {
        matches!(self, DurabilityClass::Durable)
    }

    pub fn auto_delete(self) -> bool {
        matches!(self, DurabilityClass::Transient)
    }

    pub fn exclusive(self) -> bool {
        matches!(self, DurabilityClass::Transient)
    }
}

/// A queue as wired by [`TopologyBinder::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub exchange: String,
    pub queue_name: String,
    pub routing_key: String,
    pub durability: DurabilityClass,
    pub dead_letter_exchange: String,
}

/// Derives the queue name for `identity` listening on `topic`.
///
/// The same pair always yields the same name, so re-subscribing rebinds
/// the same logical queue.
pub fn queue_name(topic: &str, identity: &str) -> String {
    format!("{topic}.{identity}")
}

/// Declares queues with a fixed dead-letter exchange and binds them to a
/// topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyBinder {
    dead_letter_exchange: String,
}

impl Default for TopologyBinder {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_EXCHANGE)
    }
}

impl TopologyBinder {
    pub fn new(dead_letter_exchange: impl Into<String>) -> Self {
        Self {
            dead_letter_exchange: dead_letter_exchange.into(),
        }
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// The declaration `bind` sends for `queue_name`.
    pub fn declaration(&self, queue_name: &str, durability: DurabilityClass) -> QueueDeclaration {
        QueueDeclaration {
            name: queue_name.to_string(),
            durable: durability.durable(),
            auto_delete: durability.auto_delete(),
            exclusive: durability.exclusive(),
            dead_letter_exchange: Some(self.dead_letter_exchange.clone()),
        }
    }

    /// Opens a session, declares `queue_name` and binds it to `exchange`
    /// under `routing_key`.
    ///
    /// The returned session owns the queue when it is transient. If any step
    /// fails the session is closed before the error is returned.
    pub async fn bind(
        &self,
        connection: &dyn Connection,
        exchange: &str,
        queue_name: &str,
        routing_key: &str,
        durability: DurabilityClass,
    ) -> Result<(Box<dyn Session>, QueueTopology)> {
        let session = connection.open_session().await?;
        match self
            .declare_and_bind(session.as_ref(), exchange, queue_name, routing_key, durability)
            .await
        {
            Ok(topology) => Ok((session, topology)),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    debug!(error = %close_err, "closing session after failed bind");
                }
                Err(e)
            }
        }
    }

    async fn declare_and_bind(
        &self,
        session: &dyn Session,
        exchange: &str,
        queue_name: &str,
        routing_key: &str,
        durability: DurabilityClass,
    ) -> Result<QueueTopology> {
        let declared = session
            .declare_queue(&self.declaration(queue_name, durability))
            .await?;
        session
            .bind_queue(&declared.name, exchange, routing_key)
            .await?;
        debug!(
            queue = %declared.name,
            exchange,
            routing_key,
            ?durability,
            "queue declared and bound"
        );
        Ok(QueueTopology {
            exchange: exchange.to_string(),
            queue_name: declared.name,
            routing_key: routing_key.to_string(),
            durability,
            dead_letter_exchange: self.dead_letter_exchange.clone(),
        })
    }
}

/// Declares the shared topic exchange plus the dead-letter exchange and queue.
pub async fn declare_base_topology(
    connection: &dyn Connection,
    settings: &BrokerSettings,
) -> Result<()> {
    let session = connection.open_session().await?;
    let result = async {
        session
            .declare_exchange(&settings.exchange, ExchangeKind::Topic, true)
            .await?;
        session
            .declare_exchange(&settings.dead_letter_exchange, ExchangeKind::Fanout, true)
            .await?;
        session
            .declare_queue(&QueueDeclaration {
                name: settings.dead_letter_queue.clone(),
                durable: true,
                auto_delete: false,
                exclusive: false,
                dead_letter_exchange: None,
            })
            .await?;
        session
            .bind_queue(&settings.dead_letter_queue, &settings.dead_letter_exchange, "")
            .await
    }
    .await;
    session.close().await?;
    result?;

    info!(
        exchange = %settings.exchange,
        dead_letter_exchange = %settings.dead_letter_exchange,
        dead_letter_queue = %settings.dead_letter_queue,
        "base topology declared"
    );
    Ok(())
}
