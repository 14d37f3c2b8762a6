//! In-process broker backend.
//!
//! `MemoryBroker` implements [`Connection`] on top of the shared [`Engine`].
//! It behaves like a single-node topic broker and is what the binary runs
//! without the `amqp` feature, and what the test-suite runs against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;

use super::engine::{Engine, QueueStats, SessionId, SharedEngine, lock};
use super::{Connection, DeliveryStream, ExchangeKind, Message, QueueDeclaration, QueueInfo, Session};
use crate::utils::error::{PubSubError, Result};

/// Connection handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    engine: SharedEngine,
    open: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            engine: Engine::shared(),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Opens a session without boxing it.
    pub fn open_memory_session(&self) -> Result<MemorySession> {
        if !self.is_open() {
            return Err(PubSubError::Connection("connection is closed".to_string()));
        }
        let id = lock(&self.engine).open_session();
        Ok(MemorySession {
            id,
            engine: Arc::clone(&self.engine),
            prefetch: Mutex::new(None),
        })
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        lock(&self.engine).queue_exists(name)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        lock(&self.engine).exchange_exists(name)
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        lock(&self.engine).queue_stats(name)
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(self.open_memory_session()?))
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            lock(&self.engine).close_all();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// A session on a [`MemoryBroker`]. Dropping it closes it.
pub struct MemorySession {
    id: SessionId,
    engine: SharedEngine,
    prefetch: Mutex<Option<u16>>,
}

impl MemorySession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        lock(&self.engine).is_session_open(self.id)
    }

    fn prefetch(&self) -> Option<u16> {
        *self.prefetch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        lock(&self.engine).declare_exchange(self.id, name, kind, durable)
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<QueueInfo> {
        lock(&self.engine).declare_queue(self.id, declaration)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        lock(&self.engine).bind_queue(self.id, queue, exchange, binding_key)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        if !self.is_open() {
            return Err(PubSubError::Connection(format!("session {} is closed", self.id)));
        }
        // zero means "no limit", as in basic.qos
        *self.prefetch.lock().unwrap_or_else(PoisonError::into_inner) =
            (count > 0).then_some(count);
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: Message) -> Result<()> {
        lock(&self.engine).publish(self.id, exchange, message)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let prefetch = self.prefetch();
        let receiver = lock(&self.engine).consume(self.id, queue, consumer_tag, prefetch)?;
        Ok(receiver.boxed())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.engine).close_session(self.id);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        lock(&self.engine).close_session(self.id);
    }
}
