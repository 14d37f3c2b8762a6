//! Broker engine
//!
//! This module contains the in-memory broker state responsible for:
//! - declaring exchanges and queues, and checking re-declarations for equivalence
//! - routing published messages through topic, fanout, direct and default exchanges
//! - dispatching ready messages round-robin to consumers within their prefetch window
//! - settling deliveries (ack, requeue, dead-letter)
//! - releasing everything a session owned when it closes
//!
//! Concurrency and usage notes:
//! - The API here is synchronous and designed to be held behind a lock
//!   (`Arc<Mutex<Engine>>`). Nothing in this module awaits, so the lock is
//!   never held across a suspension point.
//! - Deliveries are pushed into unbounded channels; backpressure comes only
//!   from the per-consumer prefetch window.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{Delivery, Message};
use super::{Acker, DELIVERY_COUNT_HEADER, ExchangeKind, QueueDeclaration, QueueInfo, topic};
use crate::utils::error::{PubSubError, Result};

pub type SessionId = u64;
pub type SharedEngine = Arc<Mutex<Engine>>;

pub(crate) fn lock(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Highest number of unacknowledged deliveries any single consumer held.
    pub peak_outstanding: usize,
}

#[derive(Debug, Clone)]
struct Envelope {
    message: Message,
    redelivered: bool,
    delivery_count: u32,
}

impl Envelope {
    fn fresh(message: Message) -> Self {
        Self {
            message,
            redelivered: false,
            delivery_count: 0,
        }
    }

    fn delivered_message(&self) -> Message {
        let mut message = self.message.clone();
        if self.delivery_count > 0 {
            message.headers.insert(
                DELIVERY_COUNT_HEADER.to_string(),
                self.delivery_count.to_string(),
            );
        }
        message
    }
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    session: SessionId,
    prefetch: Option<u16>,
    outstanding: usize,
    sender: UnboundedSender<Result<Delivery>>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch
            .map_or(true, |limit| self.outstanding < usize::from(limit))
    }
}

#[derive(Debug)]
struct QueueState {
    declaration: QueueDeclaration,
    owner: Option<SessionId>,
    ready: VecDeque<Envelope>,
    consumers: Vec<Consumer>,
    cursor: usize,
    had_consumers: bool,
    acked: u64,
    requeued: u64,
    dead_lettered: u64,
    peak_outstanding: usize,
}

impl QueueState {
    fn new(declaration: QueueDeclaration, owner: Option<SessionId>) -> Self {
        Self {
            declaration,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            had_consumers: false,
            acked: 0,
            requeued: 0,
            dead_lettered: 0,
            peak_outstanding: 0,
        }
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.declaration.name.clone(),
            message_count: u32::try_from(self.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(self.consumers.len()).unwrap_or(u32::MAX),
        }
    }

    fn check_access(&self, session: SessionId) -> Result<()> {
        match self.owner {
            Some(owner) if owner != session => Err(PubSubError::Topology(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                self.declaration.name
            ))),
            _ => Ok(()),
        }
    }

    fn is_unused_auto_delete(&self) -> bool {
        self.declaration.auto_delete && self.had_consumers && self.consumers.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    session: SessionId,
    envelope: Envelope,
}

#[derive(Debug)]
pub struct Engine {
    handle: Weak<Mutex<Engine>>,
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    sessions: HashSet<SessionId>,
    next_session: SessionId,
    next_tag: u64,
}

impl Engine {
    /// Creates an engine that can hand out ackers pointing back at itself.
    pub fn shared() -> SharedEngine {
        Arc::new_cyclic(|handle| Mutex::new(Engine::new(handle.clone())))
    }

    fn new(handle: Weak<Mutex<Engine>>) -> Self {
        Self {
            handle,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            unacked: HashMap::new(),
            sessions: HashSet::new(),
            next_session: 0,
            next_tag: 0,
        }
    }

    pub fn open_session(&mut self) -> SessionId {
        self.next_session += 1;
        self.sessions.insert(self.next_session);
        self.next_session
    }

    pub fn is_session_open(&self, session: SessionId) -> bool {
        self.sessions.contains(&session)
    }

    fn ensure_open(&self, session: SessionId) -> Result<()> {
        if self.is_session_open(session) {
            Ok(())
        } else {
            Err(PubSubError::Connection(format!("session {session} is closed")))
        }
    }

    pub fn declare_exchange(
        &mut self,
        session: SessionId,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        self.ensure_open(session)?;
        if name.is_empty() {
            return Err(PubSubError::Topology(
                "ACCESS_REFUSED - the default exchange cannot be redeclared".to_string(),
            ));
        }
        match self.exchanges.get(name) {
            Some(existing) if *existing != (kind, durable) => Err(PubSubError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{name}'"
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(name.to_string(), (kind, durable));
                debug!(exchange = name, ?kind, durable, "exchange declared");
                Ok(())
            }
        }
    }

    pub fn declare_queue(
        &mut self,
        session: SessionId,
        declaration: &QueueDeclaration,
    ) -> Result<QueueInfo> {
        self.ensure_open(session)?;

        let mut declaration = declaration.clone();
        if declaration.name.is_empty() {
            declaration.name = format!("amq.gen-{}", Uuid::new_v4());
        }

        if let Some(existing) = self.queues.get(&declaration.name) {
            existing.check_access(session)?;
            if existing.declaration != declaration {
                return Err(PubSubError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    declaration.name
                )));
            }
            return Ok(existing.info());
        }

        let owner = declaration.exclusive.then_some(session);
        let queue = QueueState::new(declaration, owner);
        let info = queue.info();
        debug!(queue = %info.name, durable = queue.declaration.durable, exclusive = queue.declaration.exclusive, "queue declared");
        self.queues.insert(info.name.clone(), queue);
        Ok(info)
    }

    pub fn bind_queue(
        &mut self,
        session: SessionId,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<()> {
        self.ensure_open(session)?;
        if exchange.is_empty() {
            return Err(PubSubError::Topology(
                "ACCESS_REFUSED - cannot bind to the default exchange".to_string(),
            ));
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(PubSubError::Topology(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        self.queues
            .get(queue)
            .ok_or_else(|| PubSubError::Topology(format!("NOT_FOUND - no queue '{queue}'")))?
            .check_access(session)?;

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            key: binding_key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            debug!(queue, exchange, binding_key, "queue bound");
            self.bindings.push(binding);
        }
        Ok(())
    }

    pub fn publish(&mut self, session: SessionId, exchange: &str, message: Message) -> Result<()> {
        self.ensure_open(session)
            .map_err(|e| PubSubError::Publish(e.to_string()))?;

        let targets = self.route(exchange, &message.routing_key)?;
        if targets.is_empty() {
            debug!(exchange, routing_key = %message.routing_key, "message unroutable, dropped");
        }
        for target in targets {
            self.enqueue(&target, message.clone());
        }
        Ok(())
    }

    pub fn consume(
        &mut self,
        session: SessionId,
        queue_name: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<UnboundedReceiver<Result<Delivery>>> {
        self.ensure_open(session)?;
        let queue = self.queues.get_mut(queue_name).ok_or_else(|| {
            PubSubError::Topology(format!("NOT_FOUND - no queue '{queue_name}'"))
        })?;
        queue.check_access(session)?;

        let tag = if consumer_tag.is_empty() {
            format!("ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_string()
        };
        if queue.consumers.iter().any(|c| c.tag == tag) {
            return Err(PubSubError::Topology(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"
            )));
        }

        let (sender, receiver) = mpsc::unbounded();
        queue.consumers.push(Consumer {
            tag: tag.clone(),
            session,
            prefetch,
            outstanding: 0,
            sender,
        });
        queue.had_consumers = true;
        debug!(queue = queue_name, consumer_tag = %tag, ?prefetch, "consumer started");

        self.dispatch(queue_name);
        Ok(receiver)
    }

    pub fn ack(&mut self, tag: u64) -> Result<()> {
        let entry = self.settle(tag)?;
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            queue.acked += 1;
        }
        self.dispatch(&entry.queue);
        Ok(())
    }

    pub fn nack(&mut self, tag: u64, requeue: bool) -> Result<()> {
        let entry = self.settle(tag)?;
        if requeue {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                queue.requeued += 1;
            }
            self.requeue(&entry.queue, entry.envelope);
        } else {
            self.dead_letter(&entry.queue, entry.envelope);
        }
        self.dispatch(&entry.queue);
        Ok(())
    }

    /// Releases everything `session` held: its consumers stop, its
    /// unacknowledged deliveries go back to the head of their queues, and
    /// queues it owned exclusively (or auto-delete queues it left without
    /// consumers) are deleted.
    pub fn close_session(&mut self, session: SessionId) {
        if !self.sessions.remove(&session) {
            return;
        }

        for queue in self.queues.values_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.session != session);
            if queue.consumers.len() != before {
                queue.cursor = 0;
            }
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        // newest first, so the oldest ends up at the head of the queue
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = HashSet::new();
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                self.requeue(&entry.queue, entry.envelope);
                touched.insert(entry.queue);
            }
        }

        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(session) || q.is_unused_auto_delete())
            .map(|(name, _)| name.clone())
            .collect();
        for name in doomed {
            touched.remove(&name);
            self.delete_queue(&name);
        }

        for name in touched {
            self.dispatch(&name);
        }
        debug!(session, "session closed");
    }

    pub fn close_all(&mut self) {
        let sessions: Vec<SessionId> = self.sessions.iter().copied().collect();
        for session in sessions {
            self.close_session(session);
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        let queue = self.queues.get(name)?;
        Some(QueueStats {
            ready: queue.ready.len(),
            unacked: self.unacked.values().filter(|u| u.queue == name).count(),
            consumers: queue.consumers.len(),
            acked: queue.acked,
            requeued: queue.requeued,
            dead_lettered: queue.dead_lettered,
            peak_outstanding: queue.peak_outstanding,
        })
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let (kind, _) = self.exchanges.get(exchange).ok_or_else(|| {
            PubSubError::Publish(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match kind {
                ExchangeKind::Topic => topic::matches(&binding.key, routing_key),
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.key == routing_key,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue_name: &str, message: Message) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.ready.push_back(Envelope::fresh(message));
            self.dispatch(queue_name);
        }
    }

    fn requeue(&mut self, queue_name: &str, mut envelope: Envelope) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            envelope.redelivered = true;
            envelope.delivery_count += 1;
            queue.ready.push_front(envelope);
        }
    }

    fn dead_letter(&mut self, queue_name: &str, envelope: Envelope) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.dead_lettered += 1;

        let Some(dlx) = queue.declaration.dead_letter_exchange.clone() else {
            debug!(queue = queue_name, "rejected message dropped, no dead-letter exchange");
            return;
        };

        let mut message = envelope.message;
        message
            .headers
            .entry("x-first-death-queue".to_string())
            .or_insert_with(|| queue_name.to_string());
        message
            .headers
            .entry("x-first-death-reason".to_string())
            .or_insert_with(|| "rejected".to_string());

        match self.route(&dlx, &message.routing_key) {
            Ok(targets) => {
                for target in targets {
                    self.enqueue(&target, message.clone());
                }
            }
            Err(e) => warn!(queue = queue_name, dead_letter_exchange = %dlx, error = %e, "dead-lettered message dropped"),
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
        self.unacked.retain(|_, u| u.queue != name);
        debug!(queue = name, "queue deleted");
    }

    fn settle(&mut self, tag: u64) -> Result<Unacked> {
        let entry = self.unacked.remove(&tag).ok_or_else(|| {
            PubSubError::Ack(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))
        })?;
        if let Some(consumer) = self.queues.get_mut(&entry.queue).and_then(|queue| {
            queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == entry.consumer_tag && c.session == entry.session)
        }) {
            consumer.outstanding = consumer.outstanding.saturating_sub(1);
        }
        Ok(entry)
    }

    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                break;
            };
            let Some(envelope) = queue.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery {
                message: envelope.delivered_message(),
                delivery_tag: tag,
                redelivered: envelope.redelivered,
                acker: Arc::new(MemoryAcker {
                    engine: self.handle.clone(),
                    tag,
                }),
            };

            let consumer = &mut queue.consumers[index];
            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                debug!(queue = queue_name, consumer_tag = %consumer.tag, "consumer gone, removing");
                queue.ready.push_front(envelope);
                queue.consumers.remove(index);
                queue.cursor = 0;
                continue;
            }

            consumer.outstanding += 1;
            queue.peak_outstanding = queue.peak_outstanding.max(consumer.outstanding);
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    session: consumer.session,
                    envelope,
                },
            );
            queue.cursor = (index + 1) % count;
        }
    }
}

/// Settles one in-memory delivery by tag.
pub(crate) struct MemoryAcker {
    engine: Weak<Mutex<Engine>>,
    tag: u64,
}

impl MemoryAcker {
    fn engine(&self) -> Result<SharedEngine> {
        self.engine
            .upgrade()
            .ok_or_else(|| PubSubError::Ack("broker has shut down".to_string()))
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let engine = self.engine()?;
        let result = lock(&engine).ack(self.tag);
        result
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let engine = self.engine()?;
        let result = lock(&engine).nack(self.tag, requeue);
        result
    }
}
