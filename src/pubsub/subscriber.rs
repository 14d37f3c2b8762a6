//! Subscriptions and the consumption loop.
//!
//! Every subscription gets its own session and one spawned task. The task
//! takes deliveries strictly one at a time, in the order the broker hands
//! them over:
//!
//! `received → decoded → handler invoked → acknowledged | requeued | discarded`
//!
//! Cancellation is only observed between deliveries, so the delivery being
//! processed always gets its decision applied. Deliveries the broker had
//! already pushed (within the prefetch window) but the loop never started
//! return to the queue when the loop closes its session.

use std::marker::PhantomData;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ack::{AckDecision, AckPolicy, DeliveryOutcome, RedeliveryGuard};
use super::serializer::{Bincode, Json, Serializer};
use super::topology::{DEFAULT_DEAD_LETTER_EXCHANGE, DurabilityClass, QueueTopology, TopologyBinder};
use crate::broker::{Connection, Delivery, DeliveryStream, Session};
use crate::config::Settings;
use crate::utils::error::Result;

/// Prefetch applied to durable queues when nothing else is configured.
pub const DEFAULT_DURABLE_PREFETCH: u16 = 10;

/// Requeues allowed per message when nothing else is configured.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Turns a decoded value into an acknowledgment decision.
///
/// Called synchronously inside the consumption loop: it must return promptly
/// and must never settle the delivery itself. Any `FnMut(T) -> AckDecision`
/// closure is a handler.
pub trait Handler<T>: Send + 'static {
    fn handle(&mut self, value: T) -> AckDecision;
}

impl<T, F> Handler<T> for F
where
    F: FnMut(T) -> AckDecision + Send + 'static,
{
    fn handle(&mut self, value: T) -> AckDecision {
        self(value)
    }
}

/// Per-subscription tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Unacknowledged deliveries allowed in flight. `None` means unbounded.
    pub prefetch: Option<u16>,
    /// Requeues allowed per message before it is discarded. `None` disables the cap.
    pub max_redeliveries: Option<u32>,
    /// Empty lets the broker choose.
    pub consumer_tag: String,
    pub dead_letter_exchange: String,
}

impl SubscribeOptions {
    /// Bounded prefetch for durable (competing-consumer) queues, unbounded for
    /// transient per-identity queues.
    pub fn for_durability(durability: DurabilityClass) -> Self {
        Self {
            prefetch: durability.durable().then_some(DEFAULT_DURABLE_PREFETCH),
            max_redeliveries: Some(DEFAULT_MAX_REDELIVERIES),
            consumer_tag: String::new(),
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings, durability: DurabilityClass) -> Self {
        Self {
            prefetch: durability
                .durable()
                .then_some(settings.subscriber.durable_prefetch),
            max_redeliveries: Some(settings.subscriber.max_redeliveries),
            consumer_tag: String::new(),
            dead_letter_exchange: settings.broker.dead_letter_exchange.clone(),
        }
    }

    pub fn with_prefetch(mut self, prefetch: Option<u16>) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_max_redeliveries(mut self, max_redeliveries: Option<u32>) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }
}

/// What a consumption loop did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub unacknowledged: u64,
    pub decode_failures: u64,
    pub ack_failures: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Acknowledged => self.acked += 1,
            DeliveryOutcome::Requeued => self.requeued += 1,
            DeliveryOutcome::Discarded => self.discarded += 1,
            DeliveryOutcome::Unacknowledged => self.unacknowledged += 1,
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does not stop the loop; call [`Subscription::shutdown`]
/// (or cancel its token) to stop it.
#[derive(Debug)]
pub struct Subscription {
    topology: QueueTopology,
    cancel: CancellationToken,
    exited: CancellationToken,
    worker: JoinHandle<ConsumerStats>,
}

impl Subscription {
    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// A token that stops this subscription when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// `true` once the loop has exited (cancelled, stream ended or session closed).
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Resolves once the loop has exited, for whatever reason. The stats are
    /// still collected with [`Subscription::join`] or [`Subscription::shutdown`].
    pub async fn finished(&self) {
        self.exited.cancelled().await;
    }

    /// Cancels the loop and waits for it to finish its current delivery.
    pub async fn shutdown(self) -> ConsumerStats {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the loop to exit on its own.
    pub async fn join(self) -> ConsumerStats {
        match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(queue = %self.topology.queue_name, error = %e, "consumer task failed");
                ConsumerStats::default()
            }
        }
    }
}

/// Binds `queue_name` to `exchange` under `routing_key` and starts consuming
/// it with `handler`, decoding payloads with `S`.
///
/// Setup failures (topology, prefetch, consume) are returned and leave no
/// session behind. Failures once the loop runs are logged by the loop.
pub async fn subscribe<S, T, H>(
    connection: &dyn Connection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: DurabilityClass,
    options: SubscribeOptions,
    handler: H,
) -> Result<Subscription>
where
    S: Serializer,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let binder = TopologyBinder::new(options.dead_letter_exchange.as_str());
    let (session, topology) = binder
        .bind(connection, exchange, queue_name, routing_key, durability)
        .await?;

    let deliveries = match start_consuming(session.as_ref(), &topology, &options).await {
        Ok(deliveries) => deliveries,
        Err(e) => {
            if let Err(close_err) = session.close().await {
                debug!(error = %close_err, "closing session after failed consume");
            }
            return Err(e);
        }
    };

    let cancel = CancellationToken::new();
    let exited = CancellationToken::new();
    let consumer = ConsumerLoop::<S, T, H> {
        queue: topology.queue_name.clone(),
        handler,
        guard: RedeliveryGuard::new(options.max_redeliveries),
        stats: ConsumerStats::default(),
        _codec: PhantomData,
    };
    let worker = tokio::spawn(consumer.run(session, deliveries, cancel.clone(), exited.clone()));

    info!(
        queue = %topology.queue_name,
        exchange,
        routing_key,
        ?durability,
        prefetch = ?options.prefetch,
        content_type = S::CONTENT_TYPE,
        "subscribed"
    );

    Ok(Subscription {
        topology,
        cancel,
        exited,
        worker,
    })
}

/// [`subscribe`] with JSON payloads and defaults for `durability`.
pub async fn subscribe_json<T, H>(
    connection: &dyn Connection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: DurabilityClass,
    handler: H,
) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let options = SubscribeOptions::for_durability(durability);
    subscribe::<Json, T, H>(connection, exchange, queue_name, routing_key, durability, options, handler).await
}

/// [`subscribe`] with bincode payloads and defaults for `durability`.
pub async fn subscribe_bincode<T, H>(
    connection: &dyn Connection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: DurabilityClass,
    handler: H,
) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let options = SubscribeOptions::for_durability(durability);
    subscribe::<Bincode, T, H>(connection, exchange, queue_name, routing_key, durability, options, handler).await
}

async fn start_consuming(
    session: &dyn Session,
    topology: &QueueTopology,
    options: &SubscribeOptions,
) -> Result<DeliveryStream> {
    if let Some(prefetch) = options.prefetch {
        session.set_prefetch(prefetch).await?;
    }
    session
        .consume(&topology.queue_name, &options.consumer_tag)
        .await
}

struct ConsumerLoop<S, T, H> {
    queue: String,
    handler: H,
    guard: RedeliveryGuard,
    stats: ConsumerStats,
    _codec: PhantomData<fn() -> (S, T)>,
}

impl<S, T, H> ConsumerLoop<S, T, H>
where
    S: Serializer,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    async fn run(
        mut self,
        session: Box<dyn Session>,
        mut deliveries: DeliveryStream,
        cancel: CancellationToken,
        exited: CancellationToken,
    ) -> ConsumerStats {
        // trips on every exit path, panics included
        let _exited = exited.drop_guard();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(queue = %self.queue, "subscription cancelled");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "delivery stream failed");
                    break;
                }
                None => {
                    info!(queue = %self.queue, "delivery stream ended");
                    break;
                }
            }
        }

        drop(deliveries);
        if let Err(e) = session.close().await {
            warn!(queue = %self.queue, error = %e, "failed to close consumer session");
        }
        debug!(queue = %self.queue, stats = ?self.stats, "consumer stopped");
        self.stats
    }

    async fn process(&mut self, delivery: Delivery) {
        self.stats.received += 1;

        let decision = match S::decode::<T>(&delivery.message.payload) {
            Ok(value) => self.handler.handle(value),
            Err(e) => {
                self.stats.decode_failures += 1;
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    content_type = %delivery.message.content_type,
                    error = %e,
                    "failed to decode payload, discarding"
                );
                AckDecision::NackDiscard
            }
        };
        let decision = self.guard.review(&delivery, decision);

        match AckPolicy::apply(delivery.acker.as_ref(), decision).await {
            Ok(outcome) => {
                self.stats.record(outcome);
                match outcome {
                    DeliveryOutcome::Acknowledged => {
                        debug!(queue = %self.queue, delivery_tag = delivery.delivery_tag, "acked")
                    }
                    _ => info!(
                        queue = %self.queue,
                        delivery_tag = delivery.delivery_tag,
                        redelivered = delivery.redelivered,
                        ?outcome,
                        "delivery settled"
                    ),
                }
            }
            Err(e) => {
                self.stats.ack_failures += 1;
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    ?decision,
                    error = %e,
                    "broker rejected acknowledgment"
                );
            }
        }
    }
}
