//! Acknowledgment policy.
//!
//! Handlers decide, the policy translates, the broker settles:
//!
//! | decision        | broker call              |
//! |-----------------|--------------------------|
//! | `Ack`           | ack                      |
//! | `NackRequeue`   | nack, requeue = true     |
//! | `NackDiscard`   | nack, requeue = false    |
//! | `Unrecognized`  | none (left unacked)      |
//!
//! A discarded delivery is routed to the dead-letter exchange of the queue it
//! came from. An unrecognized decision is logged and the delivery stays
//! outstanding until the broker takes it back when the session closes.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, info, warn};

use crate::broker::{Acker, Delivery};
use crate::utils::error::Result;

/// What a handler wants done with the delivery it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckDecision {
    Ack,
    NackRequeue,
    NackDiscard,
    /// A decision code outside the table, carried so it can be reported.
    Unrecognized(i32),
}

impl AckDecision {
    pub const ACK_CODE: i32 = 0;
    pub const NACK_REQUEUE_CODE: i32 = 1;
    pub const NACK_DISCARD_CODE: i32 = 2;

    /// Maps a numeric decision code (as produced by collaborators that speak
    /// in codes) onto a decision.
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::ACK_CODE => AckDecision::Ack,
            Self::NACK_REQUEUE_CODE => AckDecision::NackRequeue,
            Self::NACK_DISCARD_CODE => AckDecision::NackDiscard,
            other => AckDecision::Unrecognized(other),
        }
    }
}

/// The broker call a decision translates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Nack { requeue: bool },
}

/// Where a delivery ended up after its decision was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    Requeued,
    Discarded,
    Unacknowledged,
}

/// Stateless translation from decisions to broker calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckPolicy;

impl AckPolicy {
    pub fn action_for(decision: AckDecision) -> Option<AckAction> {
        match decision {
            AckDecision::Ack => Some(AckAction::Ack),
            AckDecision::NackRequeue => Some(AckAction::Nack { requeue: true }),
            AckDecision::NackDiscard => Some(AckAction::Nack { requeue: false }),
            AckDecision::Unrecognized(_) => None,
        }
    }

    /// Performs the broker call for `decision`. Exactly one call is made,
    /// or none for an unrecognized decision.
    pub async fn apply(acker: &dyn Acker, decision: AckDecision) -> Result<DeliveryOutcome> {
        let outcome = match Self::action_for(decision) {
            Some(AckAction::Ack) => {
                acker.ack().await?;
                DeliveryOutcome::Acknowledged
            }
            Some(AckAction::Nack { requeue: true }) => {
                acker.nack(true).await?;
                DeliveryOutcome::Requeued
            }
            Some(AckAction::Nack { requeue: false }) => {
                acker.nack(false).await?;
                DeliveryOutcome::Discarded
            }
            None => {
                warn!(?decision, "unknown ack decision, leaving delivery unacknowledged");
                DeliveryOutcome::Unacknowledged
            }
        };
        Ok(outcome)
    }
}

/// Messages a [`RedeliveryGuard`] remembers by default.
pub const DEFAULT_TRACKED_MESSAGES: usize = 1024;

/// Caps how often a single message may be requeued.
///
/// Attempts are counted per `message_id` for the lifetime of one
/// subscription, and also taken from the broker's delivery-count header when
/// it sends one. Once the cap is reached a requeue becomes a discard, so a
/// poison message ends up dead-lettered instead of cycling forever.
///
/// On a competing-consumer queue a requeued message may be settled by another
/// consumer and never come back here, so the counts live in an LRU of bounded
/// size. Evicting an entry only loses the local count; the broker header still
/// applies.
#[derive(Debug)]
pub struct RedeliveryGuard {
    max_redeliveries: Option<u32>,
    attempts: LruCache<String, u32>,
}

impl RedeliveryGuard {
    pub fn new(max_redeliveries: Option<u32>) -> Self {
        Self::with_capacity(max_redeliveries, DEFAULT_TRACKED_MESSAGES)
    }

    pub fn with_capacity(max_redeliveries: Option<u32>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_redeliveries,
            attempts: LruCache::new(capacity),
        }
    }

    /// Number of messages currently being tracked.
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }

    pub fn capacity(&self) -> usize {
        self.attempts.cap().get()
    }

    pub fn review(&mut self, delivery: &Delivery, decision: AckDecision) -> AckDecision {
        let Some(limit) = self.max_redeliveries else {
            return decision;
        };
        let id = delivery.message.message_id.as_deref();

        if decision != AckDecision::NackRequeue {
            if let Some(id) = id {
                self.attempts.pop(id);
            }
            return decision;
        }

        let local = match id {
            Some(id) => match self.attempts.get_mut(id) {
                Some(count) => {
                    *count += 1;
                    *count
                }
                None => {
                    self.attempts.put(id.to_string(), 1);
                    1
                }
            },
            None => 0,
        };
        let reported = delivery.delivery_count().map_or(0, |count| count + 1);
        let attempts = local.max(reported);

        if attempts > limit {
            if let Some(id) = id {
                self.attempts.pop(id);
            }
            info!(
                message_id = id.unwrap_or("-"),
                attempts,
                limit,
                "redelivery limit reached, discarding"
            );
            AckDecision::NackDiscard
        } else {
            debug!(message_id = id.unwrap_or("-"), attempts, limit, "requeueing");
            decision
        }
    }
}
