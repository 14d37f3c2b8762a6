//! The pub/sub layer handlers talk to.
//!
//! Publishing: value → [`serializer::Serializer::encode`] → [`publisher`] → broker.
//!
//! Consuming: broker delivery → [`serializer::Serializer::decode`] → handler →
//! [`ack::AckDecision`] → [`ack::AckPolicy`] → broker ack/nack.
//!
//! Topology (queue flags, dead-lettering, bindings) is set up by
//! [`topology::TopologyBinder`] whenever a subscription starts.

pub mod ack;
pub mod publisher;
pub mod retry;
pub mod serializer;
pub mod subscriber;
pub mod topology;


pub use ack::{AckAction, AckDecision, AckPolicy, DeliveryOutcome};
pub use publisher::{Publisher, publish, publish_bincode, publish_json};
pub use serializer::{Bincode, Json, Serializer};
pub use subscriber::{
    ConsumerStats, Handler, SubscribeOptions, Subscription, subscribe, subscribe_bincode,
    subscribe_json,
};
pub use topology::{DurabilityClass, QueueTopology, TopologyBinder, declare_base_topology, queue_name};
