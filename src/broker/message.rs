//! Message definitions for the broker
//!
//! `Message` is the unit that travels through an exchange. It is immutable
//! once built; the builder-style `with_*` methods consume and return it.
//!
//! Notes on fields:
//! - `routing_key`: dot-delimited label matched against bindings
//! - `content_type`: serializer tag, informational only
//! - `payload`: encoded body
//! - `headers`: optional string headers (dead-letter bookkeeping, delivery count)
//! - `message_id`: opaque unique id, stamped by the publisher
//! - `timestamp`: milliseconds since UNIX epoch

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{Acker, DELIVERY_COUNT_HEADER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub routing_key: String,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub message_id: Option<String>,
    pub timestamp: i64,
}

impl Message {
    pub fn new(
        routing_key: impl Into<String>,
        content_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            content_type: content_type.into(),
            payload,
            headers: BTreeMap::new(),
            message_id: None,
            timestamp: 0,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A message handed to a consumer, together with the means to settle it.
///
/// A delivery lives for exactly one iteration of a consumption loop.
pub struct Delivery {
    pub message: Message,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub acker: Arc<dyn Acker>,
}

impl Delivery {
    /// Previous deliveries of this message as reported by the broker, if it
    /// reports them at all.
    pub fn delivery_count(&self) -> Option<u32> {
        self.message
            .header(DELIVERY_COUNT_HEADER)
            .and_then(|count| count.parse().ok())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
