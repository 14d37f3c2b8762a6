//! # Peril pub/sub
//!
//! `peril_pubsub` is the messaging layer of a multiplayer strategy game. Game
//! components exchange typed values over a single topic exchange; this crate
//! hides the broker protocol behind typed publish/subscribe calls.
//!
//! ## Core Modules
//!
//! - `broker`: The broker client abstraction (`Connection`, `Session`, `Acker`) with an
//!   in-process backend and an optional AMQP backend (`amqp` feature).
//! - `pubsub`: Serializers, publishing, queue topology, subscriptions and the
//!   acknowledgment policy applied to every delivery.
//! - `routing`: Routing-key conventions and the plain values sent over the bus.
//! - `config`: Loads settings from `config/default.*` and `PERIL__*` environment variables.
//! - `utils`: Shared error type and logging setup.

pub mod broker;
pub mod config;
pub mod pubsub;
pub mod routing;
pub mod utils;
