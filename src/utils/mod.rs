//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `peril_pubsub` crate.
//!
//! It centralizes the error type shared by every messaging component and the
//! logging bootstrap used by the binary and by tests.

pub mod error;
pub mod logging;

pub use error::{PubSubError, Result};

#[cfg(test)]
mod tests;
