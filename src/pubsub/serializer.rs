//! Serialization strategies.
//!
//! A strategy is a zero-sized type picked at the call site
//! (`publish::<Json, _>(..)`, `subscribe::<Bincode, _, _>(..)`). The content
//! type it stamps on outgoing messages is informational; consumers always
//! decode with the strategy their subscription was created with.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::error::Result;

pub trait Serializer: Send + Sync + 'static {
    const CONTENT_TYPE: &'static str;

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

/// Self-describing JSON, for control and game-state messages shared across components.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Serializer for Json {
    const CONTENT_TYPE: &'static str = "application/json";

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact `bincode` encoding for internal audit/log traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bincode;

impl Serializer for Bincode {
    const CONTENT_TYPE: &'static str = "application/x-bincode";

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}
