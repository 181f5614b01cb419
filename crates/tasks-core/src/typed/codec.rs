//! JSON payload codec.
//!
//! The engine never calls these; tasks and schedulers use them to turn their
//! own request/state structs into the opaque bytes the engine stores.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::Result;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Empty bytes mean "nothing saved yet".
pub fn decode_or_default<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T> {
    if bytes.is_empty() {
        return Ok(T::default());
    }
    decode(bytes)
}
