// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Serialization seam for the byte-encoding tiers.
//!
//! The off-heap and disk tiers hold encoded bytes, not live values; every
//! access through them goes through a [`Codec`]. The store treats values
//! as opaque payloads, so the codec is the only place the store learns
//! anything about a value's shape.
//!
//! [`JsonCodec`] is the default wire format. Callers with their own
//! encoding plug it in via the store's codec type parameter.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Byte encode/decode strategy for serializing tiers.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError>;
}

/// JSON codec via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u64,
        tags: Vec<String>,
    }

    #[test]
    fn test_round_trip() {
        let codec = JsonCodec;
        let payload = Payload {
            name: "order-42".into(),
            count: 7,
            tags: vec!["a".into(), "b".into()],
        };

        let bytes = codec.encode(&payload).unwrap();
        let decoded: Payload = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_garbage_is_clean_error() {
        let codec = JsonCodec;
        let result: Result<Payload, _> = codec.decode(b"\xff\xfe not json");
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_primitive_keys_encode() {
        let codec = JsonCodec;
        let bytes = codec.encode(&42u64).unwrap();
        let back: u64 = codec.decode(&bytes).unwrap();
        assert_eq!(back, 42);
    }
}
