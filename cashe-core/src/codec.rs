//! Byte encoding of value slots for backends that store raw bytes.
//!
//! A value slot wraps its payload in an envelope so that a negative entry
//! (`{"value":null}`) is a present slot, distinct from an absent one.

use serde::{Deserialize, Serialize};

use crate::{Payload, StoreError};

#[derive(Debug, Serialize, Deserialize)]
struct SlotEnvelope {
    value: Option<Payload>,
}

#[derive(Debug, Serialize)]
struct SlotEnvelopeRef<'a> {
    value: Option<&'a Payload>,
}

/// Encode a value slot.
pub fn encode_slot(key: &str, value: Option<&Payload>) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(&SlotEnvelopeRef { value }).map_err(|e| StoreError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a value slot written by [`encode_slot`].
pub fn decode_slot(key: &str, bytes: &[u8]) -> Result<Option<Payload>, StoreError> {
    serde_json::from_slice::<SlotEnvelope>(bytes)
        .map(|envelope| envelope.value)
        .map_err(|e| StoreError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_negative_slot_is_not_empty() {
        let bytes = encode_slot("k", None).unwrap();
        assert_eq!(bytes, br#"{"value":null}"#.to_vec());
        assert_eq!(decode_slot("k", &bytes).unwrap(), None);
    }

    #[test]
    fn test_payload_survives() {
        let payload = json!({"id": 2, "name": "book2"});
        let bytes = encode_slot("k", Some(&payload)).unwrap();
        assert_eq!(decode_slot("k", &bytes).unwrap(), Some(payload));
    }

    #[test]
    fn test_garbage_reports_key() {
        let err = decode_slot("cashe:book:9", b"\x00\x01").unwrap_err();
        assert!(matches!(err, StoreError::Codec { ref key, .. } if key == "cashe:book:9"));
    }
}
