use crate::message::Envelope;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize<T: Serialize>(envelope: &Envelope<T>) -> Result<String> {
        serde_json::to_string(envelope).map_err(Into::into)
    }

    /// Decoding failures are reported as [`Error::Deserialization`] so the
    /// consumer engine can dead-letter them.
    pub fn deserialize<T: DeserializeOwned>(payload: &[u8]) -> Result<Envelope<T>> {
        serde_json::from_slice(payload).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u64,
    }

    #[test]
    fn test_serialized_envelope_is_compact() {
        let envelope = Envelope::new(OrderCreated { order_id: 7 });
        let json = JsonSerializer::serialize(&envelope).unwrap();

        assert!(!json.contains('\n'));
        assert!(json.contains("\"order_id\":7"));
    }

    #[test]
    fn test_identity_survives_reserialization() {
        let envelope = Envelope::new(OrderCreated { order_id: 7 }).with_trace_context("trace");
        let json = JsonSerializer::serialize(&envelope).unwrap();
        let decoded: Envelope<OrderCreated> = JsonSerializer::deserialize(json.as_bytes()).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_malformed_payload_is_a_deserialization_error() {
        let result = JsonSerializer::deserialize::<OrderCreated>(b"{\"id\": 12");
        assert!(matches!(result, Err(Error::Deserialization(_))));
    }

    #[test]
    fn test_wrong_shape_is_a_deserialization_error() {
        let other = Envelope::new("not an order".to_string());
        let json = JsonSerializer::serialize(&other).unwrap();

        let result = JsonSerializer::deserialize::<OrderCreated>(json.as_bytes());
        assert!(matches!(result, Err(Error::Deserialization(_))));
    }
}
