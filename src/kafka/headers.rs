//! Transport headers.
//!
//! The escalation state of a message lives only here: `error.retry` holds the
//! attempt number, `error.message`/`error.code` the last failure.

use crate::message::{Envelope, Failure, Message};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use uuid::Uuid;

pub const MESSAGE_ID: &str = "message.id";
pub const MESSAGE_TYPE: &str = "message.type";
pub const TRACE_CONTEXT: &str = "message.trace_context";
pub const EVENT_OCCURRED: &str = "message.event_occurred";
pub const RETRY: &str = "error.retry";
pub const ERROR_MESSAGE: &str = "error.message";
pub const ERROR_CODE: &str = "error.code";

/// Ordered header list. Setting an existing name replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    entries: Vec<(String, Vec<u8>)>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity headers derived from an envelope.
    pub fn for_envelope<T: Message>(envelope: &Envelope<T>) -> Self {
        Self::identity(
            envelope.id,
            T::TYPE_NAME,
            envelope.trace_context.as_deref(),
            envelope.occurred_at,
        )
    }

    pub fn identity(
        id: Uuid,
        message_type: &str,
        trace_context: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new()
            .with(MESSAGE_ID, id.as_bytes().to_vec())
            .with(MESSAGE_TYPE, message_type)
            .with(TRACE_CONTEXT, trace_context.unwrap_or_default())
            .with(
                EVENT_OCCURRED,
                occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            )
    }

    pub fn with(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(key, _)| key != name);
    }

    pub fn with_retry_attempt(self, attempt: u32) -> Self {
        self.with(RETRY, attempt.to_string())
    }

    pub fn with_failure(self, failure: &Failure) -> Self {
        self.with(ERROR_MESSAGE, failure.message.as_str())
            .with(ERROR_CODE, failure.code.as_deref().unwrap_or_default())
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current attempt number. Absent means first attempt (0).
    ///
    /// A present but unparsable value is an error, never a reset to zero.
    pub fn retry_attempt(&self) -> Result<u32> {
        let Some(raw) = self.get(RETRY) else {
            return Ok(0);
        };

        std::str::from_utf8(raw)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok())
            .ok_or_else(|| Error::InvalidHeader {
                header: RETRY.to_string(),
                value: String::from_utf8_lossy(raw).into_owned(),
            })
    }

    pub fn to_kafka(&self) -> OwnedHeaders {
        self.entries
            .iter()
            .fold(OwnedHeaders::new_with_capacity(self.entries.len()), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_slice()),
                })
            })
    }

    pub fn from_kafka<H: Headers>(headers: &H) -> Self {
        let entries = headers
            .iter()
            .map(|header| {
                (
                    header.key.to_string(),
                    header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                )
            })
            .collect();
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_retry_header_is_first_attempt() {
        assert_eq!(MessageHeaders::new().retry_attempt().unwrap(), 0);
    }

    #[test]
    fn test_retry_header_parsed() {
        let headers = MessageHeaders::new().with_retry_attempt(3);
        assert_eq!(headers.get_str(RETRY), Some("3"));
        assert_eq!(headers.retry_attempt().unwrap(), 3);
    }

    #[test]
    fn test_garbage_retry_header_is_an_error() {
        let headers = MessageHeaders::new().with(RETRY, "three");
        match headers.retry_attempt() {
            Err(Error::InvalidHeader { header, value }) => {
                assert_eq!(header, RETRY);
                assert_eq!(value, "three");
            }
            other => panic!("expected invalid header error, got {:?}", other),
        }
    }

    #[test]
    fn test_set_replaces_existing_value() {
        let headers = MessageHeaders::new()
            .with_retry_attempt(1)
            .with_retry_attempt(2);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.retry_attempt().unwrap(), 2);
    }

    #[test]
    fn test_failure_without_code_stamps_empty_code() {
        let headers = MessageHeaders::new().with_failure(&Failure::new("boom"));

        assert_eq!(headers.get_str(ERROR_MESSAGE), Some("boom"));
        assert_eq!(headers.get_str(ERROR_CODE), Some(""));
    }

    #[test]
    fn test_identity_headers() {
        let id = Uuid::new_v4();
        let headers = MessageHeaders::identity(id, "OrderCreatedEvent", Some("0000000000000001"), Utc::now());

        assert_eq!(headers.get(MESSAGE_ID), Some(id.as_bytes().as_slice()));
        assert_eq!(headers.get_str(MESSAGE_TYPE), Some("OrderCreatedEvent"));
        assert_eq!(headers.get_str(TRACE_CONTEXT), Some("0000000000000001"));
        assert!(headers.get(EVENT_OCCURRED).is_some());
        assert!(headers.get(RETRY).is_none());
    }

    #[test]
    fn test_kafka_header_conversion() {
        let headers = MessageHeaders::new()
            .with(MESSAGE_TYPE, "OrderCreatedEvent")
            .with_retry_attempt(2);

        let converted = MessageHeaders::from_kafka(&headers.to_kafka());
        assert_eq!(converted, headers);
    }
}
