//! Error types and result handling for resilient-kafka.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into two groups. Per-message errors ([`Error::Deserialization`],
//! [`Error::InvalidHeader`]) are isolated by the consumer engine and routed to
//! the dead-letter topic. Infrastructure errors ([`Error::Topology`],
//! [`Error::Delivery`], [`Error::Consume`]) are surfaced to the owning
//! application so it can restart or alert.
//!
//! # Example
//!
//! ```rust
//! use resilient_kafka::{Error, Result};
//!
//! fn declare() -> Result<()> {
//!     Err(Error::Topology {
//!         topic: "dev_order_created".to_string(),
//!         reason: "broker unavailable".to_string(),
//!     })
//! }
//!
//! match declare() {
//!     Ok(()) => println!("Declared"),
//!     Err(Error::Topology { topic, .. }) => eprintln!("Could not declare {}", topic),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for resilient-kafka operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The message type name cannot be turned into a topic name.
    #[error("Invalid message type name: {0:?}")]
    InvalidTypeName(String),

    /// Topic describe or creation failed. Fatal to the registration.
    #[error("Topology error for topic '{topic}': {reason}")]
    Topology {
        /// Topic that could not be described or created
        topic: String,
        /// Broker-reported cause
        reason: String,
    },

    /// The broker did not acknowledge a publish.
    #[error("Delivery to topic '{topic}' failed: {reason}")]
    Delivery {
        /// Destination topic
        topic: String,
        /// Broker-reported cause
        reason: String,
    },

    /// Payload could not be decoded into the expected envelope type.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Broker-level read failure. Terminates the consumer loop.
    #[error("Consume error: {0}")]
    Consume(String),

    /// A control header carried a value that cannot be parsed.
    #[error("Invalid value {value:?} in header '{header}'")]
    InvalidHeader {
        /// Header name
        header: String,
        /// Raw header value, lossily decoded
        value: String,
    },

    /// Kafka client construction or subscription error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// PostgreSQL error from the outbox store.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding envelopes.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenient Result type alias for resilient-kafka operations.
///
/// This is equivalent to `std::result::Result<T, resilient_kafka::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
