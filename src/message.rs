//! Message model: the [`Message`] trait, the transport [`Envelope`] and the
//! handler contract used by the consumer engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A business message that can travel through the resilience topology.
///
/// `TYPE_NAME` drives topic derivation and the `message.type` header.
///
/// ```rust
/// use resilient_kafka::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderCreatedEvent {
///     order_id: u64,
/// }
///
/// impl Message for OrderCreatedEvent {
///     const TYPE_NAME: &'static str = "OrderCreatedEvent";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// The unit of transport.
///
/// `id` and `occurred_at` are fixed at creation and survive every retry hop.
///
/// `trace_context` is an opaque string carried unchanged through every hop and
/// stamped as the `message.trace_context` header. [`Envelope::new`] fills it
/// with the id of the current `tracing` span. Span ids are only unique inside
/// the producing process, so they correlate log lines of one service but are
/// not a distributed trace id; callers that propagate a real trace context
/// (for example a W3C `traceparent`) set it with
/// [`Envelope::with_trace_context`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: Uuid,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl<T> Envelope<T> {
    /// Wraps `data` with a fresh id, the current time and the current span id
    /// as a 16 digit hex string, or no trace context outside any span.
    pub fn new(data: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            trace_context: current_trace_context(),
            occurred_at: Utc::now(),
        }
    }

    /// Replaces the trace context with a caller-supplied value.
    pub fn with_trace_context(mut self, trace_context: impl Into<String>) -> Self {
        self.trace_context = Some(trace_context.into());
        self
    }
}

fn current_trace_context() -> Option<String> {
    tracing::Span::current()
        .id()
        .map(|id| format!("{:016x}", id.into_u64()))
}

/// Failure reported by a handler, or synthesised by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub code: Option<String>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(Failure),
}

impl Outcome {
    pub fn success() -> Self {
        Outcome::Success
    }

    pub fn error(message: impl Into<String>) -> Self {
        Outcome::Failed(Failure::new(message))
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Outcome::Failed(Failure::new(message).with_code(code))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Business logic invoked by the consumer engine.
///
/// Handlers should observe `cancel` cooperatively; the engine never aborts
/// a running handler.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope<T>, cancel: CancellationToken) -> Outcome;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(Envelope<T>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send,
{
    async fn handle(&self, envelope: Envelope<T>, cancel: CancellationToken) -> Outcome {
        (self)(envelope, cancel).await
    }
}
