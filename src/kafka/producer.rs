//! Outbound publishing.
//!
//! [`ProducerRouter`] keeps one [`Publisher`] per destination topic and owns
//! the two escalation paths used by the consumer engine: re-publish to the
//! next retry topic and re-publish to the dead-letter topic.

use super::headers::MessageHeaders;
use super::serializer::JsonSerializer;
use crate::config::KafkaConfig;
use crate::message::{Envelope, Failure, Message};
use crate::topology;
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A fully prepared message bound for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    /// Message key bytes; envelope keys are the 16 raw bytes of the uuid.
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

/// Broker acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// A publisher handle bound to one topic.
///
/// `send` resolves only once the broker acknowledged the record and never
/// retries on its own.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send(&self, record: OutboundRecord) -> Result<Delivery>;
}

pub trait PublisherFactory: Send + Sync {
    fn create(&self, topic: &str) -> Result<Arc<dyn Publisher>>;
}

pub struct ProducerRouter {
    factory: Arc<dyn PublisherFactory>,
    topic_prefix: String,
    publishers: RwLock<HashMap<String, Arc<dyn Publisher>>>,
    // Serializes publisher construction only; lookups go through `publishers`.
    creation: Mutex<()>,
}

impl ProducerRouter {
    pub fn new(factory: Arc<dyn PublisherFactory>, topic_prefix: impl Into<String>) -> Self {
        Self {
            factory,
            topic_prefix: topic_prefix.into(),
            publishers: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
        }
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn cached(&self, topic: &str) -> Option<Arc<dyn Publisher>> {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    fn publisher(&self, topic: &str) -> Result<Arc<dyn Publisher>> {
        if let Some(publisher) = self.cached(topic) {
            return Ok(publisher);
        }

        let _guard = self.creation.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(publisher) = self.cached(topic) {
            return Ok(publisher);
        }

        let publisher = self.factory.create(topic)?;
        self.publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), Arc::clone(&publisher));
        info!("Created publisher for topic '{}'", topic);
        Ok(publisher)
    }

    /// Serializes `envelope`, stamps identity headers and publishes it.
    pub async fn publish<T: Message>(
        &self,
        topic: &str,
        key: Uuid,
        envelope: &Envelope<T>,
    ) -> Result<Delivery> {
        let payload = JsonSerializer::serialize(envelope)?;
        let headers = MessageHeaders::for_envelope(envelope);
        self.publish_serialized(topic, key_bytes(key), payload.into_bytes(), headers)
            .await
    }

    /// Publishes an already serialized payload with caller-provided headers.
    pub async fn publish_serialized(
        &self,
        topic: &str,
        key: Vec<u8>,
        payload: Vec<u8>,
        headers: MessageHeaders,
    ) -> Result<Delivery> {
        let publisher = self.publisher(topic)?;
        let record = OutboundRecord {
            topic: topic.to_string(),
            key,
            payload,
            headers,
        };

        match publisher.send(record).await {
            Ok(delivery) => {
                info!(
                    "Successful delivery to topic {}, partition {}, offset {}",
                    topic, delivery.partition, delivery.offset
                );
                Ok(delivery)
            }
            Err(e) => {
                error!("Delivery to topic {} failed: {}", topic, e);
                Err(match e {
                    Error::Delivery { .. } => e,
                    other => Error::Delivery {
                        topic: topic.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Re-publishes the original envelope to retry topic `next_attempt`.
    pub async fn publish_retry<T: Message>(
        &self,
        envelope: &Envelope<T>,
        next_attempt: u32,
        failure: &Failure,
    ) -> Result<Delivery> {
        let topic = topology::retry_topic(&self.topic_prefix, T::TYPE_NAME, next_attempt)?;
        let payload = JsonSerializer::serialize(envelope)?;
        let headers = MessageHeaders::for_envelope(envelope)
            .with_retry_attempt(next_attempt)
            .with_failure(failure);

        debug!(
            message_id = %envelope.id,
            attempt = next_attempt,
            "Escalating to retry topic {}",
            topic
        );
        self.publish_serialized(&topic, key_bytes(envelope.id), payload.into_bytes(), headers)
            .await
    }

    /// Re-publishes the original envelope to the dead-letter topic.
    pub async fn publish_to_dlq<T: Message>(
        &self,
        envelope: &Envelope<T>,
        failure: &Failure,
    ) -> Result<Delivery> {
        let topic = topology::dlq_topic(&self.topic_prefix, T::TYPE_NAME)?;
        let payload = JsonSerializer::serialize(envelope)?;
        let headers = MessageHeaders::for_envelope(envelope).with_failure(failure);

        debug!(message_id = %envelope.id, "Escalating to dead-letter topic {}", topic);
        self.publish_serialized(&topic, key_bytes(envelope.id), payload.into_bytes(), headers)
            .await
    }

    /// Forwards bytes that could not be decoded to `dlq_topic` untouched.
    ///
    /// The original key and headers are kept, the retry counter is dropped
    /// and the failure headers are stamped. A keyless message gets a fresh
    /// random key.
    pub async fn forward_to_dlq(
        &self,
        dlq_topic: &str,
        key: Option<Vec<u8>>,
        payload: Vec<u8>,
        headers: &MessageHeaders,
        failure: &Failure,
    ) -> Result<Delivery> {
        let mut headers = headers.clone().with_failure(failure);
        headers.remove(super::headers::RETRY);
        let key = key.unwrap_or_else(|| key_bytes(Uuid::new_v4()));

        self.publish_serialized(dlq_topic, key, payload, headers)
            .await
    }
}

/// Wire form of a uuid key.
pub fn key_bytes(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Typed publish handle returned by producer registration.
pub struct MessageProducer<T> {
    router: Arc<ProducerRouter>,
    topic: String,
    _marker: PhantomData<fn(T)>,
}

impl<T: Message> MessageProducer<T> {
    pub fn new(router: Arc<ProducerRouter>) -> Result<Self> {
        let topic = topology::main_topic(router.topic_prefix(), T::TYPE_NAME)?;
        Ok(Self {
            router,
            topic,
            _marker: PhantomData,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wraps `data` in a new envelope and publishes it keyed by envelope id.
    pub async fn publish(&self, data: T) -> Result<Envelope<T>> {
        let envelope = Envelope::new(data);
        self.publish_envelope(&envelope).await?;
        Ok(envelope)
    }

    pub async fn publish_envelope(&self, envelope: &Envelope<T>) -> Result<Delivery> {
        self.router.publish(&self.topic, envelope.id, envelope).await
    }
}

impl<T> Clone for MessageProducer<T> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            topic: self.topic.clone(),
            _marker: PhantomData,
        }
    }
}

/// [`Publisher`] backed by an rdkafka [`FutureProducer`].
pub struct KafkaPublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn send(&self, record: OutboundRecord) -> Result<Delivery> {
        let headers = record.headers.to_kafka();
        let future_record = FutureRecord::to(&record.topic)
            .key(record.key.as_slice())
            .payload(record.payload.as_slice())
            .headers(headers);

        self.producer
            .send(future_record, Timeout::After(self.delivery_timeout))
            .await
            .map(|(partition, offset)| Delivery { partition, offset })
            .map_err(|(e, _)| Error::Delivery {
                topic: record.topic.clone(),
                reason: e.to_string(),
            })
    }
}

/// Builds one [`FutureProducer`] per topic.
pub struct KafkaPublisherFactory {
    config: KafkaConfig,
}

impl KafkaPublisherFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

impl PublisherFactory for KafkaPublisherFactory {
    fn create(&self, topic: &str) -> Result<Arc<dyn Publisher>> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("client.id", format!("resilient-kafka-{}", topic))
            .set("acks", &self.config.acks)
            .set("compression.type", &self.config.compression)
            .set("partitioner", &self.config.partitioner)
            .set("message.timeout.ms", self.config.message_timeout_ms.to_string())
            .create()?;

        Ok(Arc::new(KafkaPublisher {
            producer,
            delivery_timeout: Duration::from_millis(self.config.message_timeout_ms),
        }))
    }
}
