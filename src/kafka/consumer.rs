//! Consumer engine.
//!
//! One subscribe loop per registered message type reads from the main and
//! retry topics. Each received message is handled by its own task; a counting
//! semaphore caps how many are in flight, and the loop only polls the broker
//! after it holds a permit, so a saturated pool stalls intake instead of
//! buffering.
//!
//! The escalation state of a message is carried entirely by the topic it
//! arrived on and its `error.retry` header:
//!
//! ```text
//! received -> (retry topic: sleep base_delay * attempt) -> handling
//!   success                           -> done
//!   failed, attempt + 1 <= retries    -> publish to retry_{attempt + 1}
//!   failed, otherwise                 -> publish to dlq
//! ```
//!
//! A panicking handler counts as a failure. Offsets are stored only after a
//! message was handled or escalated, and only up to the lowest message of the
//! partition still in flight; a message whose escalation could not be
//! delivered is never marked consumed.

use super::headers::MessageHeaders;
use super::offsets::{KafkaOffsetStore, OffsetStore, OffsetTracker};
use super::producer::ProducerRouter;
use super::serializer::JsonSerializer;
use super::topic_manager::AdministratorClient;
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::message::{Envelope, Failure, Handler, Message, Outcome};
use crate::topology::{TopicConfiguration, TopicRole, Topology};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message as KafkaMessage};
use rdkafka::ClientConfig;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DESERIALIZATION_FAILED: &str = "deserialization_failed";
pub const INVALID_RETRY_HEADER: &str = "invalid_retry_header";
pub const HANDLER_PANICKED: &str = "handler_panicked";

/// A message read from the broker, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: MessageHeaders,
}

impl InboundMessage {
    pub fn from_kafka(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers: message
                .headers()
                .map(MessageHeaders::from_kafka)
                .unwrap_or_default(),
        }
    }
}

/// A subscription that yields messages one at a time.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits for the next message. An error is a broker-level read failure.
    async fn recv(&mut self) -> Result<InboundMessage>;

    /// Where positions of handled messages are stored.
    fn offset_store(&self) -> Arc<dyn OffsetStore>;
}

pub trait SourceFactory: Send + Sync {
    fn subscribe(&self, topics: &[String]) -> Result<Box<dyn MessageSource>>;
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub topic_prefix: String,
    pub max_workers: usize,
    pub base_retry_delay: Duration,
}

impl EngineSettings {
    pub fn from_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        Self {
            topic_prefix: kafka.topic_prefix.clone(),
            max_workers: consumer.max_workers,
            base_retry_delay: consumer.base_retry_delay(),
        }
    }
}

pub struct ConsumerEngine {
    admin: Arc<AdministratorClient>,
    router: Arc<ProducerRouter>,
    sources: Arc<dyn SourceFactory>,
    settings: EngineSettings,
}

/// Handle to a running registration.
pub struct ConsumerHandle {
    topics: Vec<String>,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// Topics the loop is subscribed to.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to stop and every in-flight message to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Consume(format!("consumer task failed: {}", e)))?
    }
}

impl ConsumerEngine {
    pub fn new(
        admin: Arc<AdministratorClient>,
        router: Arc<ProducerRouter>,
        sources: Arc<dyn SourceFactory>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            admin,
            router,
            sources,
            settings,
        }
    }

    /// Declares the topology of `T`, subscribes and starts the loop.
    ///
    /// Returns once the loop is running; topology or subscription failures
    /// are returned here and nothing is started.
    pub async fn register<T, H>(
        &self,
        topic_config: TopicConfiguration,
        handler: H,
        cancel: CancellationToken,
    ) -> Result<ConsumerHandle>
    where
        T: Message,
        H: Handler<T>,
    {
        let topology = Topology::new(
            &self.settings.topic_prefix,
            T::TYPE_NAME,
            topic_config.retry_count,
        )?;
        self.admin
            .ensure_topics(&topology.names(), topic_config.partitions)
            .await?;

        let topics = topology.subscriptions();
        let source = self.sources.subscribe(&topics)?;
        info!("Subscribed to topics {}", topics.join(", "));

        let worker = Arc::new(Worker {
            topology,
            router: Arc::clone(&self.router),
            handler,
            base_retry_delay: self.settings.base_retry_delay,
            cancel: cancel.clone(),
            _marker: PhantomData,
        });

        let max_workers = self.settings.max_workers.max(1);
        let task = tokio::spawn(subscribe_loop(source, worker, max_workers, cancel));

        Ok(ConsumerHandle { topics, task })
    }
}

async fn subscribe_loop<T, H>(
    mut source: Box<dyn MessageSource>,
    worker: Arc<Worker<T, H>>,
    max_workers: usize,
    cancel: CancellationToken,
) -> Result<()>
where
    T: Message,
    H: Handler<T>,
{
    let semaphore = Arc::new(Semaphore::new(max_workers));
    let halt = CancellationToken::new();
    let fatal: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let offsets = source.offset_store();
    let tracker = Arc::new(Mutex::new(OffsetTracker::new()));

    let outcome = loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            _ = halt.cancelled() => break Ok(()),
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => break Err(Error::Consume(e.to_string())),
            },
        };

        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            _ = halt.cancelled() => break Ok(()),
            received = source.recv() => match received {
                Ok(message) => message,
                Err(e) => {
                    error!("Exception during consume: {}", e);
                    break Err(e);
                }
            },
        };

        tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .begin(&message.topic, message.partition, message.offset);

        let worker = Arc::clone(&worker);
        let halt = halt.clone();
        let fatal = Arc::clone(&fatal);
        let offsets = Arc::clone(&offsets);
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move {
            // Released on every exit path, including panics.
            let _permit = permit;
            let topic = message.topic.clone();
            let partition = message.partition;
            let offset = message.offset;

            match worker.process(message).await {
                Ok(()) => {
                    let next = tracker
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .complete(&topic, partition, offset);
                    if let Some(next) = next {
                        if let Err(e) = offsets.store(&topic, partition, next) {
                            warn!("{}", e);
                        }
                    }
                }
                Err(e) => {
                    error!(
                        topic = %topic,
                        partition,
                        offset,
                        "Escalation failed, stopping consumer: {}",
                        e
                    );
                    fatal
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(e);
                    halt.cancel();
                }
            }
        });
    };

    // Wait for in-flight handling units to drain.
    let _drained = semaphore.acquire_many(max_workers as u32).await;
    info!("Consumer loop for {} stopped", worker.topology.main());

    let fatal = fatal.lock().unwrap_or_else(PoisonError::into_inner).take();
    match (outcome, fatal) {
        (Err(e), _) => Err(e),
        (Ok(()), Some(e)) => Err(e),
        (Ok(()), None) => Ok(()),
    }
}

struct Worker<T, H> {
    topology: Topology,
    router: Arc<ProducerRouter>,
    handler: H,
    base_retry_delay: Duration,
    cancel: CancellationToken,
    _marker: PhantomData<fn(T)>,
}

impl<T, H> Worker<T, H>
where
    T: Message,
    H: Handler<T>,
{
    /// Handles one message. Only an escalation delivery failure is an error.
    async fn process(&self, message: InboundMessage) -> Result<()> {
        debug!(
            "Received message from topic {} [{}] at offset {}",
            message.topic, message.partition, message.offset
        );

        let Some(role) = self.topology.role_of(&message.topic) else {
            warn!("Ignoring message from unexpected topic {}", message.topic);
            return Ok(());
        };

        let attempt = match message.headers.retry_attempt() {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Unreadable retry header, dead-lettering: {}",
                    e
                );
                let failure = Failure::new(e.to_string()).with_code(INVALID_RETRY_HEADER);
                return self.dead_letter_raw(message, failure).await;
            }
        };

        if role == TopicRole::Retry && attempt > 0 {
            let delay = self.base_retry_delay * attempt;
            debug!("Delaying handle for {:?}", delay);
            tokio::time::sleep(delay).await;
        }

        let decoded = match message.payload.as_deref() {
            Some(payload) => JsonSerializer::deserialize::<T>(payload),
            None => Err(Error::Deserialization("message has no payload".to_string())),
        };
        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    attempt,
                    "Undecodable payload, dead-lettering: {}",
                    e
                );
                let failure = Failure::new(e.to_string()).with_code(DESERIALIZATION_FAILED);
                return self.dead_letter_raw(message, failure).await;
            }
        };

        let handled = AssertUnwindSafe(self.handler.handle(envelope.clone(), self.cancel.child_token()))
            .catch_unwind()
            .await;
        let outcome = handled.unwrap_or_else(|panic| {
            let reason = panic_message(&*panic);
            error!(
                message_id = %envelope.id,
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Handler panicked: {}",
                reason
            );
            Outcome::Failed(Failure::new(reason).with_code(HANDLER_PANICKED))
        });

        match outcome {
            Outcome::Success => {
                debug!(message_id = %envelope.id, attempt, "Message handled");
                Ok(())
            }
            Outcome::Failed(failure) => {
                warn!(
                    message_id = %envelope.id,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    attempt,
                    "Handler failed: {}",
                    failure.message
                );
                self.escalate(&envelope, attempt, &failure).await
            }
        }
    }

    async fn escalate(&self, envelope: &Envelope<T>, attempt: u32, failure: &Failure) -> Result<()> {
        let next_attempt = attempt.saturating_add(1);
        if next_attempt <= self.topology.retry_count() {
            self.router
                .publish_retry(envelope, next_attempt, failure)
                .await?;
        } else {
            info!(
                message_id = %envelope.id,
                attempt,
                "Retries exhausted, moving message to {}",
                self.topology.dlq()
            );
            self.router.publish_to_dlq(envelope, failure).await?;
        }
        Ok(())
    }

    async fn dead_letter_raw(&self, message: InboundMessage, failure: Failure) -> Result<()> {
        let payload = message.payload.unwrap_or_default();
        self.router
            .forward_to_dlq(
                self.topology.dlq(),
                message.key,
                payload,
                &message.headers,
                &failure,
            )
            .await?;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

/// [`MessageSource`] backed by an rdkafka [`StreamConsumer`].
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&mut self) -> Result<InboundMessage> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::Consume(e.to_string()))?;
        Ok(InboundMessage::from_kafka(&message))
    }

    fn offset_store(&self) -> Arc<dyn OffsetStore> {
        Arc::new(KafkaOffsetStore::new(Arc::clone(&self.consumer)))
    }
}

pub struct KafkaSourceFactory {
    kafka: KafkaConfig,
    consumer: ConsumerConfig,
}

impl KafkaSourceFactory {
    pub fn new(kafka: KafkaConfig, consumer: ConsumerConfig) -> Self {
        Self { kafka, consumer }
    }
}

impl SourceFactory for KafkaSourceFactory {
    fn subscribe(&self, topics: &[String]) -> Result<Box<dyn MessageSource>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.kafka.bootstrap_servers())
            .set("group.id", &self.kafka.consumer_group)
            .set("auto.offset.reset", &self.consumer.auto_offset_reset)
            .set("session.timeout.ms", self.consumer.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("allow.auto.create.topics", "false")
            .create()?;

        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        Ok(Box::new(KafkaSource {
            consumer: Arc::new(consumer),
        }))
    }
}
