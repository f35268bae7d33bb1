#![allow(dead_code)]

use async_trait::async_trait;
use resilient_kafka::config::{Config, ConsumerConfig, KafkaConfig, OutboxConfig};
use resilient_kafka::kafka::{
    CreateOutcome, Delivery, InboundMessage, MessageHeaders, MessageSource, OffsetStore,
    OutboundRecord, Publisher, PublisherFactory, SourceFactory, TopicAdmin, TopicSpec,
};
use resilient_kafka::{Error, Message, MessageBroker, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const PREFIX: &str = "test";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: u64,
}

impl Message for OrderCreatedEvent {
    const TYPE_NAME: &'static str = "OrderCreatedEvent";
}

/// In-memory configuration; nothing here talks to a broker.
pub fn get_test_config() -> Config {
    Config {
        kafka: KafkaConfig {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            topic_prefix: PREFIX.to_string(),
            consumer_group: "test-group".to_string(),
            request_timeout_secs: 10,
            operation_timeout_secs: 10,
            acks: "all".to_string(),
            compression: "none".to_string(),
            partitioner: "murmur2_random".to_string(),
            message_timeout_ms: 5000,
        },
        consumer: ConsumerConfig {
            max_workers: 4,
            base_retry_delay_ms: 1000,
            ..ConsumerConfig::default()
        },
        outbox: OutboxConfig {
            page_size: 10,
            poll_interval_ms: 100,
            ..OutboxConfig::default()
        },
    }
}

pub struct TestBroker {
    pub broker: MessageBroker,
    pub admin: Arc<MockAdmin>,
    pub publishers: Arc<RecordingPublisherFactory>,
    pub sources: Arc<ChannelSourceFactory>,
}

pub fn build_broker(config: Config) -> TestBroker {
    let admin = Arc::new(MockAdmin::new(3));
    let publishers = Arc::new(RecordingPublisherFactory::new());
    let sources = Arc::new(ChannelSourceFactory::new());

    let broker = MessageBroker::from_parts(
        config,
        Arc::clone(&admin) as Arc<dyn TopicAdmin>,
        Arc::clone(&publishers) as Arc<dyn PublisherFactory>,
        Arc::clone(&sources) as Arc<dyn SourceFactory>,
    );

    TestBroker {
        broker,
        admin,
        publishers,
        sources,
    }
}

/// Topic admin double with call counters.
pub struct MockAdmin {
    existing: Mutex<HashSet<String>>,
    brokers: usize,
    pub metadata_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub created: Mutex<Vec<TopicSpec>>,
    /// Topics whose creation is rejected by the broker.
    pub reject: Mutex<HashSet<String>>,
    /// Report every topic as missing, so creation races against existing ones.
    pub stale_metadata: AtomicBool,
    pub create_delay: Mutex<Option<Duration>>,
}

impl MockAdmin {
    pub fn new(brokers: usize) -> Self {
        Self {
            existing: Mutex::new(HashSet::new()),
            brokers,
            metadata_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            reject: Mutex::new(HashSet::new()),
            stale_metadata: AtomicBool::new(false),
            create_delay: Mutex::new(None),
        }
    }

    pub fn add_existing(&self, name: &str) {
        self.existing.lock().unwrap().insert(name.to_string());
    }

    pub fn exists(&self, name: &str) -> bool {
        self.existing.lock().unwrap().contains(name)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopicAdmin for MockAdmin {
    async fn missing_topics(&self, names: &[String]) -> Result<Vec<String>> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.stale_metadata.load(Ordering::SeqCst) {
            return Ok(names.to_vec());
        }
        let existing = self.existing.lock().unwrap();
        Ok(names
            .iter()
            .filter(|name| !existing.contains(*name))
            .cloned()
            .collect())
    }

    async fn broker_count(&self) -> Result<usize> {
        Ok(self.brokers)
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<Vec<(String, CreateOutcome)>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reject = self.reject.lock().unwrap().clone();
        let mut existing = self.existing.lock().unwrap();
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in specs {
            let outcome = if reject.contains(&spec.name) {
                CreateOutcome::Failed("Invalid replication factor".to_string())
            } else if !existing.insert(spec.name.clone()) {
                CreateOutcome::AlreadyExists
            } else {
                self.created.lock().unwrap().push(spec.clone());
                CreateOutcome::Created
            };
            outcomes.push((spec.name.clone(), outcome));
        }
        Ok(outcomes)
    }
}

/// Publisher factory whose publishers append to one shared log.
pub struct RecordingPublisherFactory {
    pub records: Arc<Mutex<Vec<OutboundRecord>>>,
    pub created: Mutex<Vec<String>>,
    sends: Arc<AtomicUsize>,
    offsets: Arc<AtomicI64>,
    /// 1-based send number that fails once.
    fail_nth: Arc<Mutex<Option<usize>>>,
    /// Every send to these topics fails.
    fail_topics: Arc<Mutex<HashSet<String>>>,
    pub create_delay: Option<Duration>,
}

impl RecordingPublisherFactory {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            created: Mutex::new(Vec::new()),
            sends: Arc::new(AtomicUsize::new(0)),
            offsets: Arc::new(AtomicI64::new(0)),
            fail_nth: Arc::new(Mutex::new(None)),
            fail_topics: Arc::new(Mutex::new(HashSet::new())),
            create_delay: None,
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn fail_nth_send(&self, n: usize) {
        self.sends.store(0, Ordering::SeqCst);
        *self.fail_nth.lock().unwrap() = Some(n);
    }

    pub fn fail_topic(&self, topic: &str) {
        self.fail_topics.lock().unwrap().insert(topic.to_string());
    }

    pub fn records(&self) -> Vec<OutboundRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn records_for(&self, topic: &str) -> Vec<OutboundRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.topic == topic)
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }

    pub fn created_topics(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// Waits, on the tokio clock, until at least `count` records were sent.
    pub async fn wait_for_records(&self, count: usize) -> Vec<OutboundRecord> {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let records = self.records();
                if records.len() >= count {
                    return records;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for published records")
    }
}

impl PublisherFactory for RecordingPublisherFactory {
    fn create(&self, topic: &str) -> Result<Arc<dyn Publisher>> {
        if let Some(delay) = self.create_delay {
            std::thread::sleep(delay);
        }
        self.created.lock().unwrap().push(topic.to_string());
        Ok(Arc::new(RecordingPublisher {
            records: Arc::clone(&self.records),
            sends: Arc::clone(&self.sends),
            offsets: Arc::clone(&self.offsets),
            fail_nth: Arc::clone(&self.fail_nth),
            fail_topics: Arc::clone(&self.fail_topics),
        }))
    }
}

struct RecordingPublisher {
    records: Arc<Mutex<Vec<OutboundRecord>>>,
    sends: Arc<AtomicUsize>,
    offsets: Arc<AtomicI64>,
    fail_nth: Arc<Mutex<Option<usize>>>,
    fail_topics: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn send(&self, record: OutboundRecord) -> Result<Delivery> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut fail_nth = self.fail_nth.lock().unwrap();
            if *fail_nth == Some(n) {
                *fail_nth = None;
                return Err(Error::Delivery {
                    topic: record.topic,
                    reason: "Message timed out".to_string(),
                });
            }
        }
        if self.fail_topics.lock().unwrap().contains(&record.topic) {
            return Err(Error::Delivery {
                topic: record.topic,
                reason: "Broker: Not enough in-sync replicas".to_string(),
            });
        }

        let offset = self.offsets.fetch_add(1, Ordering::SeqCst);
        self.records.lock().unwrap().push(record);
        Ok(Delivery {
            partition: 0,
            offset,
        })
    }
}

/// Source factory handing out one channel-backed subscription.
pub struct ChannelSourceFactory {
    sender: mpsc::UnboundedSender<Result<InboundMessage>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<InboundMessage>>>>,
    pub subscriptions: Mutex<Vec<Vec<String>>>,
    offsets: AtomicI64,
    stored: Arc<RecordingOffsetStore>,
}

impl ChannelSourceFactory {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            subscriptions: Mutex::new(Vec::new()),
            offsets: AtomicI64::new(0),
            stored: Arc::new(RecordingOffsetStore::default()),
        }
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Offsets stored by the engine, in call order.
    pub fn stored_offsets(&self) -> Vec<(String, i32, i64)> {
        self.stored.calls.lock().unwrap().clone()
    }

    /// Waits, on the tokio clock, until `next_offset` was stored for `topic`.
    pub async fn wait_for_stored(&self, topic: &str, next_offset: i64) {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let stored = self
                    .stored_offsets()
                    .iter()
                    .any(|(t, _, offset)| t == topic && *offset >= next_offset);
                if stored {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for stored offset")
    }

    /// Pushes onto partition 0 and returns the assigned offset.
    pub fn push(&self, topic: &str, payload: &[u8], headers: MessageHeaders) -> i64 {
        self.push_keyed(topic, None, payload, headers)
    }

    pub fn push_keyed(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: MessageHeaders,
    ) -> i64 {
        let offset = self.offsets.fetch_add(1, Ordering::SeqCst);
        let message = InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: key.map(<[u8]>::to_vec),
            payload: Some(payload.to_vec()),
            headers,
        };
        self.sender.send(Ok(message)).unwrap();
        offset
    }

    /// Feeds a published record back as if it was consumed.
    pub fn redeliver(&self, record: &OutboundRecord) {
        self.push_keyed(
            &record.topic,
            Some(&record.key),
            &record.payload,
            record.headers.clone(),
        );
    }

    pub fn push_error(&self, error: Error) {
        self.sender.send(Err(error)).unwrap();
    }
}

impl SourceFactory for ChannelSourceFactory {
    fn subscribe(&self, topics: &[String]) -> Result<Box<dyn MessageSource>> {
        self.subscriptions.lock().unwrap().push(topics.to_vec());
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Consume("already subscribed".to_string()))?;
        Ok(Box::new(ChannelSource {
            receiver,
            stored: Arc::clone(&self.stored),
        }))
    }
}

#[derive(Default)]
struct RecordingOffsetStore {
    calls: Mutex<Vec<(String, i32, i64)>>,
}

impl OffsetStore for RecordingOffsetStore {
    fn store(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((topic.to_string(), partition, next_offset));
        Ok(())
    }
}

struct ChannelSource {
    receiver: mpsc::UnboundedReceiver<Result<InboundMessage>>,
    stored: Arc<RecordingOffsetStore>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Result<InboundMessage> {
        match self.receiver.recv().await {
            Some(message) => message,
            // An idle broker: block until the loop is cancelled.
            None => std::future::pending().await,
        }
    }

    fn offset_store(&self) -> Arc<dyn OffsetStore> {
        Arc::clone(&self.stored) as Arc<dyn OffsetStore>
    }
}
