use crate::config::Config;
use crate::kafka::{
    AdministratorClient, ConsumerEngine, ConsumerHandle, DeclaredTopics, EngineSettings,
    KafkaPublisherFactory, KafkaSourceFactory, KafkaTopicAdmin, MessageProducer,
    ProducerRouter, PublisherFactory, SourceFactory, TopicAdmin,
};
use crate::message::{Handler, Message};
use crate::outbox::{OutboxDispatcher, OutboxStore};
use crate::topology::{TopicConfiguration, Topology};
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Entry point for applications: one per process.
///
/// Holds the shared declared-topic cache, the publisher cache and the
/// consumer engine.
pub struct MessageBroker {
    config: Config,
    admin: Arc<AdministratorClient>,
    router: Arc<ProducerRouter>,
    engine: ConsumerEngine,
}

impl MessageBroker {
    /// Builds rdkafka-backed clients from `config`.
    pub fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        info!(
            brokers = %config.kafka.bootstrap_servers(),
            prefix = %config.kafka.topic_prefix,
            "Connecting message broker"
        );

        let admin: Arc<dyn TopicAdmin> = Arc::new(KafkaTopicAdmin::new(&config.kafka)?);
        let publishers: Arc<dyn PublisherFactory> =
            Arc::new(KafkaPublisherFactory::new(config.kafka.clone()));
        let sources: Arc<dyn SourceFactory> = Arc::new(KafkaSourceFactory::new(
            config.kafka.clone(),
            config.consumer.clone(),
        ));

        Ok(Self::from_parts(config, admin, publishers, sources))
    }

    pub fn from_parts(
        config: Config,
        admin: Arc<dyn TopicAdmin>,
        publishers: Arc<dyn PublisherFactory>,
        sources: Arc<dyn SourceFactory>,
    ) -> Self {
        let admin = Arc::new(AdministratorClient::new(admin, Arc::new(DeclaredTopics::new())));
        let router = Arc::new(ProducerRouter::new(
            publishers,
            config.kafka.topic_prefix.clone(),
        ));
        let engine = ConsumerEngine::new(
            Arc::clone(&admin),
            Arc::clone(&router),
            sources,
            EngineSettings::from_config(&config.kafka, &config.consumer),
        );

        Self {
            config,
            admin,
            router,
            engine,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn admin(&self) -> &Arc<AdministratorClient> {
        &self.admin
    }

    pub fn router(&self) -> &Arc<ProducerRouter> {
        &self.router
    }

    /// Declares the topology of `T` and starts consuming it.
    pub async fn register_consumer<T, H>(
        &self,
        topic_config: TopicConfiguration,
        handler: H,
        cancel: CancellationToken,
    ) -> Result<ConsumerHandle>
    where
        T: Message,
        H: Handler<T>,
    {
        self.engine.register::<T, H>(topic_config, handler, cancel).await
    }

    /// Declares the topology of `T` and returns a publish handle for its
    /// main topic.
    pub async fn register_producer<T: Message>(
        &self,
        topic_config: TopicConfiguration,
    ) -> Result<MessageProducer<T>> {
        let topology = Topology::new(
            &self.config.kafka.topic_prefix,
            T::TYPE_NAME,
            topic_config.retry_count,
        )?;
        self.admin
            .ensure_topics(&topology.names(), topic_config.partitions)
            .await?;

        MessageProducer::new(Arc::clone(&self.router))
    }

    /// A dispatcher for `store` using the `outbox` section of the config.
    pub fn outbox_dispatcher(&self, store: Arc<dyn OutboxStore>) -> OutboxDispatcher {
        OutboxDispatcher::new(
            store,
            Arc::clone(&self.router),
            self.config.outbox.page_size,
            self.config.outbox.poll_interval(),
        )
    }
}
