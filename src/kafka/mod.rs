pub mod consumer;
pub mod headers;
pub mod offsets;
pub mod producer;
pub mod serializer;
pub mod topic_manager;


pub use consumer::{
    ConsumerEngine, ConsumerHandle, EngineSettings, InboundMessage, KafkaSource,
    KafkaSourceFactory, MessageSource, SourceFactory,
};
pub use offsets::{KafkaOffsetStore, OffsetStore, OffsetTracker};
pub use headers::MessageHeaders;
pub use producer::{
    Delivery, KafkaPublisher, KafkaPublisherFactory, MessageProducer, OutboundRecord, Publisher,
    PublisherFactory, ProducerRouter,
};
pub use serializer::JsonSerializer;
pub use topic_manager::{
    AdministratorClient, CreateOutcome, DeclaredTopics, KafkaTopicAdmin, TopicAdmin, TopicSpec,
};
