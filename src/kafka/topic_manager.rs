//! Idempotent topic declaration.
//!
//! [`AdministratorClient`] makes sure a set of topics exists before a consumer
//! or producer starts. Names confirmed to exist are remembered in a
//! [`DeclaredTopics`] cache so repeated registrations skip the broker.

use crate::config::KafkaConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
    Failed(String),
}

/// Broker-side topic administration.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Returns the subset of `names` that does not exist on the broker.
    ///
    /// An "unknown topic" answer means missing and a topic still electing its
    /// leader exists; any other broker error is fatal.
    async fn missing_topics(&self, names: &[String]) -> Result<Vec<String>>;

    /// Number of live brokers in the cluster.
    async fn broker_count(&self) -> Result<usize>;

    /// Creates all topics in one request and reports the outcome per topic.
    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<Vec<(String, CreateOutcome)>>;
}

/// Process-local set of topic names known to exist.
///
/// Created once at startup and shared by reference. Append-only; rebuilt
/// from scratch on restart, which is safe because declaration is idempotent.
#[derive(Debug, Default)]
pub struct DeclaredTopics {
    names: RwLock<HashSet<String>>,
}

impl DeclaredTopics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    pub fn insert_all<I>(&self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(names);
    }

    /// Names from `names` not yet declared, deduplicated, order preserved.
    pub fn undeclared(&self, names: &[String]) -> Vec<String> {
        let declared = self.names.read().unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        names
            .iter()
            .filter(|name| !declared.contains(name.as_str()) && seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AdministratorClient {
    admin: Arc<dyn TopicAdmin>,
    declared: Arc<DeclaredTopics>,
}

impl AdministratorClient {
    pub fn new(admin: Arc<dyn TopicAdmin>, declared: Arc<DeclaredTopics>) -> Self {
        Self { admin, declared }
    }

    pub fn declared(&self) -> &Arc<DeclaredTopics> {
        &self.declared
    }

    /// Ensures every topic in `names` exists with `partitions` partitions.
    ///
    /// Safe to call concurrently for overlapping sets: a racing creator makes
    /// the broker answer "already exists", which counts as success.
    #[instrument(skip(self, names), fields(topics = names.len()))]
    pub async fn ensure_topics(&self, names: &[String], partitions: i32) -> Result<()> {
        let pending = self.declared.undeclared(names);
        if pending.is_empty() {
            debug!("All topics already declared");
            return Ok(());
        }

        let missing = self.admin.missing_topics(&pending).await?;
        let existing: Vec<String> = pending
            .iter()
            .filter(|name| !missing.contains(name))
            .cloned()
            .collect();
        if !existing.is_empty() {
            debug!("Topics already exist on broker: {}", existing.join(", "));
            self.declared.insert_all(existing);
        }

        if missing.is_empty() {
            return Ok(());
        }

        let replication_factor = self.admin.broker_count().await?.max(1) as i32;
        let specs: Vec<TopicSpec> = missing
            .iter()
            .map(|name| TopicSpec {
                name: name.clone(),
                partitions,
                replication_factor,
            })
            .collect();

        info!(
            replication_factor,
            partitions,
            "Creating topics: {}",
            missing.join(", ")
        );

        let outcomes = self.admin.create_topics(&specs).await?;
        let mut created = Vec::with_capacity(outcomes.len());
        for (topic, outcome) in outcomes {
            match outcome {
                CreateOutcome::Created => {
                    info!("Successfully created topic: {}", topic);
                    created.push(topic);
                }
                CreateOutcome::AlreadyExists => {
                    debug!("Topic '{}' was created concurrently", topic);
                    created.push(topic);
                }
                CreateOutcome::Failed(reason) => {
                    warn!("Failed to create topic '{}': {}", topic, reason);
                    self.declared.insert_all(created);
                    return Err(Error::Topology { topic, reason });
                }
            }
        }

        self.declared.insert_all(created);
        Ok(())
    }
}

/// [`TopicAdmin`] backed by an rdkafka [`AdminClient`].
pub struct KafkaTopicAdmin {
    admin_client: Arc<AdminClient<DefaultClientContext>>,
    request_timeout: Duration,
    operation_timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let admin_client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("allow.auto.create.topics", "false")
            .create()?;

        Ok(Self {
            admin_client: Arc::new(admin_client),
            request_timeout: config.request_timeout(),
            operation_timeout: config.operation_timeout(),
        })
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new()
            .request_timeout(Some(self.request_timeout))
            .operation_timeout(Some(self.operation_timeout))
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn missing_topics(&self, names: &[String]) -> Result<Vec<String>> {
        let admin_client = Arc::clone(&self.admin_client);
        let names = names.to_vec();
        let timeout = self.request_timeout;

        // Metadata requests block the calling thread.
        tokio::task::spawn_blocking(move || {
            let metadata = admin_client
                .inner()
                .fetch_metadata(None, timeout)
                .map_err(|e| Error::Topology {
                    topic: names.join(","),
                    reason: e.to_string(),
                })?;

            let reported: Vec<(&str, Option<RDKafkaErrorCode>)> = metadata
                .topics()
                .iter()
                .map(|topic| (topic.name(), topic.error().map(RDKafkaErrorCode::from)))
                .collect();
            missing_from_metadata(&names, &reported)
        })
        .await
        .map_err(|e| Error::Topology {
            topic: String::new(),
            reason: format!("metadata task failed: {}", e),
        })?
    }

    async fn broker_count(&self) -> Result<usize> {
        let admin_client = Arc::clone(&self.admin_client);
        let timeout = self.request_timeout;

        tokio::task::spawn_blocking(move || {
            admin_client
                .inner()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
                .map_err(|e| Error::Topology {
                    topic: String::new(),
                    reason: format!("cluster describe failed: {}", e),
                })
        })
        .await
        .map_err(|e| Error::Topology {
            topic: String::new(),
            reason: format!("metadata task failed: {}", e),
        })?
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<Vec<(String, CreateOutcome)>> {
        let new_topics: Vec<NewTopic<'_>> = specs
            .iter()
            .map(|spec| {
                NewTopic::new(
                    &spec.name,
                    spec.partitions,
                    TopicReplication::Fixed(spec.replication_factor),
                )
            })
            .collect();

        let opts = self.options();
        let results = self
            .admin_client
            .create_topics(&new_topics, &opts)
            .await
            .map_err(|e| Error::Topology {
                topic: specs
                    .iter()
                    .map(|spec| spec.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: e.to_string(),
            })?;

        Ok(results
            .into_iter()
            .map(|result| match result {
                Ok(topic) => (topic, CreateOutcome::Created),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    (topic, CreateOutcome::AlreadyExists)
                }
                Err((topic, code)) => (topic, CreateOutcome::Failed(code.to_string())),
            })
            .collect())
    }
}

/// Diffs `names` against the topics a cluster metadata response reported.
///
/// Absent or "unknown topic" means missing. A topic without a leader yet
/// exists; it was just created and is still electing one.
fn missing_from_metadata(
    names: &[String],
    reported: &[(&str, Option<RDKafkaErrorCode>)],
) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for name in names {
        match reported.iter().find(|(topic, _)| *topic == name.as_str()) {
            None | Some((_, Some(RDKafkaErrorCode::UnknownTopicOrPartition))) => {
                missing.push(name.clone())
            }
            Some((_, None)) | Some((_, Some(RDKafkaErrorCode::LeaderNotAvailable))) => {}
            Some((_, Some(code))) => {
                return Err(Error::Topology {
                    topic: name.clone(),
                    reason: code.to_string(),
                })
            }
        }
    }
    Ok(missing)
}
