//! Topic naming rules for a message type.
//!
//! Every message type owns a main topic, `retry_count` retry topics and one
//! dead-letter topic. Names are derived from the configured prefix and the
//! type name:
//!
//! ```rust
//! use resilient_kafka::topology::{dlq_topic, main_topic, retry_topic};
//!
//! assert_eq!(main_topic("dev", "CreateOrderCommand").unwrap(), "dev_create_order");
//! assert_eq!(retry_topic("dev", "CreateOrderCommand", 2).unwrap(), "dev_create_order_retry_2");
//! assert_eq!(dlq_topic("dev", "CreateOrderCommand").unwrap(), "dev_create_order_dlq");
//! ```

use crate::{Error, Result};
use std::collections::HashMap;

const TOPIC_SEPARATOR: char = '_';
const COMMAND_SUFFIX: &str = "Command";
const EVENT_SUFFIX: &str = "Event";
const RETRY_SUFFIX: &str = "retry";
const DLQ_SUFFIX: &str = "dlq";

/// Per-message-type policy supplied at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicConfiguration {
    /// Partition count, only used when the topics are created.
    pub partitions: i32,
    /// Maximum escalation depth before dead-lettering.
    pub retry_count: u32,
}

impl TopicConfiguration {
    pub fn new(partitions: i32, retry_count: u32) -> Self {
        Self {
            partitions,
            retry_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicRole {
    Main,
    Retry,
    Dlq,
}

/// The derived topic set of one message type.
#[derive(Debug, Clone)]
pub struct Topology {
    main: String,
    retries: Vec<String>,
    dlq: String,
    roles: HashMap<String, TopicRole>,
}

impl Topology {
    pub fn new(prefix: &str, type_name: &str, retry_count: u32) -> Result<Self> {
        let main = main_topic(prefix, type_name)?;
        let retries: Vec<String> = (1..=retry_count)
            .map(|attempt| retry_name(&main, attempt))
            .collect();
        let dlq = dlq_name(&main);

        let mut roles = HashMap::with_capacity(retries.len() + 2);
        roles.insert(main.clone(), TopicRole::Main);
        for retry in &retries {
            roles.insert(retry.clone(), TopicRole::Retry);
        }
        roles.insert(dlq.clone(), TopicRole::Dlq);

        Ok(Self {
            main,
            retries,
            dlq,
            roles,
        })
    }

    pub fn main(&self) -> &str {
        &self.main
    }

    pub fn retries(&self) -> &[String] {
        &self.retries
    }

    pub fn dlq(&self) -> &str {
        &self.dlq
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.len() as u32
    }

    /// All topic names in order: main, retry 1..n, dlq.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.retries.len() + 2);
        names.push(self.main.clone());
        names.extend(self.retries.iter().cloned());
        names.push(self.dlq.clone());
        names
    }

    /// Topics the consumer engine reads from. The dead-letter topic is a sink.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.retries.len() + 1);
        names.push(self.main.clone());
        names.extend(self.retries.iter().cloned());
        names
    }

    pub fn role_of(&self, topic: &str) -> Option<TopicRole> {
        self.roles.get(topic).copied()
    }
}

/// Main topic for a type: `snake_case(prefix + trimmed type name)`.
pub fn main_topic(prefix: &str, type_name: &str) -> Result<String> {
    let trimmed = trim_type_name(type_name)?;
    Ok(to_snake_case(&format!("{}{}", prefix, trimmed)))
}

pub fn retry_topic(prefix: &str, type_name: &str, attempt: u32) -> Result<String> {
    Ok(retry_name(&main_topic(prefix, type_name)?, attempt))
}

pub fn dlq_topic(prefix: &str, type_name: &str) -> Result<String> {
    Ok(dlq_name(&main_topic(prefix, type_name)?))
}

/// Ordered topic set `{main} ∪ {retry_1..retry_n} ∪ {dlq}` tagged by role.
pub fn resilience_topics(
    prefix: &str,
    type_name: &str,
    retry_count: u32,
) -> Result<Vec<(String, TopicRole)>> {
    let topology = Topology::new(prefix, type_name, retry_count)?;
    Ok(topology
        .names()
        .into_iter()
        .map(|name| {
            let role = topology.roles[&name];
            (name, role)
        })
        .collect())
}

fn retry_name(main: &str, attempt: u32) -> String {
    format!(
        "{}{}{}{}{}",
        main, TOPIC_SEPARATOR, RETRY_SUFFIX, TOPIC_SEPARATOR, attempt
    )
}

fn dlq_name(main: &str) -> String {
    format!("{}{}{}", main, TOPIC_SEPARATOR, DLQ_SUFFIX)
}

// A type named exactly "Event" or "Command" keeps its name.
fn trim_type_name(type_name: &str) -> Result<&str> {
    let type_name = type_name.trim();
    if type_name.is_empty() {
        return Err(Error::InvalidTypeName(type_name.to_string()));
    }

    let trimmed = type_name
        .strip_suffix(COMMAND_SUFFIX)
        .or_else(|| type_name.strip_suffix(EVENT_SUFFIX))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(type_name);

    Ok(trimmed)
}

fn to_snake_case(value: &str) -> String {
    let mut snake = String::with_capacity(value.len() + 8);
    for (i, c) in value.chars().enumerate() {
        if c.is_uppercase() && i != 0 {
            snake.push(TOPIC_SEPARATOR);
        }
        snake.extend(c.to_lowercase());
    }
    snake
}
