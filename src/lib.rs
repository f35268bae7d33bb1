pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod topology;

pub mod kafka;
pub mod outbox;

pub use broker::MessageBroker;
pub use config::Config;
pub use error::{Error, Result};
pub use message::{Envelope, Failure, Handler, Message, Outcome};
pub use topology::TopicConfiguration;
