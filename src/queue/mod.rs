//! Asynchronous delivery path: preview jobs arrive on one durable queue and
//! results are published to another.
//!
//! The broker is reached only through the [`Broker`] seam so the consumer's
//! reconnect state machine can be driven by an in-memory double in tests.

pub mod amqp;
pub mod consumer;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use amqp::{AmqpBroker, QueueTopology};
pub use consumer::{ConsumerSettings, ConsumerState, JobConsumer};

#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("consumer stream closed by broker")]
    StreamClosed,
}

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        QueueError::Transport(e.to_string())
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Processing finished; the broker may forget the message.
    async fn ack(&self) -> Result<(), QueueError>;

    /// The message can never succeed; drop it (or dead-letter it, if the
    /// queue has a dead-letter exchange).
    async fn reject(&self) -> Result<(), QueueError>;

    /// The message should be delivered again later.
    async fn requeue(&self) -> Result<(), QueueError>;
}

/// Publishes persistent messages to a named queue.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;
}

/// A raw inbound message plus the handle used to settle it.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub acker: Box<dyn Acknowledge>,
}

/// One live connection to the broker with both queues declared and a
/// consumer attached to the job queue.
#[async_trait]
pub trait BrokerSession: Send {
    /// Next job message. `None` means the broker closed the consumer.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>>;

    fn publisher(&self) -> Arc<dyn Publish>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, QueueError>;
}
