use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tracing::info;

use super::{Acknowledge, Broker, BrokerSession, Delivery, Publish, QueueError};
use crate::config::Config;

const CONSUMER_TAG: &str = "bearlink-preview";
const PERSISTENT: u8 = 2;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Queue names and prefetch applied on every (re)connect.
#[derive(Clone, Debug)]
pub struct QueueTopology {
    pub job_queue: String,
    pub result_queue: String,
    pub prefetch: u16,
}

impl QueueTopology {
    pub fn from_config(config: &Config) -> Self {
        QueueTopology {
            job_queue: config.job_queue.clone(),
            result_queue: config.result_queue.clone(),
            prefetch: u16::try_from(config.preview_workers).unwrap_or(u16::MAX),
        }
    }
}

/// RabbitMQ (AMQP 0-9-1) implementation of the broker seam.
pub struct AmqpBroker {
    url: String,
    topology: QueueTopology,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>, topology: QueueTopology) -> Self {
        Self {
            url: url.into(),
            topology,
        }
    }
}

impl AmqpBroker {
    /// Channel setup on an open connection: declare both queues, enable
    /// publisher confirms, apply prefetch and start consuming jobs.
    async fn open_consumer(
        &self,
        connection: &Connection,
    ) -> Result<(Channel, Consumer), lapin::Error> {
        let channel = connection.create_channel().await?;

        for queue in [&self.topology.job_queue, &self.topology.result_queue] {
            let durable = QueueDeclareOptions {
                durable: true,
                ..Default::default()
            };
            channel
                .queue_declare(queue, durable, FieldTable::default())
                .await?;
        }

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .basic_qos(self.topology.prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                &self.topology.job_queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok((channel, consumer))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, QueueError> {
        info!("🔌 Connecting to message broker...");

        let props = ConnectionProperties::default().with_connection_name(CONSUMER_TAG.into());
        let connection = Connection::connect(&self.url, props).await?;

        let (channel, consumer) = match self.open_consumer(&connection).await {
            Ok(opened) => opened,
            Err(e) => {
                // The socket is open even though setup failed; close it before
                // the next retry opens another.
                close_connection(&connection, "consumer setup failed").await;
                return Err(e.into());
            }
        };

        info!(
            job_queue = %self.topology.job_queue,
            result_queue = %self.topology.result_queue,
            "✅ Broker connected, queues declared"
        );

        Ok(Box::new(AmqpSession {
            connection: Arc::new(connection),
            consumer,
            publisher: Arc::new(AmqpPublisher { channel }),
        }))
    }
}

async fn close_connection(connection: &Connection, reason: &str) {
    if !connection.status().connected() {
        return;
    }
    match tokio::time::timeout(CLOSE_TIMEOUT, connection.close(200, reason)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "Broker connection close failed"),
        Err(_) => tracing::debug!("Broker connection close timed out"),
    }
}

struct AmqpSession {
    connection: Arc<Connection>,
    consumer: Consumer,
    publisher: Arc<AmqpPublisher>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| Delivery {
                payload: delivery.data,
                acker: Box::new(AmqpAcker(delivery.acker)),
            })
            .map_err(QueueError::from),
        )
    }

    fn publisher(&self) -> Arc<dyn Publish> {
        self.publisher.clone()
    }
}

// Close the connection in the background when a session ends so repeated
// reconnects do not leak sockets.
impl Drop for AmqpSession {
    fn drop(&mut self) {
        let connection = Arc::clone(&self.connection);
        if connection.status().connected() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    close_connection(&connection, "consumer session ended").await;
                });
            }
        }
    }
}

struct AmqpPublisher {
    channel: Channel,
}

#[async_trait]
impl Publish for AmqpPublisher {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let confirmation = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(QueueError::Transport(format!(
                "broker refused message for queue {queue}"
            )));
        }
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<(), QueueError> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }

    async fn requeue(&self) -> Result<(), QueueError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await?;
        Ok(())
    }
}
