use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lapin::{
    Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};
use tracing::info;

/// Ack/reject surface of a broker channel. The drive loop settles messages
/// through this trait, so the correlation logic is testable without a broker.
#[async_trait]
pub trait MessageSettlement: Send + Sync {
    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error>;
}

/// One connection and channel, bound to a single queue. The channel is owned
/// exclusively by the engine's drive loop; nothing else may ack or reject on
/// it.
pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    queue_name: String,
}

impl RabbitMqClient {
    pub async fn connect(url: &str, queue_name: &str, prefetch_count: u16) -> Result<Self, Error> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {e}"))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {e}"))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {e}"))?;

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {queue_name}: {e}"))?;

        info!(queue = queue_name, prefetch_count, "RabbitMQ channel ready");

        Ok(Self {
            connection,
            channel,
            queue_name: queue_name.to_string(),
        })
    }

    pub async fn create_consumer(&self, consumer_tag: &str) -> Result<Consumer, Error> {
        self.channel
            .basic_consume(
                &self.queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer: {e}"))
    }

    pub async fn close(self) -> Result<(), Error> {
        self.channel
            .close(200, "worker stopping")
            .await
            .map_err(|e| anyhow!("Failed to close channel: {e}"))?;

        self.connection
            .close(200, "worker stopping")
            .await
            .map_err(|e| anyhow!("Failed to close connection: {e}"))
    }
}

#[async_trait]
impl MessageSettlement for RabbitMqClient {
    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {e}"))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| anyhow!("Failed to reject message: {e}"))
    }
}
