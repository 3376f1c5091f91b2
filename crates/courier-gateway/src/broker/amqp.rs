use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use super::{
    Acknowledger, BROADCAST_EXCHANGE, BrokerConnector, BrokerError, BrokerLink, DIRECT_EXCHANGE,
    Delivery, DeliveryStream, InstanceId, QueueKind, routing_key,
};
use crate::dispatcher::Target;

const PREFETCH: u16 = 32;

/// Persistent delivery mode, so queued envelopes survive a broker restart.
const PERSISTENT: u8 = 2;

/// Connects to RabbitMQ (or anything speaking AMQP 0-9-1).
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, instance: &InstanceId) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        channel.basic_qos(PREFETCH, BasicQosOptions::default()).await?;

        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .exchange_declare(BROADCAST_EXCHANGE, ExchangeKind::Fanout, durable, FieldTable::default())
            .await?;
        channel
            .exchange_declare(DIRECT_EXCHANGE, ExchangeKind::Direct, durable, FieldTable::default())
            .await?;

        let fanout_queue = instance.queue_name(QueueKind::Fanout);
        let direct_queue = instance.queue_name(QueueKind::Direct);
        for queue in [&fanout_queue, &direct_queue] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        channel
            .queue_bind(
                &fanout_queue,
                BROADCAST_EXCHANGE,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("Connected to AMQP broker, declared {} and {}", fanout_queue, direct_queue);

        Ok(Arc::new(AmqpLink {
            connection,
            channel,
            fanout_queue,
            direct_queue,
        }))
    }
}

pub struct AmqpLink {
    connection: Connection,
    channel: Channel,
    fanout_queue: String,
    direct_queue: String,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn publish(&self, target: Target<'_>, payload: &[u8]) -> Result<(), BrokerError> {
        let (exchange, key) = match target {
            Target::Everyone => (BROADCAST_EXCHANGE, String::new()),
            Target::User(user) => (DIRECT_EXCHANGE, routing_key(user)),
        };

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let confirmation = self
            .channel
            .basic_publish(exchange, &key, BasicPublishOptions::default(), payload, properties)
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::NotConfirmed);
        }
        Ok(())
    }

    async fn bind_user(&self, user: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &self.direct_queue,
                DIRECT_EXCHANGE,
                &routing_key(user),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_user(&self, user: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_unbind(&self.direct_queue, DIRECT_EXCHANGE, &routing_key(user), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: QueueKind) -> Result<DeliveryStream, BrokerError> {
        let name = match queue {
            QueueKind::Fanout => &self.fanout_queue,
            QueueKind::Direct => &self.direct_queue,
        };

        let consumer = self
            .channel
            .basic_consume(
                name,
                &format!("{name}_consumer"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|delivery| -> Result<Delivery, BrokerError> {
            let delivery = delivery?;
            Ok(Delivery {
                data: delivery.data,
                acker: Box::new(AmqpAcker(delivery.acker)),
            })
        });

        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if let Err(e) = self.channel.close(200, "shutdown").await {
            debug!("Channel close: {}", e);
        }
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}
