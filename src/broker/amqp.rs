// src/broker/amqp.rs
// lapin backed implementation of the broker seam

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable},
    uri::AMQPUri,
    Channel, Connection, ConnectionProperties,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::{
    BrokerChannel, BrokerConnection, ChannelEvent, ConnectOptions, Connector, Delivery, DeliveryStream,
    QueueOptions,
};
use crate::errors::{LapinResultExt, RabbitMQError, Result};

#[derive(Clone, Default)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, url: &str, options: &ConnectOptions) -> Result<Arc<dyn BrokerConnection>> {
        let uri: AMQPUri = url.parse().map_err(|reason: String| RabbitMQError::InvalidUrl {
            url: url.to_string(),
            reason,
        })?;

        // lapin negotiates TLS against the uri host, which is the server name hint
        info!(server_name = %options.server_name, "Connecting to RabbitMQ");
        let connection = Connection::connect_uri(uri, self.properties.clone())
            .await
            .or_connection()?;

        debug!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection { connection }))
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.or_channel()?;
        let (events, _) = broadcast::channel(16);

        let notifier = events.clone();
        channel.on_error(move |err| {
            error!("Channel error: {}", err);
            let _ = notifier.send(ChannelEvent::Error(err.to_string()));
            // a channel level exception always closes the channel
            let _ = notifier.send(ChannelEvent::Closed);
        });

        info!(channel_id = channel.id(), "Channel created");
        Ok(Arc::new(LapinChannel { channel, events }))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing RabbitMQ connection gracefully");
        self.connection.close(0, "Closing connection").await.or_connection()
    }
}

pub struct LapinChannel {
    channel: Channel,
    events: broadcast::Sender<ChannelEvent>,
}

fn declare_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(ttl) = options.message_ttl {
        arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl as i64));
    }
    if let Some(exchange) = &options.dead_letter_exchange {
        arguments.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(exchange.clone().into()));
    }
    if let Some(routing_key) = &options.dead_letter_routing_key {
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.clone().into()),
        );
    }
    arguments
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::LongInt(i) => Some(i.to_string()),
        AMQPValue::LongLongInt(i) => Some(i.to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(name, value)| header_value(value).map(|v| (name.as_str().to_string(), v)))
                    .collect()
            })
            .unwrap_or_default();

        Delivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            data: delivery.data,
            headers,
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };

        let declared = self
            .channel
            .queue_declare(queue, declare, declare_arguments(options))
            .await
            .or_channel()?;

        debug!(queue, messages = declared.message_count(), "Queue asserted");
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        debug!("Setting channel QoS to {}", count);
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .or_channel()
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .or_consume()?;

        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).or_consume())
            .boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
            .or_ack()
    }

    async fn nack(&self, delivery: &Delivery, all_up_to: bool, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery.delivery_tag,
                BasicNackOptions {
                    multiple: all_up_to,
                    requeue,
                },
            )
            .await
            .or_ack()
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .or_consume()
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .or_channel()
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .or_channel()
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(0, "Closing channel").await.or_channel()?;
        let _ = self.events.send(ChannelEvent::Closed);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
