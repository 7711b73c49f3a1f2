// src/broker/mod.rs
// Broker client seam: the consumers only talk to these traits

pub mod amqp;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::{RabbitMQError, Result};

/// Header carrying the application supplied batch group key.
pub const GROUP_BY_HEADER: &str = "groupBy";

/// One message received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            redelivered: false,
            data: data.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn group_key(&self) -> Option<&str> {
        self.headers.get(GROUP_BY_HEADER).map(String::as_str)
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Broker-side lifecycle notifications for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Error(String),
    Closed,
}

/// Queue declaration options. Unspecified options declare a non-durable queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub message_ttl: Option<u64>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl_ms: u64) -> Self {
        self.message_ttl = Some(ttl_ms);
        self
    }
}

/// Transport options derived from the connection url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// TLS server name hint, the host component of the url
    pub server_name: String,
}

impl ConnectOptions {
    pub fn from_url(url: &str) -> Result<Self> {
        let uri: lapin::uri::AMQPUri = url.parse().map_err(|reason: String| RabbitMQError::InvalidUrl {
            url: url.to_string(),
            reason,
        })?;

        Ok(Self {
            server_name: uri.authority.host,
        })
    }
}

/// Opens physical broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, options: &ConnectOptions) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()>;

    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    async fn nack(&self, delivery: &Delivery, all_up_to: bool, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn purge_queue(&self, queue: &str) -> Result<u32>;

    async fn delete_queue(&self, queue: &str) -> Result<u32>;

    async fn close(&self) -> Result<()>;

    /// Subscribes to error and close notifications of this channel instance.
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;
}
