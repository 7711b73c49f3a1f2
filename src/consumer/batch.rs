// src/consumer/batch.rs
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::single::DEFAULT_RETRY_TIME;
use super::{consume_loop, decode, new_consumer_tag, BatchHandler, ChannelHook};
use crate::batcher::GroupBatcher;
use crate::broker::{BrokerChannel, Delivery, QueueOptions};
use crate::config::{resolve_prefetch, DEFAULT_CONNECTION_TYPE};
use crate::crypto::Crypto;
use crate::errors::{RabbitMQError, Result};
use crate::pool::{ChannelPool, QueueClient};
use crate::retryable::HandlerError;

const DEFAULT_PREFETCH_COUNT: u16 = 1024;
const DEFAULT_BATCH_SIZE: usize = 1024;
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(1000);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct BatchConsumerConfig {
    pub channel: String,
    pub connection_type: String,
    pub retry_time: Duration,
    pub prefetch_count: Option<u16>,
    pub queue_options: QueueOptions,
    pub crypto: Option<Arc<dyn Crypto>>,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub on_channel_established: Option<ChannelHook>,
}

impl BatchConsumerConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            connection_type: DEFAULT_CONNECTION_TYPE.to_string(),
            retry_time: DEFAULT_RETRY_TIME,
            prefetch_count: None,
            queue_options: QueueOptions::default(),
            crypto: None,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            on_channel_established: None,
        }
    }

    pub fn connection_type(mut self, connection_type: impl Into<String>) -> Self {
        self.connection_type = connection_type.into();
        self
    }

    pub fn retry_time(mut self, retry_time: Duration) -> Self {
        self.retry_time = retry_time;
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn queue_options(mut self, queue_options: QueueOptions) -> Self {
        self.queue_options = queue_options;
        self
    }

    pub fn crypto(mut self, crypto: impl Crypto + 'static) -> Self {
        self.crypto = Some(Arc::new(crypto));
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }

    pub fn on_channel_established<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_channel_established = Some(Arc::new(move |channel: Arc<dyn BrokerChannel>| {
            Box::pin(hook(channel)) as BoxFuture<'static, Result<()>>
        }));
        self
    }
}

/// Consumes a queue in groups keyed by the `groupBy` header.
///
/// Every member of a flushed group shares the handler's outcome: all are
/// acked, all are requeued after `retry_time`, or all are discarded.
#[derive(Clone)]
pub struct BatchConsumer {
    inner: Arc<BatchInner>,
}

struct BatchInner {
    pool: ChannelPool,
    config: BatchConsumerConfig,
    handler: Arc<dyn BatchHandler>,
    prefetch_count: u16,
    batcher: GroupBatcher<Received>,
    in_flight: AtomicUsize,
    // serializes subscribe, cancel and teardown
    lifecycle: tokio::sync::Mutex<()>,
    setup: Mutex<Option<Arc<Setup>>>,
    consumer_tag: Mutex<Option<String>>,
}

struct Setup {
    client: QueueClient,
    channel: Arc<dyn BrokerChannel>,
}

/// A delivery together with the channel it has to be settled on.
struct Received {
    channel: Arc<dyn BrokerChannel>,
    delivery: Delivery,
}

impl BatchConsumer {
    pub fn new(pool: ChannelPool, config: BatchConsumerConfig, handler: impl BatchHandler + 'static) -> Result<Self> {
        if config.channel.is_empty() {
            return Err(RabbitMQError::NoQueueName);
        }
        let prefetch_count = resolve_prefetch(config.prefetch_count, DEFAULT_PREFETCH_COUNT);
        if (prefetch_count as usize) < config.batch_size {
            return Err(RabbitMQError::InvalidConfiguration(
                "Batch Consumer prefetchCount should be larger than batchSize".to_string(),
            ));
        }

        let inner = Arc::new_cyclic(|weak: &Weak<BatchInner>| {
            let weak = weak.clone();
            let batcher = GroupBatcher::new(config.batch_size, config.batch_timeout, move |group_by, received| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_collected(group_by, received).await;
                    }
                }
            });

            BatchInner {
                pool,
                config,
                handler: Arc::new(handler),
                prefetch_count,
                batcher,
                in_flight: AtomicUsize::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                setup: Mutex::new(None),
                consumer_tag: Mutex::new(None),
            }
        });

        Ok(Self { inner })
    }

    pub fn prefetch_count(&self) -> u16 {
        self.inner.prefetch_count
    }

    /// Subscribes to the queue and returns the consumer tag.
    ///
    /// While a subscription is live its tag is returned and nothing new is
    /// started. After [`stop_consumption`](Self::stop_consumption) a fresh tag
    /// is used; after the broker closed the channel a new channel is taken
    /// from the pool.
    pub async fn process(&self) -> Result<String> {
        info!(queue = %self.inner.config.channel, "[AMQP] Process");
        self.inner.start().await.inspect_err(|e| {
            error!(queue = %self.inner.config.channel, error = %e, "Consumer initialization error");
        })
    }

    /// Cancels the broker subscription. Returns `false` when nothing was
    /// consuming. Deliveries already received still settle.
    pub async fn stop_consumption(&self) -> Result<bool> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.cancel_current().await
    }

    pub fn is_finished(&self) -> bool {
        self.in_flight() == 0
    }

    /// Deliveries received but not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn consumer_tag(&self) -> Option<String> {
        self.inner.lock_tag().clone()
    }

    pub fn is_active_tag(&self, consumer_tag: &str) -> bool {
        self.inner.lock_tag().as_deref() == Some(consumer_tag)
    }

    /// Stops consumption, waits for every in-flight delivery to settle, then
    /// closes the channel and its connection. The connection also leaves the
    /// pool, so a later acquisition of the same connection type reconnects.
    pub async fn shutdown(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.cancel_current().await?;
        while !self.is_finished() {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        let setup = self.inner.lock_setup().take();
        if let Some(setup) = setup {
            setup.channel.close().await?;
            setup.client.close_connection().await?;
        }
        info!(queue = %self.inner.config.channel, "BatchConsumer shut down");
        Ok(())
    }
}

impl BatchInner {
    fn lock_tag(&self) -> MutexGuard<'_, Option<String>> {
        self.consumer_tag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_setup(&self) -> MutexGuard<'_, Option<Arc<Setup>>> {
        self.setup.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // caller holds `lifecycle`
    async fn ensure_setup(&self) -> Result<Arc<Setup>> {
        let cached = self.lock_setup().clone();
        if let Some(setup) = cached {
            return Ok(setup);
        }

        let client = self
            .pool
            .acquire(&self.config.channel, &self.config.connection_type, &self.config.queue_options)
            .await?;
        let channel = client.channel()?;
        channel.prefetch(self.prefetch_count).await?;
        if let Some(hook) = &self.config.on_channel_established {
            hook(Arc::clone(&channel)).await?;
        }

        let setup = Arc::new(Setup { client, channel });
        *self.lock_setup() = Some(Arc::clone(&setup));
        Ok(setup)
    }

    /// Forgets the cached setup if it still uses `channel`.
    fn reset_setup(&self, channel: &Arc<dyn BrokerChannel>) {
        let mut setup = self.lock_setup();
        if setup
            .as_ref()
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(&current.channel), Arc::as_ptr(channel)))
        {
            *setup = None;
        }
    }

    // caller holds `lifecycle`
    async fn cancel_current(&self) -> Result<bool> {
        let tag = self.lock_tag().clone();
        let Some(tag) = tag else {
            return Ok(false);
        };
        let setup = self.lock_setup().clone();
        let Some(setup) = setup else {
            return Ok(false);
        };

        // the tag stays active until the broker confirms the cancel
        setup.channel.cancel(&tag).await?;
        let mut current = self.lock_tag();
        if current.as_deref() == Some(tag.as_str()) {
            *current = None;
        }
        info!(queue = %self.config.channel, consumer_tag = %tag, "Consumer cancelled");
        Ok(true)
    }

    async fn start(self: &Arc<Self>) -> Result<String> {
        let _lifecycle = self.lifecycle.lock().await;
        let queue = &self.config.channel;
        let running = self.lock_tag().clone();
        if let Some(consumer_tag) = running {
            debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer already running");
            return Ok(consumer_tag);
        }

        let channel = Arc::clone(&self.ensure_setup().await?.channel);
        let events = channel.events();
        let consumer_tag = new_consumer_tag(queue);
        let deliveries = match channel.consume(queue, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.reset_setup(&channel);
                return Err(e);
            }
        };
        *self.lock_tag() = Some(consumer_tag.clone());
        info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");

        let inner = Arc::clone(self);
        let tag = consumer_tag.clone();
        tokio::spawn(async move {
            let receiver = Arc::clone(&inner);
            let source = Arc::clone(&channel);
            let result = consume_loop(deliveries, events, false, move |delivery| {
                receiver.receive(Arc::clone(&source), delivery)
            })
            .await;

            if let Err(e) = result {
                error!(queue = %inner.config.channel, consumer_tag = %tag, error = %e, "BatchConsumer stopped");
                // the channel is gone; the next process() takes a new one from the pool
                inner.reset_setup(&channel);
                let mut current = inner.lock_tag();
                if current.as_deref() == Some(tag.as_str()) {
                    *current = None;
                }
            }
        });

        Ok(consumer_tag)
    }

    fn receive(&self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let group_by = delivery.group_key().unwrap_or_default().to_string();
        self.batcher.add(group_by, Received { channel, delivery });
    }

    async fn handle_collected(&self, group_by: String, received: Vec<Received>) {
        let count = received.len();

        let mut contents: Vec<Value> = Vec::with_capacity(count);
        for item in &received {
            match decode(&item.delivery.data, self.config.crypto.as_deref()).await {
                Ok(content) => contents.push(content),
                Err(e) => {
                    error!(
                        queue = %self.config.channel,
                        group_by = %group_by,
                        count,
                        error = %e,
                        "BatchConsumer error finish"
                    );
                    self.nack_all(&received, false).await;
                    return;
                }
            }
        }

        match self.handler.handle(&group_by, contents).await {
            Ok(()) => {
                info!(queue = %self.config.channel, group_by = %group_by, count, "BatchConsumer-success");
                for item in &received {
                    if let Err(e) = item.channel.ack(&item.delivery).await {
                        error!(delivery_tag = item.delivery.delivery_tag, "Failed to acknowledge message: {}", e);
                    }
                }
                self.in_flight.fetch_sub(count, Ordering::SeqCst);
            }
            Err(error) if error.is_retryable() => {
                warn!(
                    queue = %self.config.channel,
                    group_by = %group_by,
                    count,
                    error = %error,
                    "BatchConsumer error retry"
                );
                tokio::time::sleep(self.config.retry_time).await;
                self.nack_all(&received, true).await;
            }
            Err(error) => {
                self.log_finish(&error, &group_by, count);
                self.nack_all(&received, false).await;
            }
        }
    }

    async fn nack_all(&self, received: &[Received], requeue: bool) {
        for item in received {
            if let Err(e) = item.channel.nack(&item.delivery, false, requeue).await {
                error!(
                    delivery_tag = item.delivery.delivery_tag,
                    "Failed to negatively acknowledge message: {}", e
                );
            }
        }
        self.in_flight.fetch_sub(received.len(), Ordering::SeqCst);
    }

    fn log_finish(&self, error: &HandlerError, group_by: &str, count: usize) {
        let error_data = error.data().cloned().unwrap_or(Value::Null);
        error!(
            queue = %self.config.channel,
            group_by = %group_by,
            count,
            error = %error,
            error_data = %error_data,
            "BatchConsumer error finish"
        );
    }
}
