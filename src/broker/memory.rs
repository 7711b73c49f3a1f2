// src/broker/memory.rs
// In-process broker used by the test-suite. Every call is recorded so tests
// can assert on the exact acknowledgment traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    BrokerChannel, BrokerConnection, ChannelEvent, ConnectOptions, Connector, Delivery, DeliveryStream,
    QueueOptions, GROUP_BY_HEADER,
};
use crate::errors::{RabbitMQError, Result};

/// A nack as the broker received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackRecord {
    pub delivery_tag: u64,
    pub all_up_to: bool,
    pub requeue: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Delivery>,
    consumers: Vec<(String, mpsc::UnboundedSender<Result<Delivery>>)>,
}

#[derive(Default)]
struct BrokerState {
    connects: AtomicUsize,
    channels_created: AtomicUsize,
    next_delivery_tag: AtomicU64,
    connect_urls: Mutex<Vec<(String, ConnectOptions)>>,
    queues: Mutex<HashMap<String, QueueState>>,
    assertions: Mutex<Vec<(String, QueueOptions)>>,
    prefetch: Mutex<Vec<u16>>,
    acks: Mutex<Vec<u64>>,
    nacks: Mutex<Vec<NackRecord>>,
    cancelled: Mutex<Vec<String>>,
    purged: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    closed_connections: AtomicUsize,
    reject_cancels: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Requeued deliveries are recorded but never redelivered.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a payload and returns the delivery tag it was given.
    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) -> u64 {
        let tag = self.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.dispatch(queue, Delivery::new(tag, payload));
        tag
    }

    pub fn publish_with_group(&self, queue: &str, group_by: &str, payload: impl Into<Vec<u8>>) -> u64 {
        let tag = self.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.dispatch(queue, Delivery::new(tag, payload).with_header(GROUP_BY_HEADER, group_by));
        tag
    }

    fn dispatch(&self, queue: &str, delivery: Delivery) {
        let mut queues = lock(&self.state.queues);
        let state = queues.entry(queue.to_string()).or_default();
        state.consumers.retain(|(_, sender)| !sender.is_closed());
        match state.consumers.first() {
            Some((_, sender)) => {
                let _ = sender.send(Ok(delivery));
            }
            None => state.pending.push_back(delivery),
        }
    }

    /// Simulates a broker-initiated close of every open channel.
    pub fn close_channels(&self) {
        for channel in lock(&self.state.channels).drain(..) {
            channel.shutdown();
        }
    }

    /// Simulates a channel level exception followed by the close it causes.
    pub fn fail_channels(&self, message: &str) {
        for channel in lock(&self.state.channels).drain(..) {
            let _ = channel.events.send(ChannelEvent::Error(message.to_string()));
            channel.shutdown();
        }
    }

    /// Makes every following `cancel` fail while leaving the consumer subscribed.
    pub fn reject_cancels(&self, reject: bool) {
        self.state.reject_cancels.store(reject, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> Vec<(String, ConnectOptions)> {
        lock(&self.state.connect_urls).clone()
    }

    pub fn channel_count(&self) -> usize {
        self.state.channels_created.load(Ordering::SeqCst)
    }

    pub fn closed_connections(&self) -> usize {
        self.state.closed_connections.load(Ordering::SeqCst)
    }

    pub fn assertions(&self) -> Vec<(String, QueueOptions)> {
        lock(&self.state.assertions).clone()
    }

    pub fn prefetch_calls(&self) -> Vec<u16> {
        lock(&self.state.prefetch).clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        lock(&self.state.acks).clone()
    }

    pub fn nacks(&self) -> Vec<NackRecord> {
        lock(&self.state.nacks).clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.state.cancelled).clone()
    }

    pub fn purged(&self) -> Vec<String> {
        lock(&self.state.purged).clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state.deleted).clone()
    }

    /// Tags of the consumers currently subscribed to `queue`.
    pub fn consumers(&self, queue: &str) -> Vec<String> {
        lock(&self.state.queues)
            .get(queue)
            .map(|state| {
                state
                    .consumers
                    .iter()
                    .filter(|(_, sender)| !sender.is_closed())
                    .map(|(tag, _)| tag.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, url: &str, options: &ConnectOptions) -> Result<Arc<dyn BrokerConnection>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.connect_urls).push((url.to_string(), options.clone()));
        // give concurrent acquirers a chance to interleave
        tokio::task::yield_now().await;
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.state.channels_created.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let (events, _) = broadcast::channel(16);
        let channel = Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            events,
            tags: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        lock(&self.state.channels).push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.state.closed_connections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryChannel {
    state: Arc<BrokerState>,
    events: broadcast::Sender<ChannelEvent>,
    tags: Mutex<Vec<(String, String)>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn drop_consumer(&self, queue: &str, consumer_tag: &str) {
        if let Some(state) = lock(&self.state.queues).get_mut(queue) {
            state.consumers.retain(|(tag, _)| tag != consumer_tag);
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Closed);
        let subscriptions: Vec<(String, String)> = lock(&self.tags).drain(..).collect();
        for (queue, tag) in subscriptions {
            self.drop_consumer(&queue, &tag);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        lock(&self.state.assertions).push((queue.to_string(), options.clone()));
        lock(&self.state.queues).entry(queue.to_string()).or_default();
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        lock(&self.state.prefetch).push(count);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut queues = lock(&self.state.queues);
        let state = queues.entry(queue.to_string()).or_default();
        if state.consumers.iter().any(|(tag, _)| tag == consumer_tag) {
            return Err(RabbitMQError::ConsumeError(format!("consumer tag {} already in use", consumer_tag)));
        }
        for delivery in state.pending.drain(..) {
            let _ = sender.send(Ok(delivery));
        }
        state.consumers.push((consumer_tag.to_string(), sender));
        drop(queues);
        lock(&self.tags).push((queue.to_string(), consumer_tag.to_string()));

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        lock(&self.state.acks).push(delivery.delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, all_up_to: bool, requeue: bool) -> Result<()> {
        lock(&self.state.nacks).push(NackRecord {
            delivery_tag: delivery.delivery_tag,
            all_up_to,
            requeue,
        });
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        if self.state.reject_cancels.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConsumeError(format!("cancel of {} rejected", consumer_tag)));
        }
        lock(&self.state.cancelled).push(consumer_tag.to_string());
        let queues: Vec<String> = {
            let mut tags = lock(&self.tags);
            let queues = tags
                .iter()
                .filter(|(_, tag)| tag == consumer_tag)
                .map(|(queue, _)| queue.clone())
                .collect();
            tags.retain(|(_, tag)| tag != consumer_tag);
            queues
        };
        for queue in queues {
            self.drop_consumer(&queue, consumer_tag);
        }
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        lock(&self.state.purged).push(queue.to_string());
        let mut queues = lock(&self.state.queues);
        let purged = queues.get_mut(queue).map(|state| {
            let count = state.pending.len() as u32;
            state.pending.clear();
            count
        });
        Ok(purged.unwrap_or(0))
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32> {
        lock(&self.state.deleted).push(queue.to_string());
        let removed = lock(&self.state.queues).remove(queue);
        Ok(removed.map(|state| state.pending.len() as u32).unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state.channels).retain(|channel| !std::ptr::eq(Arc::as_ptr(channel), self));
        self.shutdown();
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
