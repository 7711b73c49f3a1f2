// src/consumer/dlx_retry.rs
use std::sync::Arc;

use tracing::{error, info};

use super::{
    consume_loop, new_consumer_tag, ConsumerConfig, ConsumerHandle, MessageHandler, MessagePipeline, Outcome,
    PendingDelivery,
};
use crate::broker::{BrokerChannel, Delivery, QueueOptions};
use crate::config::resolve_prefetch;
use crate::errors::Result;
use crate::pool::ChannelPool;

const DEFAULT_PREFETCH_COUNT: u16 = 1;

/// Consumer that delays retries through a dead-letter queue instead of
/// holding the delivery.
///
/// A retryable failure is rejected without requeue, so the broker routes it
/// to `<queue>-retry-<ms>`; that queue's TTL expires it back onto the main
/// queue. Every other failure is acked and only logged.
pub struct DlxRetryConsumer {
    pool: ChannelPool,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    prefetch_count: u16,
}

impl DlxRetryConsumer {
    pub fn new(pool: ChannelPool, config: ConsumerConfig, handler: impl MessageHandler + 'static) -> Result<Self> {
        config.validate()?;
        let prefetch_count = resolve_prefetch(config.prefetch_count, DEFAULT_PREFETCH_COUNT);
        Ok(Self {
            pool,
            config,
            handler: Arc::new(handler),
            prefetch_count,
        })
    }

    pub fn retry_queue(&self) -> String {
        format!("{}-retry-{}", self.config.channel, self.config.retry_time.as_millis())
    }

    fn retry_queue_options(&self) -> QueueOptions {
        QueueOptions::default()
            .with_message_ttl(self.config.retry_time.as_millis() as u64)
            .with_dead_letter("", self.config.channel.clone())
    }

    fn main_queue_options(&self) -> QueueOptions {
        self.config
            .queue_options
            .clone()
            .with_dead_letter("", self.retry_queue())
    }

    pub async fn process(&self) -> Result<ConsumerHandle> {
        info!(queue = %self.config.channel, "[AMQP] Process");
        self.start().await.inspect_err(|e| {
            error!(queue = %self.config.channel, error = %e, "Consumer initialization error");
        })
    }

    async fn start(&self) -> Result<ConsumerHandle> {
        let queue = &self.config.channel;
        let connection_type = &self.config.connection_type;

        self.pool
            .acquire(&self.retry_queue(), connection_type, &self.retry_queue_options())
            .await?;
        let client = self
            .pool
            .acquire(queue, connection_type, &self.main_queue_options())
            .await?;
        let channel = client.channel()?;
        channel.prefetch(self.prefetch_count).await?;
        if let Some(hook) = &self.config.on_channel_established {
            hook(Arc::clone(&channel)).await?;
        }

        let events = channel.events();
        let consumer_tag = new_consumer_tag(queue);
        let deliveries = channel.consume(queue, &consumer_tag).await?;
        info!(queue = %queue, consumer_tag = %consumer_tag, retry_queue = %self.retry_queue(), "Consumer started");

        #[cfg(unix)]
        cancel_on_sigterm(Arc::clone(&channel), consumer_tag.clone());

        let worker = Arc::new(DlxWorker {
            pipeline: self.config.pipeline(Arc::clone(&self.handler)),
            channel: Arc::clone(&channel),
        });
        let exit_on_close = self.config.exit_on_channel_close;
        let task = tokio::spawn(consume_loop(deliveries, events, exit_on_close, move |delivery| {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.handle(delivery).await });
        }));

        Ok(ConsumerHandle {
            consumer_tag,
            channel,
            task,
        })
    }
}

#[cfg(unix)]
fn cancel_on_sigterm(channel: Arc<dyn BrokerChannel>, consumer_tag: String) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            info!(consumer_tag = %consumer_tag, "SIGTERM received, cancelling consumer");
            if let Err(e) = channel.cancel(&consumer_tag).await {
                error!(consumer_tag = %consumer_tag, "Failed to cancel consumer: {}", e);
            }
        }
    });
}

struct DlxWorker {
    pipeline: MessagePipeline,
    channel: Arc<dyn BrokerChannel>,
}

impl DlxWorker {
    async fn handle(&self, delivery: Delivery) {
        let pending = PendingDelivery::new(Arc::clone(&self.channel), delivery);
        let outcome = self.pipeline.run(&pending).await;

        if pending.is_settled() {
            info!(
                queue = %self.pipeline.queue,
                delivery_tag = pending.delivery().delivery_tag,
                "Handler settled after auto nack"
            );
            return;
        }

        match outcome {
            Outcome::Success => pending.ack().await,
            Outcome::DecodeFailed(e) => {
                pending.ack().await;
                error!(queue = %self.pipeline.queue, error = %e, "Consumer error finish");
            }
            Outcome::Failed { error, .. } if error.is_retryable() => {
                // dead-lettered to the retry queue
                pending.nack(false).await;
            }
            Outcome::Failed { error, content } => {
                pending.ack().await;
                self.pipeline.log_finish(&error, &content);
            }
        }
    }
}
