// src/main.rs
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use rabbitmq_consumer::{handler_fn, AmqpConfig, ChannelPool, Consumer, ConsumerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const QUEUE_ENV: &str = "CONSUMER_QUEUE";
const RETRY_TIME_ENV: &str = "RETRY_TIME_MS";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match AmqpConfig::from_env() {
        Ok(config) => config,
        Err(_) => rabbitmq_consumer::config::load_config()?,
    };
    let queue = env::var(QUEUE_ENV).with_context(|| format!("{} is not set", QUEUE_ENV))?;

    let mut consumer_config = ConsumerConfig::new(&queue);
    if let Ok(retry_ms) = env::var(RETRY_TIME_ENV) {
        let retry_ms: u64 = retry_ms
            .parse()
            .with_context(|| format!("{} must be a number of milliseconds", RETRY_TIME_ENV))?;
        consumer_config = consumer_config.retry_time(Duration::from_millis(retry_ms));
    }

    let pool = ChannelPool::lapin(config);
    let consumer = Consumer::new(
        pool.clone(),
        consumer_config,
        handler_fn(|content, delivery| async move {
            info!(delivery_tag = delivery.delivery_tag, content = %content, "Message received");
            Ok(())
        }),
    )?;
    let handle = consumer.process().await?;
    info!(queue = %queue, consumer_tag = handle.consumer_tag(), "Waiting for messages, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.cancel().await?;
    pool.destroy().await?;
    Ok(())
}
