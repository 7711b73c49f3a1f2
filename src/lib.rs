// src/lib.rs
pub mod batcher;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod crypto;
pub mod errors;
pub mod pool;
pub mod retryable;

pub use broker::{Delivery, QueueOptions};
pub use config::AmqpConfig;
pub use consumer::{
    batch_handler_fn, handler_fn, BatchConsumer, BatchConsumerConfig, BatchHandler, Consumer, ConsumerConfig,
    ConsumerHandle, DlxRetryConsumer, LoggerRules, MessageHandler,
};
pub use errors::{RabbitMQError, Result};
pub use pool::{ChannelPool, QueueClient};
pub use retryable::{is_retryable, HandlerError};
