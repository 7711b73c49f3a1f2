// src/consumer/mod.rs
// Consumers: turn broker deliveries into handler calls and acknowledgments

mod batch;
mod dlx_retry;
mod single;

pub use batch::{BatchConsumer, BatchConsumerConfig};
pub use dlx_retry::DlxRetryConsumer;
pub use single::{Consumer, ConsumerConfig};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, ChannelEvent, Delivery, DeliveryStream};
use crate::crypto::Crypto;
use crate::errors::{DecodeError, RabbitMQError, Result};
use crate::retryable::HandlerError;

/// Handles one decoded message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, content: Value, delivery: &Delivery) -> std::result::Result<(), HandlerError>;
}

/// Handles every decoded message of a flushed group at once.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, group_key: &str, contents: Vec<Value>) -> std::result::Result<(), HandlerError>;
}

/// Adapts a closure into a [`MessageHandler`] or [`BatchHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Value, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

pub fn batch_handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Value, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, content: Value, delivery: &Delivery) -> std::result::Result<(), HandlerError> {
        (self.0)(content, delivery.clone()).await
    }
}

#[async_trait]
impl<F, Fut> BatchHandler for HandlerFn<F>
where
    F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, group_key: &str, contents: Vec<Value>) -> std::result::Result<(), HandlerError> {
        (self.0)(group_key.to_string(), contents).await
    }
}

/// Runs once the consumer's channel is ready, before consumption starts.
pub type ChannelHook = Arc<dyn Fn(Arc<dyn BrokerChannel>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Error message to the content fields that may be logged with it.
#[derive(Debug, Clone, Default)]
pub struct LoggerRules {
    rules: HashMap<String, Vec<String>>,
}

impl LoggerRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, error_message: impl Into<String>, fields: &[&str]) -> Self {
        self.rules.insert(
            error_message.into(),
            fields.iter().map(|field| field.to_string()).collect(),
        );
        self
    }

    /// The part of `content` that may be logged for an error with `error_message`.
    pub fn redact(&self, error_message: &str, content: &Value) -> Value {
        let Some(fields) = self.rules.get(error_message) else {
            return content.clone();
        };

        match content {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(key, _)| fields.contains(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
            _ => Value::Object(Default::default()),
        }
    }
}

impl From<HashMap<String, Vec<String>>> for LoggerRules {
    fn from(rules: HashMap<String, Vec<String>>) -> Self {
        Self { rules }
    }
}

pub(crate) fn new_consumer_tag(queue: &str) -> String {
    format!("{}-{}", queue, uuid::Uuid::new_v4())
}

/// UTF-8, optional decryption, then JSON.
pub(crate) async fn decode(data: &[u8], crypto: Option<&dyn Crypto>) -> std::result::Result<Value, DecodeError> {
    let text = String::from_utf8(data.to_vec())?;
    let text = match crypto {
        Some(crypto) => crypto
            .decrypt(&text)
            .await
            .map_err(|e| DecodeError::Decrypt(e.to_string()))?,
        None => text,
    };
    Ok(serde_json::from_str(&text)?)
}

/// Where a single delivery is in its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryState {
    Received,
    Decoding,
    Decrypting,
    Handling,
    Acked,
    RequeueScheduled,
    Requeued,
    Discarded,
}

/// A delivery together with the guarantee that it is acknowledged at most once.
pub(crate) struct PendingDelivery {
    delivery: Delivery,
    channel: Arc<dyn BrokerChannel>,
    settled: AtomicBool,
    state: Mutex<DeliveryState>,
}

impl PendingDelivery {
    pub(crate) fn new(channel: Arc<dyn BrokerChannel>, delivery: Delivery) -> Self {
        Self {
            delivery,
            channel,
            settled: AtomicBool::new(false),
            state: Mutex::new(DeliveryState::Received),
        }
    }

    pub(crate) fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub(crate) fn state(&self) -> DeliveryState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, state: DeliveryState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn claim(&self) -> bool {
        let claimed = self
            .settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !claimed {
            debug!(delivery_tag = self.delivery.delivery_tag, "Delivery already settled");
        }
        claimed
    }

    pub(crate) async fn ack(&self) {
        if !self.claim() {
            return;
        }
        self.set_state(DeliveryState::Acked);
        if let Err(e) = self.channel.ack(&self.delivery).await {
            error!(delivery_tag = self.delivery.delivery_tag, "Failed to acknowledge message: {}", e);
        }
    }

    pub(crate) async fn nack(&self, requeue: bool) {
        if !self.claim() {
            return;
        }
        self.set_state(if requeue {
            DeliveryState::Requeued
        } else {
            DeliveryState::Discarded
        });
        if let Err(e) = self.channel.nack(&self.delivery, false, requeue).await {
            error!(
                delivery_tag = self.delivery.delivery_tag,
                "Failed to negatively acknowledge message: {}", e
            );
        }
    }
}

/// What happened to a delivery before any acknowledgment decision.
pub(crate) enum Outcome {
    Success,
    DecodeFailed(DecodeError),
    Failed { error: HandlerError, content: Value },
}

/// Decode and handler stages shared by the single-message consumers.
pub(crate) struct MessagePipeline {
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) crypto: Option<Arc<dyn Crypto>>,
    pub(crate) auto_nack_time: Option<std::time::Duration>,
    pub(crate) logger_rules: LoggerRules,
    pub(crate) log_retryable_error_content: bool,
}

impl MessagePipeline {
    async fn evaluate(&self, pending: &PendingDelivery) -> Outcome {
        pending.set_state(match self.crypto {
            Some(_) => DeliveryState::Decrypting,
            None => DeliveryState::Decoding,
        });
        let content = match decode(&pending.delivery().data, self.crypto.as_deref()).await {
            Ok(content) => content,
            Err(e) => return Outcome::DecodeFailed(e),
        };

        pending.set_state(DeliveryState::Handling);
        match self.handler.handle(content.clone(), pending.delivery()).await {
            Ok(()) => Outcome::Success,
            Err(error) => Outcome::Failed { error, content },
        }
    }

    /// Runs decode and handler under the auto-nack guard, if one is configured.
    pub(crate) async fn run(&self, pending: &PendingDelivery) -> Outcome {
        let Some(limit) = self.auto_nack_time else {
            return self.evaluate(pending).await;
        };

        let processing = self.evaluate(pending);
        tokio::pin!(processing);

        tokio::select! {
            outcome = &mut processing => outcome,
            _ = tokio::time::sleep(limit) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = pending.delivery().delivery_tag,
                    status = ?pending.state(),
                    content = %String::from_utf8_lossy(&pending.delivery().data),
                    "Consumer auto nack"
                );
                pending.nack(true).await;
                processing.await
            }
        }
    }

    pub(crate) fn log_retry(&self, error: &HandlerError, content: &Value) {
        if self.log_retryable_error_content {
            warn!(queue = %self.queue, error = %error, content = %content, "Consumer error retry");
        } else {
            warn!(queue = %self.queue, error = %error, "Consumer error retry");
        }
    }

    pub(crate) fn log_finish(&self, error: &HandlerError, content: &Value) {
        let content = self.logger_rules.redact(&error.message(), content);
        error!(queue = %self.queue, error = %error, content = %content, "Consumer error finish");
    }
}

/// Drives a delivery stream until it ends or the channel fails.
///
/// A channel close exits the process when `exit_on_close` is set; otherwise
/// the loop returns the infrastructure error.
pub(crate) async fn consume_loop<F>(
    mut deliveries: DeliveryStream,
    mut events: broadcast::Receiver<ChannelEvent>,
    exit_on_close: bool,
    mut on_delivery: F,
) -> Result<()>
where
    F: FnMut(Delivery) + Send,
{
    let mut fatal: Option<RabbitMQError> = None;

    loop {
        tokio::select! {
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => on_delivery(delivery),
                Some(Err(e)) => {
                    error!("Error receiving message: {}", e);
                    return Err(e);
                }
                None => {
                    // a closing channel ends the stream; look for the reason
                    loop {
                        match events.try_recv() {
                            Ok(event) => {
                                if let Some(result) = on_channel_event(event, &mut fatal, exit_on_close) {
                                    return result;
                                }
                            }
                            Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    info!("Consumer cancelled");
                    return fatal.map_or(Ok(()), Err);
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(result) = on_channel_event(event, &mut fatal, exit_on_close) {
                        return result;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    if let Some(result) = on_channel_event(ChannelEvent::Closed, &mut fatal, exit_on_close) {
                        return result;
                    }
                }
            },
        }
    }
}

fn on_channel_event(
    event: ChannelEvent,
    fatal: &mut Option<RabbitMQError>,
    exit_on_close: bool,
) -> Option<Result<()>> {
    match event {
        ChannelEvent::Error(message) => {
            error!(message = %message, "[AMQP] Channel error");
            fatal.get_or_insert(RabbitMQError::ChannelError(message));
            None
        }
        ChannelEvent::Closed => {
            if exit_on_close {
                error!("[AMQP] Channel close");
                std::process::exit(1);
            }
            warn!("[AMQP] Channel close");
            Some(Err(fatal.take().unwrap_or(RabbitMQError::ChannelClosed)))
        }
    }
}

/// A running single-message consumer.
pub struct ConsumerHandle {
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::clone(&self.channel)
    }

    /// Stops intake; deliveries already being processed still settle.
    pub async fn cancel(&self) -> Result<()> {
        self.channel.cancel(&self.consumer_tag).await
    }

    /// Waits for the consumption loop to end.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("consumer task failed: {}", e)))?
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;

    use crate::crypto::{Crypto, CryptoError};

    /// Reverses the text both ways.
    pub(crate) struct Reverse;

    #[async_trait]
    impl Crypto for Reverse {
        async fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
            Ok(plaintext.chars().rev().collect())
        }

        async fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
            Ok(ciphertext.chars().rev().collect())
        }
    }

    /// Fails every decryption, as with a rotated key.
    pub(crate) struct WrongKey;

    #[async_trait]
    impl Crypto for WrongKey {
        async fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
            Ok(plaintext.to_string())
        }

        async fn decrypt(&self, _ciphertext: &str) -> Result<String, CryptoError> {
            Err("bad decrypt".into())
        }
    }

    pub(crate) fn reversed(text: &str) -> String {
        text.chars().rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Reverse, WrongKey};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn decode_parses_json() {
        assert_eq!(decode(br#"{"alma":"fa"}"#, None).await.unwrap(), json!({ "alma": "fa" }));
    }

    #[tokio::test]
    async fn decode_decrypts_first() {
        let crypto = Reverse;
        let encrypted = crypto.encrypt(r#"{"alma":"fa"}"#).await.unwrap();
        let content = decode(encrypted.as_bytes(), Some(&crypto)).await.unwrap();
        assert_eq!(content, json!({ "alma": "fa" }));
    }

    #[tokio::test]
    async fn decode_reports_decrypt_failures() {
        let result = decode(br#"{"alma":"fa"}"#, Some(&WrongKey)).await;
        assert!(matches!(result, Err(DecodeError::Decrypt(ref m)) if m == "bad decrypt"));
    }

    #[tokio::test]
    async fn decode_rejects_bad_payloads() {
        assert!(matches!(decode(b"Not a JSON", None).await, Err(DecodeError::Json(_))));
        assert!(matches!(decode(&[0xff, 0xfe], None).await, Err(DecodeError::Utf8(_))));
    }

    #[test]
    fn logger_rules_keep_only_allowed_fields() {
        let rules = LoggerRules::new().allow("test error", &["id"]);
        let content = json!({ "id": 1, "email": "a@b.c" });

        assert_eq!(rules.redact("test error", &content), json!({ "id": 1 }));
        assert_eq!(rules.redact("other error", &content), content);
    }

    #[test]
    fn consumer_tags_are_unique() {
        assert_ne!(new_consumer_tag("orders"), new_consumer_tag("orders"));
        assert!(new_consumer_tag("orders").starts_with("orders-"));
    }
}
