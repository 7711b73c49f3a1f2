// src/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("No RabbitMQ connection")]
    NoConnection,

    #[error("No RabbitMQ queue")]
    NoQueueName,

    #[error("No AMQP configuration for connection type '{0}'")]
    UnknownConnectionType(String),

    #[error("Invalid consumer configuration: {0}")]
    InvalidConfiguration(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ channel closed")]
    ChannelClosed,

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Invalid AMQP url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl RabbitMQError {
    /// Configuration errors are raised synchronously and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RabbitMQError::NoConnection
                | RabbitMQError::NoQueueName
                | RabbitMQError::UnknownConnectionType(_)
                | RabbitMQError::InvalidConfiguration(_)
                | RabbitMQError::InvalidUrl { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RabbitMQError>;

// lapin reports every failure through one error type, so the call site picks the variant
pub(crate) trait LapinResultExt<T> {
    fn or_connection(self) -> Result<T>;
    fn or_channel(self) -> Result<T>;
    fn or_consume(self) -> Result<T>;
    fn or_ack(self) -> Result<T>;
}

impl<T> LapinResultExt<T> for std::result::Result<T, LapinError> {
    fn or_connection(self) -> Result<T> {
        self.map_err(|e| RabbitMQError::ConnectionError(e.to_string()))
    }

    fn or_channel(self) -> Result<T> {
        self.map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }

    fn or_consume(self) -> Result<T> {
        self.map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
    }

    fn or_ack(self) -> Result<T> {
        self.map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}

/// Why a payload could not be turned into JSON content. Always terminal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Message payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Message payload could not be decrypted: {0}")]
    Decrypt(String),

    #[error("Message payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
