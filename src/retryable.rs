//! Classification of handler failures.
//!
//! A handler returns a [`HandlerError`]. Whether the consumer retries the
//! delivery or discards it depends only on [`HandlerError::is_retryable`];
//! nothing else about the error (its type, its message) is consulted.

use std::error::Error as StdError;
use std::fmt;

/// Error returned by message and batch handlers.
///
/// Any `std::error::Error + Send + Sync` converts into a non-retryable
/// `HandlerError` with `?`. Use [`HandlerError::retryable`] or
/// [`HandlerError::decorate`] to mark a failure as transient.
pub struct HandlerError {
    inner: anyhow::Error,
    code: Option<i64>,
    data: Option<serde_json::Value>,
    retryable: bool,
}

impl HandlerError {
    /// A terminal failure with the given message.
    pub fn new(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self {
            inner: anyhow::Error::msg(message),
            code: None,
            data: None,
            retryable: false,
        }
    }

    /// A failure classified as retryable from the start.
    pub fn retryable(message: impl Into<String>, code: Option<i64>) -> Self {
        Self {
            inner: anyhow::Error::msg(message.into()),
            code,
            data: None,
            retryable: true,
        }
    }

    /// Marks an existing error as retryable and returns it.
    pub fn decorate(error: impl Into<HandlerError>) -> Self {
        let mut error = error.into();
        error.retryable = true;
        error
    }

    /// Wraps an `anyhow` error, keeping its context chain. Not retryable.
    pub fn from_anyhow(inner: anyhow::Error) -> Self {
        Self {
            inner,
            code: None,
            data: None,
            retryable: false,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Attaches structured context that is logged alongside a terminal batch failure.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    /// The top-level message, used as the key into logger redaction rules.
    pub fn message(&self) -> String {
        self.inner.to_string()
    }

    pub fn source_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

/// `false` for every error that was not built or decorated as retryable.
pub fn is_retryable(error: &HandlerError) -> bool {
    error.is_retryable()
}

impl<E> From<E> for HandlerError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self {
            inner: anyhow::Error::new(error),
            code: None,
            data: None,
            retryable: false,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("message", &self.inner.to_string())
            .field("code", &self.code)
            .field("retryable", &self.retryable)
            .finish()
    }
}
