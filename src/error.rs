//! Error taxonomy for the connection/channel lifecycle core.

use thiserror::Error;

/// Errors surfaced by [`crate::connection::Connection`] and its channels.
#[derive(Debug, Error)]
pub enum RabbitMqError {
    /// The broker URI supplied to the factory was empty. Never retried.
    #[error("broker URI is empty")]
    UriEmpty,

    /// Dialing the broker failed. Retried by the reconnect loop if `keep_alive`
    /// is set; surfaced to the caller otherwise.
    #[error("failed to connect to broker: {0}")]
    DialFailed(String),

    /// An operation was attempted on a connection that has already been
    /// explicitly closed. Never retried.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The channel is not currently usable (degraded/reopening). Transient:
    /// publisher channels cache, consumer channels pause.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// `register_consumer` was called with a queue name already bound by
    /// another consumer channel on this connection. Never retried.
    #[error("a consumer is already registered for queue {0:?}")]
    ConsumerDuplicateQueue(String),

    /// A handler registry had no handlers registered at validation time.
    #[error("handler registry has no registered handlers")]
    HandlerRegistryEmpty,

    /// A handler registry had an empty routing-key pattern.
    #[error("handler registry has an empty routing key")]
    HandlerKeyEmpty,

    /// Retries were consumed draining a cached publish; the record was
    /// dropped.
    #[error("publish retries exhausted for message {0}")]
    PublishExhausted(String),

    /// A codec was asked to encode a value it does not support.
    #[error("encoding unsupported for this codec")]
    EncodingUnsupported,

    /// An underlying `lapin` call failed outside of the publish/consume
    /// paths above (e.g. topology declaration during channel setup).
    #[error("AMQP error: {0}")]
    Lapin(#[from] lapin::Error),
}

/// Outcome returned by a delivery handler, distinguishing retriable failures
/// from ones that should be discarded (and dead-lettered, if the broker is
/// configured for it).
#[derive(Debug, Error)]
pub enum HandlerOutcome {
    /// The delivery should be nacked with `requeue = true`.
    #[error("transient handler error: {0}")]
    Transient(String),

    /// The delivery should be nacked with `requeue = false`.
    #[error("permanent handler error: {0}")]
    Permanent(String),
}

impl HandlerOutcome {
    /// Convenience constructor for a transient (requeue-worthy) failure.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Convenience constructor for a permanent (discard) failure.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether the broker delivery should be requeued.
    pub fn should_requeue(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result alias used throughout the crate's public surface.
pub type Result<T> = std::result::Result<T, RabbitMqError>;
