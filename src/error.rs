use crate::broker::BrokerError;

/// The error type returned by the connection layer.
///
/// Connection and declaration failures are fatal to the operation that triggered them and
/// are handed back to the caller untouched: retry policies belong to whoever supervises the
/// [`Connection`](crate::Connection).
///
/// Failures that happen while processing a message (a callback returning an error or
/// panicking) never show up here: they are logged and the message is acknowledged anyway.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The broker connection (or its channel) could not be established.
    #[error("Failed to establish a connection with the broker.")]
    Connect(#[source] BrokerError),
    /// The broker rejected the exchange/queue declaration of a topic consumer,
    /// e.g. an exchange with the same name but a different type already exists.
    #[error("Failed to declare queue `{queue}` bound to exchange `{exchange}`.")]
    Declaration {
        exchange: String,
        queue: String,
        #[source]
        source: BrokerError,
    },
    /// The broker refused to start delivering messages to a consumer.
    #[error("Failed to start consuming from queue `{queue}` with tag `{tag}`.")]
    Consume {
        queue: String,
        tag: String,
        #[source]
        source: BrokerError,
    },
    /// Cancelling a consumer failed for a reason other than the broker no longer knowing
    /// its tag.
    #[error("Failed to cancel consumer `{tag}`.")]
    Cancel {
        tag: String,
        #[source]
        source: BrokerError,
    },
    /// The connection has no open channel: call `reconnect` first.
    #[error("The connection is not connected to the broker.")]
    NotConnected,
    /// The drain loop is running: reset the connection before registering new consumers.
    #[error("The connection is already consuming.")]
    AlreadyConsuming,
    /// The topic consumer has been cancelled and can no longer consume.
    #[error("Consumer `{0}` has been cancelled.")]
    ConsumerCancelled(String),
    /// The connection context has been closed and no longer holds a connection.
    #[error("The connection context has been closed.")]
    ContextClosed,
    /// The connection pool failed for a reason unrelated to the broker.
    #[error(transparent)]
    Pool(anyhow::Error),
}
