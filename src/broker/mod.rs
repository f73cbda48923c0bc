//! The broker-client abstraction the connection layer is written against.
//!
//! A [`Broker`] opens [`BrokerConnection`]s, connections open [`BrokerChannel`]s and channels
//! expose the handful of primitives a topic consumer needs: declare, bind, consume, cancel.
//!
//! Two implementations ship with the crate:
//! - [`ConnectionFactory`](crate::amqp::ConnectionFactory), talking to RabbitMq via `lapin`;
//! - [`InMemoryBroker`](memory::InMemoryBroker), an in-process broker for tests and local development.
use amq_protocol_types::{DeliveryTag, FieldTable};
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

pub mod memory;

/// A stream of messages pushed by the broker for a single consumer.
///
/// Waiting on the next item is the equivalent of draining broker events: it suspends until
/// a delivery arrives. The stream ends when the consumer is cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Errors reported by a broker-client implementation.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("The broker refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("The connection with the broker is closed.")]
    ConnectionClosed,
    #[error("The channel is closed.")]
    ChannelClosed,
    /// A declaration conflicts with an existing entity (e.g. same name, different type).
    #[error("The broker rejected the declaration: {0}")]
    PreconditionFailed(String),
    #[error("{0} not found.")]
    NotFound(String),
    /// The consumer tag is not (or no longer) registered on the channel.
    ///
    /// This is also what a channel torn down by a broken connection reports: every consumer
    /// registered on it is gone.
    #[error("The broker does not know consumer `{0}`.")]
    UnknownConsumer(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Entry point of a broker-client implementation.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new connection to the broker listening at `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// An open connection to a broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// `false` once the connection has been closed, by us or by the broker.
    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Ask the broker to start pushing messages from `queue` to a consumer identified by `tag`.
    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Stop the consumer identified by `tag`.
    ///
    /// Fails with [`BrokerError::UnknownConsumer`] if the tag is not registered on the channel.
    async fn basic_cancel(&self, tag: &str) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Acknowledges a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), BrokerError>;
}

/// The kinds of exchange supported by AMQP 0-9-1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Headers,
    Topic,
}

/// Flags used when declaring an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// The exchange survives a broker restart.
    pub durable: bool,
    /// The exchange is deleted when the last queue is unbound from it.
    pub auto_delete: bool,
}

/// Flags used when declaring a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    /// The queue survives a broker restart.
    pub durable: bool,
    /// The queue is deleted when its last consumer goes away.
    pub auto_delete: bool,
    /// The queue can only be used by the connection that declared it.
    pub exclusive: bool,
}

/// Flags used when starting a consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Do not wait for the broker to confirm the consumer registration.
    pub nowait: bool,
    /// Request exclusive access to the queue.
    pub exclusive: bool,
}

/// A message pushed by the broker to one of our consumers.
pub struct Delivery {
    /// The delivery tag of the message, unique per channel.
    pub delivery_tag: DeliveryTag,
    /// The exchange the message was published to.
    pub exchange: String,
    /// The routing key the message was published with.
    pub routing_key: String,
    /// Whether this message was delivered before and not acknowledged.
    pub redelivered: bool,
    /// The MIME content type advertised by the publisher, if any.
    pub content_type: Option<String>,
    /// The payload of the message in binary format.
    pub data: Vec<u8>,
    // Kept out of the public interface: the framework acknowledges each delivery exactly once,
    // after the callback has run.
    pub(crate) acker: Box<dyn Acker>,
}

impl Delivery {
    /// Assemble a delivery. Meant for [`BrokerChannel`] implementations.
    pub fn new(
        delivery_tag: DeliveryTag,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        content_type: Option<String>,
        data: Vec<u8>,
        acker: impl Acker,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            content_type,
            data,
            acker: Box::new(acker),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("content_type", &self.content_type)
            .field("data_len", &self.data.len())
            .finish_non_exhaustive()
    }
}
