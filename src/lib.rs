//! `carrot-topic` is a consumer-side connection layer for RabbitMQ, built on top of [`lapin`].
//!
//! It binds [topic consumers](crate::consumers::TopicConsumer) to queues, drains their
//! deliveries on a background task and recovers from broker-side disconnects.
//!
//! The moving parts, leaves first:
//! - a [`TopicConsumer`](crate::consumers::TopicConsumer) binds one
//!   [`Callback`](crate::consumers::Callback) to one topic and acknowledges every message it
//!   receives, whatever the outcome of the callback;
//! - a [`Connection`] owns a broker link, a channel, an ordered list of consumers and the drain
//!   loop running them;
//! - a [`ConnectionPool`] hands out connections to one borrower at a time;
//! - a [`ConnectionContext`] scopes the borrow of a connection, pooled or standalone.
//!
//! Everything is written against the [broker abstraction](crate::broker): use
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) to talk to RabbitMQ, or
//! [`InMemoryBroker`](crate::broker::memory::InMemoryBroker) in tests.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod broker;
pub mod config;
mod connection;
pub mod consumers;
mod context;
mod error;
pub mod pool;

pub use connection::{Connection, ConnectionState, DrainHandle};
pub use context::ConnectionContext;
pub use error::Error;
pub use pool::{get_connection_pool, ConnectionPool};
