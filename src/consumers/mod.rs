//! Topic consumers and the callbacks they run.
//!
//! A [`TopicConsumer`] binds a [`Callback`] to a topic. Consumers are usually created through
//! [`Connection::create_consumer`](crate::Connection::create_consumer), which takes care of
//! tagging them and of draining their deliveries.
mod callback;
mod message;
mod topic;

pub use crate::broker::ConsumeOptions;
pub use callback::{Callback, ClosureCallback};
pub use message::{DecodeError, Message, Payload};
pub use topic::{Subscription, TopicConsumer, TopicOptions};
