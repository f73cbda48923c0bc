use crate::broker::{
    BrokerChannel, BrokerError, ConsumeOptions, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, QueueOptions,
};
use crate::consumers::{Callback, Message, Payload};
use crate::Error;
use amq_protocol_types::FieldTable;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Declaration options of a [`TopicConsumer`].
///
/// The defaults give you a durable, shared queue that is not deleted when its consumers go
/// away, bound to a durable topic exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicOptions {
    /// Applies to both the exchange and the queue.
    pub durable: bool,
    /// Applies to both the exchange and the queue.
    pub auto_delete: bool,
    /// Applies to the queue.
    pub exclusive: bool,
    /// The name of the queue. Defaults to the topic.
    pub queue_name: Option<String>,
    /// Extra arguments for the queue declaration, e.g. `x-message-ttl`.
    pub arguments: FieldTable,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
            queue_name: None,
            arguments: FieldTable::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConsumerState {
    Declared,
    Consuming,
    Cancelled,
}

/// Binds one [`Callback`] to one topic.
///
/// Creating a `TopicConsumer` declares a topic exchange and a queue named after the topic, and
/// binds them using the topic as routing key. Messages start flowing once
/// [`TopicConsumer::consume`] is called and the returned [`Subscription`] is drained (that's
/// what [`Connection::consume_in_thread`](crate::Connection::consume_in_thread) does).
///
/// # Acknowledgements
///
/// Every message is acknowledged after the callback has run, even if it failed: the broker
/// delivery bookkeeping is not used as a retry mechanism.
pub struct TopicConsumer {
    topic: String,
    queue: String,
    exchange: String,
    tag: String,
    options: TopicOptions,
    callback: Arc<dyn Callback>,
    channel: Arc<dyn BrokerChannel>,
    state: ConsumerState,
}

impl TopicConsumer {
    /// Declare the exchange, the queue and their binding on `channel`.
    ///
    /// Fails with [`Error::Declaration`] if the broker rejects any of the declarations, e.g.
    /// because an exchange with the same name but a different type already exists.
    #[tracing::instrument(
        name = "topic_consumer_create",
        skip_all,
        fields(topic = %topic, tag = %tag, exchange = %exchange)
    )]
    pub async fn create(
        channel: Arc<dyn BrokerChannel>,
        topic: &str,
        callback: Arc<dyn Callback>,
        tag: &str,
        exchange: &str,
        options: TopicOptions,
    ) -> Result<Self, Error> {
        let queue = options
            .queue_name
            .clone()
            .unwrap_or_else(|| topic.to_owned());
        let consumer = Self {
            topic: topic.to_owned(),
            queue,
            exchange: exchange.to_owned(),
            tag: tag.to_owned(),
            options,
            callback,
            channel,
            state: ConsumerState::Declared,
        };
        consumer.declare().await?;
        Ok(consumer)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    /// The consumer tag, unique among the consumers of a channel.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == ConsumerState::Cancelled
    }

    /// Re-declare the exchange, the queue and their binding on a new channel, after the owning
    /// connection re-established its link with the broker.
    ///
    /// Declarations are idempotent: re-declaring entities that already exist with the same
    /// settings does nothing broker-side.
    /// The consumer must be [consumed](TopicConsumer::consume) again to receive messages.
    #[tracing::instrument(name = "topic_consumer_reconnect", skip_all, fields(topic = %self.topic, tag = %self.tag))]
    pub async fn reconnect(&mut self, channel: Arc<dyn BrokerChannel>) -> Result<(), Error> {
        self.channel = channel;
        self.declare().await?;
        self.state = ConsumerState::Declared;
        Ok(())
    }

    /// Ask the broker to start delivering messages from the queue to this consumer.
    ///
    /// The returned [`Subscription`] must be drained to process messages.
    /// Consuming again replaces the previous subscription of this consumer.
    #[tracing::instrument(name = "topic_consumer_consume", skip_all, fields(topic = %self.topic, tag = %self.tag))]
    pub async fn consume(&mut self, options: ConsumeOptions) -> Result<Subscription, Error> {
        match self.state {
            ConsumerState::Cancelled => return Err(Error::ConsumerCancelled(self.tag.clone())),
            // The broker still holds the previous subscription under our tag.
            ConsumerState::Consuming => self.cancel_subscription().await?,
            ConsumerState::Declared => {}
        }
        let deliveries = self
            .channel
            .basic_consume(&self.queue, &self.tag, options)
            .await
            .map_err(|source| Error::Consume {
                queue: self.queue.clone(),
                tag: self.tag.clone(),
                source,
            })?;
        self.state = ConsumerState::Consuming;
        Ok(Subscription {
            deliveries,
            handler: DeliveryHandler {
                topic: self.topic.clone(),
                tag: self.tag.clone(),
                callback: Arc::clone(&self.callback),
            },
        })
    }

    /// Cancel the subscription of this consumer.
    ///
    /// The broker not knowing the tag anymore (e.g. the channel died with a broken
    /// connection, or the consumer was already cancelled) counts as a success.
    #[tracing::instrument(name = "topic_consumer_cancel", skip_all, fields(topic = %self.topic, tag = %self.tag))]
    pub async fn cancel(&mut self) -> Result<(), Error> {
        self.cancel_subscription().await?;
        self.state = ConsumerState::Cancelled;
        Ok(())
    }

    /// Cancel the subscription, if any, keeping the consumer declared so that it can consume
    /// again.
    pub(crate) async fn unsubscribe(&mut self) -> Result<(), Error> {
        if self.state == ConsumerState::Consuming {
            self.cancel_subscription().await?;
            self.state = ConsumerState::Declared;
        }
        Ok(())
    }

    async fn cancel_subscription(&self) -> Result<(), Error> {
        match self.channel.basic_cancel(&self.tag).await {
            Ok(()) => {}
            Err(BrokerError::UnknownConsumer(_)) => {
                tracing::debug!("The broker no longer knows the consumer, nothing to cancel");
            }
            Err(source) => {
                return Err(Error::Cancel {
                    tag: self.tag.clone(),
                    source,
                })
            }
        }
        Ok(())
    }

    async fn declare(&self) -> Result<(), Error> {
        let declaration_error = |source| Error::Declaration {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            source,
        };
        self.channel
            .declare_exchange(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeOptions {
                    durable: self.options.durable,
                    auto_delete: self.options.auto_delete,
                },
            )
            .await
            .map_err(declaration_error)?;
        self.channel
            .declare_queue(
                &self.queue,
                QueueOptions {
                    durable: self.options.durable,
                    auto_delete: self.options.auto_delete,
                    exclusive: self.options.exclusive,
                },
                self.options.arguments.clone(),
            )
            .await
            .map_err(declaration_error)?;
        self.channel
            .bind_queue(&self.queue, &self.exchange, &self.topic)
            .await
            .map_err(declaration_error)?;
        Ok(())
    }
}

/// An active subscription: the deliveries pushed by the broker and what to do with them.
pub struct Subscription {
    pub(crate) deliveries: DeliveryStream,
    pub(crate) handler: DeliveryHandler,
}

impl Subscription {
    pub fn tag(&self) -> &str {
        &self.handler.tag
    }

    /// Process the next delivery.
    ///
    /// Returns `Ok(false)` once the broker stops delivering (the consumer was cancelled or the
    /// channel closed), an error if the delivery stream fails.
    pub async fn process_next(&mut self) -> Result<bool, BrokerError> {
        use futures_util::StreamExt;

        match self.deliveries.next().await {
            Some(delivery) => {
                self.handler
                    .process(delivery?, &CancellationToken::new())
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Runs the callback of a consumer on a delivery, then acknowledges it.
#[derive(Clone)]
pub(crate) struct DeliveryHandler {
    pub(crate) topic: String,
    pub(crate) tag: String,
    callback: Arc<dyn Callback>,
}

impl DeliveryHandler {
    /// Decode, run the callback, acknowledge.
    ///
    /// Nothing that happens in here is allowed to escape: decoding failures, callback errors
    /// and callback panics are logged, and the message is acknowledged regardless.
    /// A callback still running when `interrupt` is cancelled is dropped, and the message is
    /// acknowledged as well.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(topic = %self.topic, tag = %self.tag, delivery_tag = delivery.delivery_tag),
        level = "debug"
    )]
    pub(crate) async fn process(&self, delivery: Delivery, interrupt: &CancellationToken) {
        let Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            content_type,
            data,
            acker,
        } = delivery;

        match Payload::decode(content_type.as_deref(), data) {
            Ok(payload) => {
                let message = Message {
                    topic: self.topic.clone(),
                    exchange,
                    routing_key,
                    delivery_tag,
                    redelivered,
                    payload,
                };
                let outcome = tokio::select! {
                    biased;
                    outcome = AssertUnwindSafe(self.callback.handle(message)).catch_unwind() => outcome,
                    _ = interrupt.cancelled() => {
                        tracing::warn!("Message callback interrupted, acknowledging anyway");
                        Ok(Ok(()))
                    }
                };
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(error = ?e, "Message callback failed, acknowledging anyway");
                    }
                    Err(panic) => {
                        tracing::error!(
                            panic = %panic_message(panic.as_ref()),
                            "Message callback panicked, acknowledging anyway"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    error = ?e,
                    content_type = ?content_type,
                    "Failed to decode message, acknowledging without processing"
                );
            }
        }

        if let Err(e) = acker.ack().await {
            tracing::warn!(error = ?e, "Failed to acknowledge message");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
