//! An in-process broker implementing the [broker abstraction](super).
//!
//! `InMemoryBroker` models the subset of AMQP 0-9-1 the connection layer relies on:
//! typed exchanges, queues, bindings with topic routing, round-robin delivery to consumers,
//! acknowledgements and requeueing of unacknowledged messages when a consumer goes away.
//!
//! It also lets you break things on purpose: [`InMemoryBroker::sever_connections`] behaves
//! like a broker restart and [`InMemoryBroker::refuse_connections`] makes `connect` fail.
//!
//! ```rust
//! use carrot_topic::broker::memory::InMemoryBroker;
//! use carrot_topic::broker::{Broker, ExchangeKind, ExchangeOptions, QueueOptions};
//!
//! # async fn example() -> Result<(), carrot_topic::broker::BrokerError> {
//! let broker = InMemoryBroker::new();
//! let connection = broker.connect("memory://").await?;
//! let channel = connection.create_channel().await?;
//! let options = ExchangeOptions { durable: true, auto_delete: false };
//! channel.declare_exchange("events", ExchangeKind::Topic, options).await?;
//! # Ok(())
//! # }
//! ```
use super::{
    Acker, Broker, BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions, Delivery,
    DeliveryStream, ExchangeKind, ExchangeOptions, QueueOptions,
};
use amq_protocol_types::{DeliveryTag, FieldTable};
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A broker living in the memory of the current process.
///
/// Cloning is cheap: all clones share the same exchanges, queues and connections.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    /// Open connection ids.
    connections: HashSet<u64>,
    /// Open channel id -> owning connection id.
    channels: HashMap<u64, u64>,
    refuse_connections: bool,
    connections_opened: usize,
    next_id: u64,
    next_delivery_tag: DeliveryTag,
}

struct Exchange {
    kind: ExchangeKind,
    options: ExchangeOptions,
}

#[derive(Default)]
struct Queue {
    options: Option<QueueOptions>,
    /// The connection that owns the queue, if exclusive.
    owner: Option<u64>,
    bindings: Vec<(String, String)>,
    ready: VecDeque<Message>,
    consumers: Vec<QueueConsumer>,
    next_consumer: usize,
    unacked: HashMap<DeliveryTag, Unacked>,
    acked: usize,
}

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    content_type: Option<String>,
    data: Vec<u8>,
    redelivered: bool,
}

struct QueueConsumer {
    channel_id: u64,
    tag: String,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

struct Unacked {
    channel_id: u64,
    tag: String,
    message: Message,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `body` on `exchange` using `routing_key`.
    ///
    /// An empty exchange name stands for the default exchange, which routes directly to the
    /// queue named after the routing key.
    /// Returns the number of queues the message was routed to.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<usize, BrokerError> {
        self.publish_with_content_type(exchange, routing_key, None, body.into())
    }

    /// Serialize `payload` as JSON and publish it with an `application/json` content type.
    pub fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<usize, BrokerError> {
        let body = serde_json::to_vec(payload).map_err(anyhow::Error::from)?;
        self.publish_with_content_type(
            exchange,
            routing_key,
            Some("application/json".to_owned()),
            body,
        )
    }

    /// Publish `data` advertising `content_type`.
    pub fn publish_with_content_type(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: Option<String>,
        data: Vec<u8>,
    ) -> Result<usize, BrokerError> {
        let mut state = self.lock();
        let targets: Vec<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            let kind = state
                .exchanges
                .get(exchange)
                .map(|e| e.kind.clone())
                .ok_or_else(|| BrokerError::NotFound(format!("Exchange `{exchange}`")))?;
            state
                .queues
                .iter()
                .filter(|(_, queue)| {
                    queue.bindings.iter().any(|(bound_exchange, binding_key)| {
                        bound_exchange == exchange && routes(&kind, binding_key, routing_key)
                    })
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        let message = Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            content_type,
            data,
            redelivered: false,
        };
        for queue_name in &targets {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(&mut state, queue_name);
        }
        Ok(targets.len())
    }

    /// Simulate a broker restart: every open connection and channel is closed.
    ///
    /// Active consumers receive a [`BrokerError::ConnectionClosed`] before their delivery
    /// stream ends. Unacknowledged messages are put back on their queues and exclusive queues
    /// are deleted.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let connections: Vec<u64> = state.connections.drain().collect();
        for connection_id in connections {
            Self::drop_connection(&mut state, connection_id, true);
        }
        let queues: Vec<String> = state.queues.keys().cloned().collect();
        for queue in queues {
            self.dispatch(&mut state, &queue);
        }
    }

    /// When `true`, every subsequent `connect` fails with [`BrokerError::ConnectionRefused`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// The number of messages waiting to be delivered on `queue`, `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// The number of messages delivered on `queue` and still waiting for an acknowledgement.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// The number of messages acknowledged on `queue` since it was declared.
    pub fn acked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).map(|e| e.kind.clone())
    }

    /// The `(exchange, routing key)` pairs `queue` is bound with.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.clone())
            .unwrap_or_default()
    }

    /// How many connections have been successfully opened since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// How many connections are currently open.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Push ready messages of `queue_name` to its consumers, round-robin.
    fn dispatch(&self, state: &mut State, queue_name: &str) {
        loop {
            let delivery_tag = state.next_delivery_tag + 1;
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() {
                return;
            }
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let index = queue.next_consumer % queue.consumers.len();
            let consumer = &queue.consumers[index];
            let delivery = Delivery::new(
                delivery_tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.redelivered,
                message.content_type.clone(),
                message.data.clone(),
                MemoryAcker {
                    broker: self.clone(),
                    queue: queue_name.to_owned(),
                    channel_id: consumer.channel_id,
                    delivery_tag,
                },
            );
            if consumer.sender.send(Ok(delivery)).is_err() {
                // Nobody is listening on the other side anymore: forget the consumer and
                // try again with the next one.
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }
            queue.unacked.insert(
                delivery_tag,
                Unacked {
                    channel_id: consumer.channel_id,
                    tag: consumer.tag.clone(),
                    message,
                },
            );
            queue.next_consumer = index + 1;
            state.next_delivery_tag = delivery_tag;
        }
    }

    /// Close `connection_id` and every channel multiplexed over it.
    fn drop_connection(state: &mut State, connection_id: u64, abrupt: bool) {
        state.connections.remove(&connection_id);
        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, owner)| **owner == connection_id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel_id in &channels {
            state.channels.remove(channel_id);
        }
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|consumer| {
                if !channels.contains(&consumer.channel_id) {
                    return true;
                }
                if abrupt {
                    let _ = consumer.sender.send(Err(BrokerError::ConnectionClosed));
                }
                false
            });
            queue.requeue(|unacked| channels.contains(&unacked.channel_id));
        }
        state
            .queues
            .retain(|_, queue| queue.owner != Some(connection_id));
    }

    fn channel_is_open(&self, channel_id: u64) -> bool {
        self.lock().channels.contains_key(&channel_id)
    }
}

impl Queue {
    /// Put the unacknowledged messages selected by `predicate` back at the front of the queue.
    fn requeue(&mut self, predicate: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| predicate(unacked))
            .map(|(tag, _)| *tag)
            .collect();
        // Oldest deliveries end up first.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }
}

/// Does a message published with `routing_key` match a binding with `binding_key`?
fn routes(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
        // We do not carry message headers.
        ExchangeKind::Headers => false,
    }
}

/// AMQP topic matching: `*` stands for exactly one word, `#` for zero or more words.
fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && topic_matches(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && topic_matches(rest, &words[1..]),
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(BrokerError::ConnectionRefused(url.to_owned()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(id);
        state.connections_opened += 1;
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        state.next_id += 1;
        let channel_id = state.next_id;
        state.channels.insert(channel_id, self.id);
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            id: channel_id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker.lock().connections.contains(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        InMemoryBroker::drop_connection(&mut state, self.id, false);
        let queues: Vec<String> = state.queues.keys().cloned().collect();
        for queue in queues {
            self.broker.dispatch(&mut state, &queue);
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    connection_id: u64,
    id: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        let state = self.broker.lock();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed(
                format!(
                    "inequivalent arg 'type' for exchange `{name}`: received {kind:?} but current is {:?}",
                    existing.kind
                ),
            )),
            Some(existing) if existing.options != options => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent flags for exchange `{name}`: received {options:?} but current is {:?}",
                    existing.options
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_owned(), Exchange { kind, options });
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        _arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        let connection_id = self.connection_id;
        let queue = state.queues.entry(name.to_owned()).or_default();
        if let Some(owner) = queue.owner {
            if owner != connection_id {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue `{name}` is exclusive to another connection"
                )));
            }
        }
        match queue.options {
            Some(existing) if existing != options => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent flags for queue `{name}`: received {options:?} but current is {existing:?}"
                )))
            }
            Some(_) => Ok(()),
            None => {
                queue.options = Some(options);
                queue.owner = options.exclusive.then_some(connection_id);
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("Exchange `{exchange}`")));
        }
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("Queue `{queue}`")))?;
        let binding = (exchange.to_owned(), routing_key.to_owned());
        if !queue.bindings.contains(&binding) {
            queue.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue_name: &str,
        tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.open_state()?;
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::NotFound(format!("Queue `{queue_name}`")))?;
        if queue
            .consumers
            .iter()
            .any(|c| c.channel_id == self.id && c.tag == tag)
        {
            return Err(BrokerError::PreconditionFailed(format!(
                "consumer tag `{tag}` is already in use on this channel"
            )));
        }
        if queue.consumers.iter().any(|c| c.exclusive)
            || (options.exclusive && !queue.consumers.is_empty())
        {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue `{queue_name}` is in exclusive use"
            )));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        queue.consumers.push(QueueConsumer {
            channel_id: self.id,
            tag: tag.to_owned(),
            exclusive: options.exclusive,
            sender,
        });
        self.broker.dispatch(&mut state, queue_name);

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            // Consumers die with their channel.
            return Err(BrokerError::UnknownConsumer(tag.to_owned()));
        }
        let channel_id = self.id;
        let mut emptied = None;
        let found = state.queues.iter_mut().find_map(|(name, queue)| {
            let position = queue
                .consumers
                .iter()
                .position(|c| c.channel_id == channel_id && c.tag == tag)?;
            queue.consumers.remove(position);
            queue.requeue(|unacked| unacked.channel_id == channel_id && unacked.tag == tag);
            let auto_delete = queue.options.map_or(false, |o| o.auto_delete);
            if auto_delete && queue.consumers.is_empty() {
                emptied = Some(name.clone());
            }
            Some(name.clone())
        });
        let Some(queue_name) = found else {
            return Err(BrokerError::UnknownConsumer(tag.to_owned()));
        };
        if let Some(emptied) = emptied {
            state.queues.remove(&emptied);
        } else {
            self.broker.dispatch(&mut state, &queue_name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.channel_is_open(self.id)
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    channel_id: u64,
    delivery_tag: DeliveryTag,
}

#[async_trait::async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.channel_id) {
            return Err(BrokerError::ChannelClosed);
        }
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::NotFound(format!("Queue `{}`", self.queue)))?;
        match queue.unacked.remove(&self.delivery_tag) {
            Some(_) => {
                queue.acked += 1;
                Ok(())
            }
            None => Err(BrokerError::Other(anyhow::anyhow!(
                "Unknown delivery tag {}",
                self.delivery_tag
            ))),
        }
    }
}
