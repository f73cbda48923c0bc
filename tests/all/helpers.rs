use amq_protocol_types::FieldTable;
use carrot_topic::broker::memory::InMemoryBroker;
use carrot_topic::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions, DeliveryStream,
    ExchangeKind, ExchangeOptions, QueueOptions,
};
use carrot_topic::config::ConnectionSettings;
use carrot_topic::consumers::{Callback, ClosureCallback, Message};
use carrot_topic::Connection;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const EXCHANGE: &str = "test-events";

pub fn settings() -> ConnectionSettings {
    ConnectionSettings::new("memory://localhost", EXCHANGE)
}

/// A connection to `broker`, linked and ready for consumers.
pub async fn connected(broker: impl Broker) -> Connection {
    let mut connection = Connection::new(Arc::new(broker), settings());
    connection.reconnect().await.unwrap();
    connection
}

pub fn topic() -> String {
    format!("test.{}", Uuid::new_v4())
}

/// A callback forwarding every message it receives to the returned receiver.
pub fn recorder() -> (impl Callback + Clone, mpsc::UnboundedReceiver<Message>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let callback = Arc::new(ClosureCallback(move |message: Message| {
        let sender = sender.clone();
        async move { sender.send(message).map_err(|_| anyhow::anyhow!("Receiver dropped")) }
    }));
    (callback, receiver)
}

/// Wait for the next message, failing the test if it takes too long.
pub async fn next_message(receiver: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("Timed out waiting for a message")
        .expect("The callback was dropped")
}

/// Wait until `condition` holds, failing the test if it takes too long.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for the condition to hold")
}

/// An [`InMemoryBroker`] recording every consumer cancellation.
#[derive(Clone, Default)]
pub struct SpyBroker {
    pub inner: InMemoryBroker,
    cancelled: Arc<Mutex<Vec<String>>>,
}

impl SpyBroker {
    /// The tags of the cancelled consumers, in cancellation order.
    pub fn cancelled_tags(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Broker for SpyBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        Ok(Box::new(SpyConnection {
            inner: self.inner.connect(url).await?,
            cancelled: Arc::clone(&self.cancelled),
        }))
    }
}

struct SpyConnection {
    inner: Box<dyn BrokerConnection>,
    cancelled: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl BrokerConnection for SpyConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        Ok(Arc::new(SpyChannel {
            inner: self.inner.create_channel().await?,
            cancelled: Arc::clone(&self.cancelled),
        }))
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

struct SpyChannel {
    inner: Arc<dyn BrokerChannel>,
    cancelled: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl BrokerChannel for SpyChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.inner.declare_exchange(name, kind, options).await
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.inner.declare_queue(name, options, arguments).await
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.inner.basic_consume(queue, tag, options).await
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), BrokerError> {
        self.cancelled.lock().unwrap().push(tag.to_owned());
        self.inner.basic_cancel(tag).await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}
