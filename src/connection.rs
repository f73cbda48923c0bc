//! A broker connection with its topic consumers and their drain loop.
use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions};
use crate::config::ConnectionSettings;
use crate::consumers::{Callback, Subscription, TopicConsumer, TopicOptions};
use crate::Error;
use futures_util::stream::{select_all, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Where a [`Connection`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Freshly created or reset: call [`Connection::reconnect`] before registering consumers.
    Idle,
    /// Linked to the broker, consumers can be registered.
    Connected,
    /// The drain loop is running.
    Consuming,
}

/// One broker connection, one channel, an ordered list of [`TopicConsumer`]s and the
/// background loop draining their deliveries.
///
/// A `Connection` is meant to go through `reconnect` → `create_consumer` (one or more times)
/// → `consume_in_thread` → `reset` as many times as needed.
/// A reset connection is idle, but it keeps its broker link if it is still up: reconnecting it
/// then reuses that link instead of opening a new one, which is what makes it cheap to reuse
/// from a [`ConnectionPool`](crate::ConnectionPool).
///
/// ```rust,no_run
/// use carrot_topic::broker::memory::InMemoryBroker;
/// use carrot_topic::config::ConnectionSettings;
/// use carrot_topic::consumers::{ClosureCallback, Message};
/// use carrot_topic::Connection;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), carrot_topic::Error> {
/// let mut connection = Connection::new(Arc::new(InMemoryBroker::new()), ConnectionSettings::default());
/// connection.reconnect().await?;
/// connection
///     .create_consumer("orders.created", ClosureCallback(|message: Message| async move {
///         println!("{:?}", message.payload);
///         Ok::<_, anyhow::Error>(())
///     }))
///     .await?;
/// let drain = connection.consume_in_thread().await?;
/// // [...]
/// connection.reset().await?;
/// assert!(drain.is_finished());
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    id: Uuid,
    broker: Arc<dyn Broker>,
    settings: ConnectionSettings,
    link: Option<Box<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    consumers: Vec<TopicConsumer>,
    consume_options: ConsumeOptions,
    drain: Option<DrainTask>,
    // Set by `reconnect`/`recover`, cleared by `reset`. The link can outlive it.
    ready: bool,
}

struct DrainTask {
    token: CancellationToken,
    finished: watch::Receiver<bool>,
    join: JoinHandle<Result<(), BrokerError>>,
}

impl DrainTask {
    fn handle(&self) -> DrainHandle {
        DrainHandle {
            token: self.token.clone(),
            finished: self.finished.clone(),
        }
    }

    /// Request cancellation and wait for the loop to be gone.
    async fn stop(self) {
        self.token.cancel();
        match self.join.await {
            Ok(Ok(())) => tracing::debug!("Drain loop stopped"),
            Ok(Err(e)) => {
                tracing::warn!(error = ?e, "Drain loop had stopped on a broker error")
            }
            Err(e) if e.is_cancelled() => tracing::debug!("Drain loop cancelled"),
            Err(e) => tracing::error!(error = ?e, "Drain loop panicked"),
        }
    }
}

impl Connection {
    /// A new, idle connection. Nothing happens broker-side until [`Connection::reconnect`].
    pub fn new(broker: Arc<dyn Broker>, settings: ConnectionSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            broker,
            settings,
            link: None,
            channel: None,
            consumers: Vec::new(),
            consume_options: ConsumeOptions::default(),
            drain: None,
            ready: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// The flags used when the drain loop starts consuming.
    pub fn set_consume_options(&mut self, options: ConsumeOptions) {
        self.consume_options = options;
    }

    /// The registered consumers, in registration order.
    pub fn consumers(&self) -> &[TopicConsumer] {
        &self.consumers
    }

    /// `true` if the broker link is up.
    pub fn is_connected(&self) -> bool {
        self.link.as_ref().map_or(false, |link| link.is_connected())
    }

    pub fn state(&self) -> ConnectionState {
        if !self.ready || self.channel.is_none() {
            ConnectionState::Idle
        } else if self.is_draining() {
            ConnectionState::Consuming
        } else {
            ConnectionState::Connected
        }
    }

    /// A handle on the running drain loop, if any.
    pub fn drain_handle(&self) -> Option<DrainHandle> {
        self.drain.as_ref().map(DrainTask::handle)
    }

    fn is_draining(&self) -> bool {
        self.drain
            .as_ref()
            .map_or(false, |drain| !drain.handle().is_finished())
    }

    fn ready_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.clone().filter(|_| self.ready)
    }

    fn link_is_up(&self) -> bool {
        self.is_connected() && self.channel.as_ref().map_or(false, |channel| channel.is_open())
    }

    /// Open a new broker link and a channel on it.
    ///
    /// The connection is [reset](Connection::reset) first: every consumer is cancelled and
    /// forgotten and must be registered again.
    /// An idle connection whose previous link is still up reuses it.
    /// Connection failures are returned as they are, without retries.
    #[tracing::instrument(name = "connection_reconnect", skip(self), fields(connection_id = %self.id))]
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        let reusable = self.state() == ConnectionState::Idle && self.link_is_up();
        if let Err(e) = self.reset().await {
            tracing::warn!(error = ?e, "Failed to reset the connection before reconnecting");
        }
        if reusable {
            tracing::debug!("Reusing the broker link kept across the last reset");
        } else {
            self.relink().await?;
        }
        self.ready = true;
        Ok(())
    }

    /// Re-establish the broker link while keeping the registered consumers.
    ///
    /// Every consumer is re-declared on the new channel, keeping its tag. If the drain loop was
    /// started before (even if it has since stopped because the broker went away), it is
    /// started again.
    #[tracing::instrument(name = "connection_recover", skip(self), fields(connection_id = %self.id))]
    pub async fn recover(&mut self) -> Result<(), Error> {
        let was_consuming = self.drain.is_some();
        if let Some(drain) = self.drain.take() {
            drain.stop().await;
        }
        self.relink().await?;
        self.ready = true;
        let channel = self.channel.clone().ok_or(Error::NotConnected)?;
        for consumer in &mut self.consumers {
            consumer.reconnect(Arc::clone(&channel)).await?;
        }
        tracing::info!(consumers = self.consumers.len(), "Consumers re-declared");
        if was_consuming {
            self.consume_in_thread().await?;
        }
        Ok(())
    }

    async fn relink(&mut self) -> Result<(), Error> {
        self.close_link().await;
        let link = self
            .broker
            .connect(self.settings.url.expose_secret())
            .await
            .map_err(Error::Connect)?;
        let channel = link.create_channel().await.map_err(Error::Connect)?;
        self.link = Some(link);
        self.channel = Some(channel);
        tracing::info!("Connected to the broker");
        Ok(())
    }

    async fn close_link(&mut self) {
        self.channel = None;
        if let Some(link) = self.link.take() {
            if link.is_connected() {
                if let Err(e) = link.close().await {
                    tracing::debug!(error = ?e, "Failed to close the previous broker link");
                }
            }
        }
    }

    /// Declare a consumer for `topic` with the default [`TopicOptions`] and append it to the
    /// consumer list.
    ///
    /// Its tag is its position in the list.
    pub async fn create_consumer<C: Callback>(
        &mut self,
        topic: &str,
        callback: C,
    ) -> Result<&TopicConsumer, Error> {
        self.create_consumer_with(topic, callback, TopicOptions::default())
            .await
    }

    /// Same as [`Connection::create_consumer`], with custom declaration options.
    #[tracing::instrument(
        name = "connection_create_consumer",
        skip(self, callback, options),
        fields(connection_id = %self.id)
    )]
    pub async fn create_consumer_with<C: Callback>(
        &mut self,
        topic: &str,
        callback: C,
        options: TopicOptions,
    ) -> Result<&TopicConsumer, Error> {
        if self.is_draining() {
            return Err(Error::AlreadyConsuming);
        }
        let channel = self.ready_channel().ok_or(Error::NotConnected)?;
        let tag = self.consumers.len().to_string();
        let consumer = TopicConsumer::create(
            channel,
            topic,
            Arc::new(callback),
            &tag,
            &self.settings.exchange,
            options,
        )
        .await?;
        self.consumers.push(consumer);
        Ok(&self.consumers[self.consumers.len() - 1])
    }

    /// Start every consumer, in registration order, then drain their deliveries on a
    /// background task.
    ///
    /// Returns as soon as the consumers are started.
    /// The loop runs until the connection is reset, the handle is stopped, or the broker stops
    /// delivering (e.g. the link went down, see [`Connection::recover`]).
    #[tracing::instrument(name = "connection_consume", skip(self), fields(connection_id = %self.id))]
    pub async fn consume_in_thread(&mut self) -> Result<DrainHandle, Error> {
        if self.is_draining() {
            return Err(Error::AlreadyConsuming);
        }
        if self.ready_channel().is_none() {
            return Err(Error::NotConnected);
        }
        if let Some(drain) = self.drain.take() {
            drain.stop().await;
        }

        let mut subscriptions = Vec::with_capacity(self.consumers.len());
        for index in 0..self.consumers.len() {
            match self.consumers[index].consume(self.consume_options).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    // Nothing will drain the consumers started so far.
                    drop(subscriptions);
                    for started in &mut self.consumers[..index] {
                        if let Err(e) = started.unsubscribe().await {
                            tracing::warn!(error = ?e, tag = started.tag(), "Failed to stop consumer");
                        }
                    }
                    return Err(e);
                }
            }
        }
        tracing::info!(consumers = subscriptions.len(), "Consumers started");

        let token = CancellationToken::new();
        let (finished_sender, finished) = watch::channel(false);
        let span = tracing::info_span!("drain_loop", connection_id = %self.id);
        let join = tokio::spawn(
            {
                let token = token.clone();
                async move {
                    let outcome = drain_deliveries(subscriptions, token).await;
                    let _ = finished_sender.send(true);
                    outcome
                }
            }
            .instrument(span),
        );
        let task = DrainTask {
            token,
            finished,
            join,
        };
        let handle = task.handle();
        self.drain = Some(task);
        Ok(handle)
    }

    /// Stop the drain loop (waiting for it to be gone), then cancel every consumer in
    /// registration order and forget them.
    ///
    /// The connection is idle afterwards, but its broker link is kept for the next
    /// [`Connection::reconnect`]. Does nothing on an idle connection.
    /// Every consumer is cancelled even if some cancellations fail: the first failure is
    /// returned.
    #[tracing::instrument(name = "connection_reset", skip(self), fields(connection_id = %self.id))]
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.ready = false;
        if let Some(drain) = self.drain.take() {
            drain.stop().await;
        }
        let mut consumers = std::mem::take(&mut self.consumers);
        let mut outcome = Ok(());
        for consumer in &mut consumers {
            if let Err(e) = consumer.cancel().await {
                tracing::warn!(error = ?e, tag = consumer.tag(), "Failed to cancel consumer");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    /// Reset the connection, then close its broker link.
    #[tracing::instrument(name = "connection_disconnect", skip(self), fields(connection_id = %self.id))]
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        let outcome = self.reset().await;
        self.close_link().await;
        outcome
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(drain) = &self.drain {
            drain.token.cancel();
        }
        let Some(link) = self.link.take() else {
            return;
        };
        // Closing is async: it needs a runtime to run on.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let id = self.id;
                runtime.spawn(async move {
                    if link.is_connected() {
                        if let Err(e) = link.close().await {
                            tracing::debug!(connection_id = %id, error = ?e, "Failed to close a dropped connection");
                        }
                    }
                });
            }
            Err(_) => tracing::warn!(
                connection_id = %self.id,
                "Connection dropped outside of a runtime, its broker link was not closed"
            ),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("exchange", &self.settings.exchange)
            .field("state", &self.state())
            .field("consumers", &self.consumers.len())
            .finish_non_exhaustive()
    }
}

/// Wait for deliveries on every subscription and hand them over to their consumer.
///
/// Deliveries are processed one at a time. Cancellation interrupts the callback in flight,
/// if any; its message is acknowledged all the same.
async fn drain_deliveries(
    subscriptions: Vec<Subscription>,
    token: CancellationToken,
) -> Result<(), BrokerError> {
    if subscriptions.is_empty() {
        token.cancelled().await;
        return Ok(());
    }
    let mut handlers = Vec::with_capacity(subscriptions.len());
    let mut streams = Vec::with_capacity(subscriptions.len());
    for (index, subscription) in subscriptions.into_iter().enumerate() {
        handlers.push(subscription.handler);
        streams.push(
            subscription
                .deliveries
                .map(move |delivery| (index, delivery)),
        );
    }
    let mut deliveries = select_all(streams);

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            next = deliveries.next() => next,
        };
        match next {
            Some((index, Ok(delivery))) => handlers[index].process(delivery, &token).await,
            Some((index, Err(e))) => {
                tracing::warn!(
                    error = ?e,
                    tag = %handlers[index].tag,
                    "The broker stopped delivering messages"
                );
                return Err(e);
            }
            None => {
                tracing::info!("Every consumer has been cancelled by the broker");
                return Ok(());
            }
        }
    }
}

/// A handle on the background drain loop of a [`Connection`].
///
/// Dropping the handle does not stop the loop.
#[derive(Clone, Debug)]
pub struct DrainHandle {
    token: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl DrainHandle {
    pub fn is_finished(&self) -> bool {
        // A dropped sender means the task is gone, e.g. it panicked.
        *self.finished.borrow() || self.finished.has_changed().is_err()
    }

    /// Ask the loop to stop, interrupting the callback in flight, if any.
    ///
    /// Consumers stay registered: use [`Connection::reset`] to cancel them.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Wait for the loop to stop.
    pub async fn finished(&self) {
        let mut finished = self.finished.clone();
        while !*finished.borrow_and_update() {
            if finished.changed().await.is_err() {
                return;
            }
        }
    }
}
