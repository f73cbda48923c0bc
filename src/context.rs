//! Scoped borrows of a [`Connection`].
use crate::broker::Broker;
use crate::config::ConnectionSettings;
use crate::consumers::{Callback, TopicConsumer, TopicOptions};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::{Connection, ConnectionState, DrainHandle, Error};
use std::fmt;
use std::sync::Arc;

/// Holds a [`Connection`], either borrowed from a [`ConnectionPool`] or owned outright, until
/// [`ConnectionContext::close`] is called.
///
/// Closing resets the connection (drain loop stopped, consumers cancelled) and then gives it
/// back to its pool, or closes it if it did not come from one.
/// Once closed, every operation fails with [`Error::ContextClosed`].
///
/// A pooled context dropped without being closed still gives its connection back: the pool
/// resets it before handing it out again.
///
/// ```rust
/// use carrot_topic::broker::memory::InMemoryBroker;
/// use carrot_topic::config::{MapConfig, DEFAULT_SECTION};
/// use carrot_topic::consumers::{ClosureCallback, Message};
/// use carrot_topic::{ConnectionContext, ConnectionPool};
///
/// # async fn example() -> Result<(), carrot_topic::Error> {
/// let pool = ConnectionPool::new(&MapConfig::new(), InMemoryBroker::new(), DEFAULT_SECTION)?;
/// let mut context = ConnectionContext::pooled(&pool).await?;
/// context
///     .create_consumer("orders.created", ClosureCallback(|_: Message| async {
///         Ok::<_, anyhow::Error>(())
///     }))
///     .await?;
/// context.consume_in_thread().await?;
/// // [...]
/// context.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionContext {
    held: Option<Held>,
}

enum Held {
    Pooled {
        pool: ConnectionPool,
        connection: PooledConnection,
    },
    Standalone(Connection),
}

impl ConnectionContext {
    /// Borrow a connection from `pool`, waiting for one to be released if the pool is
    /// exhausted.
    ///
    /// Connections come back from the pool reset, hence idle: they are reconnected, reusing
    /// their broker link.
    pub async fn pooled(pool: &ConnectionPool) -> Result<Self, Error> {
        let mut connection = pool.acquire().await?;
        if connection.state() == ConnectionState::Idle {
            connection.reconnect().await?;
        }
        Ok(Self {
            held: Some(Held::Pooled {
                pool: pool.clone(),
                connection,
            }),
        })
    }

    /// Open a connection outside of any pool.
    pub async fn standalone(
        broker: Arc<dyn Broker>,
        settings: ConnectionSettings,
    ) -> Result<Self, Error> {
        let mut connection = Connection::new(broker, settings);
        connection.reconnect().await?;
        Ok(Self::from(connection))
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.held, Some(Held::Pooled { .. }))
    }

    pub fn is_closed(&self) -> bool {
        self.held.is_none()
    }

    /// The wrapped connection.
    pub fn connection(&self) -> Result<&Connection, Error> {
        match &self.held {
            Some(Held::Pooled { connection, .. }) => Ok(&**connection),
            Some(Held::Standalone(connection)) => Ok(connection),
            None => Err(Error::ContextClosed),
        }
    }

    fn connection_mut(&mut self) -> Result<&mut Connection, Error> {
        match &mut self.held {
            Some(Held::Pooled { connection, .. }) => Ok(&mut **connection),
            Some(Held::Standalone(connection)) => Ok(connection),
            None => Err(Error::ContextClosed),
        }
    }

    /// See [`Connection::create_consumer`].
    pub async fn create_consumer<C: Callback>(
        &mut self,
        topic: &str,
        callback: C,
    ) -> Result<&TopicConsumer, Error> {
        self.connection_mut()?
            .create_consumer(topic, callback)
            .await
    }

    /// See [`Connection::create_consumer_with`].
    pub async fn create_consumer_with<C: Callback>(
        &mut self,
        topic: &str,
        callback: C,
        options: TopicOptions,
    ) -> Result<&TopicConsumer, Error> {
        self.connection_mut()?
            .create_consumer_with(topic, callback, options)
            .await
    }

    /// See [`Connection::consume_in_thread`].
    pub async fn consume_in_thread(&mut self) -> Result<DrainHandle, Error> {
        self.connection_mut()?.consume_in_thread().await
    }

    /// See [`Connection::reconnect`].
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        self.connection_mut()?.reconnect().await
    }

    /// See [`Connection::recover`].
    pub async fn recover(&mut self) -> Result<(), Error> {
        self.connection_mut()?.recover().await
    }

    /// See [`Connection::reset`].
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.connection_mut()?.reset().await
    }

    /// Reset the connection, then give it back to its pool (or close it if standalone).
    ///
    /// The connection is released even if the reset fails; the reset error is returned.
    /// Closing an already closed context does nothing.
    #[tracing::instrument(name = "connection_context_close", skip(self))]
    pub async fn close(&mut self) -> Result<(), Error> {
        match self.held.take() {
            Some(Held::Pooled {
                pool,
                mut connection,
            }) => {
                let outcome = connection.reset().await;
                pool.release(connection);
                outcome
            }
            Some(Held::Standalone(mut connection)) => connection.disconnect().await,
            None => Ok(()),
        }
    }
}

impl From<Connection> for ConnectionContext {
    fn from(connection: Connection) -> Self {
        Self {
            held: Some(Held::Standalone(connection)),
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("pooled", &self.is_pooled())
            .field("connection", &self.connection().ok())
            .finish()
    }
}
