//! Provides pooling for [`Connection`](crate::Connection)s using [`deadpool`].
//!
//! The pool provides two key guarantees:
//! - a connection is handed to one borrower at a time, and borrowers wait (without a timeout)
//!   when every connection is taken and the pool is full;
//! - connections that lost their link with the broker are disposed of and recreated on demand.
//!
//! Connections are created lazily, never pre-warmed.
//!
//! ```rust
//! use carrot_topic::broker::memory::InMemoryBroker;
//! use carrot_topic::config::{MapConfig, DEFAULT_SECTION};
//! use carrot_topic::pool::ConnectionPool;
//!
//! // Function for asyncness.
//! async fn example() -> Result<(), carrot_topic::Error> {
//!     let config = MapConfig::new().with(DEFAULT_SECTION, "pool_size", "16");
//!     let pool = ConnectionPool::new(&config, InMemoryBroker::new(), DEFAULT_SECTION)?;
//!
//!     // get a connection, linked to the broker, from the pool.
//!     let connection = pool.acquire().await?;
//!     pool.release(connection);
//!     Ok(())
//! }
//! ```
use crate::broker::Broker;
use crate::config::{self, Config, ConnectionSettings};
use crate::Error;
use deadpool::managed::{Object, Pool};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

mod connection;
mod error;

pub use connection::ConnectionManager;

/// A [`Connection`](crate::Connection) borrowed from a [`ConnectionPool`].
///
/// It dereferences to [`Connection`](crate::Connection) and goes back to the pool when dropped.
pub type PooledConnection = Object<ConnectionManager>;

/// A bounded pool of [`Connection`](crate::Connection)s.
///
/// Cloning is cheap: all clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Pool<ConnectionManager>,
    settings: ConnectionSettings,
}

/// A snapshot of the occupancy of a [`ConnectionPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    /// The maximum number of connections.
    pub max_size: usize,
    /// The number of connections currently alive, borrowed or not.
    pub size: usize,
    /// The number of connections waiting for a borrower.
    pub available: usize,
}

impl ConnectionPool {
    /// Build a pool of connections to `broker`.
    ///
    /// The connection settings are read from `section`, the maximum size from `pool_size` in
    /// the [`DEFAULT_SECTION`](crate::config::DEFAULT_SECTION).
    pub fn new(config: &dyn Config, broker: impl Broker, section: &str) -> Result<Self, Error> {
        Self::with_max_size(
            Arc::new(broker),
            ConnectionSettings::from_config(config, section),
            config::pool_size(config),
        )
    }

    pub fn with_max_size(
        broker: Arc<dyn Broker>,
        settings: ConnectionSettings,
        max_size: usize,
    ) -> Result<Self, Error> {
        let inner = Pool::builder(ConnectionManager::new(broker, settings.clone()))
            .max_size(max_size)
            .build()
            .map_err(|e| Error::Pool(anyhow::anyhow!("Failed to build the connection pool: {e}")))?;
        tracing::debug!(max_size, "Connection pool created");
        Ok(Self { inner, settings })
    }

    /// Borrow a connection.
    ///
    /// An idle connection is reused if there is one, otherwise a new one is created if the
    /// pool is not full. Otherwise this waits, for as long as it takes, for another borrower
    /// to give a connection back.
    #[tracing::instrument(name = "connection_pool_acquire", skip(self))]
    pub async fn acquire(&self) -> Result<PooledConnection, Error> {
        Ok(self.inner.get().await?)
    }

    /// Give a connection back, making it available to the next [`ConnectionPool::acquire`].
    ///
    /// Dropping a [`PooledConnection`] has the same effect.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: usize::try_from(status.available).unwrap_or(0),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .finish()
    }
}

type Registry = Mutex<HashMap<TypeId, ConnectionPool>>;

static POOLS: OnceLock<Registry> = OnceLock::new();

/// The process-wide pool of connections to brokers of type `B`.
///
/// The first call for a given broker type builds the pool (see [`ConnectionPool::new`]);
/// every later call returns that same pool and ignores its arguments.
pub fn get_connection_pool<B: Broker>(
    config: &dyn Config,
    broker: B,
    section: &str,
) -> Result<ConnectionPool, Error> {
    let mut pools = POOLS
        .get_or_init(Registry::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(pool) = pools.get(&TypeId::of::<B>()) {
        return Ok(pool.clone());
    }
    let pool = ConnectionPool::new(config, broker, section)?;
    tracing::info!(
        broker = std::any::type_name::<B>(),
        max_size = pool.status().max_size,
        "Shared connection pool created"
    );
    pools.insert(TypeId::of::<B>(), pool.clone());
    Ok(pool)
}
