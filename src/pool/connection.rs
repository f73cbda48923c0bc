//! Implements [`Manager`] for [`Connection`].
use crate::broker::Broker;
use crate::config::ConnectionSettings;
use crate::{Connection, Error};
use deadpool::managed::{self, Manager};
use std::sync::Arc;

/// `ConnectionManager` implements [`Manager`] to manage a pool of [`Connection`]s.
///
/// Connections are linked to the broker when created. A connection whose broker link went
/// down is discarded when it is about to be handed out again; a healthy one is reset, in case
/// its previous borrower did not do it.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    settings: ConnectionSettings,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, settings: ConnectionSettings) -> Self {
        Self { broker, settings }
    }
}

#[async_trait::async_trait]
impl Manager for ConnectionManager {
    type Type = Connection;
    type Error = Error;

    async fn create(&self) -> Result<Connection, Error> {
        let mut connection = Connection::new(Arc::clone(&self.broker), self.settings.clone());
        connection.reconnect().await?;
        tracing::debug!(connection_id = %connection.id(), "Pooled connection created");
        Ok(connection)
    }

    async fn recycle(&self, connection: &mut Connection) -> managed::RecycleResult<Error> {
        if !connection.is_connected() {
            return Err(managed::RecycleError::Message(format!(
                "Connection {} lost its link with the broker",
                connection.id()
            )));
        }
        if !connection.consumers().is_empty() || connection.drain_handle().is_some() {
            tracing::debug!(
                connection_id = %connection.id(),
                "Resetting a connection returned to the pool without being reset"
            );
            connection.reset().await.map_err(managed::RecycleError::Backend)?;
        }
        Ok(())
    }
}
