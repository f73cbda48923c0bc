use crate::helpers::{next_message, recorder, settings, topic, EXCHANGE};
use carrot_topic::broker::memory::InMemoryBroker;
use carrot_topic::{ConnectionContext, ConnectionPool, Error};
use std::sync::Arc;

#[tokio::test]
async fn closing_a_pooled_context_resets_the_connection_and_gives_it_back() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ConnectionPool::with_max_size(Arc::new(broker.clone()), settings(), 4).unwrap();
    let topic = topic();
    let mut context = ConnectionContext::pooled(&pool).await.unwrap();
    let (callback, mut messages) = recorder();
    context.create_consumer(&topic, callback).await.unwrap();
    let drain = context.consume_in_thread().await.unwrap();
    broker.publish(EXCHANGE, &topic, "hello").unwrap();
    next_message(&mut messages).await;

    // Act
    context.close().await.unwrap();

    // Assert
    assert!(context.is_closed());
    assert!(drain.is_finished());
    assert_eq!(0, broker.consumer_count(&topic));
    assert_eq!(1, pool.status().available);
    assert_eq!(1, broker.open_connections());
}

#[tokio::test]
async fn a_closed_context_refuses_every_operation() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ConnectionPool::with_max_size(Arc::new(broker), settings(), 1).unwrap();
    let mut context = ConnectionContext::pooled(&pool).await.unwrap();
    context.close().await.unwrap();

    // Act
    let (callback, _messages) = recorder();
    let outcome = context.create_consumer(&topic(), callback).await;

    // Assert
    assert!(matches!(outcome, Err(Error::ContextClosed)));
    assert!(matches!(context.consume_in_thread().await, Err(Error::ContextClosed)));
    assert!(matches!(context.reconnect().await, Err(Error::ContextClosed)));
    assert!(matches!(context.reset().await, Err(Error::ContextClosed)));
    assert!(matches!(context.connection(), Err(Error::ContextClosed)));
    // Closing again is harmless.
    assert!(context.close().await.is_ok());
}

#[tokio::test]
async fn closing_a_standalone_context_closes_its_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut context = ConnectionContext::standalone(Arc::new(broker.clone()), settings())
        .await
        .unwrap();
    let topic = topic();
    let (callback, _messages) = recorder();
    context.create_consumer(&topic, callback).await.unwrap();
    let _drain = context.consume_in_thread().await.unwrap();
    assert!(!context.is_pooled());
    assert_eq!(1, broker.open_connections());

    // Act
    context.close().await.unwrap();

    // Assert
    assert_eq!(0, broker.consumer_count(&topic));
    assert_eq!(0, broker.open_connections());
}

#[tokio::test]
async fn a_context_delegates_to_its_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut context = ConnectionContext::standalone(Arc::new(broker.clone()), settings())
        .await
        .unwrap();
    let (callback, _messages) = recorder();
    context.create_consumer(&topic(), callback).await.unwrap();

    // Act
    context.reconnect().await.unwrap();

    // Assert
    assert!(context.connection().unwrap().consumers().is_empty());
    assert_eq!(2, broker.connections_opened());
    assert_eq!(1, broker.open_connections());
}
