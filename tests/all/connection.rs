use crate::helpers::{connected, eventually, next_message, recorder, topic, SpyBroker, EXCHANGE};
use carrot_topic::broker::memory::InMemoryBroker;
use carrot_topic::broker::{Broker, ConsumeOptions, ExchangeKind, ExchangeOptions};
use carrot_topic::consumers::{ClosureCallback, Message};
use carrot_topic::{ConnectionState, Error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn reconnecting_drops_consumers_and_stops_the_drain_loop() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut connection = connected(broker.clone()).await;
    let (callback, _messages) = recorder();
    connection.create_consumer("T", callback).await.unwrap();
    let drain = connection.consume_in_thread().await.unwrap();
    assert_eq!(1, connection.consumers().len());

    // Act
    connection.reconnect().await.unwrap();

    // Assert
    assert!(connection.consumers().is_empty());
    assert!(connection.drain_handle().is_none());
    assert!(drain.is_finished());
    assert_eq!(ConnectionState::Connected, connection.state());
    assert_eq!(0, broker.consumer_count("T"));
    assert_eq!(1, broker.open_connections());
}

#[tokio::test]
async fn reset_cancels_every_consumer_once_in_registration_order() {
    // Arrange
    let broker = SpyBroker::default();
    let mut connection = connected(broker.clone()).await;
    for _ in 0..3 {
        let (callback, _messages) = recorder();
        connection.create_consumer(&topic(), callback).await.unwrap();
    }
    let _drain = connection.consume_in_thread().await.unwrap();

    // Act
    connection.reset().await.unwrap();

    // Assert
    assert_eq!(vec!["0", "1", "2"], broker.cancelled_tags());
    assert!(connection.consumers().is_empty());
    assert_eq!(ConnectionState::Idle, connection.state());
}

#[tokio::test]
async fn tags_start_from_zero_again_after_a_reset() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut connection = connected(broker.clone()).await;
    for topic in ["A", "B", "C"] {
        let (callback, _messages) = recorder();
        connection.create_consumer(topic, callback).await.unwrap();
    }
    connection.reset().await.unwrap();
    connection.reconnect().await.unwrap();

    // Act
    let (callback, _messages) = recorder();
    let consumer = connection.create_consumer("D", callback).await.unwrap();

    // Assert
    assert_eq!("0", consumer.tag());
    assert_eq!(1, connection.consumers().len());
    assert_eq!(1, broker.connections_opened());
}

#[tokio::test]
async fn a_reset_connection_is_idle_until_reconnected() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut connection = connected(broker.clone()).await;
    let (callback, _messages) = recorder();
    connection.create_consumer("A", callback.clone()).await.unwrap();
    let _drain = connection.consume_in_thread().await.unwrap();

    // Act
    connection.reset().await.unwrap();

    // Assert
    assert_eq!(ConnectionState::Idle, connection.state());
    assert!(matches!(
        connection.create_consumer("B", callback.clone()).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        connection.consume_in_thread().await,
        Err(Error::NotConnected)
    ));
    connection.reconnect().await.unwrap();
    assert_eq!(ConnectionState::Connected, connection.state());
    connection.create_consumer("B", callback).await.unwrap();
    // The broker link survived the reset and was reused.
    assert_eq!(1, broker.connections_opened());
    assert_eq!(1, broker.open_connections());
}

#[tokio::test]
async fn resetting_an_idle_connection_does_nothing() {
    let broker = InMemoryBroker::new();
    let mut connection = carrot_topic::Connection::new(Arc::new(broker), crate::helpers::settings());

    connection.reset().await.unwrap();

    assert_eq!(ConnectionState::Idle, connection.state());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_failing_callback_does_not_stop_the_drain_loop() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut connection = connected(broker.clone()).await;
    let topic = topic();
    let processed = Arc::new(AtomicUsize::new(0));
    let callback = {
        let processed = Arc::clone(&processed);
        ClosureCallback(move |message: Message| {
            let processed = Arc::clone(&processed);
            async move {
                processed.fetch_add(1, Ordering::SeqCst);
                if message.text().as_deref() == Some("M") {
                    anyhow::bail!("Cannot process M");
                }
                Ok(())
            }
        })
    };
    connection.create_consumer(&topic, callback).await.unwrap();
    let drain = connection.consume_in_thread().await.unwrap();

    // Act
    broker.publish(EXCHANGE, &topic, "M").unwrap();
    broker.publish(EXCHANGE, &topic, "M+1").unwrap();

    // Assert
    eventually(|| broker.acked_count(&topic) == 2).await;
    assert_eq!(2, processed.load(Ordering::SeqCst));
    assert_eq!(Some(0), broker.queue_depth(&topic));
    assert!(!drain.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_panicking_callback_does_not_stop_the_drain_loop() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut connection = connected(broker.clone()).await;
    let topic = topic();
    let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
    let callback = ClosureCallback(move |message: Message| {
        let sender = sender.clone();
        async move {
            if message.text().as_deref() == Some("boom") {
                panic!("The callback blew up");
            }
            sender.send(message).map_err(|_| anyhow::anyhow!("Receiver dropped"))
        }
    });
    connection.create_consumer(&topic, callback).await.unwrap();
    let drain = connection.consume_in_thread().await.unwrap();

    // Act
    broker.publish(EXCHANGE, &topic, "boom").unwrap();
    broker.publish(EXCHANGE, &topic, "fine").unwrap();

    // Assert
    let message = next_message(&mut received).await;
    assert_eq!(Some("fine".to_owned()), message.text());
    eventually(|| broker.acked_count(&topic) == 2).await;
    assert!(!drain.is_finished());
}

#[tokio::test]
async fn cancelling_after_the_broker_went_away_is_not_an_error() {
    // Arrange
    let broker = SpyBroker::default();
    let mut connection = connected(broker.clone()).await;
    let (callback, _messages) = recorder();
    connection.create_consumer(&topic(), callback).await.unwrap();
    let drain = connection.consume_in_thread().await.unwrap();

    // Act
    broker.inner.sever_connections();
    drain.finished().await;
    let outcome = connection.reset().await;

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(vec!["0"], broker.cancelled_tags());
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn connection_failures_are_returned_to_the_caller() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(true);
    let mut connection =
        carrot_topic::Connection::new(Arc::new(broker.clone()), crate::helpers::settings());

    let outcome = connection.reconnect().await;

    assert!(matches!(outcome, Err(Error::Connect(_))));
    assert_eq!(ConnectionState::Idle, connection.state());
    assert_eq!(0, broker.connections_opened());
}

#[tokio::test]
async fn declaration_conflicts_are_returned_to_the_caller() {
    // Arrange
    let broker = InMemoryBroker::new();
    let link = broker.connect("memory://").await.unwrap();
    let options = ExchangeOptions {
        durable: true,
        auto_delete: false,
    };
    link.create_channel()
        .await
        .unwrap()
        .declare_exchange(EXCHANGE, ExchangeKind::Fanout, options)
        .await
        .unwrap();
    let mut connection = connected(broker).await;

    // Act
    let (callback, _messages) = recorder();
    let outcome = connection.create_consumer(&topic(), callback).await;

    // Assert
    assert!(matches!(outcome, Err(Error::Declaration { .. })));
    assert!(connection.consumers().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovering_keeps_consumers_and_resumes_consumption() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut connection = connected(broker.clone()).await;
    let topic = topic();
    let (callback, mut messages) = recorder();
    connection.create_consumer(&topic, callback).await.unwrap();
    let drain = connection.consume_in_thread().await.unwrap();
    broker.sever_connections();
    drain.finished().await;
    broker.publish(EXCHANGE, &topic, "while we were away").unwrap();

    // Act
    connection.recover().await.unwrap();

    // Assert
    let message = next_message(&mut messages).await;
    assert_eq!(Some("while we were away".to_owned()), message.text());
    assert_eq!(vec!["0"], tags(&connection));
    assert_eq!(ConnectionState::Consuming, connection.state());
    assert_eq!(1, broker.consumer_count(&topic));
    assert_eq!(2, broker.connections_opened());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unacknowledged_messages_are_redelivered_after_recovery() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut connection = connected(broker.clone()).await;
    let topic = topic();
    let (started, mut started_received) = tokio::sync::mpsc::unbounded_channel();
    let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
    let callback = ClosureCallback(move |message: Message| {
        let started = started.clone();
        let sender = sender.clone();
        async move {
            if !message.redelivered {
                let _ = started.send(());
                // Wait for the broker to go away before finishing.
                std::future::pending::<()>().await;
            }
            sender.send(message).map_err(|_| anyhow::anyhow!("Receiver dropped"))
        }
    });
    connection.create_consumer(&topic, callback).await.unwrap();
    let _drain = connection.consume_in_thread().await.unwrap();
    broker.publish(EXCHANGE, &topic, "slow").unwrap();
    started_received.recv().await.unwrap();

    // Act
    broker.sever_connections();
    connection.recover().await.unwrap();

    // Assert
    let message = next_message(&mut received).await;
    assert!(message.redelivered);
    assert_eq!(Some("slow".to_owned()), message.text());
}

fn tags(connection: &carrot_topic::Connection) -> Vec<&str> {
    connection.consumers().iter().map(|c| c.tag()).collect()
}

#[tokio::test]
async fn reconnecting_after_a_failed_recovery_drops_stale_consumers() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut connection = connected(broker.clone()).await;
    let (callback, _messages) = recorder();
    connection.create_consumer("T", callback).await.unwrap();
    let drain = connection.consume_in_thread().await.unwrap();
    broker.sever_connections();
    drain.finished().await;
    broker.refuse_connections(true);
    assert!(matches!(connection.recover().await, Err(Error::Connect(_))));
    broker.refuse_connections(false);

    // Act
    connection.reconnect().await.unwrap();

    // Assert
    assert!(connection.consumers().is_empty());
    assert!(connection.drain_handle().is_none());
    assert_eq!(ConnectionState::Connected, connection.state());
    let (callback, mut messages) = recorder();
    connection.create_consumer("T", callback).await.unwrap();
    let _drain = connection.consume_in_thread().await.unwrap();
    broker.publish(EXCHANGE, "T", "back").unwrap();
    assert_eq!(Some("back".to_owned()), next_message(&mut messages).await.text());
}

#[tokio::test]
async fn consumers_started_before_a_failing_one_are_cancelled() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (free, locked) = (topic(), topic());
    let mut holder = connected(broker.clone()).await;
    holder.set_consume_options(ConsumeOptions {
        exclusive: true,
        ..Default::default()
    });
    let (callback, _messages) = recorder();
    holder.create_consumer(&locked, callback).await.unwrap();
    let _holder_drain = holder.consume_in_thread().await.unwrap();
    let mut connection = connected(broker.clone()).await;
    for topic in [&free, &locked] {
        let (callback, _messages) = recorder();
        connection.create_consumer(topic, callback).await.unwrap();
    }

    // Act
    let outcome = connection.consume_in_thread().await;

    // Assert
    assert!(matches!(outcome, Err(Error::Consume { .. })));
    assert_eq!(0, broker.consumer_count(&free));
    assert_eq!(ConnectionState::Connected, connection.state());
    // Once the queue is free again, every consumer starts.
    holder.reset().await.unwrap();
    let _drain = connection.consume_in_thread().await.unwrap();
    assert_eq!(1, broker.consumer_count(&free));
    assert_eq!(1, broker.consumer_count(&locked));
}

#[tokio::test]
async fn dropping_a_connection_closes_its_broker_link() {
    // Arrange
    let broker = InMemoryBroker::new();
    let connection = connected(broker.clone()).await;
    assert_eq!(1, broker.open_connections());

    // Act
    drop(connection);

    // Assert
    eventually(|| broker.open_connections() == 0).await;
}
