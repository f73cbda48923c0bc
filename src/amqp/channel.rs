//! [`lapin`] implementations of the broker traits.
use crate::broker::{
    Acker, BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions, Delivery,
    DeliveryStream, ExchangeKind, ExchangeOptions, QueueOptions,
};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use std::sync::Arc;

pub(crate) struct LapinConnection(pub(crate) lapin::Connection);

#[async_trait::async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.0.create_channel().await.map_err(broker_error)?;
        Ok(Arc::new(LapinChannel(channel)))
    }

    fn is_connected(&self) -> bool {
        self.0.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.0.close(200, "OK").await.map_err(broker_error)
    }
}

struct LapinChannel(lapin::Channel);

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let options = ExchangeDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            ..Default::default()
        };
        self.0
            .exchange_declare(name, kind, options, FieldTable::default())
            .await
            .map_err(broker_error)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            ..Default::default()
        };
        self.0
            .queue_declare(name, options, arguments)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.0
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let options = BasicConsumeOptions {
            nowait: options.nowait,
            exclusive: options.exclusive,
            ..Default::default()
        };
        let consumer = self
            .0
            .basic_consume(queue, tag, options, FieldTable::default())
            .await
            .map_err(broker_error)?;
        let deliveries = consumer.map(|delivery| {
            let delivery = delivery.map_err(broker_error)?;
            Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.exchange.as_str(),
                delivery.routing_key.as_str(),
                delivery.redelivered,
                delivery
                    .properties
                    .content_type()
                    .as_ref()
                    .map(|c| c.as_str().to_owned()),
                delivery.data,
                LapinAcker(delivery.acker),
            ))
        });
        Ok(deliveries.boxed())
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), BrokerError> {
        match self.0.basic_cancel(tag, BasicCancelOptions::default()).await {
            Ok(()) => Ok(()),
            // The consumers registered on a closed channel are gone with it.
            Err(lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)) => {
                Err(BrokerError::UnknownConsumer(tag.to_owned()))
            }
            Err(e) => Err(broker_error(e)),
        }
    }

    fn is_open(&self) -> bool {
        self.0.status().connected()
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(broker_error)
    }
}

pub(crate) fn broker_error(error: lapin::Error) -> BrokerError {
    if let lapin::Error::ProtocolError(e) = &error {
        let message = e.get_message().as_str().to_owned();
        match e.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                return BrokerError::PreconditionFailed(message)
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => return BrokerError::NotFound(message),
            _ => {}
        }
    }
    match error {
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
        error => BrokerError::Other(error.into()),
    }
}
