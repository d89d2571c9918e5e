// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the seam between the bus and the broker client. The
//! `Connector` opens a connection plus one operating channel; the `BrokerChannel`
//! exposes the handful of channel operations the connection manager, the
//! publisher and the consumer need. The lapin-backed implementations live here
//! too; tests substitute their own.

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::{QueueBinding, QueueDefinition}};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A message handed over by the broker, detached from the client library.
#[derive(Debug, Clone, Default)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Broker answer to a publish made in confirmation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirm {
    Ack,
    Nack,
}

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// An asynchronous connection or channel failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFault {
    pub generation: u64,
    pub error: AmqpError,
}

/// Where a connection reports the faults it observes after being opened.
///
/// Each connection attempt gets its own generation so the connection manager can
/// discard faults raised by connections it already replaced.
#[derive(Debug, Clone)]
pub struct FaultSink {
    generation: u64,
    tx: mpsc::UnboundedSender<ConnectionFault>,
}

impl FaultSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<ConnectionFault>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn report(&self, error: AmqpError) {
        let fault = ConnectionFault {
            generation: self.generation,
            error,
        };
        if self.tx.send(fault).is_err() {
            debug!("fault receiver dropped, ignoring connection fault");
        }
    }
}

/// The operating channel, shared by the publisher and the consumer.
///
/// Only the connection manager may `close` it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Enables publisher confirmation mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Limits the unacknowledged deliveries held by all consumers of the channel.
    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes and waits for the broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm, AmqpError>;

    /// Starts a manual-ack subscription on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens a connection and its operating channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// # Parameters
    /// * `uri` - The broker URI
    /// * `connection_name` - Name shown in the broker management UI
    /// * `faults` - Sink for asynchronous connection and channel errors
    async fn open(
        &self,
        uri: &str,
        connection_name: &str,
        faults: FaultSink,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// lapin implementation of the `Connector` trait.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    /// Creates a new AMQP connection and channel.
    ///
    /// Connection-level and channel-level errors raised by lapin after this call
    /// returns are forwarded to `faults`.
    async fn open(
        &self,
        uri: &str,
        connection_name: &str,
        faults: FaultSink,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let connection = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let connection_faults = faults.clone();
        connection.on_error(move |err| {
            connection_faults.report(AmqpError::ConnectionError(err.to_string()));
        });

        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        debug!("channel created");

        channel.on_error(move |err| {
            faults.report(AmqpError::ChannelError(err.to_string()));
        });

        Ok(Arc::new(LapinChannel {
            connection,
            channel,
        }))
    }
}

/// lapin implementation of the `BrokerChannel` trait.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

/// A declaration rejected with PRECONDITION_FAILED means the broker holds a
/// different definition under the same name.
fn declaration_error(err: lapin::Error, name: &str, fallback: fn(String) -> AmqpError) -> AmqpError {
    if let lapin::Error::ProtocolError(amqp_error) = &err {
        if matches!(
            amqp_error.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ) {
            return AmqpError::TopologyConflict(name.to_owned());
        }
    }
    error!(error = err.to_string(), name = name, "declaration failed");
    fallback(name.to_owned())
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| AmqpError::ConfirmSelectError(err.to_string()))
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: true })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: def.is_internal(),
                    nowait: false,
                },
                FieldTable::from(def.params().clone()),
            )
            .await
            .map_err(|err| declaration_error(err, def.name(), AmqpError::DeclareExchangeError))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| declaration_error(err, def.name(), AmqpError::DeclareQueueError))
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                binding.queue(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue().to_owned(),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => Ok(PublishConfirm::Nack),
            Ok(_) => Ok(PublishConfirm::Ack),
            Err(err) => Err(AmqpError::PublishingError(err.to_string())),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(InboundDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|_| AmqpError::NackMessageError)
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(200, "closing").await {
                debug!(error = err.to_string(), "channel already closed");
            }
        }

        if self.connection.status().connected() {
            self.connection
                .close(200, "closing")
                .await
                .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;
        }

        Ok(())
    }
}
