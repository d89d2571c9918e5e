// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module turns domain events into wire messages and publishes them with
//! delivery confirmation. Every message is persistent, carries a fresh message id
//! and timestamp, and propagates the OpenTelemetry context of the caller.
//!
//! A publish made while disconnected fails immediately with `NotConnected`; it is
//! never buffered client-side, so the broker stays the only place a backlog can
//! build up. A publish the broker does not confirm fails with `PublishRejected`
//! and the caller decides how to back off.

use crate::{
    channel::PublishConfirm,
    connection::ConnectionManager,
    envelope::{DeliveryHeaders, Envelope, Event, HeaderValue},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// What end users see when an event could not be handed to the broker
pub const RETRY_LATER_MESSAGE: &str = "please try again";

/// Translates a publish failure into the only text end users may see.
pub fn user_facing_message(_err: &AmqpError) -> &'static str {
    RETRY_LATER_MESSAGE
}

/// An event plus its routing and optional broker options.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub event: Event,
    pub headers: HashMap<String, HeaderValue>,
    pub priority: Option<u8>,
    pub expiration: Option<Duration>,
    pub correlation_id: Option<String>,
}

impl PublishMessage {
    pub fn new(exchange: &str, routing_key: &str, event: Event) -> Self {
        Self {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            event,
            headers: HashMap::default(),
            priority: None,
            expiration: None,
            correlation_id: None,
        }
    }

    /// Adds a header; reserved `x-retry-count`/`x-error`/... keys are dropped at publish time.
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }
}

/// The broker accepted and confirmed the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub message_id: String,
    /// Epoch milliseconds stamped on the message
    pub timestamp: i64,
}

/// Publishes domain events.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// # Returns
    /// `Accepted` once the broker confirmed the message, `AmqpError::NotConnected`
    /// without a live connection, `AmqpError::PublishRejected` otherwise
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<Accepted, AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
pub struct RabbitMQPublisher {
    manager: Arc<ConnectionManager>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `manager` - Connection manager owning the operating channel
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { manager })
    }

    /// Publishes `event` under the current trace context, without extra options.
    pub async fn publish_event(
        &self,
        exchange: &str,
        routing_key: &str,
        event: Event,
    ) -> Result<Accepted, AmqpError> {
        self.publish(
            &Context::current(),
            &PublishMessage::new(exchange, routing_key, event),
        )
        .await
    }

    fn properties(
        &self,
        ctx: &Context,
        msg: &PublishMessage,
        message_id: &str,
        timestamp: i64,
    ) -> BasicProperties {
        let mut trace = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut trace);

        let mut headers = DeliveryHeaders::default();
        headers.merge(trace);
        let refused = headers.merge(
            msg.headers
                .iter()
                .map(|(key, value)| (ShortString::from(key.as_str()), AMQPValue::from(value.clone()))),
        );
        if !refused.is_empty() {
            warn!(headers = ?refused, "ignoring headers that would overwrite required fields");
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(message_id))
            .with_timestamp(u64::try_from(timestamp).unwrap_or_default())
            .with_type(ShortString::from(msg.event.event.as_str()))
            .with_headers(headers.into_field_table());

        if let Some(priority) = msg.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(expiration) = msg.expiration {
            properties = properties.with_expiration(ShortString::from(expiration.as_millis().to_string()));
        }
        if let Some(correlation_id) = &msg.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }

        properties
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    /// Publishes a message to RabbitMQ and waits for the broker confirmation.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context for tracing
    /// * `msg` - The event, its routing and options
    ///
    /// # Returns
    /// Accepted on success or AmqpError on failure
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<Accepted, AmqpError> {
        let Some(channel) = self.manager.channel() else {
            warn!(
                exchange = msg.exchange.as_str(),
                routing_key = msg.routing_key.as_str(),
                "publish refused, broker not connected"
            );
            return Err(AmqpError::NotConnected);
        };

        let now = Utc::now();
        let body = Envelope::wrap(&msg.event, now).to_bytes()?;
        let message_id = Uuid::new_v4().to_string();
        let properties = self.properties(ctx, msg, &message_id, now.timestamp_millis());

        match channel
            .publish(&msg.exchange, &msg.routing_key, &body, properties)
            .await
        {
            Ok(PublishConfirm::Ack) => {
                debug!(
                    exchange = msg.exchange.as_str(),
                    routing_key = msg.routing_key.as_str(),
                    message_id = message_id.as_str(),
                    "message published"
                );
                Ok(Accepted {
                    message_id,
                    timestamp: now.timestamp_millis(),
                })
            }
            Ok(PublishConfirm::Nack) => {
                warn!(
                    exchange = msg.exchange.as_str(),
                    routing_key = msg.routing_key.as_str(),
                    message_id = message_id.as_str(),
                    "broker did not confirm the message"
                );
                Err(AmqpError::PublishRejected(
                    "broker did not confirm the message".to_owned(),
                ))
            }
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishRejected(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{BrokerChannel, MockBrokerChannel, MockConnector},
        config::BrokerConfig,
        envelope::HEADER_RETRY_COUNT,
        topology::Topology,
    };
    use serde_json::{json, Value};
    use std::sync::Mutex;

    type Published = Arc<Mutex<Vec<(String, String, Vec<u8>, BasicProperties)>>>;

    async fn connected_publisher(confirm: Result<PublishConfirm, AmqpError>) -> (Arc<RabbitMQPublisher>, Published) {
        let published: Published = Arc::new(Mutex::new(vec![]));
        let sink = published.clone();

        let mut connector = MockConnector::new();
        connector.expect_open().returning(move |_, _, _| {
            let sink = sink.clone();
            let confirm = confirm.clone();
            let mut channel = MockBrokerChannel::new();
            channel.expect_confirm_select().returning(|| Ok(()));
            channel.expect_basic_qos().returning(|_| Ok(()));
            channel.expect_publish().returning(move |exchange, key, body, props| {
                sink.lock()
                    .unwrap()
                    .push((exchange.to_owned(), key.to_owned(), body.to_vec(), props));
                confirm.clone()
            });
            Ok(Arc::new(channel) as Arc<dyn BrokerChannel>)
        });

        let manager = ConnectionManager::new(Arc::new(connector), Topology::default(), BrokerConfig::default());
        manager.connect().await.unwrap();
        (RabbitMQPublisher::new(manager), published)
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails_fast() {
        let manager = ConnectionManager::new(
            Arc::new(MockConnector::new()),
            Topology::default(),
            BrokerConfig::default(),
        );
        let publisher = RabbitMQPublisher::new(manager);

        let result = publisher
            .publish_event("orders.exchange", "order.created", Event::new("order_created", json!({})))
            .await;

        assert_eq!(result, Err(AmqpError::NotConnected));
        assert_eq!(user_facing_message(&result.unwrap_err()), "please try again");
    }

    #[tokio::test]
    async fn publish_builds_persistent_envelope() {
        let (publisher, published) = connected_publisher(Ok(PublishConfirm::Ack)).await;

        let accepted = publisher
            .publish_event(
                "orders.exchange",
                "order.created",
                Event::new("order_created", json!({"id": "o1"})),
            )
            .await
            .unwrap();

        let published = published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (exchange, key, body, props) = &published[0];
        assert_eq!(exchange, "orders.exchange");
        assert_eq!(key, "order.created");

        let body: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body["event"], "order_created");
        assert_eq!(body["payload"], json!({"id": "o1"}));
        assert_eq!(body["at"], json!(accepted.timestamp));

        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.message_id().as_ref().map(|id| id.to_string()),
            Some(accepted.message_id.clone())
        );
        assert_eq!(props.timestamp(), &Some(accepted.timestamp as u64));
        assert_eq!(DeliveryHeaders::from_properties(props).retry_count, 0);
    }

    #[tokio::test]
    async fn message_ids_are_unique() {
        let (publisher, _) = connected_publisher(Ok(PublishConfirm::Ack)).await;
        let event = Event::new("order_created", json!({}));

        let first = publisher.publish_event("orders.exchange", "k", event.clone()).await.unwrap();
        let second = publisher.publish_event("orders.exchange", "k", event).await.unwrap();
        assert_ne!(first.message_id, second.message_id);
    }

    #[tokio::test]
    async fn caller_headers_cannot_override_required_fields() {
        let (publisher, published) = connected_publisher(Ok(PublishConfirm::Ack)).await;

        let msg = PublishMessage::new(
            "payments.exchange",
            "payment.approved",
            Event::new("payment_approved", json!({"orderId": "o1"})),
        )
        .header(HEADER_RETRY_COUNT, HeaderValue::LongInt(7))
        .header("tenant", HeaderValue::LongString("acme".to_owned()))
        .priority(3)
        .expiration(Duration::from_secs(10));

        publisher.publish(&Context::new(), &msg).await.unwrap();

        let published = published.lock().unwrap();
        let props = &published[0].3;
        let headers = DeliveryHeaders::from_properties(props);
        assert_eq!(headers.retry_count, 0);
        assert!(headers.extra().contains_key("tenant"));
        assert_eq!(props.priority(), &Some(3));
        assert_eq!(
            props.expiration().as_ref().map(|e| e.to_string()),
            Some("10000".to_owned())
        );
    }

    #[tokio::test]
    async fn unconfirmed_publish_is_rejected() {
        let (publisher, _) = connected_publisher(Ok(PublishConfirm::Nack)).await;

        let result = publisher
            .publish_event("orders.exchange", "order.created", Event::new("order_created", json!({})))
            .await;

        assert!(matches!(result, Err(AmqpError::PublishRejected(_))));
    }

    #[tokio::test]
    async fn transport_failure_is_rejected() {
        let (publisher, _) =
            connected_publisher(Err(AmqpError::PublishingError("channel closed".to_owned()))).await;

        let result = publisher
            .publish_event("orders.exchange", "order.created", Event::new("order_created", json!({})))
            .await;

        assert_eq!(result, Err(AmqpError::PublishRejected("failure to publish: channel closed".to_owned())));
    }
}
