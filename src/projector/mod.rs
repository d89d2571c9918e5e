// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Order-Status Projector
//!
//! Consumes payment lifecycle events and advances the order read model. The
//! transition is keyed on the state currently stored, never on the arrival of
//! the event, so redeliveries and duplicates leave the order untouched. Writes
//! are compare-and-set: an order that changed underneath the projector fails
//! the message, which then takes the retry path.
//!
//! Orders enter the read model through `OrderIntake`, which consumes
//! `order_created` events from `orders.created`.

mod intake;
mod order;
mod store;

pub use intake::{OrderIntake, ORDER_CREATED_EVENT};
pub use order::{next_state, Order, OrderState, OrderStatus, PaymentEvent, PaymentStatus};
pub use store::{InMemoryOrderStore, OrderStore, StoreError};

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::{ConsumedMessage, HandlerError, MessageHandler},
    queue::{QueueBinding, QueueDefinition, RetryPolicy},
    topology::Topology,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

pub const ORDERS_EXCHANGE: &str = "orders.exchange";
pub const PAYMENTS_EXCHANGE: &str = "payments.exchange";
pub const ORDERS_CREATED_QUEUE: &str = "orders.created";
pub const PAYMENT_STATUS_QUEUE: &str = "orders.payment-status";
pub const ORDER_CREATED_ROUTING_KEY: &str = "order.created";
pub const PAYMENT_ROUTING_PATTERN: &str = "payment.*";

/// The fulfillment exchanges and queues.
///
/// * `orders.exchange` (topic) routes `order.created` to `orders.created`
/// * `payments.exchange` (topic) routes `payment.*` to `orders.payment-status`
///
/// Both queues are durable and carry `retry` with their `.retry` and `.dlq` queues.
pub fn fulfillment_topology(retry: RetryPolicy) -> Result<Topology, AmqpError> {
    Topology::builder()
        .exchange(ExchangeDefinition::new(ORDERS_EXCHANGE).topic().durable())
        .exchange(ExchangeDefinition::new(PAYMENTS_EXCHANGE).topic().durable())
        .queue(
            QueueDefinition::new(ORDERS_CREATED_QUEUE)
                .durable()
                .with_retry(retry),
        )
        .queue(
            QueueDefinition::new(PAYMENT_STATUS_QUEUE)
                .durable()
                .with_retry(retry),
        )
        .queue_binding(
            QueueBinding::new(ORDERS_CREATED_QUEUE)
                .exchange(ORDERS_EXCHANGE)
                .routing_key(ORDER_CREATED_ROUTING_KEY),
        )
        .queue_binding(
            QueueBinding::new(PAYMENT_STATUS_QUEUE)
                .exchange(PAYMENTS_EXCHANGE)
                .routing_key(PAYMENT_ROUTING_PATTERN),
        )
        .build()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentPayload {
    order_id: String,
    #[serde(default)]
    payment_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Applies payment events to orders held by an `OrderStore`.
pub struct OrderStatusProjector {
    store: Arc<dyn OrderStore>,
}

impl OrderStatusProjector {
    pub fn new(store: Arc<dyn OrderStore>) -> Arc<Self> {
        Arc::new(OrderStatusProjector { store })
    }

    /// Read-only view of an order's state.
    pub async fn get_order_status(&self, order_id: &str) -> Result<Option<OrderState>, StoreError> {
        Ok(self.store.get(order_id).await?.map(|order| order.state))
    }
}

#[async_trait]
impl MessageHandler for OrderStatusProjector {
    async fn exec(&self, _ctx: &Context, msg: &ConsumedMessage) -> Result<(), HandlerError> {
        let Some(event) = PaymentEvent::from_name(&msg.event) else {
            debug!(event = msg.event.as_str(), "ignoring event");
            return Ok(());
        };

        let payload: PaymentPayload = serde_json::from_value(msg.payload.clone())?;

        let order = self
            .store
            .get(&payload.order_id)
            .await
            .map_err(|err| HandlerError(err.to_string()))?
            .ok_or_else(|| HandlerError(format!("unknown order `{}`", payload.order_id)))?;

        let Some(next) = next_state(order.state, event) else {
            debug!(
                order_id = payload.order_id.as_str(),
                event = event.name(),
                status = %order.state.status,
                payment_status = %order.state.payment_status,
                "order already settled"
            );
            return Ok(());
        };

        let applied = self
            .store
            .transition(&payload.order_id, order.state, next)
            .await
            .map_err(|err| HandlerError(err.to_string()))?;
        if !applied {
            return Err(HandlerError(format!(
                "order `{}` changed while applying {}",
                payload.order_id,
                event.name()
            )));
        }

        info!(
            order_id = payload.order_id.as_str(),
            payment_id = payload.payment_id.as_deref().unwrap_or_default(),
            gateway_status = payload.status.as_deref().unwrap_or_default(),
            status = %next.status,
            payment_status = %next.payment_status,
            "order status advanced"
        );

        Ok(())
    }
}
