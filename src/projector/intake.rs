// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Seeds the read model from `order_created` events.

use super::{order::OrderState, store::OrderStore};
use crate::handler::{ConsumedMessage, HandlerError, MessageHandler};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

pub const ORDER_CREATED_EVENT: &str = "order_created";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreatedPayload {
    order_id: String,
}

/// Records every newly created order as `{pending, pending}`.
///
/// Redelivered events find the order already present and leave it as is.
pub struct OrderIntake {
    store: Arc<dyn OrderStore>,
}

impl OrderIntake {
    pub fn new(store: Arc<dyn OrderStore>) -> Arc<Self> {
        Arc::new(OrderIntake { store })
    }
}

#[async_trait]
impl MessageHandler for OrderIntake {
    async fn exec(&self, _ctx: &Context, msg: &ConsumedMessage) -> Result<(), HandlerError> {
        if msg.event != ORDER_CREATED_EVENT {
            debug!(event = msg.event.as_str(), "ignoring event");
            return Ok(());
        }

        let payload: OrderCreatedPayload = serde_json::from_value(msg.payload.clone())?;

        let created = self
            .store
            .create(&payload.order_id, OrderState::default())
            .await
            .map_err(|err| HandlerError(err.to_string()))?;

        if created {
            info!(order_id = payload.order_id.as_str(), "order recorded");
        } else {
            debug!(order_id = payload.order_id.as_str(), "order already known");
        }

        Ok(())
    }
}
