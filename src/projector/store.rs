// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Persistence seam of the order read model.

use super::order::{Order, OrderState};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("order store unavailable: {0}")]
    Unavailable(String),
}

/// Order persistence owned by the rest of the application.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError>;

    /// Records `order_id` in `state` unless it is already known.
    ///
    /// # Returns
    /// false when the order already existed; its state is left untouched
    async fn create(&self, order_id: &str, state: OrderState) -> Result<bool, StoreError>;

    /// Replaces the state of `order_id` with `to` only if it is still `from`.
    ///
    /// # Returns
    /// false when the order is missing or its state moved on
    async fn transition(
        &self,
        order_id: &str,
        from: OrderState,
        to: OrderState,
    ) -> Result<bool, StoreError>;
}

/// Process-local `OrderStore`.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<String, OrderState>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, order_id: &str, state: OrderState) {
        self.orders.write().await.insert(order_id.to_owned(), state);
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().await.get(order_id).map(|state| Order {
            id: order_id.to_owned(),
            state: *state,
        }))
    }

    async fn create(&self, order_id: &str, state: OrderState) -> Result<bool, StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(order_id) {
            return Ok(false);
        }
        orders.insert(order_id.to_owned(), state);
        Ok(true)
    }

    async fn transition(
        &self,
        order_id: &str,
        from: OrderState,
        to: OrderState,
    ) -> Result<bool, StoreError> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(order_id) {
            Some(state) if *state == from => {
                *state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
