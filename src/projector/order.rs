// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Order read model and the payment transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Preparing,
    OutForDelivery,
    Difficulty,
    Delivered,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Difficulty => "difficulty",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        };
        f.write_str(status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        };
        f.write_str(status)
    }
}

/// The part of an order the projector reads and advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderState {
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
}

impl OrderState {
    pub fn new(status: OrderStatus, payment_status: PaymentStatus) -> Self {
        OrderState {
            status,
            payment_status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    #[serde(flatten)]
    pub state: OrderState,
}

/// Payment lifecycle events understood by the projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEvent {
    Approved,
    Rejected,
    Cancelled,
}

impl PaymentEvent {
    pub const APPROVED: &'static str = "payment_approved";
    pub const REJECTED: &'static str = "payment_rejected";
    pub const CANCELLED: &'static str = "payment_cancelled";

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            Self::APPROVED => Some(PaymentEvent::Approved),
            Self::REJECTED => Some(PaymentEvent::Rejected),
            Self::CANCELLED => Some(PaymentEvent::Cancelled),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PaymentEvent::Approved => Self::APPROVED,
            PaymentEvent::Rejected => Self::REJECTED,
            PaymentEvent::Cancelled => Self::CANCELLED,
        }
    }
}

/// Applies `event` to `current`.
///
/// Only a pending payment moves; the order status follows it only from
/// `pending`. Everything else, duplicates included, yields `None`.
pub fn next_state(current: OrderState, event: PaymentEvent) -> Option<OrderState> {
    if current.payment_status != PaymentStatus::Pending {
        return None;
    }

    let (payment_status, status) = match event {
        PaymentEvent::Approved => (PaymentStatus::Completed, OrderStatus::Confirmed),
        PaymentEvent::Rejected => (PaymentStatus::Failed, OrderStatus::Cancelled),
        PaymentEvent::Cancelled => return None,
    };

    let status = if current.status == OrderStatus::Pending {
        status
    } else {
        current.status
    };

    Some(OrderState::new(status, payment_status))
}
