// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The contract between the dispatcher and business code: a handler receives the
//! decoded message and reports success or failure. It never acknowledges
//! anything itself; the consumer turns its result into ack, retry or dead-letter.

use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use thiserror::Error;

/// A decoded message handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub queue: String,
    pub event: String,
    pub payload: Value,
    /// Epoch milliseconds at which the producer published the event
    pub at: i64,
    pub message_id: Option<String>,
    /// Number of earlier failed attempts
    pub retry_count: u32,
}

/// Business failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError(format!("invalid payload: {err}"))
    }
}

/// Processes messages consumed from a queue.
///
/// Delivery is at-least-once, so implementations must be idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumedMessage) -> Result<(), HandlerError>;
}
