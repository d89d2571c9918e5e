// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Fulfillment Bus
//!
//! This module provides the error taxonomy for every broker-facing operation.
//! The `AmqpError` enum represents all failure scenarios that can occur during
//! connection, channel, topology, publishing and consuming operations.
//!
//! Two classifications matter to callers:
//! - configuration errors (`is_configuration`) are never retried
//! - fatal errors (`is_fatal`) mean the service cannot keep running

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed. String
/// payloads carry the name of the offending entity or the underlying error text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Connection attempt exceeded the configured timeout
    #[error("connection attempt timed out after {0}ms")]
    ConnectTimeout(u64),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error enabling publisher confirmation mode
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The broker already holds a definition with different parameters
    #[error("topology conflict on `{0}`: existing definition differs")]
    TopologyConflict(String),

    /// The topology descriptor failed load-time validation
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Publish attempted without a live connection
    #[error("not connected to the broker")]
    NotConnected,

    /// The broker (or local flow control) refused to confirm a publish
    #[error("publish rejected: {0}")]
    PublishRejected(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Queue is not part of the installed topology
    #[error("queue `{0}` is not part of the topology")]
    UnknownQueue(String),

    /// Queue has no retry/dead-letter queues configured
    #[error("queue `{0}` has no retry policy configured")]
    RetryNotConfigured(String),

    /// Reconnect budget exhausted; the broker is considered unavailable
    #[error("broker unavailable after {attempts} attempts: {last_error}")]
    ReconnectBudgetExhausted { attempts: u32, last_error: String },

    /// A connection state transition that the state machine does not allow
    #[error("illegal connection transition: {event} while {status}")]
    IllegalTransition { status: String, event: String },

    /// The connection manager was shut down
    #[error("connection closed")]
    ConnectionClosed,
}

impl AmqpError {
    /// Errors caused by the descriptor or broker definitions rather than the network.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AmqpError::TopologyConflict(_) | AmqpError::InvalidTopology(_)
        )
    }

    /// Errors after which the service must not continue as if healthy.
    pub fn is_fatal(&self) -> bool {
        self.is_configuration()
            || matches!(
                self,
                AmqpError::ReconnectBudgetExhausted { .. } | AmqpError::IllegalTransition { .. }
            )
    }
}
