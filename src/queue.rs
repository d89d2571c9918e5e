// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining queues and their bindings.
//! It includes the retry/dead-letter convention used by the consumer: every
//! business queue with a retry policy owns two derived queues, `<name>.retry`
//! (a delay hop whose expired messages dead-letter back into the business
//! queue) and `<name>.dlq` (a terminal sink).

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, time::Duration};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_ARGS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_ARGS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_ARGS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_ARGS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to enable priorities
pub const AMQP_ARGS_MAX_PRIORITY: &str = "x-max-priority";

/// Suffix of the delay-hop queue derived from a business queue
pub const RETRY_QUEUE_SUFFIX: &str = ".retry";
/// Suffix of the dead-letter queue derived from a business queue
pub const DLQ_SUFFIX: &str = ".dlq";

/// Name of the retry queue for `queue`.
pub fn retry_queue_name(queue: &str) -> String {
    format!("{queue}{RETRY_QUEUE_SUFFIX}")
}

/// Name of the dead-letter queue for `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}{DLQ_SUFFIX}")
}

/// Retry budget and linear delay applied when a handler fails.
///
/// The n-th retry waits `retry_delay * n` in the retry queue. Once the retry
/// count would exceed `max_retries` the message is dead-lettered instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Whether a message whose retry count would become `retry_count` may still be retried.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }

    /// Time the message spends in the retry queue before its `retry_count`-th redelivery.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.retry_delay.saturating_mul(retry_count)
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports standard queue options as well as message TTL, max length, priority,
/// explicit dead-letter routing and the retry/DLQ convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) max_priority: Option<u8>,
    pub(crate) message_ttl: Option<Duration>,
    pub(crate) max_length: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) retry: Option<RetryPolicy>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }

    pub fn max_priority(&self) -> Option<u8> {
        self.max_priority
    }

    pub fn message_ttl(&self) -> Option<Duration> {
        self.message_ttl
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// Durable queues will survive broker restart, preserving persistent messages.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// Messages that exceed this TTL are removed, or dead-lettered if configured.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Enables message priorities up to `max`.
    pub fn priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Routes rejected or expired messages to `exchange` (optionally re-keyed).
    ///
    /// # Parameters
    /// * `exchange` - The dead-letter exchange
    /// * `routing_key` - Routing key replacing the original one, if any
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = routing_key.map(str::to_owned);
        self
    }

    /// Adds the retry mechanism to the queue.
    ///
    /// This declares `<name>.retry` and `<name>.dlq` alongside the queue and lets the
    /// consumer route failed messages through them.
    ///
    /// # Parameters
    /// * `policy` - Retry budget and delay base
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn retry_name(&self) -> Option<String> {
        self.retry.map(|_| retry_queue_name(&self.name))
    }

    pub fn dlq_name(&self) -> Option<String> {
        self.retry.map(|_| dlq_name(&self.name))
    }

    /// Builds the `x-*` declaration arguments of the queue.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_ARGS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }

        if let Some(ttl) = self.message_ttl {
            let ttl = i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX);
            args.insert(
                ShortString::from(AMQP_ARGS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_ARGS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(priority) = self.max_priority {
            args.insert(
                ShortString::from(AMQP_ARGS_MAX_PRIORITY),
                AMQPValue::ShortShortUInt(priority),
            );
        }

        FieldTable::from(args)
    }

    /// The delay-hop queue: no consumers, expired messages go back to this queue.
    pub(crate) fn retry_definition(&self) -> Option<QueueDefinition> {
        self.retry_name().map(|name| QueueDefinition {
            name,
            durable: self.durable,
            dead_letter_exchange: Some(String::new()),
            dead_letter_routing_key: Some(self.name.clone()),
            ..QueueDefinition::default()
        })
    }

    /// The terminal sink: no TTL, no dead-lettering.
    pub(crate) fn dlq_definition(&self) -> Option<QueueDefinition> {
        self.dlq_name().map(|name| QueueDefinition {
            name,
            durable: self.durable,
            ..QueueDefinition::default()
        })
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
