// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Event backbone of the fulfillment service: a RabbitMQ client that keeps its
//! topology alive across outages, publishes with broker confirmation and
//! consumes with bounded concurrency, delayed retries and dead-lettering, plus
//! the order-status projector that runs on top of it.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod projector;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use consumer::{DeliveryOutcome, RetryRoute};
