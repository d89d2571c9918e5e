// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Per-delivery processing: decode the envelope, run the handler inside a
//! consumer span, then settle the delivery. A failure republishes the original
//! body to the queue's `.retry` queue with an incremented `x-retry-count` and a
//! per-message expiration; the broker dead-letters it back to the business
//! queue once the delay elapses. When the retry budget is spent the copy goes to
//! the `.dlq` queue instead, stamped with the death reason and time.
//!
//! The original delivery is only settled after the broker confirmed the copy.
//! If it did not, the delivery is returned to its queue unchanged so no message
//! is lost.

use crate::{
    channel::{BrokerChannel, InboundDelivery, PublishConfirm},
    envelope::{DeliveryHeaders, Envelope, DEATH_REASON_MAX_RETRIES},
    errors::AmqpError,
    handler::{ConsumedMessage, HandlerError, MessageHandler},
    otel,
    publisher::PERSISTENT_DELIVERY_MODE,
    queue::{QueueDefinition, RetryPolicy},
};
use chrono::Utc;
use futures_util::FutureExt;
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, time::Duration};
use tracing::{debug, error, warn};

/// Where a failed delivery of a business queue goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRoute {
    pub queue: String,
    pub retry_queue: String,
    pub dlq: String,
    pub policy: RetryPolicy,
}

impl TryFrom<&QueueDefinition> for RetryRoute {
    type Error = AmqpError;

    fn try_from(def: &QueueDefinition) -> Result<Self, Self::Error> {
        match (def.retry_policy(), def.retry_name(), def.dlq_name()) {
            (Some(policy), Some(retry_queue), Some(dlq)) => Ok(RetryRoute {
                queue: def.name().to_owned(),
                retry_queue,
                dlq,
                policy,
            }),
            _ => Err(AmqpError::RetryNotConfigured(def.name().to_owned())),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Retried { retry_count: u32, delay: Duration },
    DeadLettered { retry_count: u32 },
    /// The failure copy was not confirmed; the delivery went back to its queue
    /// with its retry count unchanged.
    ///
    /// The broker redelivers a requeued message at once, so while it keeps
    /// refusing publishes (flow control, a missing `.retry` queue) the handler
    /// runs again in a tight loop.
    Requeued,
}

/// Processes one delivery of `route.queue` and settles it.
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for the consumer span
/// * `delivery` - The delivery to process
/// * `route` - Retry and dead-letter destinations of the queue
/// * `handler` - Business handler
/// * `channel` - Channel the delivery arrived on, used to settle and republish
///
/// # Returns
/// The outcome, or an error when the delivery could not be settled at all
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    route: &RetryRoute,
    handler: &dyn MessageHandler,
    channel: &dyn BrokerChannel,
) -> Result<DeliveryOutcome, AmqpError> {
    let headers = DeliveryHeaders::from_properties(&delivery.properties);
    let envelope = Envelope::from_slice(&delivery.data);

    let event_name = delivery
        .properties
        .kind()
        .as_ref()
        .map(|kind| kind.as_str().to_owned())
        .or_else(|| envelope.as_ref().ok().map(|e| e.event.clone()))
        .unwrap_or_else(|| "unknown".to_owned());

    let (ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, &event_name);

    debug!(
        queue = route.queue.as_str(),
        event = event_name.as_str(),
        retry_count = headers.retry_count,
        "received message"
    );

    let result = match envelope {
        Ok(envelope) => {
            let msg = ConsumedMessage {
                queue: route.queue.clone(),
                event: envelope.event,
                payload: envelope.payload,
                at: envelope.at,
                message_id: delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_owned()),
                retry_count: headers.retry_count,
            };

            match AssertUnwindSafe(handler.exec(&ctx, &msg)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(HandlerError(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        }
        Err(err) => Err(HandlerError(format!("failure to decode message: {err}"))),
    };

    let reason = match result {
        Ok(()) => {
            if let Err(err) = channel.ack(delivery.delivery_tag).await {
                error!(error = err.to_string(), "error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Err(err);
            }

            debug!(queue = route.queue.as_str(), "message successfully processed");
            span.set_status(Status::Ok);
            return Ok(DeliveryOutcome::Acked);
        }
        Err(err) => err,
    };

    span.record_error(&reason);
    span.set_status(Status::Error {
        description: Cow::from(reason.to_string()),
    });

    let next = headers.escalate(&route.queue, &reason.0);
    let retry_count = next.retry_count;

    let (target, properties, outcome) = if route.policy.allows(retry_count) {
        let delay = route.policy.delay_for(retry_count);
        warn!(
            queue = route.queue.as_str(),
            error = reason.0.as_str(),
            retry_count = retry_count,
            delay_ms = delay.as_millis() as u64,
            "error whiling handling msg, scheduling retry"
        );
        let properties = republish_properties(&delivery.properties, next.into_field_table())
            .with_expiration(ShortString::from(delay.as_millis().to_string()));
        (
            route.retry_queue.as_str(),
            properties,
            DeliveryOutcome::Retried { retry_count, delay },
        )
    } else {
        error!(
            queue = route.queue.as_str(),
            error = reason.0.as_str(),
            retry_count = retry_count,
            "too many attempts, sending to dlq"
        );
        let headers = next.dead_letter(DEATH_REASON_MAX_RETRIES, Utc::now());
        (
            route.dlq.as_str(),
            republish_properties(&delivery.properties, headers.into_field_table()),
            DeliveryOutcome::DeadLettered { retry_count },
        )
    };

    let confirmed = match channel.publish("", target, &delivery.data, properties).await {
        Ok(PublishConfirm::Ack) => true,
        Ok(PublishConfirm::Nack) => {
            error!(queue = target, "broker refused the failure copy");
            false
        }
        Err(err) => {
            error!(queue = target, error = err.to_string(), "error whiling publishing failure copy");
            false
        }
    };

    if let Err(err) = channel.nack(delivery.delivery_tag, !confirmed).await {
        error!(error = err.to_string(), "error whiling nack msg");
        return Err(err);
    }

    if confirmed {
        Ok(outcome)
    } else {
        error!(
            queue = route.queue.as_str(),
            copy_to = target,
            "failure copy unconfirmed, message returned to its queue"
        );
        Ok(DeliveryOutcome::Requeued)
    }
}

/// Copies the delivery properties for a republish, with new headers.
///
/// The expiration of an earlier retry hop is dropped.
fn republish_properties(original: &BasicProperties, headers: FieldTable) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(headers);

    if let Some(content_type) = original.content_type() {
        props = props.with_content_type(content_type.clone());
    }
    if let Some(message_id) = original.message_id() {
        props = props.with_message_id(message_id.clone());
    }
    if let Some(timestamp) = original.timestamp() {
        props = props.with_timestamp(*timestamp);
    }
    if let Some(kind) = original.kind() {
        props = props.with_type(kind.clone());
    }
    if let Some(correlation_id) = original.correlation_id() {
        props = props.with_correlation_id(correlation_id.clone());
    }
    if let Some(priority) = original.priority() {
        props = props.with_priority(*priority);
    }

    props
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
