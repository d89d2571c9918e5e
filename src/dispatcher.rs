// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Binds handlers to queues of the installed topology. Every subscription runs
//! in its own task with manual acknowledgements, processing up to `prefetch`
//! deliveries concurrently. When the connection is replaced the subscription
//! re-attaches to the new channel; it stops on `disconnect`.

use crate::{
    connection::{ConnectionManager, Lifecycle},
    consumer::{consume, DeliveryOutcome, RetryRoute},
    errors::AmqpError,
    handler::MessageHandler,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Subscribes handlers to business queues.
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
}

/// A running subscription.
pub struct Subscription {
    queue: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits until the subscription stopped after `disconnect`.
    pub async fn stopped(self) {
        if let Err(err) = self.handle.await {
            error!(queue = self.queue.as_str(), error = err.to_string(), "subscription task failed");
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Dispatcher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Dispatcher { manager }
    }

    /// Starts consuming `queue` with `handler`.
    ///
    /// The queue must be part of the topology and carry a retry policy. The
    /// subscription starts as soon as the manager is connected, which may be
    /// later than this call.
    ///
    /// # Returns
    /// The running subscription, `AmqpError::UnknownQueue` or
    /// `AmqpError::RetryNotConfigured`
    pub fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, AmqpError> {
        let def = self
            .manager
            .topology()
            .queue(queue)
            .ok_or_else(|| AmqpError::UnknownQueue(queue.to_owned()))?;
        let route = RetryRoute::try_from(def)?;

        let handle = tokio::spawn(run_subscription(self.manager.clone(), route, handler));

        Ok(Subscription {
            queue: queue.to_owned(),
            handle,
        })
    }
}

async fn run_subscription(
    manager: Arc<ConnectionManager>,
    route: RetryRoute,
    handler: Arc<dyn MessageHandler>,
) {
    let tracer = global::tracer("amqp consumer");
    let limit = usize::from(manager.config().prefetch.max(1));
    let mut lifecycle = manager.subscribe();
    let mut attached = 0u64;

    loop {
        if lifecycle.borrow().shutdown {
            break;
        }

        if let Some(session) = manager.session().filter(|s| s.generation != attached) {
            attached = session.generation;
            let tag = format!("{}.{}", route.queue, Uuid::new_v4());

            match session.channel.consume(&route.queue, &tag).await {
                Ok(stream) => {
                    info!(queue = route.queue.as_str(), generation = attached, "consuming");

                    let channel = session.channel.as_ref();
                    let (tracer, route, handler) = (&tracer, &route, handler.as_ref());
                    let processing = stream.for_each_concurrent(limit, move |result| async move {
                        match result {
                            Ok(delivery) => {
                                match consume(tracer, &delivery, route, handler, channel).await {
                                    Ok(DeliveryOutcome::Acked) => {}
                                    Ok(outcome) => debug!(queue = route.queue.as_str(), ?outcome, "delivery settled"),
                                    Err(err) => error!(error = err.to_string(), "error consume msg"),
                                }
                            }
                            Err(err) => error!(error = err.to_string(), "errors consume msg"),
                        }
                    });

                    tokio::select! {
                        _ = processing => {
                            warn!(queue = route.queue.as_str(), "subscription interrupted");
                        }
                        stop = superseded(&mut lifecycle, attached) => {
                            if stop {
                                break;
                            }
                            warn!(
                                queue = route.queue.as_str(),
                                generation = attached,
                                "connection replaced, dropping stale consumer"
                            );
                        }
                    }
                }
                Err(err) => {
                    error!(queue = route.queue.as_str(), error = err.to_string(), "failure to subscribe");
                }
            }
        }

        let waited = lifecycle
            .wait_for(|l| l.shutdown || l.generation != attached)
            .await
            .is_err();
        if waited {
            break;
        }
    }

    info!(queue = route.queue.as_str(), "subscription stopped");
}

/// Resolves on shutdown or once a generation other than `attached` is live.
///
/// Returns true when the subscription must stop.
async fn superseded(lifecycle: &mut watch::Receiver<Lifecycle>, attached: u64) -> bool {
    match lifecycle.wait_for(|l| l.shutdown || l.generation != attached).await {
        Ok(current) => current.shutdown,
        Err(_) => true,
    }
}
