// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides the topology descriptor: the exchanges, queues and bindings
//! the service depends on. A descriptor is validated once when it is built and is
//! immutable afterwards, because the broker only accepts re-declarations with
//! identical parameters. The connection manager installs it on every (re)connect.
//!
//! The main components are:
//! - `TopologyBuilder`: collects definitions and validates them
//! - `Topology`: the validated descriptor and its ordered installation

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::collections::HashSet;
use tracing::{debug, error};

/// Collects definitions before validation.
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<QueueDefinition>,
    queues_binding: Vec<QueueBinding>,
}

impl TopologyBuilder {
    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    ///
    /// Queues with a retry policy bring their `.retry` and `.dlq` queues along.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Validates the definitions and freezes them into a `Topology`.
    ///
    /// # Returns
    /// The descriptor, or `AmqpError::InvalidTopology` when names collide or a
    /// binding references an exchange or queue that is not part of the descriptor
    pub fn build(self) -> Result<Topology, AmqpError> {
        let mut exchange_names = HashSet::new();
        for exch in &self.exchanges {
            if exch.name().is_empty() {
                return Err(AmqpError::InvalidTopology(
                    "the default exchange cannot be declared".to_owned(),
                ));
            }
            if !exchange_names.insert(exch.name()) {
                return Err(AmqpError::InvalidTopology(format!(
                    "duplicate exchange `{}`",
                    exch.name()
                )));
            }
        }

        let mut queue_names = HashSet::new();
        for def in &self.queues {
            let derived = [def.retry_name(), def.dlq_name()];
            let names = std::iter::once(def.name().to_owned()).chain(derived.into_iter().flatten());
            for name in names {
                if name.is_empty() {
                    return Err(AmqpError::InvalidTopology(
                        "queues must be named".to_owned(),
                    ));
                }
                if !queue_names.insert(name.clone()) {
                    return Err(AmqpError::InvalidTopology(format!(
                        "duplicate queue `{name}`"
                    )));
                }
            }
        }

        for binding in &self.queues_binding {
            if !exchange_names.contains(binding.exchange_name()) {
                return Err(AmqpError::InvalidTopology(format!(
                    "binding references unknown exchange `{}`",
                    binding.exchange_name()
                )));
            }
            if !queue_names.contains(binding.queue()) {
                return Err(AmqpError::InvalidTopology(format!(
                    "binding references unknown queue `{}`",
                    binding.queue()
                )));
            }
        }

        Ok(Topology {
            exchanges: self.exchanges,
            queues: self.queues,
            queues_binding: self.queues_binding,
        })
    }
}

/// A validated, immutable topology descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<QueueDefinition>,
    queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    /// The business queues, without their derived retry/dlq queues.
    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|def| def.name() == name)
    }

    /// Installs the topology on the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all exchanges
    /// 2. Declares all queues (retry and dead-letter queues before their business queue)
    /// 3. Binds queues to exchanges
    ///
    /// Re-installing against a broker that already holds the same definitions is a no-op.
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());

            if let Err(err) = channel.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name(),
                    "error to declare the exchange"
                );
                return Err(err);
            }

            debug!("exchange: {} was created", exch.name());
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            let derived = [def.retry_definition(), def.dlq_definition()];
            for queue in derived.iter().flatten().chain(std::iter::once(def)) {
                debug!("creating queue: {}", queue.name());

                if let Err(err) = channel.declare_queue(queue).await {
                    error!(
                        error = err.to_string(),
                        name = queue.name(),
                        "error to declare the queue"
                    );
                    return Err(err);
                }

                debug!("queue: {} was created", queue.name());
            }
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue(),
                binding.exchange_name(),
                binding.key()
            );

            channel.bind_queue(binding).await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}
