// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchange descriptors of the topology. Producers publish to an exchange and
//! the bindings decide which queues get a copy. A definition must not change
//! between deployments: the broker refuses a re-declaration with other
//! parameters.

use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, fmt};

/// Routing behavior of an exchange.
///
/// `Topic` is what the fulfillment flows use: `payment.*` matches one word,
/// `#` any number of words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// A named exchange and its declaration flags.
///
/// ```
/// use fulfillment_bus::exchange::ExchangeDefinition;
///
/// let orders = ExchangeDefinition::new("orders.exchange").topic().durable();
/// assert_eq!(orders.name(), "orders.exchange");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// A transient `direct` exchange named `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn params(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.params
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Extra `x-*` declaration argument.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Deleted by the broker once its last binding goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Survives a broker restart.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only reachable through exchange-to-exchange bindings.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}
