// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The wire format shared by producers and consumers: a JSON body
//! `{event, payload, at}` plus a typed view over the broker headers the retry
//! engine relies on (`x-retry-count`, `x-original-queue`, `x-error`,
//! `x-death-reason`, `x-death-time`).
//!
//! Header merge semantics: reserved `x-*` fields are only ever written through
//! `DeliveryHeaders`; caller supplied headers are added when new and never
//! replace a reserved or already present key.

use crate::errors::AmqpError;
use chrono::{DateTime, SecondsFormat, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Number of times the message went through the retry queue
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Business queue whose handler failed the message
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";
/// Message of the last handler failure
pub const HEADER_ERROR: &str = "x-error";
/// Why the message was dead-lettered
pub const HEADER_DEATH_REASON: &str = "x-death-reason";
/// When the message was dead-lettered, RFC 3339
pub const HEADER_DEATH_TIME: &str = "x-death-time";

pub const DEATH_REASON_MAX_RETRIES: &str = "max-retries-exceeded";

const RESERVED_HEADERS: [&str; 5] = [
    HEADER_RETRY_COUNT,
    HEADER_ORIGINAL_QUEUE,
    HEADER_ERROR,
    HEADER_DEATH_REASON,
    HEADER_DEATH_TIME,
];

/// A domain event as handed over by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    pub payload: Value,
}

impl Event {
    pub fn new(event: &str, payload: Value) -> Self {
        Self {
            event: event.to_owned(),
            payload,
        }
    }
}

/// The JSON body of every message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub payload: Value,
    /// Epoch milliseconds at publish time
    pub at: i64,
}

impl Envelope {
    pub fn wrap(event: &Event, at: DateTime<Utc>) -> Self {
        Self {
            event: event.event.clone(),
            payload: event.payload.clone(),
            at: at.timestamp_millis(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::InternalError(err.to_string()))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Header values callers may attach to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    LongString(String),
    Bool(bool),
    Int(i32),
    LongInt(i64),
    Uint(u32),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::Int(v) => AMQPValue::LongInt(v),
            HeaderValue::LongInt(v) => AMQPValue::LongLongInt(v),
            HeaderValue::Uint(v) => AMQPValue::LongUInt(v),
        }
    }
}

/// Typed view over the headers of a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryHeaders {
    pub retry_count: u32,
    pub original_queue: Option<String>,
    pub error: Option<String>,
    pub death_reason: Option<String>,
    pub death_time: Option<String>,
    extra: BTreeMap<ShortString, AMQPValue>,
}

impl DeliveryHeaders {
    pub fn is_reserved(key: &str) -> bool {
        RESERVED_HEADERS.contains(&key)
    }

    /// Reads the headers of a delivery; a missing or unreadable count is 0.
    pub fn from_properties(props: &BasicProperties) -> Self {
        let Some(table) = props.headers() else {
            return DeliveryHeaders::default();
        };

        let mut headers = DeliveryHeaders::default();
        for (key, value) in table.inner() {
            match key.as_str() {
                HEADER_RETRY_COUNT => headers.retry_count = read_count(value),
                HEADER_ORIGINAL_QUEUE => headers.original_queue = read_string(value),
                HEADER_ERROR => headers.error = read_string(value),
                HEADER_DEATH_REASON => headers.death_reason = read_string(value),
                HEADER_DEATH_TIME => headers.death_time = read_string(value),
                _ => {
                    headers.extra.insert(key.clone(), value.clone());
                }
            }
        }
        headers
    }

    pub fn extra(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.extra
    }

    /// Adds caller headers that are neither reserved nor already present.
    ///
    /// # Returns
    /// The keys that were refused
    pub fn merge<I>(&mut self, headers: I) -> Vec<String>
    where
        I: IntoIterator<Item = (ShortString, AMQPValue)>,
    {
        let mut refused = vec![];
        for (key, value) in headers {
            if Self::is_reserved(key.as_str()) || self.extra.contains_key(&key) {
                refused.push(key.to_string());
                continue;
            }
            self.extra.insert(key, value);
        }
        refused
    }

    /// Headers of the copy sent to the retry queue after a handler failure.
    ///
    /// The count only ever moves forward from what the delivery carried.
    pub fn escalate(&self, queue: &str, error: &str) -> Self {
        DeliveryHeaders {
            retry_count: self.retry_count.saturating_add(1),
            original_queue: Some(queue.to_owned()),
            error: Some(error.to_owned()),
            death_reason: None,
            death_time: None,
            extra: self.extra.clone(),
        }
    }

    /// Marks escalated headers as terminally dead-lettered.
    pub fn dead_letter(mut self, reason: &str, at: DateTime<Utc>) -> Self {
        self.death_reason = Some(reason.to_owned());
        self.death_time = Some(at.to_rfc3339_opts(SecondsFormat::Millis, true));
        self
    }

    pub fn into_field_table(self) -> FieldTable {
        let mut table = self.extra;

        table.insert(
            ShortString::from(HEADER_RETRY_COUNT),
            AMQPValue::LongLongInt(i64::from(self.retry_count)),
        );

        let optional = [
            (HEADER_ORIGINAL_QUEUE, self.original_queue),
            (HEADER_ERROR, self.error),
            (HEADER_DEATH_REASON, self.death_reason),
            (HEADER_DEATH_TIME, self.death_time),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                table.insert(
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value)),
                );
            }
        }

        FieldTable::from(table)
    }
}

fn read_count(value: &AMQPValue) -> u32 {
    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes())
            .trim()
            .parse()
            .unwrap_or_default(),
        _ => 0,
    };
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

fn read_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}
