// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker with the routing, acknowledgement, expiration and
//! dead-lettering behavior the bus relies on.

#![allow(dead_code)]

use async_trait::async_trait;
use fulfillment_bus::{
    channel::{BrokerChannel, Connector, DeliveryStream, FaultSink, InboundDelivery, PublishConfirm},
    config::BrokerConfig,
    connection::{ConnectionManager, ReconnectPolicy},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::{ConsumedMessage, HandlerError, MessageHandler},
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
};
use futures_util::{stream, StreamExt};
use lapin::{types::ShortString, BasicProperties};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub seq: u64,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct QueueArgs {
    durable: bool,
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
}

struct Consumer {
    channel_id: u64,
    tx: mpsc::UnboundedSender<InboundDelivery>,
}

struct QueueState {
    args: QueueArgs,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    acked: Vec<(String, StoredMessage)>,
    channels: HashMap<u64, FaultSink>,
    next_tag: u64,
    next_seq: u64,
}

/// Shared broker state; clones observe the same broker.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
    next_channel: Arc<AtomicU64>,
    refuse_connections: Arc<AtomicU32>,
    opened: Arc<AtomicU32>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    /// The next `n` connection attempts fail.
    pub fn refuse_next_connections(&self, n: u32) {
        self.refuse_connections.store(n, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Drops every open channel as a broker restart would, reporting a fault on each.
    pub fn restart(&self) {
        let sinks: Vec<(u64, FaultSink)> = {
            let state = self.state.lock().unwrap();
            state.channels.iter().map(|(id, sink)| (*id, sink.clone())).collect()
        };
        for (id, sink) in sinks {
            self.close_channel(id);
            sink.report(AmqpError::ConnectionError("connection reset by broker".to_owned()));
        }
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().unwrap().exchanges.contains_key(exchange)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Messages waiting in `queue`.
    pub fn ready(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages acknowledged by consumers of `queue`.
    pub fn acked(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .unwrap()
            .acked
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    fn open_channel(&self, faults: FaultSink) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let refused = self
            .refuse_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().unwrap().channels.insert(id, faults);

        Ok(Arc::new(FakeChannel {
            broker: self.clone(),
            id,
            open: AtomicBool::new(true),
        }))
    }

    fn close_channel(&self, channel_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.channels.remove(&channel_id);

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                enqueue(self, &mut state, &unacked.queue, message);
            }
        }
    }
}

/// Routes a message from `exchange`; unroutable messages are dropped.
fn route(broker: &FakeBroker, state: &mut State, exchange: &str, key: &str, message: StoredMessage) {
    if exchange.is_empty() {
        enqueue(broker, state, key, message);
        return;
    }

    let Some(kind) = state.exchanges.get(exchange).copied() else {
        return;
    };
    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|(ex, _, pattern)| {
            ex == exchange
                && match kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(pattern, key),
                    _ => pattern == key,
                }
        })
        .map(|(_, queue, _)| queue.clone())
        .collect();

    for queue in targets {
        enqueue(broker, state, &queue, message.clone());
    }
}

fn enqueue(broker: &FakeBroker, state: &mut State, queue: &str, message: StoredMessage) {
    let Some(target) = state.queues.get_mut(queue) else {
        return;
    };

    if target.consumers.is_empty() {
        let expiration = message
            .properties
            .expiration()
            .as_ref()
            .and_then(|e| e.as_str().parse::<u64>().ok());
        let seq = message.seq;
        target.ready.push_back(message);

        if let Some(ms) = expiration {
            let broker = broker.clone();
            let queue = queue.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                broker.expire(&queue, seq);
            });
        }
        return;
    }

    deliver(state, queue, message);
}

fn deliver(state: &mut State, queue: &str, message: StoredMessage) {
    state.next_tag += 1;
    let tag = state.next_tag;

    let Some(target) = state.queues.get_mut(queue) else {
        return;
    };
    let index = target.next_consumer % target.consumers.len();
    target.next_consumer = target.next_consumer.wrapping_add(1);
    let consumer = &target.consumers[index];

    let delivery = InboundDelivery {
        delivery_tag: tag,
        exchange: String::new(),
        routing_key: message.routing_key.clone(),
        redelivered: message.redelivered,
        properties: message.properties.clone(),
        data: message.data.clone(),
    };
    let channel_id = consumer.channel_id;
    if consumer.tx.send(delivery).is_ok() {
        state.unacked.insert(
            tag,
            Unacked {
                channel_id,
                queue: queue.to_owned(),
                message,
            },
        );
    } else {
        target.ready.push_back(message);
    }
}

impl FakeBroker {
    fn expire(&self, queue: &str, seq: u64) {
        let mut state = self.state.lock().unwrap();
        let Some(source) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(position) = source.ready.iter().position(|m| m.seq == seq) else {
            return;
        };
        let Some(message) = source.ready.remove(position) else {
            return;
        };
        let args = source.args.clone();
        dead_letter(self, &mut state, &args, message);
    }
}

fn dead_letter(broker: &FakeBroker, state: &mut State, args: &QueueArgs, mut message: StoredMessage) {
    let Some(exchange) = args.dead_letter_exchange.clone() else {
        return;
    };
    let key = args
        .dead_letter_routing_key
        .clone()
        .unwrap_or_else(|| message.routing_key.clone());

    message.properties = without_expiration(&message.properties);
    message.routing_key = key.clone();
    route(broker, state, &exchange, &key, message);
}

fn without_expiration(props: &BasicProperties) -> BasicProperties {
    let mut copy = BasicProperties::default();
    if let Some(v) = props.content_type() {
        copy = copy.with_content_type(v.clone());
    }
    if let Some(v) = props.delivery_mode() {
        copy = copy.with_delivery_mode(*v);
    }
    if let Some(v) = props.headers() {
        copy = copy.with_headers(v.clone());
    }
    if let Some(v) = props.message_id() {
        copy = copy.with_message_id(v.clone());
    }
    if let Some(v) = props.timestamp() {
        copy = copy.with_timestamp(*v);
    }
    if let Some(v) = props.kind() {
        copy = copy.with_type(v.clone());
    }
    copy
}

/// AMQP topic matching: `*` is one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

struct FakeConnector {
    broker: FakeBroker,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        _uri: &str,
        _connection_name: &str,
        faults: FaultSink,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.broker.open_channel(faults)
    }
}

struct FakeChannel {
    broker: FakeBroker,
    id: u64,
    open: AtomicBool,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) && self.broker.state.lock().unwrap().channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn basic_qos(&self, _prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        match state.exchanges.get(def.name()) {
            Some(kind) if *kind != def.exchange_kind() => {
                Err(AmqpError::TopologyConflict(def.name().to_owned()))
            }
            _ => {
                state.exchanges.insert(def.name().to_owned(), def.exchange_kind());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let args = QueueArgs {
            durable: def.is_durable(),
            dead_letter_exchange: def.dead_letter_exchange().map(str::to_owned),
            dead_letter_routing_key: def.dead_letter_routing_key().map(str::to_owned),
        };

        let mut state = self.broker.state.lock().unwrap();
        match state.queues.get(def.name()) {
            Some(existing) if existing.args != args => {
                Err(AmqpError::TopologyConflict(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    QueueState {
                        args,
                        ready: VecDeque::new(),
                        consumers: vec![],
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let entry = (
            binding.exchange_name().to_owned(),
            binding.queue().to_owned(),
            binding.key().to_owned(),
        );
        let mut state = self.broker.state.lock().unwrap();
        if !state.bindings.contains(&entry) {
            state.bindings.push(entry);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm, AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        state.next_seq += 1;
        let message = StoredMessage {
            seq: state.next_seq,
            routing_key: routing_key.to_owned(),
            properties,
            data: payload.to_vec(),
            redelivered: false,
        };
        route(&self.broker, &mut state, exchange, routing_key, message);
        Ok(PublishConfirm::Ack)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.broker.state.lock().unwrap();
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        target.consumers.push(Consumer {
            channel_id: self.id,
            tx,
        });
        let backlog: Vec<StoredMessage> = target.ready.drain(..).collect();
        for message in backlog {
            deliver(&mut state, queue, message);
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok::<_, AmqpError>(delivery), rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::AckMessageError)?;
        let mut state = self.broker.state.lock().unwrap();
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::AckMessageError)?;
        state.acked.push((unacked.queue, unacked.message));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::NackMessageError)?;
        let mut state = self.broker.state.lock().unwrap();
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::NackMessageError)?;

        let mut message = unacked.message;
        if requeue {
            message.redelivered = true;
            enqueue(&self.broker, &mut state, &unacked.queue, message);
        } else if let Some(args) = state.queues.get(&unacked.queue).map(|q| q.args.clone()) {
            dead_letter(&self.broker, &mut state, &args, message);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.ensure_open().is_ok()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_channel(self.id);
        }
        Ok(())
    }
}

/// Broker settings fit for tests: short backoff, small prefetch.
pub fn test_config(max_retries: u32, retry_delay: Duration) -> BrokerConfig {
    BrokerConfig {
        connect_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        prefetch: 4,
        max_retries,
        retry_delay,
        ..BrokerConfig::default()
    }
}

pub fn manager(broker: &FakeBroker, topology: Topology, config: BrokerConfig) -> Arc<ConnectionManager> {
    ConnectionManager::new(broker.connector(), topology, config)
}

/// Polls `condition` until it holds or a generous deadline passes.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Default)]
pub struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
    seen: Mutex<Vec<ConsumedMessage>>,
}

impl FlakyHandler {
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(FlakyHandler {
            failures,
            ..Default::default()
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<ConsumedMessage> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn exec(&self, _ctx: &opentelemetry::Context, msg: &ConsumedMessage) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(msg.clone());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::new(format!("attempt {} failed", call + 1)))
        } else {
            Ok(())
        }
    }
}

/// Holds every message for `delay`, tracking how many run at once.
pub struct SlowHandler {
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicU32,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(SlowHandler {
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicU32::new(0),
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn exec(&self, _ctx: &opentelemetry::Context, _msg: &ConsumedMessage) -> Result<(), HandlerError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn header_str(props: &BasicProperties, key: &str) -> Option<String> {
    match props.headers().as_ref()?.inner().get(key)? {
        lapin::types::AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        lapin::types::AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

pub fn header_count(props: &BasicProperties, key: &str) -> Option<i64> {
    match props.headers().as_ref()?.inner().get(key)? {
        lapin::types::AMQPValue::LongLongInt(v) => Some(*v),
        lapin::types::AMQPValue::LongInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}

pub fn short(value: &str) -> ShortString {
    ShortString::from(value)
}
