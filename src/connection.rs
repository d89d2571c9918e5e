// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the broker connection and the single operating channel shared by the
//! publisher and the dispatcher. On every successful (re)connect it enables
//! publisher confirms, applies the channel-global prefetch and installs the
//! topology.
//!
//! The lifecycle is an explicit state machine driven by `ConnectionState::apply`:
//!
//! ```text
//!                ConnectRequested            Established
//! Disconnected ───────────────────> Connecting ───────────> Connected
//!      ^                                │                      │
//!      │          ConnectFailed         │                      │
//!      ├────────────────────────────────┘                      │
//!      │                Fault / Closed                         │
//!      └───────────────────────────────────────────────────────┘
//! ```
//!
//! Failed attempts back off exponentially (`base * 2^attempt`, capped) until the
//! attempt budget is spent, at which point the broker is considered unavailable
//! and the error is fatal for the process.

use crate::{
    channel::{BrokerChannel, ConnectionFault, Connector, FaultSink},
    config::BrokerConfig,
    errors::AmqpError,
    topology::Topology,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(status)
    }
}

/// Inputs of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// `connect()` starts an attempt
    ConnectRequested,
    /// Channel set up and topology installed
    Established,
    /// The attempt failed or timed out
    ConnectFailed,
    /// Broker-initiated close, heartbeat loss, channel error
    Fault,
    /// Explicit `disconnect()`
    Closed,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Process-local connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts since the last successful connect
    pub reconnect_attempts: u32,
}

impl ConnectionState {
    /// The single reducer of the connection lifecycle.
    ///
    /// # Returns
    /// The next state, or `AmqpError::IllegalTransition` for any pair the
    /// lifecycle does not allow
    pub fn apply(self, event: ConnectionEvent) -> Result<ConnectionState, AmqpError> {
        use ConnectionEvent::*;
        use ConnectionStatus::*;

        match (self.status, event) {
            (Disconnected, ConnectRequested) => Ok(ConnectionState {
                status: Connecting,
                ..self
            }),
            (Connecting, Established) => Ok(ConnectionState {
                status: Connected,
                reconnect_attempts: 0,
            }),
            (Connecting, ConnectFailed) => Ok(ConnectionState {
                status: Disconnected,
                reconnect_attempts: self.reconnect_attempts.saturating_add(1),
            }),
            (Connected, Fault) => Ok(ConnectionState {
                status: Disconnected,
                ..self
            }),
            (Connected | Disconnected, Closed) => Ok(ConnectionState {
                status: Disconnected,
                reconnect_attempts: 0,
            }),
            (status, event) => Err(AmqpError::IllegalTransition {
                status: status.to_string(),
                event: event.to_string(),
            }),
        }
    }
}

/// Bounded exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retrying after the `attempt`-th consecutive failure (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }
}

/// Proof of a live connection returned by `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    pub generation: u64,
}

/// Lifecycle signal observed by subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lifecycle {
    /// Bumped on every successful connect
    pub generation: u64,
    pub shutdown: bool,
}

/// The live channel and the connect generation that produced it.
#[derive(Clone)]
pub struct Session {
    pub generation: u64,
    pub channel: Arc<dyn BrokerChannel>,
}

/// Owner of the broker connection and its operating channel.
///
/// Dependents borrow the channel through `channel()` and never close it.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    topology: Arc<Topology>,
    config: BrokerConfig,
    state: Mutex<ConnectionState>,
    session: RwLock<Option<Session>>,
    next_generation: AtomicU64,
    shutdown: AtomicBool,
    connect_lock: AsyncMutex<()>,
    lifecycle: watch::Sender<Lifecycle>,
    faults_tx: mpsc::UnboundedSender<ConnectionFault>,
    faults_rx: AsyncMutex<mpsc::UnboundedReceiver<ConnectionFault>>,
}

impl ConnectionManager {
    /// Creates a manager in the `disconnected` state.
    ///
    /// # Parameters
    /// * `connector` - Opens connections (lapin in production, a fake in tests)
    /// * `topology` - Installed on every successful connect
    /// * `config` - Broker URI, timeouts, prefetch and reconnect policy
    pub fn new(connector: Arc<dyn Connector>, topology: Topology, config: BrokerConfig) -> Arc<Self> {
        let (lifecycle, _) = watch::channel(Lifecycle::default());
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        Arc::new(ConnectionManager {
            connector,
            topology: Arc::new(topology),
            config,
            state: Mutex::new(ConnectionState::default()),
            session: RwLock::new(None),
            next_generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            connect_lock: AsyncMutex::new(()),
            lifecycle,
            faults_tx,
            faults_rx: AsyncMutex::new(faults_rx),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while connected over an open channel.
    pub fn is_healthy(&self) -> bool {
        self.state().status == ConnectionStatus::Connected
            && self.channel().is_some_and(|channel| channel.is_open())
    }

    /// The operating channel, only while `connected`.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.session().map(|session| session.channel)
    }

    /// The operating channel with its generation, only while `connected`.
    pub fn session(&self) -> Option<Session> {
        if self.state().status != ConnectionStatus::Connected {
            return None;
        }
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Watches generation bumps and shutdown.
    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    fn transition(&self, event: ConnectionEvent) -> Result<ConnectionState, AmqpError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let next = state.apply(event)?;
        debug!(from = %state.status, to = %next.status, event = %event, "connection transition");
        *state = next;
        Ok(next)
    }

    fn replace_session(&self, session: Option<Session>) -> Option<Session> {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, session)
    }

    fn live_generation(&self) -> Option<u64> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.generation)
    }

    /// Connects, retrying with bounded exponential backoff.
    ///
    /// Returns immediately when already connected. Configuration errors (an
    /// invalid descriptor, a conflicting definition on the broker) are returned
    /// without retrying.
    ///
    /// # Returns
    /// `Connected` on success, or a fatal `AmqpError::ReconnectBudgetExhausted`
    /// once `max_attempts` consecutive attempts failed
    pub async fn connect(&self) -> Result<Connected, AmqpError> {
        let _guard = self.connect_lock.lock().await;

        if self.state().status == ConnectionStatus::Connected {
            if let Some(generation) = self.live_generation() {
                return Ok(Connected { generation });
            }
        }

        let policy = self.config.reconnect;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(AmqpError::ConnectionClosed);
            }

            let state = self.transition(ConnectionEvent::ConnectRequested)?;
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                uri = self.config.redacted_uri(),
                attempt = state.reconnect_attempts + 1,
                "connecting to broker"
            );

            let attempt = timeout(self.config.connect_timeout, self.establish(generation)).await;
            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(AmqpError::ConnectTimeout(
                    u64::try_from(self.config.connect_timeout.as_millis()).unwrap_or(u64::MAX),
                )),
            };

            match result {
                Ok(channel) => {
                    self.replace_session(Some(Session {
                        generation,
                        channel,
                    }));
                    self.transition(ConnectionEvent::Established)?;
                    self.lifecycle.send_modify(|lifecycle| lifecycle.generation = generation);
                    info!(generation = generation, "broker connected, topology installed");
                    return Ok(Connected { generation });
                }
                Err(err) => {
                    let state = self.transition(ConnectionEvent::ConnectFailed)?;

                    if err.is_configuration() {
                        error!(error = err.to_string(), "broker rejected the topology");
                        return Err(err);
                    }

                    if policy.exhausted(state.reconnect_attempts) {
                        error!(
                            error = err.to_string(),
                            attempts = state.reconnect_attempts,
                            "broker unavailable, giving up"
                        );
                        return Err(AmqpError::ReconnectBudgetExhausted {
                            attempts: state.reconnect_attempts,
                            last_error: err.to_string(),
                        });
                    }

                    let delay = policy.backoff(state.reconnect_attempts - 1);
                    warn!(
                        error = err.to_string(),
                        attempt = state.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "connection attempt failed, retrying"
                    );

                    let mut lifecycle = self.subscribe();
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = lifecycle.wait_for(|l| l.shutdown) => {
                            return Err(AmqpError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Opens the connection, sets up the channel and installs the topology.
    async fn establish(&self, generation: u64) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let faults = FaultSink::new(generation, self.faults_tx.clone());
        let channel = self
            .connector
            .open(&self.config.uri, &self.config.connection_name, faults)
            .await?;

        let setup = async {
            channel.confirm_select().await?;
            channel.basic_qos(self.config.prefetch).await?;
            self.topology.install(channel.as_ref()).await
        };

        if let Err(err) = setup.await {
            if let Err(close_err) = channel.close().await {
                debug!(error = close_err.to_string(), "failure to close half-open connection");
            }
            return Err(err);
        }

        Ok(channel)
    }

    /// Reacts to asynchronous faults until shutdown.
    ///
    /// Faults raised by replaced connections are ignored. A fault on the live
    /// connection drops it and re-enters `connect`; subscriptions are
    /// re-established by the dispatcher once the new generation is published.
    ///
    /// # Returns
    /// Ok(()) after `disconnect`, or the fatal error that ended reconnection
    pub async fn supervise(&self) -> Result<(), AmqpError> {
        let mut faults = self.faults_rx.lock().await;
        let mut lifecycle = self.subscribe();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            let fault = tokio::select! {
                fault = faults.recv() => fault,
                _ = lifecycle.wait_for(|l| l.shutdown) => return Ok(()),
            };
            let Some(fault) = fault else {
                return Ok(());
            };

            if self.live_generation() != Some(fault.generation)
                || self.state().status != ConnectionStatus::Connected
            {
                debug!(
                    generation = fault.generation,
                    error = fault.error.to_string(),
                    "ignoring stale connection fault"
                );
                continue;
            }

            warn!(error = fault.error.to_string(), "broker connection lost");
            self.transition(ConnectionEvent::Fault)?;
            if let Some(session) = self.replace_session(None) {
                if let Err(err) = session.channel.close().await {
                    debug!(error = err.to_string(), "failure to close faulted connection");
                }
            }

            match self.connect().await {
                Ok(_) => {}
                Err(AmqpError::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Closes the channel and connection and stops reconnecting.
    pub async fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.lifecycle.send_modify(|lifecycle| lifecycle.shutdown = true);

        let _guard = self.connect_lock.lock().await;
        if let Some(session) = self.replace_session(None) {
            if let Err(err) = session.channel.close().await {
                warn!(error = err.to_string(), "failure to close broker connection");
            }
        }

        if let Err(err) = self.transition(ConnectionEvent::Closed) {
            debug!(error = err.to_string(), "disconnect while not connected");
        }
        info!("broker connection closed");
    }
}
