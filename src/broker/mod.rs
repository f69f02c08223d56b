//! MQTT Broker Core
//!
//! [`Broker`] is the explicitly constructed aggregate that owns the session
//! registry, the topic matcher and the collaborators (session store,
//! authenticator). It is cheap to clone; every connection task holds a
//! handle. Routing lives here too: [`Broker::route`] is the dispatcher that
//! turns one PUBLISH into pushes onto subscriber queues.

mod connection;
mod writer;

pub use connection::{CloseReason, Connection, ConnectionError};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::auth::{AllowAll, Authenticator};
use crate::protocol::{Packet, ProtocolVersion, Publish, QoS};
use crate::session::{
    OutboundQueue, Outbound, OverflowPolicy, PushOutcome, SessionRegistry, SharedSession,
};
use crate::store::{MemoryStore, SessionStore};
use crate::topic::{validate_topic_name_with_max_levels, TopicError, TopicMatcher};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Connections beyond this are closed at accept
    pub max_connections: usize,
    /// Largest accepted packet, measured as the remaining length (the
    /// variable header plus payload, fixed header excluded)
    pub max_packet_size: usize,
    /// Per-session outbound queue bound
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// How long a routed publish may wait under `OverflowPolicy::Block`
    pub block_timeout: Duration,
    /// Messages kept for a disconnected persistent session
    pub max_queued_messages: usize,
    /// Resend unacknowledged QoS 1/2 messages after this long (zero disables)
    pub retry_interval: Duration,
    /// Keep alive multiplier applied before a silent client is dropped
    pub keep_alive_grace: f64,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Maximum granted subscription QoS
    pub max_qos: QoS,
    /// Store retained messages
    pub retain_available: bool,
    /// Assign an id to clean-session clients that send an empty one
    pub allow_empty_client_id: bool,
    /// Accept clients without a username
    pub allow_anonymous: bool,
    /// Replace the client id with the username when one is given
    pub username_as_client_id: bool,
    /// Deepest topic name or filter accepted (0 = built-in ceiling)
    pub max_topic_levels: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 100_000,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            outbound_queue_capacity: 1024,
            overflow_policy: OverflowPolicy::Block,
            block_timeout: Duration::from_millis(500),
            max_queued_messages: 1000,
            retry_interval: Duration::from_secs(30),
            keep_alive_grace: 1.5,
            connect_timeout: Duration::from_secs(10),
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            allow_empty_client_id: true,
            allow_anonymous: true,
            username_as_client_id: false,
            max_topic_levels: 128,
        }
    }
}

/// Broker events
///
/// Fire-and-forget notifications for observers such as a cluster layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// CONNECT accepted
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        session_present: bool,
    },
    /// Connection closed; `graceful` when the client sent DISCONNECT
    ClientDisconnected { client_id: Arc<str>, graceful: bool },
    /// A persistent session was picked up by a new connection
    SessionResumed { client_id: Arc<str> },
    /// A live connection was replaced by a newer one with the same id
    SessionTakenOver { client_id: Arc<str> },
}

/// The MQTT Broker
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    registry: Arc<SessionRegistry>,
    matcher: Arc<TopicMatcher>,
    store: Arc<dyn SessionStore>,
    auth: Arc<dyn Authenticator>,
    events: broadcast::Sender<BrokerEvent>,
    shutdown: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
}

impl Broker {
    /// Create a broker that allows every client and keeps sessions in memory
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_parts(config, Arc::new(AllowAll), Arc::new(MemoryStore::new()))
    }

    pub fn with_parts(
        config: BrokerConfig,
        auth: Arc<dyn Authenticator>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);
        let matcher = TopicMatcher::with_max_levels(config.max_topic_levels);

        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            matcher: Arc::new(matcher),
            store,
            auth,
            events,
            shutdown,
            active_connections: Arc::new(AtomicUsize::new(0)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn matcher(&self) -> &TopicMatcher {
        &self.matcher
    }

    pub(crate) fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub(crate) fn auth(&self) -> &dyn Authenticator {
        self.auth.as_ref()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("MQTT/TCP listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Listener shutting down");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, addr)) => self.handle_connection(stream, addr),
                    Err(e) => error!("Failed to accept TCP connection: {}", e),
                },
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let active = self.active_connections.fetch_add(1, Ordering::AcqRel);
        if active >= self.config.max_connections {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            warn!(
                "Connection limit ({}) reached, rejecting {}",
                self.config.max_connections, addr
            );
            return;
        }
        debug!("New TCP connection from {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let conn = Connection::new(stream, addr, self.clone());
        let active = self.active_connections.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.run().await {
                debug!("Connection error from {}: {}", addr, e);
            }
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn new_queue(&self) -> Arc<OutboundQueue> {
        Arc::new(OutboundQueue::new(
            self.config.outbound_queue_capacity,
            self.config.overflow_policy,
            self.config.block_timeout,
        ))
    }

    pub(crate) fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub(crate) fn emit(&self, event: BrokerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Stop the accept loop and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn retained_count(&self) -> usize {
        self.matcher.retained_count()
    }

    /// Publish a message from the server itself
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<usize, TopicError> {
        validate_topic_name_with_max_levels(topic, self.config.max_topic_levels)?;
        Ok(self.route(&Publish::new(topic, payload, qos, retain)).await)
    }

    /// Route a publish to every matching session.
    ///
    /// Stores or clears the retained message first, then delivers one copy
    /// per subscriber at `min(subscription QoS, publish QoS)`. Returns the
    /// number of sessions that accepted the message.
    pub async fn route(&self, publish: &Publish) -> usize {
        let mut publish = publish.clone();
        if !self.config.retain_available {
            publish.retain = false;
        }

        let targets = self.matcher.publish(&publish);
        if targets.is_empty() {
            return 0;
        }

        // Copies for established subscriptions never carry the retain flag
        publish.retain = false;

        let mut delivered = 0;
        for target in targets {
            let Some(session) = self.registry.find(&target.client_id) else {
                continue;
            };
            if self.deliver(&session, &publish, target.qos).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Hand one message to one session at `qos`
    pub(crate) async fn deliver(&self, session: &SharedSession, publish: &Publish, qos: QoS) -> bool {
        let outbound = session.lock().prepare_outbound(publish, qos);

        match outbound {
            Outbound::Send(queue, publish) => match queue.push(Packet::Publish(publish)).await {
                PushOutcome::Queued => true,
                PushOutcome::DroppedOldest(evicted) => {
                    warn!("Outbound queue full, dropped oldest message");
                    forget_inflight(session, &evicted);
                    true
                }
                PushOutcome::Dropped(packet) => {
                    warn!("Outbound queue full, dropped message");
                    forget_inflight(session, &packet);
                    false
                }
                // The in-flight record stays and is resent on resume
                PushOutcome::Closed(_) => false,
            },
            Outbound::Queued => true,
            Outbound::Discarded => false,
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

fn forget_inflight(session: &SharedSession, packet: &Packet) {
    if let Packet::Publish(Publish {
        packet_id: Some(id),
        ..
    }) = packet
    {
        session.lock().inflight_outgoing.remove(id);
    }
}
