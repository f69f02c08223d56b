//! MQTT Connection Handler
//!
//! Each accepted socket runs two tasks joined by the session's bounded
//! [`OutboundQueue`]: the read loop here (decode, state machine, keep alive)
//! and the sender in [`super::writer`]. Handlers never touch the socket;
//! every response is pushed onto the queue. Closing the queue is the single
//! shutdown signal both tasks observe.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;


use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use super::{writer, Broker};
use crate::codec::Decoder;
use crate::protocol::{
    ConnAck, ConnectReturnCode, DecodeError, Packet, ProtocolError, ProtocolVersion,
};
use crate::session::{OutboundQueue, SessionState, SharedSession};

/// How long the sender may keep flushing after the read side is done
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Decode(e))
    }
}

fn violation(msg: &'static str) -> ConnectionError {
    ConnectionError::Protocol(ProtocolError::ProtocolViolation(msg))
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent DISCONNECT
    Graceful,
    /// EOF or socket error
    PeerClosed,
    /// Malformed input or a protocol rule broken
    ProtocolError,
    KeepAliveTimeout,
    /// No CONNECT within the connect timeout
    ConnectTimeout,
    /// Outbound queue closed by someone else (takeover or failed write)
    QueueClosed,
    /// Broker shutdown
    Shutdown,
    /// CONNACK refused the client
    Refused,
}

impl CloseReason {
    /// Whether an owning connection publishes the will for this reason
    fn fires_will(self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed
                | CloseReason::ProtocolError
                | CloseReason::KeepAliveTimeout
                | CloseReason::QueueClosed
        )
    }
}

/// What the read loop does after a packet is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close(CloseReason),
}

/// Protocol state machine for one connection.
///
/// Owns no I/O: packets go in through [`Handler::handle`], responses come
/// out on `queue`.
pub(crate) struct Handler {
    pub(crate) broker: Broker,
    pub(crate) conn_id: u64,
    pub(crate) addr: SocketAddr,
    pub(crate) state: SessionState,
    pub(crate) queue: Arc<OutboundQueue>,
    pub(crate) session: Option<SharedSession>,
    pub(crate) client_id: Arc<str>,
    pub(crate) username: Option<String>,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) keep_alive: u16,
}

impl Handler {
    pub(crate) fn new(broker: Broker, addr: SocketAddr) -> Self {
        let conn_id = broker.next_conn_id();
        let queue = broker.new_queue();
        Self {
            broker,
            conn_id,
            addr,
            state: SessionState::New,
            queue,
            session: None,
            client_id: Arc::from(""),
            username: None,
            protocol_version: ProtocolVersion::default(),
            keep_alive: 0,
        }
    }

    /// Drive the state machine with one decoded packet
    pub(crate) async fn handle(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        trace!("{} <- {:?}", self.addr, packet.packet_type());

        match (self.state, packet) {
            (SessionState::New, Packet::Connect(connect)) => self.handle_connect(*connect).await,
            (SessionState::New, _) => Err(violation("first packet must be CONNECT")),
            (SessionState::Connected, packet) => self.handle_connected(packet).await,
            (_, _) => Err(violation("packet after disconnect")),
        }
    }

    async fn handle_connected(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(violation("duplicate CONNECT")),
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(puback) => self.handle_puback(puback),
            Packet::PubRec(pubrec) => self.handle_pubrec(pubrec).await,
            Packet::PubRel(pubrel) => self.handle_pubrel(pubrel).await,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(pubcomp),
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
            Packet::PingReq => {
                self.send(Packet::PingResp).await;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => Ok(self.handle_disconnect()),
            Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => Err(violation("server-to-client packet from client")),
        }
    }

    /// Respond to a decode failure before the connection is dropped
    pub(crate) async fn handle_decode_error(&mut self, error: &DecodeError) {
        if self.state == SessionState::New && error.is_unacceptable_protocol() {
            self.send(Packet::ConnAck(ConnAck::refused(
                ConnectReturnCode::UnacceptableProtocolVersion,
            )))
            .await;
        }
    }

    /// Queue a frame owed to the client (waits for room)
    pub(crate) async fn send(&self, packet: Packet) {
        if !self.queue.push_wait(packet).await.is_queued() {
            trace!("{} outbound queue closed, frame dropped", self.addr);
        }
    }

    /// Keep alive deadline from now, `None` when disabled
    fn keep_alive_deadline(&self) -> Option<Instant> {
        let config = self.broker.config();
        match self.state {
            SessionState::New => Some(Instant::now() + config.connect_timeout),
            _ if self.keep_alive == 0 => None,
            _ => Some(
                Instant::now()
                    + Duration::from_secs_f64(f64::from(self.keep_alive) * config.keep_alive_grace),
            ),
        }
    }

    /// Resend QoS 1/2 messages the client has not acknowledged in time
    pub(crate) async fn retry_inflight(&mut self, interval: Duration) {
        let Some(session) = &self.session else {
            return;
        };
        let packets = {
            let mut s = session.lock();
            if !s.is_owned_by(self.conn_id) {
                return;
            }
            s.expired_inflight(interval)
        };
        for packet in packets {
            trace!("{} resending {:?}", self.client_id, packet.packet_type());
            self.send(packet).await;
        }
    }
}

/// One client connection: socket plus handler
pub struct Connection<S> {
    stream: S,
    handler: Handler,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, addr: SocketAddr, broker: Broker) -> Self {
        let decoder = Decoder::new().with_max_packet_size(broker.config().max_packet_size);
        Self {
            stream,
            handler: Handler::new(broker, addr),
            decoder,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Run the connection until it closes
    pub async fn run(self) -> Result<(), ConnectionError> {
        let Connection {
            stream,
            mut handler,
            mut decoder,
            mut read_buf,
        } = self;

        let (mut reader, write_half) = tokio::io::split(stream);
        let queue = handler.queue.clone();
        let addr = handler.addr;
        let mut writer_task = tokio::spawn(writer::run(write_half, queue.clone()));

        let mut shutdown_rx = handler.broker.shutdown_signal();
        let retry_interval = handler.broker.config().retry_interval;
        let mut retry_ticker = tokio::time::interval(retry_interval.max(Duration::from_millis(100)));
        retry_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick
        retry_ticker.tick().await;

        let mut deadline = handler.keep_alive_deadline();
        let mut error: Option<ConnectionError> = None;
        let mut stalled = false;

        let reason = loop {
            tokio::select! {
                biased;

                _ = queue.closed() => break CloseReason::QueueClosed,
                _ = shutdown_rx.recv() => break CloseReason::Shutdown,
                result = reader.read_buf(&mut read_buf) => match result {
                    Ok(0) => {
                        debug!("Connection closed from {}", addr);
                        break CloseReason::PeerClosed;
                    }
                    Ok(_) => {
                        // A handler can wait on a full queue while the client
                        // is not reading. Shutdown and keep alive expiry close
                        // the queue, which ends that wait.
                        let expiry = if handler.state == SessionState::New {
                            CloseReason::ConnectTimeout
                        } else {
                            CloseReason::KeepAliveTimeout
                        };
                        let (result, interrupted) = {
                            let processing =
                                process_buffer(&mut handler, &mut decoder, &mut read_buf);
                            tokio::pin!(processing);
                            let mut interrupted = None;
                            let result = loop {
                                tokio::select! {
                                    biased;

                                    result = &mut processing => break result,
                                    _ = shutdown_rx.recv(), if interrupted.is_none() => {
                                        interrupted = Some(CloseReason::Shutdown);
                                        queue.close();
                                    }
                                    _ = sleep_opt(deadline), if interrupted.is_none() => {
                                        interrupted = Some(expiry);
                                        queue.close();
                                    }
                                }
                            };
                            (result, interrupted)
                        };
                        if let Some(reason) = interrupted {
                            debug!("{} interrupted while handling input ({:?})", addr, reason);
                            stalled = queue.len() >= queue.capacity();
                            if reason == CloseReason::KeepAliveTimeout {
                                error = Some(ProtocolError::KeepAliveTimeout.into());
                            }
                            break reason;
                        }
                        match result {
                            Ok(Flow::Continue) => {
                                // The connect timeout is not extended by partial input
                                if handler.state != SessionState::New {
                                    deadline = handler.keep_alive_deadline();
                                }
                            }
                            Ok(Flow::Close(reason)) => break reason,
                            Err(e) => {
                                debug!("Closing {}: {}", addr, e);
                                error = Some(e);
                                break CloseReason::ProtocolError;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Read error from {}: {}", addr, e);
                        error = Some(e.into());
                        break CloseReason::PeerClosed;
                    }
                },
                _ = sleep_opt(deadline) => {
                    if handler.state == SessionState::New {
                        debug!("Connect timeout from {}", addr);
                        break CloseReason::ConnectTimeout;
                    }
                    info!("Keep alive timeout for {} - disconnecting", handler.client_id);
                    error = Some(ProtocolError::KeepAliveTimeout.into());
                    break CloseReason::KeepAliveTimeout;
                }
                _ = retry_ticker.tick(), if !retry_interval.is_zero() => {
                    handler.retry_inflight(retry_interval).await;
                }
            }
        };

        handler.close(reason).await;
        queue.close();

        if stalled {
            // The sender is blocked on a peer that stopped reading
            warn!("Dropping {} with a full outbound queue", addr);
            writer_task.abort();
        } else if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
            .await
            .is_err()
        {
            warn!("Sender for {} did not drain in time", addr);
            writer_task.abort();
        }

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Decode and handle every complete packet in the buffer
async fn process_buffer(
    handler: &mut Handler,
    decoder: &mut Decoder,
    read_buf: &mut BytesMut,
) -> Result<Flow, ConnectionError> {
    loop {
        if handler.queue.is_closed() {
            return Ok(Flow::Close(CloseReason::QueueClosed));
        }
        match decoder.decode(read_buf) {
            Ok(Some(packet)) => {
                if let Flow::Close(reason) = handler.handle(packet).await? {
                    return Ok(Flow::Close(reason));
                }
            }
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                handler.handle_decode_error(&e).await;
                return Err(e.into());
            }
        }
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
