//! Per-connection handshake context.
//!
//! A [`HandshakeContext`] is the transient bundle handed to the external
//! handshake engine for one connection: the live socket, the connection
//! event channel, a deadline timer, local identity, and one method per
//! capability the engine needs (send, receive, close, statistics, option
//! application, peer-address resolution, keep-alive tick). The context is
//! exclusively owned by the per-connection task and consumed by value; the
//! engine either keeps driving the socket afterwards or closes it.
//!
//! # Option sets
//!
//! The builder computes two option sets from configuration:
//!
//! - **pre-up** (applied before any handshake I/O): receive-readiness
//!   disabled, length-prefixed framing, keep-alive/no-delay per config
//! - **post-up** (applied once the link is up): push delivery into the
//!   event channel, same framing, ordered delivery, binary payloads,
//!   no-delay
//!
//! Receive mode, delivery mode, and framing are protocol invariants owned
//! by this layer; [`HandshakeContext::set_options`] refuses to change them
//! out of band.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::directory::{PROTOCOL_VERSION, Resolved};
use crate::driver::{
    AddressFamily, DriverSocket, ProtocolTag, SocketEvent, SocketOptions, SocketStats,
    TransportDriver,
};
use crate::error::{DriverError, OptionError, OptionViolation, ResolveError};
use crate::name::{NamingMode, NodeName};

/// Requested connection type, as seen by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// A brand-new link.
    New,
    /// Re-establishment of a link that existed before.
    Reestablished,
}

/// The deadline timer owned by one connection.
///
/// Started when the connection attempt enters handshake processing and
/// reset exactly once on the outbound path (after resolution, before the
/// actual connect) so that directory latency does not eat into handshake
/// time. Expiry is connection-scoped: it aborts this connection's task
/// and nothing else.
#[derive(Debug, Clone)]
pub struct Deadline {
    timeout: Duration,
    expires_at: tokio::time::Instant,
}

impl Deadline {
    /// Start the timer now.
    #[must_use]
    pub fn start(timeout: Duration) -> Self {
        Self { timeout, expires_at: tokio::time::Instant::now() + timeout }
    }

    /// Restart the full timeout from now.
    pub fn reset(&mut self) {
        self.expires_at = tokio::time::Instant::now() + self.timeout;
    }

    /// Time left before expiry (zero once expired).
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(tokio::time::Instant::now())
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// The full timeout this deadline was started with.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolves when the deadline expires.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.expires_at).await;
    }
}

/// Result of one keep-alive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The forced write went out.
    Sent,
    /// The peer is gone; a synthetic close was delivered to the event
    /// channel (once per connection).
    Closed,
}

/// Fully-resolved peer identity and location.
///
/// Produced by [`HandshakeContext::resolve_peer_address`]: on the inbound
/// path from the live socket's peer endpoint plus the peer name's host
/// label, on the outbound path verbatim from the connector's resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// The peer's node name.
    pub name: NodeName,
    /// Address of the peer.
    pub addr: std::net::IpAddr,
    /// Port of the peer (listen port outbound, source port inbound).
    pub port: u16,
    /// Address family of the link.
    pub family: AddressFamily,
    /// Transport protocol of the link.
    pub protocol: ProtocolTag,
    /// Protocol version the peer speaks.
    pub version: u16,
}

/// Reason the external engine aborted a handshake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct HandshakeAbort {
    /// Human-readable abort reason, for terminal logging.
    pub reason: String,
}

impl HandshakeAbort {
    /// Build an abort with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// The external handshake engine this layer produces contexts for.
///
/// The engine owns the wire protocol, capability negotiation, and the
/// tick interval; this layer owns everything up to the point where a
/// fully-configured context exists.
#[async_trait]
pub trait HandshakeEngine<D: TransportDriver>: Send + Sync + 'static {
    /// Drive the handshake on `ctx` to completion.
    ///
    /// # Errors
    ///
    /// Returns the abort reason when negotiation fails; the context (and
    /// socket) are dropped by then.
    async fn run(&self, ctx: HandshakeContext<D>) -> Result<(), HandshakeAbort>;
}

enum Origin {
    Inbound,
    Outbound { peer: NodeName, resolved: Resolved },
}

/// Per-connection configuration bundle consumed by the handshake engine.
pub struct HandshakeContext<D: TransportDriver> {
    driver: Arc<D>,
    socket: D::Socket,
    /// Events drained from the acceptor during handoff, served before any
    /// direct socket delivery.
    buffered: VecDeque<SocketEvent>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    deadline: Deadline,
    local: NodeName,
    kind: ConnectionKind,
    naming: NamingMode,
    pre_up: SocketOptions,
    post_up: SocketOptions,
    origin: Origin,
    last_stats: SocketStats,
    close_signalled: bool,
}

impl<D: TransportDriver> std::fmt::Debug for HandshakeContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeContext").finish_non_exhaustive()
    }
}

impl<D: TransportDriver> HandshakeContext<D> {
    /// Build the context for an accepted connection.
    pub(crate) fn inbound(
        driver: Arc<D>,
        socket: D::Socket,
        buffered: VecDeque<SocketEvent>,
        config: &LinkConfig,
        local: NodeName,
        deadline: Deadline,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        Self {
            driver,
            socket,
            buffered,
            events,
            event_tx,
            deadline,
            local,
            kind: ConnectionKind::New,
            naming: config.naming,
            pre_up: config.pre_up_options(),
            post_up: config.post_up_options(),
            origin: Origin::Inbound,
            last_stats: SocketStats::default(),
            close_signalled: false,
        }
    }

    /// Build the context for an outbound connection.
    pub(crate) fn outbound(
        driver: Arc<D>,
        socket: D::Socket,
        config: &LinkConfig,
        local: NodeName,
        peer: NodeName,
        resolved: Resolved,
        kind: ConnectionKind,
        deadline: Deadline,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        Self {
            driver,
            socket,
            buffered: VecDeque::new(),
            events,
            event_tx,
            deadline,
            local,
            kind,
            naming: config.naming,
            pre_up: config.pre_up_options(),
            post_up: config.post_up_options(),
            origin: Origin::Outbound { peer, resolved },
            last_stats: SocketStats::default(),
            close_signalled: false,
        }
    }

    /// Local node identity.
    #[must_use]
    pub fn local(&self) -> &NodeName {
        &self.local
    }

    /// Requested connection type.
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// The remote node identity, when already known.
    ///
    /// `Some` on the outbound path; inbound connections learn the peer's
    /// name during the handshake and resolve it through
    /// [`HandshakeContext::resolve_peer_address`].
    #[must_use]
    pub fn peer(&self) -> Option<&NodeName> {
        match &self.origin {
            Origin::Inbound => None,
            Origin::Outbound { peer, .. } => Some(peer),
        }
    }

    /// The connection's deadline timer.
    #[must_use]
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Mutable access to the deadline timer (the engine may reset it per
    /// its own protocol rules).
    pub fn deadline_mut(&mut self) -> &mut Deadline {
        &mut self.deadline
    }

    /// The pre-handshake option set the engine should apply before any
    /// handshake I/O.
    #[must_use]
    pub fn pre_up(&self) -> &SocketOptions {
        &self.pre_up
    }

    /// The post-handshake option set the engine should apply once the
    /// link is up.
    #[must_use]
    pub fn post_up(&self) -> &SocketOptions {
        &self.post_up
    }

    /// Send one framed payload.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub async fn send(&mut self, data: Bytes) -> Result<(), DriverError> {
        self.socket.send(data).await
    }

    /// Receive one inbound event (pull mode).
    ///
    /// Events drained during the controller handoff are served first, in
    /// their original arrival order, before anything read directly from
    /// the socket.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub async fn recv(&mut self) -> Result<SocketEvent, DriverError> {
        if let Some(event) = self.buffered.pop_front() {
            return Ok(event);
        }
        self.socket.recv().await
    }

    /// Next event from the connection event channel (push mode and
    /// synthetic closes). `None` once the channel is drained and closed.
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    /// Close the connection and consume the context.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure; the socket is gone either way.
    pub async fn close(mut self) -> Result<(), DriverError> {
        self.socket.close().await
    }

    /// Apply the pre-up option set.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub async fn apply_pre_up(&mut self) -> Result<(), DriverError> {
        let opts = self.pre_up;
        self.socket.apply_options(&opts)
    }

    /// Apply the post-up option set and switch to push delivery.
    ///
    /// Handoff-buffered events not yet consumed through
    /// [`HandshakeContext::recv`] are flushed into the event channel
    /// first, so the channel observes the same total order the wire
    /// produced.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub async fn apply_post_up(&mut self) -> Result<(), DriverError> {
        for event in self.buffered.drain(..) {
            let _ = self.event_tx.send(event);
        }
        self.socket.set_event_sink(self.event_tx.clone());
        let opts = self.post_up;
        self.socket.apply_options(&opts)
    }

    /// Apply an option delta out of band.
    ///
    /// Receive mode, delivery mode, and framing are protocol invariants
    /// and are rejected here; everything else is delegated to the driver.
    ///
    /// # Errors
    ///
    /// [`OptionError::Violation`] naming every offending option, or the
    /// driver's failure for delegated options.
    pub fn set_options(&mut self, delta: &SocketOptions) -> Result<(), OptionError> {
        let mut offending = Vec::new();
        if delta.receive.is_some() {
            offending.push("receive");
        }
        if delta.delivery.is_some() {
            offending.push("delivery");
        }
        if delta.framing.is_some() {
            offending.push("framing");
        }
        if !offending.is_empty() {
            return Err(OptionViolation { options: offending }.into());
        }
        self.socket.apply_options(delta).map_err(OptionError::from)
    }

    /// Current socket option values.
    #[must_use]
    pub fn options(&self) -> SocketOptions {
        self.socket.options()
    }

    /// Aggregated connection statistics.
    ///
    /// Raw driver counters are folded in a fixed order — received, then
    /// sent, then pending — with any unreported counter keeping its
    /// last-known value (zero before the first report).
    pub fn stats(&mut self) -> SocketStats {
        let raw = self.socket.raw_stats();
        self.last_stats.received = raw.received.unwrap_or(self.last_stats.received);
        self.last_stats.sent = raw.sent.unwrap_or(self.last_stats.sent);
        self.last_stats.pending_sends = raw.pending_sends.unwrap_or(self.last_stats.pending_sends);
        self.last_stats
    }

    /// Resolve the peer's identity and location.
    ///
    /// Inbound, the address and port come from the live socket's actual
    /// peer endpoint and the name supplies the host label; outbound, the
    /// connector's resolution is returned verbatim.
    ///
    /// # Errors
    ///
    /// A naming error when `name` does not parse under the configured
    /// naming mode, or a driver error when the socket can no longer
    /// report its peer.
    pub fn resolve_peer_address(&self, name: &str) -> Result<PeerDescriptor, ResolveError> {
        let name = NodeName::parse(name, self.naming)?;
        match &self.origin {
            Origin::Inbound => {
                let endpoint = self.socket.peer_addr()?;
                Ok(PeerDescriptor {
                    name,
                    addr: endpoint.ip(),
                    port: endpoint.port(),
                    family: self.driver.family(),
                    protocol: self.driver.protocol(),
                    version: PROTOCOL_VERSION,
                })
            },
            Origin::Outbound { resolved, .. } => Ok(PeerDescriptor {
                name,
                addr: resolved.addr,
                port: resolved.port,
                family: self.driver.family(),
                protocol: self.driver.protocol(),
                version: resolved.version,
            }),
        }
    }

    /// One keep-alive tick: a forced zero-length write.
    ///
    /// Never blocks indefinitely. On detecting the peer closed, delivers
    /// exactly one synthetic [`SocketEvent::Closed`] to the event channel
    /// so downstream logic observes closure uniformly regardless of
    /// cause, and keeps answering [`Tick::Closed`] on later ticks.
    ///
    /// # Errors
    ///
    /// Driver failures other than closure are propagated.
    pub async fn tick(&mut self) -> Result<Tick, DriverError> {
        match self.socket.send_forced(Bytes::new()).await {
            Ok(()) => Ok(Tick::Sent),
            Err(DriverError::Closed) => {
                if !self.close_signalled {
                    self.close_signalled = true;
                    let _ = self.event_tx.send(SocketEvent::Closed);
                }
                Ok(Tick::Closed)
            },
            Err(other) => Err(other),
        }
    }
}
