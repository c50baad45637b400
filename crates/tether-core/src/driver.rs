//! Transport driver abstraction.
//!
//! The [`TransportDriver`] and [`DriverSocket`] traits are the seam between
//! this layer and a concrete transport. Everything above them (listener,
//! acceptor, connector, handshake context) is written against the traits,
//! so swapping plain TCP for a TLS-wrapped or simulated transport touches
//! nothing but the driver crate.
//!
//! # Implementations
//!
//! - **`tether-tcp`** (production): Tokio TCP with length-prefixed framing
//! - **`tether-harness`** (testing): deterministic in-memory socket pairs
//!
//! # Socket ownership
//!
//! Exactly one task may hold receive-readiness for a socket at any time.
//! In this layer ownership transfer is the Rust move of the socket value;
//! [`DriverSocket::take_buffered`] is the primitive that makes the move
//! atomic with respect to inbound events that arrived while the socket sat
//! in the previous owner's custody — the old owner drains and forwards
//! them before handing the value over, preserving arrival order.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::DriverError;

/// Address family a driver operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

/// Identifies the concrete transport a driver speaks (e.g. `"tcp"`).
///
/// Carried in accept notifications and peer descriptors so a controller
/// can refuse connections arriving over a transport it does not serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolTag(pub &'static str);

impl std::fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// One local interface, as reported by the driver.
///
/// Consumed by admission control: the netmask is applied to both the
/// interface address and the peer address to decide same-subnet
/// membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// Address assigned to the interface.
    pub addr: IpAddr,
    /// Broadcast address, when the interface has one.
    pub broadcast: Option<IpAddr>,
    /// Netmask of the interface.
    pub netmask: IpAddr,
}

/// An inbound event delivered by a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// One framed payload. A zero-length payload is a peer keep-alive.
    Data(Bytes),
    /// The peer closed the connection (or closure was detected locally).
    Closed,
}

/// How inbound data reaches the owner of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Receive-readiness disabled: the owner pulls via [`DriverSocket::recv`].
    Pull,
    /// Receive-readiness enabled: the driver pushes events into the sink
    /// installed with [`DriverSocket::set_event_sink`].
    Push,
}

/// Wire framing applied to payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Unframed byte stream.
    Raw,
    /// 4-byte big-endian length prefix per payload. A zero-length frame is
    /// the keep-alive tick.
    LengthPrefixed,
}

/// Ordering contract for pushed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Events are delivered in arrival order.
    Ordered,
}

/// Payload representation handed to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    /// Payloads are opaque binaries.
    Binary,
}

/// A delta of socket options: only `Some` fields are applied.
///
/// The handshake context owns three of these fields as protocol invariants
/// (receive mode, framing, delivery) and refuses to change them out of
/// band; see `HandshakeContext::set_options`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Receive-readiness mode.
    pub receive: Option<ReceiveMode>,
    /// Wire framing.
    pub framing: Option<Framing>,
    /// Delivery ordering.
    pub delivery: Option<DeliveryMode>,
    /// Payload representation.
    pub payload: Option<PayloadMode>,
    /// TCP_NODELAY or the transport's equivalent.
    pub no_delay: Option<bool>,
    /// Transport keep-alive probes.
    pub keep_alive: Option<bool>,
}

impl SocketOptions {
    /// Overlay `delta` on `self`: fields set in `delta` win.
    #[must_use]
    pub fn overlaid(mut self, delta: &SocketOptions) -> SocketOptions {
        self.receive = delta.receive.or(self.receive);
        self.framing = delta.framing.or(self.framing);
        self.delivery = delta.delivery.or(self.delivery);
        self.payload = delta.payload.or(self.payload);
        self.no_delay = delta.no_delay.or(self.no_delay);
        self.keep_alive = delta.keep_alive.or(self.keep_alive);
        self
    }
}

/// Options for opening a listening endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Accept backlog. When `None` at bind time, the listener injects the
    /// configured default.
    pub backlog: Option<u32>,
    /// Interface to bind instead of the wildcard address.
    pub bind_interface: Option<IpAddr>,
    /// Socket options applied to the listening socket.
    pub socket: SocketOptions,
}

/// Options for opening an outbound connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Local interface to bind before connecting.
    pub bind_interface: Option<IpAddr>,
    /// Socket options applied before the connect.
    pub socket: SocketOptions,
}

/// Raw statistics counters as reported by a driver.
///
/// A driver reports `None` for any counter it does not track; the
/// handshake context folds these over last-known values in a fixed order
/// (received, then sent, then pending).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawSocketStats {
    /// Frames received, when tracked.
    pub received: Option<u64>,
    /// Frames sent, when tracked.
    pub sent: Option<u64>,
    /// Writes queued but not yet on the wire, when tracked.
    pub pending_sends: Option<u64>,
}

/// Aggregated statistics for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Frames received.
    pub received: u64,
    /// Frames sent.
    pub sent: u64,
    /// Writes queued but not yet on the wire.
    pub pending_sends: u64,
}

/// A connected socket owned by exactly one task.
///
/// All methods take `&mut self`: the single-owner model makes interior
/// synchronization unnecessary, which is the point of the ownership
/// transfer protocol.
#[async_trait]
pub trait DriverSocket: Send + 'static {
    /// Send one framed payload.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Closed`] when the peer is gone, or another
    /// driver error for transport failures.
    async fn send(&mut self, data: Bytes) -> Result<(), DriverError>;

    /// Forced write that bypasses any send queue and flushes immediately.
    ///
    /// Used by the keep-alive tick with a zero-length payload. Must not
    /// block indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Closed`] when the peer is gone.
    async fn send_forced(&mut self, data: Bytes) -> Result<(), DriverError>;

    /// Pull one inbound event (receive-readiness disabled).
    ///
    /// Returns [`SocketEvent::Closed`] when the peer has closed; calling
    /// again after that keeps returning `Closed`.
    ///
    /// # Errors
    ///
    /// Returns a driver error for transport failures other than orderly
    /// closure.
    async fn recv(&mut self) -> Result<SocketEvent, DriverError>;

    /// Close the socket. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a driver error when the transport reports one during
    /// shutdown; the socket is unusable afterwards either way.
    async fn close(&mut self) -> Result<(), DriverError>;

    /// Apply an option delta to the live socket.
    ///
    /// # Errors
    ///
    /// Returns a driver error when the transport refuses an option.
    fn apply_options(&mut self, delta: &SocketOptions) -> Result<(), DriverError>;

    /// Current option values.
    fn options(&self) -> SocketOptions;

    /// Raw statistics counters; `None` for anything untracked.
    fn raw_stats(&self) -> RawSocketStats;

    /// Address of the remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns a driver error when the socket is no longer connected.
    fn peer_addr(&self) -> Result<SocketAddr, DriverError>;

    /// Address of the local endpoint.
    ///
    /// # Errors
    ///
    /// Returns a driver error when the socket is no longer connected.
    fn local_addr(&self) -> Result<SocketAddr, DriverError>;

    /// Drain events that arrived while the socket sat in the current
    /// owner's custody, in arrival order.
    ///
    /// Called by the acceptor immediately before transferring ownership;
    /// the drained events are forwarded to the new owner ahead of the
    /// socket itself so nothing is lost or reordered across the handoff.
    fn take_buffered(&mut self) -> Vec<SocketEvent>;

    /// Install the sink that push-mode delivery feeds.
    ///
    /// Must be called before receive-readiness is switched to
    /// [`ReceiveMode::Push`]; once push delivery starts, pulling via
    /// [`DriverSocket::recv`] is no longer available.
    fn set_event_sink(&mut self, sink: mpsc::UnboundedSender<SocketEvent>);
}

/// A concrete transport.
///
/// One driver instance serves one address family and one protocol; the
/// layer above never mixes drivers on a single link stack.
#[async_trait]
pub trait TransportDriver: Send + Sync + 'static {
    /// Listening endpoint type.
    type Listener: Send + Sync + 'static;
    /// Connected socket type.
    type Socket: DriverSocket;

    /// Address family this driver serves.
    fn family(&self) -> AddressFamily;

    /// Protocol tag this driver speaks.
    fn protocol(&self) -> ProtocolTag;

    /// Bind a listening socket on `port` (0 = transport-chosen ephemeral).
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AddrInUse`] when the port is taken — the
    /// listener's port scan advances on exactly that value — or another
    /// driver error for other bind failures.
    async fn listen(
        &self,
        bind: Option<IpAddr>,
        port: u16,
        opts: &ListenOptions,
    ) -> Result<Self::Listener, DriverError>;

    /// Address the listener is actually bound to.
    ///
    /// # Errors
    ///
    /// Returns a driver error when the listener is no longer usable.
    fn listener_addr(&self, listener: &Self::Listener) -> Result<SocketAddr, DriverError>;

    /// Accept one inbound connection.
    ///
    /// Blocks until a connection arrives. A failure here is fatal for the
    /// accept loop (propagated, never swallowed).
    ///
    /// # Errors
    ///
    /// Returns a driver error when the accept fails.
    async fn accept(&self, listener: &Self::Listener) -> Result<Self::Socket, DriverError>;

    /// Open an outbound connection to `addr:port`.
    ///
    /// # Errors
    ///
    /// Returns a driver error when the peer is unreachable, refuses, or
    /// the transport fails.
    async fn connect(
        &self,
        addr: IpAddr,
        port: u16,
        opts: &ConnectOptions,
    ) -> Result<Self::Socket, DriverError>;

    /// Resolve a host string to an address in this driver's family.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AddressParse`] when the host cannot be
    /// resolved.
    async fn parse_address(&self, host: &str) -> Result<IpAddr, DriverError>;

    /// Apply `netmask` to `addr`.
    ///
    /// Returns `None` when the families differ; admission control skips
    /// such interfaces.
    fn mask(&self, netmask: IpAddr, addr: IpAddr) -> Option<IpAddr> {
        match (netmask, addr) {
            (IpAddr::V4(mask), IpAddr::V4(a)) => {
                let masked = u32::from(mask) & u32::from(a);
                Some(IpAddr::V4(masked.into()))
            },
            (IpAddr::V6(mask), IpAddr::V6(a)) => {
                let masked = u128::from(mask) & u128::from(a);
                Some(IpAddr::V6(masked.into()))
            },
            _ => None,
        }
    }

    /// Local interfaces, for same-subnet admission.
    ///
    /// # Errors
    ///
    /// Returns a driver error when enumeration fails.
    async fn interfaces(&self) -> Result<Vec<InterfaceAddr>, DriverError>;
}
