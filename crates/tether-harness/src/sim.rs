//! In-memory simulated network.
//!
//! [`SimNet`] is one shared network segment: a table of listening ports,
//! scripted pre-occupied ports, a host table for address parsing, and a
//! scripted interface list for admission checks. [`SimDriver`] implements
//! the core driver traits on top of it with deterministic socket pairs —
//! no real sockets, no timing dependence, every delivered event
//! observable.
//!
//! Scripting hooks used by tests:
//!
//! - [`SimNet::occupy`]: mark ports as taken so the listener's port scan
//!   has something to skip
//! - [`SimNet::set_interfaces`]: the interface table admission sees
//! - [`SimNet::add_host`]: host labels for `parse_address`
//! - [`SimNet::break_listener`]: make a pending accept fail, for
//!   acceptor-fatality tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_core::driver::{
    AddressFamily, ConnectOptions, DriverSocket, Framing, InterfaceAddr, ListenOptions,
    ProtocolTag, RawSocketStats, ReceiveMode, SocketEvent, SocketOptions, TransportDriver,
};
use tether_core::error::DriverError;

/// One shared network segment.
#[derive(Clone, Default)]
pub struct SimNet {
    inner: Arc<Mutex<NetState>>,
}

struct NetState {
    listeners: HashMap<u16, mpsc::UnboundedSender<SimSocket>>,
    occupied: HashSet<u16>,
    bound: HashSet<u16>,
    hosts: HashMap<String, IpAddr>,
    interfaces: Vec<InterfaceAddr>,
    next_ephemeral: u16,
    next_client_port: u16,
}

impl Default for NetState {
    fn default() -> Self {
        Self {
            listeners: HashMap::new(),
            occupied: HashSet::new(),
            bound: HashSet::new(),
            hosts: HashMap::new(),
            interfaces: Vec::new(),
            next_ephemeral: 49152,
            next_client_port: 30000,
        }
    }
}

impl SimNet {
    /// Create an empty network segment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark ports as already taken by unrelated sockets.
    pub fn occupy(&self, ports: impl IntoIterator<Item = u16>) {
        let mut state = self.lock();
        state.occupied.extend(ports);
    }

    /// Seed a host label for `parse_address`.
    pub fn add_host(&self, host: impl Into<String>, addr: IpAddr) {
        self.lock().hosts.insert(host.into(), addr);
    }

    /// Script the interface table admission checks consult.
    pub fn set_interfaces(&self, interfaces: Vec<InterfaceAddr>) {
        self.lock().interfaces = interfaces;
    }

    /// Tear the listener on `port` out from under its accept loop: the
    /// pending (and every later) accept fails.
    pub fn break_listener(&self, port: u16) {
        self.lock().listeners.remove(&port);
    }

    /// Whether a listener is currently bound on `port`.
    #[must_use]
    pub fn is_listening(&self, port: u16) -> bool {
        self.lock().listeners.contains_key(&port)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.inner.lock().expect("SimNet mutex poisoned")
    }

    fn release(&self, port: u16) {
        let mut state = self.lock();
        state.bound.remove(&port);
        state.listeners.remove(&port);
    }
}

/// A bound simulated listener.
pub struct SimListener {
    net: SimNet,
    addr: SocketAddr,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<SimSocket>>,
}

impl std::fmt::Debug for SimListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimListener").field("addr", &self.addr).finish_non_exhaustive()
    }
}

impl Drop for SimListener {
    fn drop(&mut self) {
        self.net.release(self.addr.port());
    }
}

/// Deterministic in-memory transport driver.
///
/// One instance models one host on the segment, identified by its local
/// address; connections between drivers sharing a [`SimNet`] deliver
/// events through unbounded in-memory channels, in send order.
#[derive(Clone)]
pub struct SimDriver {
    net: SimNet,
    local_ip: IpAddr,
}

impl SimDriver {
    /// A driver for the host at `local_ip` on `net`.
    #[must_use]
    pub fn new(net: SimNet, local_ip: IpAddr) -> Self {
        Self { net, local_ip }
    }

    /// The network this driver is attached to.
    #[must_use]
    pub fn net(&self) -> &SimNet {
        &self.net
    }
}

#[async_trait]
impl TransportDriver for SimDriver {
    type Listener = SimListener;
    type Socket = SimSocket;

    fn family(&self) -> AddressFamily {
        if self.local_ip.is_ipv4() { AddressFamily::V4 } else { AddressFamily::V6 }
    }

    fn protocol(&self) -> ProtocolTag {
        ProtocolTag("tcp")
    }

    async fn listen(
        &self,
        bind: Option<IpAddr>,
        port: u16,
        _opts: &ListenOptions,
    ) -> Result<Self::Listener, DriverError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = {
            let mut state = self.net.lock();
            let port = if port == 0 {
                loop {
                    let candidate = state.next_ephemeral;
                    state.next_ephemeral += 1;
                    if !state.occupied.contains(&candidate) && !state.bound.contains(&candidate) {
                        break candidate;
                    }
                }
            } else {
                port
            };
            if state.occupied.contains(&port) || state.bound.contains(&port) {
                return Err(DriverError::AddrInUse);
            }
            state.bound.insert(port);
            state.listeners.insert(port, tx);
            SocketAddr::new(bind.unwrap_or(self.local_ip), port)
        };
        Ok(SimListener { net: self.net.clone(), addr, inbound: tokio::sync::Mutex::new(rx) })
    }

    fn listener_addr(&self, listener: &Self::Listener) -> Result<SocketAddr, DriverError> {
        Ok(listener.addr)
    }

    async fn accept(&self, listener: &Self::Listener) -> Result<Self::Socket, DriverError> {
        listener
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| DriverError::Io("listener torn down".to_string()))
    }

    async fn connect(
        &self,
        addr: IpAddr,
        port: u16,
        _opts: &ConnectOptions,
    ) -> Result<Self::Socket, DriverError> {
        let mut state = self.net.lock();
        let client_port = state.next_client_port;
        state.next_client_port += 1;

        let local = SocketAddr::new(self.local_ip, client_port);
        let remote = SocketAddr::new(addr, port);
        let (client, server) = SimSocket::pair(local, remote);

        let Some(acceptor) = state.listeners.get(&port) else {
            return Err(DriverError::Refused);
        };
        if acceptor.send(server).is_err() {
            return Err(DriverError::Refused);
        }
        Ok(client)
    }

    async fn parse_address(&self, host: &str) -> Result<IpAddr, DriverError> {
        if let Some(addr) = self.net.lock().hosts.get(host) {
            return Ok(*addr);
        }
        host.parse::<IpAddr>().map_err(|_| DriverError::AddressParse(host.to_string()))
    }

    async fn interfaces(&self) -> Result<Vec<InterfaceAddr>, DriverError> {
        Ok(self.net.lock().interfaces.clone())
    }
}

/// One end of a simulated connection.
#[derive(Debug)]
pub struct SimSocket {
    tx: mpsc::UnboundedSender<SocketEvent>,
    rx: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    local: SocketAddr,
    peer: SocketAddr,
    opts: SocketOptions,
    sink: Option<mpsc::UnboundedSender<SocketEvent>>,
    pump: Option<JoinHandle<()>>,
    received: Arc<AtomicU64>,
    sent: u64,
    eof_seen: bool,
    locally_closed: bool,
}

impl SimSocket {
    fn pair(a_addr: SocketAddr, b_addr: SocketAddr) -> (SimSocket, SimSocket) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = SimSocket::from_parts(a_tx, a_rx, a_addr, b_addr);
        let b = SimSocket::from_parts(b_tx, b_rx, b_addr, a_addr);
        (a, b)
    }

    fn from_parts(
        tx: mpsc::UnboundedSender<SocketEvent>,
        rx: mpsc::UnboundedReceiver<SocketEvent>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        Self {
            tx,
            rx: Some(rx),
            local,
            peer,
            opts: SocketOptions {
                receive: Some(ReceiveMode::Pull),
                framing: Some(Framing::LengthPrefixed),
                ..SocketOptions::default()
            },
            sink: None,
            pump: None,
            received: Arc::new(AtomicU64::new(0)),
            sent: 0,
            eof_seen: false,
            locally_closed: false,
        }
    }

    fn start_pump(&mut self) -> Result<(), DriverError> {
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| DriverError::Io("event sink not installed".to_string()))?;
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| DriverError::Io("push delivery already active".to_string()))?;
        let received = Arc::clone(&self.received);
        self.pump = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Some(SocketEvent::Data(payload)) => {
                        received.fetch_add(1, Ordering::Relaxed);
                        if sink.send(SocketEvent::Data(payload)).is_err() {
                            break;
                        }
                    },
                    Some(SocketEvent::Closed) | None => {
                        let _ = sink.send(SocketEvent::Closed);
                        break;
                    },
                }
            }
        }));
        Ok(())
    }
}

#[async_trait]
impl DriverSocket for SimSocket {
    async fn send(&mut self, data: Bytes) -> Result<(), DriverError> {
        if self.locally_closed {
            return Err(DriverError::Closed);
        }
        self.tx.send(SocketEvent::Data(data)).map_err(|_| DriverError::Closed)?;
        self.sent += 1;
        Ok(())
    }

    async fn send_forced(&mut self, data: Bytes) -> Result<(), DriverError> {
        // Delivery is instant here; a forced write is an ordinary send.
        self.send(data).await
    }

    async fn recv(&mut self) -> Result<SocketEvent, DriverError> {
        if self.eof_seen {
            return Ok(SocketEvent::Closed);
        }
        let rx = self
            .rx
            .as_mut()
            .ok_or_else(|| DriverError::Io("receive-readiness is push".to_string()))?;
        match rx.recv().await {
            Some(SocketEvent::Data(payload)) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                Ok(SocketEvent::Data(payload))
            },
            Some(SocketEvent::Closed) | None => {
                self.eof_seen = true;
                Ok(SocketEvent::Closed)
            },
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.locally_closed {
            self.locally_closed = true;
            let _ = self.tx.send(SocketEvent::Closed);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        Ok(())
    }

    fn apply_options(&mut self, delta: &SocketOptions) -> Result<(), DriverError> {
        if delta.receive == Some(ReceiveMode::Push) && self.pump.is_none() {
            self.start_pump()?;
        }
        if delta.receive == Some(ReceiveMode::Pull) && self.pump.is_some() {
            return Err(DriverError::Io("push delivery cannot be disabled".to_string()));
        }
        self.opts = self.opts.overlaid(delta);
        Ok(())
    }

    fn options(&self) -> SocketOptions {
        self.opts
    }

    fn raw_stats(&self) -> RawSocketStats {
        RawSocketStats {
            received: Some(self.received.load(Ordering::Relaxed)),
            sent: Some(self.sent),
            pending_sends: Some(0),
        }
    }

    fn peer_addr(&self) -> Result<SocketAddr, DriverError> {
        Ok(self.peer)
    }

    fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        Ok(self.local)
    }

    fn take_buffered(&mut self) -> Vec<SocketEvent> {
        let mut drained = Vec::new();
        let Some(rx) = self.rx.as_mut() else {
            return drained;
        };
        loop {
            match rx.try_recv() {
                Ok(event) => drained.push(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if drained.last() != Some(&SocketEvent::Closed) {
                        drained.push(SocketEvent::Closed);
                    }
                    break;
                },
            }
        }
        drained
    }

    fn set_event_sink(&mut self, sink: mpsc::UnboundedSender<SocketEvent>) {
        self.sink = Some(sink);
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
