//! Tokio TCP transport driver for the tether link layer.
//!
//! [`TcpDriver`] implements `tether-core`'s driver traits over real
//! sockets: length-prefixed framing, a reader pump for push delivery,
//! keep-alive via `socket2`, and interface enumeration via `if-addrs`.
//! Address-in-use surfaces as [`DriverError::AddrInUse`] so the
//! listener's port scan behaves the same here as in simulation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod socket;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket};

use tether_core::driver::{
    AddressFamily, ConnectOptions, InterfaceAddr, ListenOptions, ProtocolTag, SocketOptions,
    TransportDriver,
};
use tether_core::error::DriverError;

pub use socket::TcpLinkSocket;

/// Map an I/O failure onto the driver error taxonomy.
pub(crate) fn map_io(err: io::Error) -> DriverError {
    match err.kind() {
        io::ErrorKind::AddrInUse => DriverError::AddrInUse,
        io::ErrorKind::ConnectionRefused => DriverError::Refused,
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            DriverError::Unreachable
        },
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => DriverError::Closed,
        _ => DriverError::Io(err.to_string()),
    }
}

/// A bound TCP listener plus the socket options accepted connections
/// inherit.
#[derive(Debug)]
pub struct TcpLinkListener {
    inner: TcpListener,
    inherited: SocketOptions,
}

/// The production TCP driver.
///
/// One instance serves one address family; the protocol tag is `"tcp"`.
pub struct TcpDriver {
    family: AddressFamily,
}

impl TcpDriver {
    /// IPv4 driver.
    #[must_use]
    pub fn v4() -> Self {
        Self { family: AddressFamily::V4 }
    }

    /// IPv6 driver.
    #[must_use]
    pub fn v6() -> Self {
        Self { family: AddressFamily::V6 }
    }

    fn wildcard(&self) -> IpAddr {
        match self.family {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn matches_family(&self, addr: IpAddr) -> bool {
        match self.family {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }

    fn raw_socket(&self) -> io::Result<TcpSocket> {
        match self.family {
            AddressFamily::V4 => TcpSocket::new_v4(),
            AddressFamily::V6 => TcpSocket::new_v6(),
        }
    }
}

#[async_trait]
impl TransportDriver for TcpDriver {
    type Listener = TcpLinkListener;
    type Socket = TcpLinkSocket;

    fn family(&self) -> AddressFamily {
        self.family
    }

    fn protocol(&self) -> ProtocolTag {
        ProtocolTag("tcp")
    }

    async fn listen(
        &self,
        bind: Option<IpAddr>,
        port: u16,
        opts: &ListenOptions,
    ) -> Result<Self::Listener, DriverError> {
        let addr = SocketAddr::new(bind.unwrap_or_else(|| self.wildcard()), port);
        let socket = self.raw_socket().map_err(map_io)?;
        socket.bind(addr).map_err(map_io)?;
        let backlog = opts.backlog.unwrap_or(tether_core::config::DEFAULT_BACKLOG);
        let inner = socket.listen(backlog).map_err(map_io)?;
        tracing::debug!(addr = %addr, backlog, "tcp listener bound");
        Ok(TcpLinkListener { inner, inherited: opts.socket })
    }

    fn listener_addr(&self, listener: &Self::Listener) -> Result<SocketAddr, DriverError> {
        listener.inner.local_addr().map_err(map_io)
    }

    async fn accept(&self, listener: &Self::Listener) -> Result<Self::Socket, DriverError> {
        let (stream, _peer) = listener.inner.accept().await.map_err(map_io)?;
        TcpLinkSocket::new(stream, &listener.inherited)
    }

    async fn connect(
        &self,
        addr: IpAddr,
        port: u16,
        opts: &ConnectOptions,
    ) -> Result<Self::Socket, DriverError> {
        let target = SocketAddr::new(addr, port);
        let socket = self.raw_socket().map_err(map_io)?;
        if let Some(iface) = opts.bind_interface {
            socket.bind(SocketAddr::new(iface, 0)).map_err(map_io)?;
        }
        let stream = socket.connect(target).await.map_err(map_io)?;
        TcpLinkSocket::new(stream, &opts.socket)
    }

    async fn parse_address(&self, host: &str) -> Result<IpAddr, DriverError> {
        if let Ok(literal) = host.parse::<IpAddr>() {
            if self.matches_family(literal) {
                return Ok(literal);
            }
            return Err(DriverError::AddressParse(host.to_string()));
        }

        let resolved = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| DriverError::AddressParse(host.to_string()))?
            .map(|sa| sa.ip())
            .find(|ip| self.matches_family(*ip));
        resolved.ok_or_else(|| DriverError::AddressParse(host.to_string()))
    }

    async fn interfaces(&self) -> Result<Vec<InterfaceAddr>, DriverError> {
        let interfaces = if_addrs::get_if_addrs().map_err(map_io)?;
        Ok(interfaces
            .into_iter()
            .map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => InterfaceAddr {
                    addr: IpAddr::V4(v4.ip),
                    broadcast: v4.broadcast.map(IpAddr::V4),
                    netmask: IpAddr::V4(v4.netmask),
                },
                if_addrs::IfAddr::V6(v6) => InterfaceAddr {
                    addr: IpAddr::V6(v6.ip),
                    broadcast: v6.broadcast.map(IpAddr::V6),
                    netmask: IpAddr::V6(v6.netmask),
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tether_core::driver::{DriverSocket, ReceiveMode, SocketEvent};
    use tokio::sync::mpsc;

    use super::*;

    fn loopback() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn ephemeral_listen_reports_bound_port() {
        let driver = TcpDriver::v4();
        let listener = driver.listen(loopback(), 0, &ListenOptions::default()).await.unwrap();
        let addr = driver.listener_addr(&listener).unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn double_bind_maps_to_addr_in_use() {
        let driver = TcpDriver::v4();
        let listener = driver.listen(loopback(), 0, &ListenOptions::default()).await.unwrap();
        let port = driver.listener_addr(&listener).unwrap().port();

        let err = driver.listen(loopback(), port, &ListenOptions::default()).await.unwrap_err();
        assert_eq!(err, DriverError::AddrInUse);
    }

    #[tokio::test]
    async fn framed_roundtrip_including_tick() {
        let driver = TcpDriver::v4();
        let listener = driver.listen(loopback(), 0, &ListenOptions::default()).await.unwrap();
        let port = driver.listener_addr(&listener).unwrap().port();

        let client = tokio::spawn(async move {
            let driver = TcpDriver::v4();
            let mut socket = driver
                .connect(IpAddr::V4(Ipv4Addr::LOCALHOST), port, &ConnectOptions::default())
                .await
                .unwrap();
            socket.send(Bytes::from_static(b"hello")).await.unwrap();
            // A forced zero-length write is the keep-alive tick.
            socket.send_forced(Bytes::new()).await.unwrap();
            socket
        });

        let mut accepted = driver.accept(&listener).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), SocketEvent::Data(Bytes::from_static(b"hello")));
        assert_eq!(accepted.recv().await.unwrap(), SocketEvent::Data(Bytes::new()));

        let mut client = client.await.unwrap();
        client.close().await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), SocketEvent::Closed);

        let stats = accepted.raw_stats();
        assert_eq!(stats.received, Some(2));
        assert_eq!(stats.pending_sends, None);
    }

    #[tokio::test]
    async fn push_delivery_pumps_frames_and_close() {
        let driver = TcpDriver::v4();
        let listener = driver.listen(loopback(), 0, &ListenOptions::default()).await.unwrap();
        let port = driver.listener_addr(&listener).unwrap().port();

        let client = tokio::spawn(async move {
            let driver = TcpDriver::v4();
            let mut socket = driver
                .connect(IpAddr::V4(Ipv4Addr::LOCALHOST), port, &ConnectOptions::default())
                .await
                .unwrap();
            socket.send(Bytes::from_static(b"one")).await.unwrap();
            socket.send(Bytes::from_static(b"two")).await.unwrap();
            socket.close().await.unwrap();
        });

        let mut accepted = driver.accept(&listener).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        accepted.set_event_sink(tx);
        accepted
            .apply_options(&SocketOptions {
                receive: Some(ReceiveMode::Push),
                ..SocketOptions::default()
            })
            .unwrap();

        assert_eq!(rx.recv().await, Some(SocketEvent::Data(Bytes::from_static(b"one"))));
        assert_eq!(rx.recv().await, Some(SocketEvent::Data(Bytes::from_static(b"two"))));
        assert_eq!(rx.recv().await, Some(SocketEvent::Closed));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn literal_parse_respects_family() {
        let driver = TcpDriver::v4();
        assert_eq!(
            driver.parse_address("10.0.0.5").await.unwrap(),
            "10.0.0.5".parse::<IpAddr>().unwrap()
        );
        let err = driver.parse_address("::1").await.unwrap_err();
        assert!(matches!(err, DriverError::AddressParse(_)));
    }
}
