//! Connector integration tests: both resolution shapes, failure phases,
//! and the single deadline reset.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_core::config::LinkConfig;
use tether_core::connector::Connector;
use tether_core::context::ConnectionKind;
use tether_core::directory::{
    Creation, DirectoryClient, DirectoryError, InMemoryDirectory, Resolution,
};
use tether_core::driver::{AddressFamily, ListenOptions, ProtocolTag, TransportDriver};
use tether_core::error::{SetupError, SetupPhase};
use tether_core::name::{NamingMode, NodeName};
use tether_harness::{SimDriver, SimNet};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn connector_over<C: DirectoryClient>(net: &SimNet, directory: Arc<C>) -> Connector<SimDriver, C> {
    Connector::new(
        Arc::new(SimDriver::new(net.clone(), ip("10.0.0.9"))),
        directory,
        Arc::new(LinkConfig::default()),
        NodeName::parse("node2@beta", NamingMode::Short).unwrap(),
    )
}

/// Directory that only ever answers with the address, forcing the
/// follow-up port query.
struct TwoStepDirectory {
    inner: InMemoryDirectory,
}

#[async_trait]
impl DirectoryClient for TwoStepDirectory {
    async fn listen_port_please(
        &self,
        alive: &str,
        host: &str,
    ) -> Result<Option<u16>, DirectoryError> {
        self.inner.listen_port_please(alive, host).await
    }

    async fn register_node(
        &self,
        alive: &str,
        port: u16,
        protocol: ProtocolTag,
    ) -> Result<Creation, DirectoryError> {
        self.inner.register_node(alive, port, protocol).await
    }

    async fn address_please(
        &self,
        alive: &str,
        host: &str,
        family: AddressFamily,
    ) -> Result<Resolution, DirectoryError> {
        match self.inner.address_please(alive, host, family).await? {
            Resolution::Full { addr, .. } | Resolution::AddressOnly { addr } => {
                Ok(Resolution::AddressOnly { addr })
            },
        }
    }

    async fn port_please(&self, alive: &str, addr: IpAddr) -> Result<(u16, u16), DirectoryError> {
        self.inner.port_please(alive, addr).await
    }
}

/// Directory that takes its time answering the address query.
struct SlowDirectory {
    inner: InMemoryDirectory,
    delay: Duration,
}

#[async_trait]
impl DirectoryClient for SlowDirectory {
    async fn listen_port_please(
        &self,
        alive: &str,
        host: &str,
    ) -> Result<Option<u16>, DirectoryError> {
        self.inner.listen_port_please(alive, host).await
    }

    async fn register_node(
        &self,
        alive: &str,
        port: u16,
        protocol: ProtocolTag,
    ) -> Result<Creation, DirectoryError> {
        self.inner.register_node(alive, port, protocol).await
    }

    async fn address_please(
        &self,
        alive: &str,
        host: &str,
        family: AddressFamily,
    ) -> Result<Resolution, DirectoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.address_please(alive, host, family).await
    }

    async fn port_please(&self, alive: &str, addr: IpAddr) -> Result<(u16, u16), DirectoryError> {
        self.inner.port_please(alive, addr).await
    }
}

fn seeded_directory() -> InMemoryDirectory {
    let directory = InMemoryDirectory::new();
    directory.add_host("alpha", ip("10.0.0.5"));
    directory
}

async fn serve(net: &SimNet, port: u16) {
    let server = SimDriver::new(net.clone(), ip("10.0.0.5"));
    let listener = server.listen(None, port, &ListenOptions::default()).await.unwrap();
    // Keep the listener alive for the test's duration.
    tokio::spawn(async move {
        let _accepted = server.accept(&listener).await;
        // hold the socket until the task is dropped with the runtime
        std::future::pending::<()>().await;
    });
}

#[tokio::test]
async fn full_resolution_shape_connects() {
    let net = SimNet::new();
    serve(&net, 9005).await;

    let directory = seeded_directory();
    directory.register_node("node1", 9005, ProtocolTag("tcp")).await.unwrap();

    let connector = connector_over(&net, Arc::new(directory));
    let ctx = connector
        .connect("node1@alpha", ConnectionKind::New, Duration::from_secs(7))
        .await
        .unwrap();

    let peer = ctx.resolve_peer_address("node1@alpha").unwrap();
    assert_eq!((peer.addr, peer.port, peer.version), (ip("10.0.0.5"), 9005, 1));
}

#[tokio::test]
async fn address_only_shape_converges_via_port_query() {
    let net = SimNet::new();
    serve(&net, 9005).await;

    let inner = seeded_directory();
    inner.register_node("node1", 9005, ProtocolTag("tcp")).await.unwrap();
    let directory = TwoStepDirectory { inner };

    let connector = connector_over(&net, Arc::new(directory));
    let ctx = connector
        .connect("node1@alpha", ConnectionKind::New, Duration::from_secs(7))
        .await
        .unwrap();

    let peer = ctx.resolve_peer_address("node1@alpha").unwrap();
    assert_eq!((peer.addr, peer.port), (ip("10.0.0.5"), 9005));
}

#[tokio::test]
async fn malformed_name_fails_in_naming_phase() {
    let net = SimNet::new();
    let connector = connector_over(&net, Arc::new(seeded_directory()));

    let err = connector
        .connect("no-separator", ConnectionKind::New, Duration::from_secs(7))
        .await
        .unwrap_err();
    assert_eq!(err.phase(), SetupPhase::Naming);
}

#[tokio::test]
async fn unknown_peer_fails_in_resolution_phase() {
    let net = SimNet::new();
    let connector = connector_over(&net, Arc::new(seeded_directory()));

    let err = connector
        .connect("ghost@nowhere", ConnectionKind::New, Duration::from_secs(7))
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::Resolution { .. }));
    assert_eq!(err.phase(), SetupPhase::Resolution);
}

#[tokio::test]
async fn vanished_peer_fails_in_connect_phase() {
    let net = SimNet::new();
    // Registered in the directory, but nothing is listening.
    let directory = seeded_directory();
    directory.register_node("node1", 9005, ProtocolTag("tcp")).await.unwrap();

    let connector = connector_over(&net, Arc::new(directory));
    let err = connector
        .connect("node1@alpha", ConnectionKind::New, Duration::from_secs(7))
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::Connect { port: 9005, .. }));
    assert_eq!(err.phase(), SetupPhase::Connect);
}

#[tokio::test(start_paused = true)]
async fn deadline_resets_after_resolution() {
    let net = SimNet::new();
    serve(&net, 9005).await;

    let inner = seeded_directory();
    inner.register_node("node1", 9005, ProtocolTag("tcp")).await.unwrap();
    let directory = SlowDirectory { inner, delay: Duration::from_secs(5) };

    let connector = connector_over(&net, Arc::new(directory));
    let ctx = connector
        .connect("node1@alpha", ConnectionKind::New, Duration::from_secs(7))
        .await
        .unwrap();

    // Five virtual seconds went to resolution, yet the handshake still
    // has its full budget: the timer was reset before the connect.
    assert!(ctx.deadline().remaining() > Duration::from_secs(6));
}
