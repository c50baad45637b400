//! Same-subnet admission integration tests.
//!
//! The full inbound path runs — listener, acceptor, controller, handler
//! task — with a scripted interface table; only the admission verdict
//! differs between the two cases.

use std::sync::Arc;

use tether_core::acceptor::{Acceptor, Controller};
use tether_core::config::{LinkConfig, PortRange};
use tether_core::directory::InMemoryDirectory;
use tether_core::driver::{
    ConnectOptions, DriverSocket, InterfaceAddr, ListenOptions, SocketEvent, TransportDriver,
};
use tether_core::listener::listen;
use tether_core::name::{NamingMode, NodeName};
use tether_harness::{RecordingEngine, SimDriver, SimNet};
use tokio::sync::mpsc;

fn ip(s: &str) -> std::net::IpAddr {
    s.parse().unwrap()
}

/// Server at 10.0.0.5/24 with admission enforced; returns the client
/// driver for `client_ip` and the stream of handshake reports.
async fn admission_stack(
    client_ip: &str,
) -> (SimDriver, u16, mpsc::UnboundedReceiver<tether_harness::HandshakeReport>) {
    let net = SimNet::new();
    net.set_interfaces(vec![InterfaceAddr {
        addr: ip("10.0.0.5"),
        broadcast: Some(ip("10.0.0.255")),
        netmask: ip("255.255.255.0"),
    }]);

    let server_driver = Arc::new(SimDriver::new(net.clone(), ip("10.0.0.5")));
    let directory = InMemoryDirectory::new();
    let config = Arc::new(LinkConfig {
        port_range: PortRange { low: 9000, high: 9010 },
        check_subnet: true,
        ..LinkConfig::default()
    });
    let local = NodeName::parse("node1@alpha", NamingMode::Short).unwrap();

    let (endpoint, _creation) =
        listen(&local, server_driver.as_ref(), &directory, &config, &ListenOptions::default())
            .await
            .unwrap();
    let port = endpoint.port();

    let (engine, reports) = RecordingEngine::new();
    let (controller, controller_tx) =
        Controller::new(Arc::clone(&server_driver), Arc::new(engine), config, local);
    tokio::spawn(controller.run());

    let acceptor = Acceptor::new(Arc::clone(&server_driver), Arc::new(endpoint), controller_tx);
    tokio::spawn(acceptor.run());

    (SimDriver::new(net, ip(client_ip)), port, reports)
}

#[tokio::test]
async fn same_subnet_peer_reaches_the_engine() {
    let (client_driver, port, mut reports) = admission_stack("10.0.0.9").await;

    let _outbound =
        client_driver.connect(ip("10.0.0.5"), port, &ConnectOptions::default()).await.unwrap();

    let report = reports.recv().await.unwrap();
    assert_eq!(report.local, "node1@alpha");
}

#[tokio::test]
async fn cross_subnet_peer_is_refused_before_the_engine() {
    let (client_driver, port, mut reports) = admission_stack("10.1.0.9").await;

    let mut outbound =
        client_driver.connect(ip("10.0.0.5"), port, &ConnectOptions::default()).await.unwrap();

    // The handler drops the socket without handshaking; only this
    // connection is affected.
    assert_eq!(outbound.recv().await.unwrap(), SocketEvent::Closed);
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn refusal_leaves_the_listener_serving_others() {
    let (refused_driver, port, mut reports) = admission_stack("10.1.0.9").await;

    let mut refused =
        refused_driver.connect(ip("10.0.0.5"), port, &ConnectOptions::default()).await.unwrap();
    assert_eq!(refused.recv().await.unwrap(), SocketEvent::Closed);

    // A same-subnet peer on the same listener still gets through.
    let admitted_driver = SimDriver::new(refused_driver.net().clone(), ip("10.0.0.77"));
    let _outbound =
        admitted_driver.connect(ip("10.0.0.5"), port, &ConnectOptions::default()).await.unwrap();
    let report = reports.recv().await.unwrap();
    assert_eq!(report.local, "node1@alpha");
}
