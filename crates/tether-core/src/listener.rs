//! Listening endpoint setup.
//!
//! [`listen`] produces the [`Endpoint`] other cluster members connect to:
//! it merges the caller's listen options with configuration, asks the
//! directory whether a concrete port is prescribed, binds (scanning the
//! configured port range linearly when the directory says "any"), and
//! registers the bound port with the directory to obtain the
//! registration's [`Creation`].
//!
//! The port scan advances only on address-in-use and never wraps around;
//! a range with every port taken (or an inverted range) fails with a
//! port-range-exhausted setup error. Registration failure tears the
//! just-bound endpoint down — no partial state survives a failed listen.

use std::net::IpAddr;

use crate::config::{LinkConfig, PortRange};
use crate::directory::{Creation, DirectoryClient};
use crate::driver::{AddressFamily, ListenOptions, ProtocolTag, TransportDriver};
use crate::error::{DriverError, SetupError};
use crate::name::NodeName;

/// A bound listening endpoint.
///
/// Created once by [`listen`], immutable afterwards, and shared read-only
/// with the acceptor. Dropping the endpoint closes the listening socket.
pub struct Endpoint<D: TransportDriver> {
    listener: D::Listener,
    family: AddressFamily,
    protocol: ProtocolTag,
    host: String,
    port: u16,
}

impl<D: TransportDriver> std::fmt::Debug for Endpoint<D>
where
    D::Listener: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("listener", &self.listener)
            .field("family", &self.family)
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl<D: TransportDriver> Endpoint<D> {
    /// The driver-level listener, for the accept loop.
    #[must_use]
    pub fn listener(&self) -> &D::Listener {
        &self.listener
    }

    /// Address family of the endpoint.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Transport protocol of the endpoint.
    #[must_use]
    pub fn protocol(&self) -> ProtocolTag {
        self.protocol
    }

    /// Host part of the owning node's name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the endpoint is bound to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Bind a listening endpoint for `name` and register it with the
/// directory.
///
/// # Errors
///
/// Any failure is a fatal [`SetupError`] for this listen attempt: the
/// directory could not be queried, no port could be bound, or
/// registration was refused (in which case the endpoint has already been
/// torn down).
pub async fn listen<D, C>(
    name: &NodeName,
    driver: &D,
    directory: &C,
    config: &LinkConfig,
    base: &ListenOptions,
) -> Result<(Endpoint<D>, Creation), SetupError>
where
    D: TransportDriver,
    C: DirectoryClient,
{
    let opts = config.merged_listen(base);
    let bind = opts.bind_interface;

    let prescribed = directory
        .listen_port_please(name.alive(), name.host())
        .await
        .map_err(|source| SetupError::PortQuery { name: name.to_string(), source })?;

    let listener = match prescribed {
        // A prescribed port is bound exactly, with no retry.
        Some(port) => driver
            .listen(bind, port, &opts)
            .await
            .map_err(|source| SetupError::PortUnavailable { port, source })?,
        None if config.port_range.is_ephemeral() => {
            driver.listen(bind, 0, &opts).await.map_err(SetupError::Listen)?
        },
        None => scan(driver, bind, &opts, config.port_range).await?,
    };

    let local = driver.listener_addr(&listener).map_err(SetupError::Listen)?;

    let creation = match directory.register_node(name.alive(), local.port(), driver.protocol()).await
    {
        Ok(creation) => creation,
        Err(source) => {
            drop(listener);
            return Err(SetupError::Registration { name: name.to_string(), source });
        },
    };

    tracing::info!(name = %name, port = local.port(), creation = %creation, "listener registered");

    Ok((
        Endpoint {
            listener,
            family: driver.family(),
            protocol: driver.protocol(),
            host: name.host().to_string(),
            port: local.port(),
        },
        creation,
    ))
}

/// Linear scan of `[low..=high]`: advance on address-in-use, stop on the
/// first success, fail once the candidate passes `high`. Never wraps.
async fn scan<D: TransportDriver>(
    driver: &D,
    bind: Option<IpAddr>,
    opts: &ListenOptions,
    range: PortRange,
) -> Result<D::Listener, SetupError> {
    let mut candidate = range.low;
    loop {
        if candidate > range.high {
            return Err(SetupError::PortRangeExhausted { low: range.low, high: range.high });
        }
        match driver.listen(bind, candidate, opts).await {
            Ok(listener) => return Ok(listener),
            Err(DriverError::AddrInUse) => match candidate.checked_add(1) {
                Some(next) => candidate = next,
                None => {
                    return Err(SetupError::PortRangeExhausted {
                        low: range.low,
                        high: range.high,
                    });
                },
            },
            Err(other) => return Err(SetupError::Listen(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::directory::{DirectoryError, InMemoryDirectory, Resolution};
    use crate::driver::{ConnectOptions, InterfaceAddr};
    use crate::name::NamingMode;

    /// Driver whose network is a scripted set of occupied ports.
    struct PortMapDriver {
        occupied: Mutex<HashSet<u16>>,
        live_listeners: Arc<AtomicUsize>,
    }

    #[derive(Debug)]
    struct PortMapListener {
        port: u16,
        live: Arc<AtomicUsize>,
    }

    impl Drop for PortMapListener {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl PortMapDriver {
        fn new(occupied: impl IntoIterator<Item = u16>) -> Self {
            Self {
                occupied: Mutex::new(occupied.into_iter().collect()),
                live_listeners: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl TransportDriver for PortMapDriver {
        type Listener = PortMapListener;
        type Socket = crate::driver::test_support::NeverSocket;

        fn family(&self) -> AddressFamily {
            AddressFamily::V4
        }

        fn protocol(&self) -> ProtocolTag {
            ProtocolTag("tcp")
        }

        async fn listen(
            &self,
            _bind: Option<IpAddr>,
            port: u16,
            _opts: &ListenOptions,
        ) -> Result<Self::Listener, DriverError> {
            let mut occupied = self.occupied.lock().unwrap();
            let port = if port == 0 { 50000 } else { port };
            if !occupied.insert(port) {
                return Err(DriverError::AddrInUse);
            }
            self.live_listeners.fetch_add(1, Ordering::SeqCst);
            Ok(PortMapListener { port, live: Arc::clone(&self.live_listeners) })
        }

        fn listener_addr(&self, listener: &Self::Listener) -> Result<SocketAddr, DriverError> {
            Ok(SocketAddr::new("127.0.0.1".parse().unwrap(), listener.port))
        }

        async fn accept(&self, _listener: &Self::Listener) -> Result<Self::Socket, DriverError> {
            unimplemented!()
        }

        async fn connect(
            &self,
            _addr: IpAddr,
            _port: u16,
            _opts: &ConnectOptions,
        ) -> Result<Self::Socket, DriverError> {
            unimplemented!()
        }

        async fn parse_address(&self, _host: &str) -> Result<IpAddr, DriverError> {
            unimplemented!()
        }

        async fn interfaces(&self) -> Result<Vec<InterfaceAddr>, DriverError> {
            unimplemented!()
        }
    }

    /// Directory that refuses every registration.
    struct RefusingDirectory;

    #[async_trait]
    impl DirectoryClient for RefusingDirectory {
        async fn listen_port_please(
            &self,
            _alive: &str,
            _host: &str,
        ) -> Result<Option<u16>, DirectoryError> {
            Ok(None)
        }

        async fn register_node(
            &self,
            _alive: &str,
            _port: u16,
            _protocol: ProtocolTag,
        ) -> Result<Creation, DirectoryError> {
            Err(DirectoryError::Refused("registration disabled".to_string()))
        }

        async fn address_please(
            &self,
            _alive: &str,
            _host: &str,
            _family: AddressFamily,
        ) -> Result<Resolution, DirectoryError> {
            unimplemented!()
        }

        async fn port_please(
            &self,
            _alive: &str,
            _addr: IpAddr,
        ) -> Result<(u16, u16), DirectoryError> {
            unimplemented!()
        }
    }

    fn node() -> NodeName {
        NodeName::parse("node1@alpha", NamingMode::Short).unwrap()
    }

    fn ranged_config(low: u16, high: u16) -> LinkConfig {
        LinkConfig { port_range: PortRange { low, high }, ..LinkConfig::default() }
    }

    #[tokio::test]
    async fn scan_binds_first_free_port() {
        let driver = PortMapDriver::new(9000..=9004);
        let directory = InMemoryDirectory::new();
        let config = ranged_config(9000, 9010);

        let (endpoint, _creation) =
            listen(&node(), &driver, &directory, &config, &ListenOptions::default())
                .await
                .unwrap();
        assert_eq!(endpoint.port(), 9005);
    }

    #[tokio::test]
    async fn exhausted_range_fails_without_wrapping() {
        let driver = PortMapDriver::new(9000..=9010);
        let directory = InMemoryDirectory::new();
        let config = ranged_config(9000, 9010);

        let err = listen(&node(), &driver, &directory, &config, &ListenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::PortRangeExhausted { low: 9000, high: 9010 }));
    }

    #[tokio::test]
    async fn degenerate_range_at_end_of_port_space_does_not_wrap() {
        let driver = PortMapDriver::new([65535]);
        let directory = InMemoryDirectory::new();
        let config = ranged_config(65535, 65535);

        let err = listen(&node(), &driver, &directory, &config, &ListenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::PortRangeExhausted { .. }));
    }

    #[tokio::test]
    async fn inverted_range_is_exhausted_immediately() {
        let driver = PortMapDriver::new([]);
        let directory = InMemoryDirectory::new();
        let config = ranged_config(9010, 9000);

        let err = listen(&node(), &driver, &directory, &config, &ListenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::PortRangeExhausted { .. }));
    }

    #[tokio::test]
    async fn prescribed_port_is_bound_without_scan() {
        let driver = PortMapDriver::new([]);
        let directory = InMemoryDirectory::new();
        directory.set_fixed_port("node1", 4370);
        let config = ranged_config(9000, 9010);

        let (endpoint, _creation) =
            listen(&node(), &driver, &directory, &config, &ListenOptions::default())
                .await
                .unwrap();
        assert_eq!(endpoint.port(), 4370);
    }

    #[tokio::test]
    async fn prescribed_port_conflict_fails_without_retry() {
        let driver = PortMapDriver::new([4370]);
        let directory = InMemoryDirectory::new();
        directory.set_fixed_port("node1", 4370);
        let config = ranged_config(9000, 9010);

        let err = listen(&node(), &driver, &directory, &config, &ListenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::PortUnavailable { port: 4370, .. }));
    }

    #[tokio::test]
    async fn registration_failure_tears_endpoint_down() {
        let driver = PortMapDriver::new([]);
        let config = ranged_config(9000, 9010);

        let err = listen(&node(), &driver, &RefusingDirectory, &config, &ListenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::Registration { .. }));
        assert_eq!(driver.live_listeners.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ephemeral_range_delegates_to_transport() {
        let driver = PortMapDriver::new([]);
        let directory = InMemoryDirectory::new();
        let config = ranged_config(0, 0);

        let (endpoint, _creation) =
            listen(&node(), &driver, &directory, &config, &ListenOptions::default())
                .await
                .unwrap();
        assert_eq!(endpoint.port(), 50000);
    }

    #[test]
    fn prop_scan_lands_on_first_free_port() {
        use proptest::prelude::*;

        proptest!(|(low in 9000u16..9050, span in 0u16..10, taken in 0u16..=10)| {
            let high = low + span;
            let driver = PortMapDriver::new(low..low + taken);
            let directory = InMemoryDirectory::new();
            let config = ranged_config(low, high);

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let result = runtime.block_on(listen(
                &node(),
                &driver,
                &directory,
                &config,
                &ListenOptions::default(),
            ));

            if taken > span {
                // Every port in the range is taken.
                let is_exhausted = matches!(result, Err(SetupError::PortRangeExhausted { .. }));
                prop_assert!(is_exhausted);
            } else {
                let (endpoint, _creation) = result.unwrap();
                prop_assert_eq!(endpoint.port(), low + taken);
            }
        });
    }
}
