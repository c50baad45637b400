//! Directory client abstraction.
//!
//! The directory is the external name/address registry peers use to find
//! each other: a node registers its listen port under its name, and a
//! connecting node resolves a peer name to an address and port. The
//! service itself is an external collaborator; this module defines the
//! capability set the layer consumes plus a default in-process
//! implementation good enough for single-process clusters and tests.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::driver::{AddressFamily, ProtocolTag};

/// Protocol version advertised for registrations by the default
/// directory.
pub const PROTOCOL_VERSION: u16 = 1;

/// Opaque per-registration generation counter.
///
/// Peers compare creations for equality to distinguish a reconnect to the
/// same incarnation of a node from a connection to a restarted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Creation(u32);

impl Creation {
    /// Wrap a raw generation value. Directory implementations own the
    /// numbering scheme; consumers only compare.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Creation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an address resolution returned.
///
/// Directories come in two shapes: some answer with everything needed to
/// connect, some answer with the address only and expect a follow-up
/// port query. Both shapes converge on the same connect step in the
/// connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Address, port, and protocol version in one answer.
    Full {
        /// Resolved address.
        addr: IpAddr,
        /// Port the peer listens on.
        port: u16,
        /// Protocol version the peer registered.
        version: u16,
    },
    /// Address only; the caller issues a port query next.
    AddressOnly {
        /// Resolved address.
        addr: IpAddr,
    },
}

/// A resolution normalized to the converged shape.
///
/// Both [`Resolution`] shapes end up here: the connector fills in the
/// port and version with a follow-up `port_please` when the directory
/// answered with the address only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Resolved address.
    pub addr: IpAddr,
    /// Port the peer listens on.
    pub port: u16,
    /// Protocol version the peer registered.
    pub version: u16,
}

/// Errors reported by a directory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// The queried name has no registration.
    #[error("{name:?} is not registered")]
    NotRegistered {
        /// The name that was queried.
        name: String,
    },

    /// The directory refused the operation.
    #[error("directory refused: {0}")]
    Refused(String),

    /// The directory could not be reached.
    #[error("directory unreachable: {0}")]
    Unreachable(String),
}

/// Capability set consumed from the directory service.
///
/// Implementations are shared collaborators invoked concurrently by the
/// listener and any number of connectors; they must be internally
/// synchronized. This layer adds no timeout around directory calls —
/// callers relying on an unresponsive directory add their own.
#[async_trait]
pub trait DirectoryClient: Send + Sync + 'static {
    /// Port this node should listen on, or `None` for "any".
    ///
    /// # Errors
    ///
    /// Returns a directory error when the query fails.
    async fn listen_port_please(
        &self,
        alive: &str,
        host: &str,
    ) -> Result<Option<u16>, DirectoryError>;

    /// Register this node's listen port; returns the registration's
    /// creation.
    ///
    /// # Errors
    ///
    /// Returns a directory error when registration is refused or fails.
    async fn register_node(
        &self,
        alive: &str,
        port: u16,
        protocol: ProtocolTag,
    ) -> Result<Creation, DirectoryError>;

    /// Resolve a peer name to an address (and possibly port and version).
    ///
    /// # Errors
    ///
    /// Returns a directory error when the peer is unknown or the query
    /// fails.
    async fn address_please(
        &self,
        alive: &str,
        host: &str,
        family: AddressFamily,
    ) -> Result<Resolution, DirectoryError>;

    /// Port and protocol version of a peer already resolved to `addr`.
    ///
    /// # Errors
    ///
    /// Returns a directory error when the peer is unknown at `addr`.
    async fn port_please(&self, alive: &str, addr: IpAddr) -> Result<(u16, u16), DirectoryError>;
}

/// In-process directory for single-process clusters and tests.
///
/// Hosts are seeded with [`InMemoryDirectory::add_host`]; registrations
/// bump a per-name creation counter so re-registration is observable the
/// way a directory restart would be. All state sits behind one mutex; the
/// lock is never held across an await.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    inner: Arc<Mutex<DirectoryInner>>,
}

#[derive(Default)]
struct DirectoryInner {
    /// Host label -> address.
    hosts: HashMap<String, IpAddr>,
    /// Alive name -> registration.
    nodes: HashMap<String, Registration>,
    /// Alive name -> prescribed listen port.
    fixed_ports: HashMap<String, u16>,
    /// Alive name -> creations handed out so far.
    creations: HashMap<String, u32>,
}

struct Registration {
    port: u16,
    version: u16,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a host label with its address.
    pub fn add_host(&self, host: impl Into<String>, addr: IpAddr) {
        self.lock().hosts.insert(host.into(), addr);
    }

    /// Prescribe a fixed listen port for `alive`; `listen_port_please`
    /// will answer with it.
    pub fn set_fixed_port(&self, alive: impl Into<String>, port: u16) {
        self.lock().fixed_ports.insert(alive.into(), port);
    }

    /// Number of currently registered nodes.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.lock().nodes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirectoryInner> {
        self.inner.lock().expect("InMemoryDirectory mutex poisoned")
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    async fn listen_port_please(
        &self,
        alive: &str,
        _host: &str,
    ) -> Result<Option<u16>, DirectoryError> {
        Ok(self.lock().fixed_ports.get(alive).copied())
    }

    async fn register_node(
        &self,
        alive: &str,
        port: u16,
        _protocol: ProtocolTag,
    ) -> Result<Creation, DirectoryError> {
        let mut inner = self.lock();
        let creation = inner.creations.entry(alive.to_string()).or_insert(0);
        *creation += 1;
        let creation = Creation(*creation);
        inner.nodes.insert(alive.to_string(), Registration { port, version: PROTOCOL_VERSION });
        Ok(creation)
    }

    async fn address_please(
        &self,
        alive: &str,
        host: &str,
        _family: AddressFamily,
    ) -> Result<Resolution, DirectoryError> {
        let inner = self.lock();
        let addr = *inner
            .hosts
            .get(host)
            .ok_or_else(|| DirectoryError::NotRegistered { name: host.to_string() })?;
        match inner.nodes.get(alive) {
            Some(reg) => Ok(Resolution::Full { addr, port: reg.port, version: reg.version }),
            // The host is known but the node's port is not: answer with
            // the address and let the caller follow up with port_please.
            None => Ok(Resolution::AddressOnly { addr }),
        }
    }

    async fn port_please(&self, alive: &str, _addr: IpAddr) -> Result<(u16, u16), DirectoryError> {
        let inner = self.lock();
        match inner.nodes.get(alive) {
            Some(reg) => Ok((reg.port, reg.version)),
            None => Err(DirectoryError::NotRegistered { name: alive.to_string() }),
        }
    }
}
