//! Error types for connection establishment.
//!
//! The taxonomy follows the failure domains of the layer:
//!
//! - [`DriverError`]: transport-level failures reported by a driver
//! - [`SetupError`]: fatal, non-retryable failures of a single listen or
//!   connect attempt, each carrying the phase it failed in
//! - [`AcceptError`]: a raw accept failure — fatal for the accept loop,
//!   propagated so a supervisor can restart listening
//! - [`AdmissionRefused`]: a peer failed the subnet admission check —
//!   deliberately a distinct type so logs can tell it apart from
//!   handshake failures
//! - [`OptionViolation`]: an out-of-band attempt to change a
//!   protocol-invariant socket option
//!
//! Nothing in this layer retries on error; every value carries enough
//! context (target name, phase, underlying cause) for the caller to make
//! that call.

use std::net::IpAddr;
use std::time::Duration;

use crate::directory::DirectoryError;
use crate::name::NameError;

/// Transport-level failures reported by a driver.
///
/// String payloads keep the type comparable in tests without dragging
/// `std::io::Error` through the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The requested local address/port is already bound.
    #[error("address in use")]
    AddrInUse,

    /// The peer refused the connection.
    #[error("connection refused")]
    Refused,

    /// The peer is unreachable.
    #[error("host unreachable")]
    Unreachable,

    /// The socket is closed (locally or by the peer).
    #[error("socket closed")]
    Closed,

    /// A host string could not be resolved to an address.
    #[error("cannot resolve {0:?}")]
    AddressParse(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Io(String),
}

/// Phase a setup attempt failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    /// Node-name parsing.
    Naming,
    /// Binding the listening endpoint.
    Listen,
    /// Registering the endpoint with the directory.
    Registration,
    /// Resolving a peer name through the directory.
    Resolution,
    /// Opening the outbound connection.
    Connect,
}

/// Fatal failure of a single listen or connect attempt.
///
/// Setup errors are never retried inside this layer (the linear port scan
/// is the one documented exception and happens below this type). Any
/// socket opened before the failure has been closed by the time the error
/// is returned.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The supplied node name is malformed.
    #[error(transparent)]
    Name(#[from] NameError),

    /// Every candidate port in the configured range was unavailable.
    #[error("no free port in configured range {low}..={high}")]
    PortRangeExhausted {
        /// Lower bound of the scanned range.
        low: u16,
        /// Upper bound of the scanned range.
        high: u16,
    },

    /// The directory prescribed a concrete port and binding it failed.
    /// Prescribed ports are bound exactly, with no scan.
    #[error("prescribed port {port} unavailable: {source}")]
    PortUnavailable {
        /// The port the directory prescribed.
        port: u16,
        /// The bind failure.
        source: DriverError,
    },

    /// Binding failed for a reason other than port availability.
    #[error("listen failed: {0}")]
    Listen(DriverError),

    /// The directory could not answer the listen-port query.
    #[error("listen-port query for {name:?} failed: {source}")]
    PortQuery {
        /// Name the query was for.
        name: String,
        /// The directory failure.
        source: DirectoryError,
    },

    /// Registering the bound endpoint with the directory failed. The
    /// endpoint has been torn down.
    #[error("directory registration of {name:?} failed: {source}")]
    Registration {
        /// Name the registration was for.
        name: String,
        /// The directory failure.
        source: DirectoryError,
    },

    /// Resolving the target name through the directory failed.
    #[error("resolution of {name:?} failed: {source}")]
    Resolution {
        /// Name that failed to resolve.
        name: String,
        /// The directory failure.
        source: DirectoryError,
    },

    /// The transport connect failed (including the peer disappearing
    /// between resolution and connect).
    #[error("connect to {name:?} at {addr}:{port} failed: {source}")]
    Connect {
        /// Name of the target peer.
        name: String,
        /// Resolved address the connect was issued to.
        addr: IpAddr,
        /// Resolved port the connect was issued to.
        port: u16,
        /// The transport failure.
        source: DriverError,
    },
}

impl SetupError {
    /// The phase this attempt failed in, for logging and retry decisions
    /// at the call site.
    #[must_use]
    pub fn phase(&self) -> SetupPhase {
        match self {
            Self::Name(_) => SetupPhase::Naming,
            Self::PortRangeExhausted { .. }
            | Self::PortUnavailable { .. }
            | Self::Listen(_)
            | Self::PortQuery { .. } => SetupPhase::Listen,
            Self::Registration { .. } => SetupPhase::Registration,
            Self::Resolution { .. } => SetupPhase::Resolution,
            Self::Connect { .. } => SetupPhase::Connect,
        }
    }
}

/// A raw accept failure.
///
/// Terminates the accept loop that observed it; the listening endpoint
/// itself is unaffected and a supervising layer decides whether to listen
/// again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("accept failed: {source}")]
pub struct AcceptError {
    /// The underlying driver failure.
    pub source: DriverError,
}

/// A peer was refused by the same-subnet admission check.
///
/// Scoped to the one connection attempt; the listener and all other
/// in-flight connections are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer {peer} refused by subnet admission")]
pub struct AdmissionRefused {
    /// Address the peer connected from.
    pub peer: IpAddr,
}

/// An out-of-band attempt to change protocol-invariant socket options.
///
/// Receive mode, delivery mode, and framing are owned by this layer for
/// the lifetime of a connection; the violation names every offending
/// option so the caller can fix all of them at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol-invariant options cannot be changed: {options:?}")]
pub struct OptionViolation {
    /// Names of the options the caller tried to change.
    pub options: Vec<&'static str>,
}

/// Failure of an out-of-band option change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    /// The caller tried to change protocol-invariant options.
    #[error(transparent)]
    Violation(#[from] OptionViolation),

    /// The driver refused a delegated option.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Failure of a peer-address resolution on a live connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The peer name has no parseable host label. Fatal for the
    /// handshake.
    #[error(transparent)]
    Name(#[from] NameError),

    /// The socket can no longer report its peer endpoint.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Why a per-connection task aborted.
///
/// Used by the inbound controller and outbound drivers for terminal
/// logging; the variants keep the failure domains distinguishable.
#[derive(Debug, thiserror::Error)]
pub enum AbortReason {
    /// Setup failed before a handshake could start.
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// The peer failed admission.
    #[error(transparent)]
    Admission(#[from] AdmissionRefused),

    /// The handshake deadline expired.
    #[error("handshake deadline expired after {elapsed:?}")]
    DeadlineExpired {
        /// Time the connection was given.
        elapsed: Duration,
    },

    /// The external handshake engine aborted.
    #[error("handshake aborted: {0}")]
    Handshake(String),

    /// The transport failed mid-establishment.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_error_phases() {
        let err = SetupError::PortRangeExhausted { low: 9000, high: 9010 };
        assert_eq!(err.phase(), SetupPhase::Listen);

        let err = SetupError::Resolution {
            name: "node1@alpha".to_string(),
            source: DirectoryError::NotRegistered { name: "node1".to_string() },
        };
        assert_eq!(err.phase(), SetupPhase::Resolution);

        let err = SetupError::Connect {
            name: "node1@alpha".to_string(),
            addr: "10.0.0.5".parse().unwrap(),
            port: 9005,
            source: DriverError::Refused,
        };
        assert_eq!(err.phase(), SetupPhase::Connect);
    }

    #[test]
    fn error_display_is_stable() {
        insta::assert_snapshot!(
            SetupError::PortRangeExhausted { low: 9000, high: 9010 }.to_string(),
            @"no free port in configured range 9000..=9010"
        );
        insta::assert_snapshot!(
            AdmissionRefused { peer: "10.1.0.9".parse().unwrap() }.to_string(),
            @"peer 10.1.0.9 refused by subnet admission"
        );
        insta::assert_snapshot!(
            OptionViolation { options: vec!["receive", "framing"] }.to_string(),
            @r#"protocol-invariant options cannot be changed: ["receive", "framing"]"#
        );
    }
}
