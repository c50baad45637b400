//! Same-subnet admission control.
//!
//! An optional gate between raw accept and the handshake: when enabled,
//! an inbound peer is admitted only if it shares a subnet with one of
//! this host's interfaces. Rejection is fatal for that one connection
//! attempt — the listener and every other in-flight connection are
//! untouched — and is a distinct error type so logs can tell an admission
//! refusal apart from a handshake failure.

use std::net::IpAddr;

use crate::driver::{InterfaceAddr, TransportDriver};
use crate::error::AdmissionRefused;

/// Whether `peer` shares a subnet with any of `interfaces`.
///
/// The driver's netmask application is used on both sides of each
/// comparison; interfaces whose family does not match the peer are
/// skipped.
#[must_use]
pub fn admit<D: TransportDriver>(driver: &D, peer: IpAddr, interfaces: &[InterfaceAddr]) -> bool {
    interfaces.iter().any(|interface| {
        match (
            driver.mask(interface.netmask, interface.addr),
            driver.mask(interface.netmask, peer),
        ) {
            (Some(local), Some(remote)) => local == remote,
            _ => false,
        }
    })
}

/// Run the admission gate for one inbound peer.
///
/// With enforcement off this always admits. With it on, the driver's
/// interface table is consulted; a driver that cannot enumerate
/// interfaces refuses the peer (there is nothing to admit against).
///
/// # Errors
///
/// [`AdmissionRefused`] carrying the peer address.
pub async fn check<D: TransportDriver>(
    driver: &D,
    peer: IpAddr,
    enforce: bool,
) -> Result<(), AdmissionRefused> {
    if !enforce {
        return Ok(());
    }

    let interfaces = match driver.interfaces().await {
        Ok(interfaces) => interfaces,
        Err(error) => {
            tracing::warn!(error = %error, "interface enumeration failed, refusing peer");
            return Err(AdmissionRefused { peer });
        },
    };

    if admit(driver, peer, &interfaces) {
        Ok(())
    } else {
        Err(AdmissionRefused { peer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::NullDriver;

    fn net(addr: &str, mask: &str) -> InterfaceAddr {
        InterfaceAddr {
            addr: addr.parse().unwrap(),
            broadcast: None,
            netmask: mask.parse().unwrap(),
        }
    }

    #[test]
    fn same_subnet_peer_is_admitted() {
        let interfaces = [net("10.0.0.5", "255.255.255.0")];
        assert!(admit(&NullDriver, "10.0.0.9".parse().unwrap(), &interfaces));
    }

    #[test]
    fn other_subnet_peer_is_refused() {
        let interfaces = [net("10.0.0.5", "255.255.255.0")];
        assert!(!admit(&NullDriver, "10.1.0.9".parse().unwrap(), &interfaces));
    }

    #[test]
    fn any_matching_interface_admits() {
        let interfaces = [net("10.0.0.5", "255.255.255.0"), net("192.168.7.1", "255.255.255.0")];
        assert!(admit(&NullDriver, "192.168.7.200".parse().unwrap(), &interfaces));
    }

    #[test]
    fn family_mismatch_never_matches() {
        let interfaces = [net("10.0.0.5", "255.255.255.0")];
        assert!(!admit(&NullDriver, "fe80::1".parse().unwrap(), &interfaces));
    }

    #[test]
    fn empty_interface_table_refuses() {
        assert!(!admit(&NullDriver, "10.0.0.9".parse().unwrap(), &[]));
    }

    #[tokio::test]
    async fn disabled_enforcement_admits_everyone() {
        // NullDriver's interfaces() is unreachable: the gate must answer
        // before consulting the driver.
        check(&NullDriver, "203.0.113.7".parse().unwrap(), false).await.unwrap();
    }
}
