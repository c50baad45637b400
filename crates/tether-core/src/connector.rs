//! Outbound connection setup.
//!
//! The [`Connector`] resolves a peer name through the directory and opens
//! the transport connection, producing the outbound handshake context.
//! Name resolution accepts both directory shapes — a full
//! `{addr, port, version}` answer, or an address-only answer followed by
//! a port query — and both converge on the same connect step.
//!
//! The deadline timer starts at call entry and is reset exactly once,
//! immediately before the actual connect: directory latency does not eat
//! into handshake time. Every failure is a fatal [`SetupError`] carrying
//! the target name and phase; retry policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::config::LinkConfig;
use crate::context::{ConnectionKind, Deadline, HandshakeContext, HandshakeEngine};
use crate::directory::{DirectoryClient, Resolution, Resolved};
use crate::driver::{ConnectOptions, TransportDriver};
use crate::error::{AbortReason, SetupError};
use crate::name::NodeName;

/// Opens outbound connections to named peers.
///
/// Shared by any number of concurrent connect attempts; each call owns
/// its own deadline, socket, and context.
pub struct Connector<D, C> {
    driver: Arc<D>,
    directory: Arc<C>,
    config: Arc<LinkConfig>,
    local: NodeName,
}

impl<D, C> Connector<D, C>
where
    D: TransportDriver,
    C: DirectoryClient,
{
    /// Build a connector acting as `local`.
    pub fn new(driver: Arc<D>, directory: Arc<C>, config: Arc<LinkConfig>, local: NodeName) -> Self {
        Self { driver, directory, config, local }
    }

    /// Resolve `name`, connect, and build the handshake context.
    ///
    /// # Errors
    ///
    /// A fatal [`SetupError`] when the name is malformed, resolution
    /// fails, or the connect fails (including the peer disappearing
    /// between resolution and connect). No retry is performed here.
    pub async fn connect(
        &self,
        name: &str,
        kind: ConnectionKind,
        timeout: Duration,
    ) -> Result<HandshakeContext<D>, SetupError> {
        let mut deadline = Deadline::start(timeout);

        let peer = NodeName::parse(name, self.config.naming)?;
        let resolved = self.resolve(&peer).await?;

        // Resolution time does not count against the handshake budget.
        deadline.reset();

        let opts = self.config.merged_connect(&ConnectOptions::default());
        let socket = self
            .driver
            .connect(resolved.addr, resolved.port, &opts)
            .await
            .map_err(|source| SetupError::Connect {
                name: peer.to_string(),
                addr: resolved.addr,
                port: resolved.port,
                source,
            })?;

        tracing::debug!(peer = %peer, addr = %resolved.addr, port = resolved.port, "connected");

        Ok(HandshakeContext::outbound(
            Arc::clone(&self.driver),
            socket,
            &self.config,
            self.local.clone(),
            peer,
            resolved,
            kind,
            deadline,
        ))
    }

    /// Connect and drive the external handshake engine to completion.
    ///
    /// Deadline expiry aborts this attempt only; nothing is retried.
    ///
    /// # Errors
    ///
    /// The setup failure, the engine's abort reason, or deadline expiry.
    pub async fn connect_with<H>(
        &self,
        engine: &H,
        name: &str,
        kind: ConnectionKind,
        timeout: Duration,
    ) -> Result<(), AbortReason>
    where
        H: HandshakeEngine<D>,
    {
        let ctx = self.connect(name, kind, timeout).await?;
        let expiry = ctx.deadline().clone();

        let label = self.config.spawn_for(kind).label.clone().unwrap_or_default();
        let span = tracing::info_span!("outbound_link", peer = %name, label = %label);
        let outcome = async {
            tokio::select! {
                outcome = engine.run(ctx) => {
                    outcome.map_err(|abort| AbortReason::Handshake(abort.reason))
                },
                () = expiry.expired() => {
                    Err(AbortReason::DeadlineExpired { elapsed: expiry.timeout() })
                },
            }
        }
        .instrument(span)
        .await;

        if let Err(reason) = &outcome {
            tracing::info!(peer = %name, reason = %reason, "outbound attempt aborted");
        }
        outcome
    }

    async fn resolve(&self, peer: &NodeName) -> Result<Resolved, SetupError> {
        let resolution = self
            .directory
            .address_please(peer.alive(), peer.host(), self.driver.family())
            .await
            .map_err(|source| SetupError::Resolution { name: peer.to_string(), source })?;

        match resolution {
            Resolution::Full { addr, port, version } => Ok(Resolved { addr, port, version }),
            Resolution::AddressOnly { addr } => {
                let (port, version) = self
                    .directory
                    .port_please(peer.alive(), addr)
                    .await
                    .map_err(|source| SetupError::Resolution { name: peer.to_string(), source })?;
                Ok(Resolved { addr, port, version })
            },
        }
    }
}
