//! Accept loop and controller handoff.
//!
//! The [`Acceptor`] owns the raw accept loop for one endpoint. Each
//! accepted socket goes through the controller handoff protocol before
//! any handshake I/O happens:
//!
//! ```text
//! Acceptor                    Controller               Handler task
//!    │  raw accept                │                        │
//!    │──Accepted{family,proto}──▶│                        │
//!    │                            │── spawn ──────────────▶│
//!    │◀──Grant{handler}──────────│                        │
//!    │──Handoff::Buffered(e)*───────────────────────────▶│
//!    │──Handoff::Complete(sock)─────────────────────────▶│
//!    │  (next accept)             │                        │ admission,
//!    │                            │                        │ context, engine
//! ```
//!
//! Buffered events drained from the socket are forwarded ahead of the
//! socket itself, in arrival order, so the new owner misses nothing; the
//! `Complete` message moves raw ownership and doubles as the completion
//! acknowledgment. When the controller answers `Unsupported`, the socket
//! is discarded without acknowledgment.
//!
//! A raw accept failure terminates the loop and is returned to the
//! caller — deliberately propagated, never swallowed — while the
//! endpoint itself stays valid for a supervising layer to listen again.
//! Handler tasks run concurrently and unbounded: a slow handshake never
//! delays the next accept beyond its own handoff.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::admission;
use crate::config::LinkConfig;
use crate::context::{ConnectionKind, Deadline, HandshakeAbort, HandshakeContext, HandshakeEngine};
use crate::driver::{AddressFamily, DriverSocket, ProtocolTag, SocketEvent, TransportDriver};
use crate::error::{AbortReason, AcceptError, DriverError};
use crate::listener::Endpoint;
use crate::name::NodeName;

/// Handoff protocol messages, in the order the handler receives them.
pub enum Handoff<D: TransportDriver> {
    /// An inbound event that arrived while the socket was still in
    /// acceptor custody. Forwarded in original arrival order.
    Buffered(SocketEvent),
    /// Raw socket ownership. Receiving this completes the handoff.
    Complete(D::Socket),
}

/// Controller's answer to an accept notification.
enum HandoffDecision<D: TransportDriver> {
    /// Hand the socket to this handler.
    Grant(mpsc::UnboundedSender<Handoff<D>>),
    /// The protocol is not served here; discard the socket.
    Unsupported,
}

/// Notification of one raw accept, sent to the controller.
pub struct Accepted<D: TransportDriver> {
    /// Address family of the accepted socket.
    pub family: AddressFamily,
    /// Transport protocol of the accepted socket.
    pub protocol: ProtocolTag,
    /// Peer endpoint the connection arrived from.
    pub peer: SocketAddr,
    reply: oneshot::Sender<HandoffDecision<D>>,
}

impl<D: TransportDriver> Accepted<D> {
    /// Grant ownership to the handler behind `handler`.
    pub fn grant(self, handler: mpsc::UnboundedSender<Handoff<D>>) {
        let _ = self.reply.send(HandoffDecision::Grant(handler));
    }

    /// Refuse the connection as an unsupported protocol.
    pub fn refuse(self) {
        let _ = self.reply.send(HandoffDecision::Unsupported);
    }
}

/// The raw accept loop for one endpoint.
pub struct Acceptor<D: TransportDriver> {
    driver: Arc<D>,
    endpoint: Arc<Endpoint<D>>,
    controller: mpsc::UnboundedSender<Accepted<D>>,
}

impl<D: TransportDriver> Acceptor<D> {
    /// Build an acceptor feeding `controller`.
    pub fn new(
        driver: Arc<D>,
        endpoint: Arc<Endpoint<D>>,
        controller: mpsc::UnboundedSender<Accepted<D>>,
    ) -> Self {
        Self { driver, endpoint, controller }
    }

    /// Run until the driver's accept fails; returns the fatal error.
    ///
    /// The loop blocks on the controller rendezvous only until the grant
    /// arrives — never on the handshake behind it.
    pub async fn run(self) -> AcceptError {
        loop {
            let mut socket = match self.driver.accept(self.endpoint.listener()).await {
                Ok(socket) => socket,
                Err(source) => {
                    tracing::error!(error = %source, "accept failed, acceptor terminating");
                    return AcceptError { source };
                },
            };

            let peer = match socket.peer_addr() {
                Ok(peer) => peer,
                Err(error) => {
                    tracing::warn!(error = %error, "accepted socket lost before handoff");
                    continue;
                },
            };

            let (reply, decision) = oneshot::channel();
            let accepted = Accepted {
                family: self.endpoint.family(),
                protocol: self.endpoint.protocol(),
                peer,
                reply,
            };
            if self.controller.send(accepted).is_err() {
                return AcceptError {
                    source: DriverError::Io("controller channel closed".to_string()),
                };
            }

            match decision.await {
                Ok(HandoffDecision::Grant(handler)) => {
                    // Drain-then-transfer: everything that arrived during
                    // acceptor custody reaches the new owner first, in
                    // order. The Complete message is the acknowledgment.
                    let mut handler_gone = false;
                    for event in socket.take_buffered() {
                        if handler.send(Handoff::Buffered(event)).is_err() {
                            handler_gone = true;
                            break;
                        }
                    }
                    if !handler_gone {
                        let _ = handler.send(Handoff::Complete(socket));
                    }
                },
                Ok(HandoffDecision::Unsupported) | Err(_) => {
                    tracing::warn!(peer = %peer, "connection discarded before handoff");
                },
            }
        }
    }
}

/// Accept-side controller: spawns one handler task per inbound
/// connection.
///
/// The controller decides whether the arriving protocol is served,
/// grants the handoff, and leaves admission, context construction, and
/// the handshake itself to the spawned task. Handlers are independent;
/// an unbounded number may be in flight.
pub struct Controller<D, H>
where
    D: TransportDriver,
    H: HandshakeEngine<D>,
{
    driver: Arc<D>,
    engine: Arc<H>,
    config: Arc<LinkConfig>,
    local: NodeName,
    supported: Vec<ProtocolTag>,
    events: mpsc::UnboundedReceiver<Accepted<D>>,
}

impl<D, H> Controller<D, H>
where
    D: TransportDriver,
    H: HandshakeEngine<D>,
{
    /// Build a controller; the returned sender is what the [`Acceptor`]
    /// feeds.
    pub fn new(
        driver: Arc<D>,
        engine: Arc<H>,
        config: Arc<LinkConfig>,
        local: NodeName,
    ) -> (Self, mpsc::UnboundedSender<Accepted<D>>) {
        let (tx, events) = mpsc::unbounded_channel();
        let supported = vec![driver.protocol()];
        (Self { driver, engine, config, local, supported, events }, tx)
    }

    /// Replace the set of protocols this controller serves.
    #[must_use]
    pub fn with_supported(mut self, supported: Vec<ProtocolTag>) -> Self {
        self.supported = supported;
        self
    }

    /// Consume accept notifications until every sender is gone.
    pub async fn run(mut self) {
        while let Some(accepted) = self.events.recv().await {
            self.dispatch(accepted);
        }
    }

    fn dispatch(&self, accepted: Accepted<D>) {
        if !self.supported.contains(&accepted.protocol) {
            tracing::warn!(
                protocol = %accepted.protocol,
                peer = %accepted.peer,
                "unsupported protocol refused"
            );
            accepted.refuse();
            return;
        }

        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let peer = accepted.peer;
        accepted.grant(handoff_tx);

        let label = self.config.spawn_for(ConnectionKind::New).label.clone().unwrap_or_default();
        let span = tracing::info_span!("inbound_link", peer = %peer, label = %label);
        let task = inbound_task(
            Arc::clone(&self.driver),
            Arc::clone(&self.engine),
            Arc::clone(&self.config),
            self.local.clone(),
            handoff_rx,
            peer,
        );
        tokio::spawn(task.instrument(span));
    }
}

/// One inbound connection attempt: handoff, admission, context,
/// handshake.
async fn inbound_task<D, H>(
    driver: Arc<D>,
    engine: Arc<H>,
    config: Arc<LinkConfig>,
    local: NodeName,
    mut handoff: mpsc::UnboundedReceiver<Handoff<D>>,
    peer: SocketAddr,
) where
    D: TransportDriver,
    H: HandshakeEngine<D>,
{
    // The deadline covers the whole handshake process, handoff included.
    let deadline = Deadline::start(config.setup_timeout);

    let mut buffered = VecDeque::new();
    let socket = loop {
        match handoff.recv().await {
            Some(Handoff::Buffered(event)) => buffered.push_back(event),
            Some(Handoff::Complete(socket)) => break socket,
            None => {
                tracing::debug!(peer = %peer, "acceptor abandoned handoff");
                return;
            },
        }
    };

    if let Err(refused) = admission::check(driver.as_ref(), peer.ip(), config.check_subnet).await {
        // Deliberately logged apart from handshake failures.
        tracing::warn!(peer = %refused.peer, "peer refused by subnet admission");
        return;
    }

    let ctx = HandshakeContext::inbound(driver, socket, buffered, &config, local, deadline);
    let expiry = ctx.deadline().clone();

    let outcome = tokio::select! {
        outcome = engine.run(ctx) => outcome,
        () = expiry.expired() => {
            Err(HandshakeAbort::new(
                AbortReason::DeadlineExpired { elapsed: expiry.timeout() }.to_string(),
            ))
        },
    };
    match outcome {
        Ok(()) => tracing::debug!(peer = %peer, "inbound link established"),
        Err(abort) => tracing::info!(peer = %peer, reason = %abort, "inbound handshake aborted"),
    }
}
