//! Recording stub for the external handshake engine.

use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_core::context::{ConnectionKind, HandshakeAbort, HandshakeContext, HandshakeEngine};
use tether_core::driver::{SocketOptions, TransportDriver};

/// What the recording engine observed for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReport {
    /// Local identity the context carried.
    pub local: String,
    /// Requested connection type.
    pub kind: ConnectionKind,
    /// The pre-up option set the context prescribed.
    pub pre_up: SocketOptions,
    /// The post-up option set the context prescribed.
    pub post_up: SocketOptions,
    /// Socket options in effect after the pre-up set was applied.
    pub applied: SocketOptions,
}

/// A handshake engine that records what it was handed and succeeds.
///
/// It applies the pre-up option set — the first thing any real engine
/// does — and reports the context's contents through a channel, leaving
/// assertions to the test.
pub struct RecordingEngine {
    reports: mpsc::UnboundedSender<HandshakeReport>,
}

impl RecordingEngine {
    /// The engine plus the stream of reports it will produce.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HandshakeReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        (Self { reports }, rx)
    }
}

#[async_trait]
impl<D: TransportDriver> HandshakeEngine<D> for RecordingEngine {
    async fn run(&self, mut ctx: HandshakeContext<D>) -> Result<(), HandshakeAbort> {
        ctx.apply_pre_up().await.map_err(|err| HandshakeAbort::new(err.to_string()))?;
        let report = HandshakeReport {
            local: ctx.local().to_string(),
            kind: ctx.kind(),
            pre_up: *ctx.pre_up(),
            post_up: *ctx.post_up(),
            applied: ctx.options(),
        };
        self.reports
            .send(report)
            .map_err(|_| HandshakeAbort::new("report channel closed".to_string()))?;
        Ok(())
    }
}
