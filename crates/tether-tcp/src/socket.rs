//! Connected TCP socket with length-prefixed framing.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_core::driver::{
    DriverSocket, Framing, RawSocketStats, ReceiveMode, SocketEvent, SocketOptions,
};
use tether_core::error::DriverError;

use crate::map_io;

/// Frames larger than this are treated as a protocol error.
const MAX_FRAME: usize = 64 * 1024 * 1024;

enum Io {
    /// Pull mode: the whole stream is owned here.
    Whole(TcpStream),
    /// Push mode: the read half lives in the pump task.
    Split { write: OwnedWriteHalf },
    /// Shut down.
    Closed,
}

/// A connected link socket over Tokio TCP.
///
/// Framing is 4-byte big-endian length prefixes; a zero-length frame is
/// the keep-alive tick. Statistics count frames (ticks included); the
/// pending-sends counter is unreported because writes go straight to the
/// kernel — the context's fold keeps its last-known value, which stays
/// zero.
///
/// Kernel-level options (no-delay, keep-alive) are applied while the
/// socket is still in pull mode; in this stack every option set reaches
/// the socket before push delivery starts.
pub struct TcpLinkSocket {
    io: Io,
    opts: SocketOptions,
    sink: Option<mpsc::UnboundedSender<SocketEvent>>,
    pump: Option<JoinHandle<()>>,
    received: Arc<AtomicU64>,
    sent: u64,
    peer: SocketAddr,
    local: SocketAddr,
    stash: VecDeque<SocketEvent>,
    eof_seen: bool,
}

impl TcpLinkSocket {
    pub(crate) fn new(stream: TcpStream, base: &SocketOptions) -> Result<Self, DriverError> {
        let peer = stream.peer_addr().map_err(map_io)?;
        let local = stream.local_addr().map_err(map_io)?;
        let mut socket = Self {
            io: Io::Whole(stream),
            opts: SocketOptions {
                receive: Some(ReceiveMode::Pull),
                framing: Some(Framing::LengthPrefixed),
                ..SocketOptions::default()
            },
            sink: None,
            pump: None,
            received: Arc::new(AtomicU64::new(0)),
            sent: 0,
            peer,
            local,
            stash: VecDeque::new(),
            eof_seen: false,
        };
        socket.apply_options(base)?;
        Ok(socket)
    }

    fn framing(&self) -> Framing {
        self.opts.framing.unwrap_or(Framing::LengthPrefixed)
    }

    async fn write_frame(&mut self, data: &[u8]) -> Result<(), DriverError> {
        let framing = self.framing();
        let writer: &mut (dyn tokio::io::AsyncWrite + Unpin + Send) = match &mut self.io {
            Io::Whole(stream) => stream,
            Io::Split { write } => write,
            Io::Closed => return Err(DriverError::Closed),
        };

        if framing == Framing::LengthPrefixed {
            let len = u32::try_from(data.len())
                .map_err(|_| DriverError::Io("frame too large".to_string()))?;
            writer.write_all(&len.to_be_bytes()).await.map_err(map_io)?;
        }
        writer.write_all(data).await.map_err(map_io)?;
        writer.flush().await.map_err(map_io)?;
        self.sent += 1;
        Ok(())
    }

    /// Move to push mode: split the stream and spawn the reader pump.
    fn start_pump(&mut self) -> Result<(), DriverError> {
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| DriverError::Io("event sink not installed".to_string()))?;

        match std::mem::replace(&mut self.io, Io::Closed) {
            Io::Whole(stream) => {
                let (mut read, write) = stream.into_split();
                self.io = Io::Split { write };

                let framing = self.framing();
                let received = Arc::clone(&self.received);
                self.pump = Some(tokio::spawn(async move {
                    loop {
                        match read_frame(&mut read, framing).await {
                            Ok(Some(payload)) => {
                                received.fetch_add(1, Ordering::Relaxed);
                                if sink.send(SocketEvent::Data(payload)).is_err() {
                                    break;
                                }
                            },
                            Ok(None) | Err(_) => {
                                let _ = sink.send(SocketEvent::Closed);
                                break;
                            },
                        }
                    }
                }));
                Ok(())
            },
            Io::Split { write } => {
                self.io = Io::Split { write };
                Ok(())
            },
            Io::Closed => Err(DriverError::Closed),
        }
    }
}

/// Read one frame; `Ok(None)` on orderly EOF.
async fn read_frame<R>(read: &mut R, framing: Framing) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    match framing {
        Framing::LengthPrefixed => {
            let mut header = [0u8; 4];
            match read.read_exact(&mut header).await {
                Ok(_) => {},
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(err) => return Err(err),
            }
            let len = u32::from_be_bytes(header) as usize;
            if len > MAX_FRAME {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds limit"));
            }
            let mut payload = vec![0u8; len];
            read.read_exact(&mut payload).await?;
            Ok(Some(Bytes::from(payload)))
        },
        Framing::Raw => {
            let mut chunk = vec![0u8; 64 * 1024];
            let n = read.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            chunk.truncate(n);
            Ok(Some(Bytes::from(chunk)))
        },
    }
}

#[async_trait]
impl DriverSocket for TcpLinkSocket {
    async fn send(&mut self, data: Bytes) -> Result<(), DriverError> {
        self.write_frame(&data).await
    }

    async fn send_forced(&mut self, data: Bytes) -> Result<(), DriverError> {
        // Writes here go straight to the kernel with no queue in front,
        // so a forced write is an ordinary framed write and flush.
        self.write_frame(&data).await
    }

    async fn recv(&mut self) -> Result<SocketEvent, DriverError> {
        if let Some(event) = self.stash.pop_front() {
            return Ok(event);
        }
        if self.eof_seen {
            return Ok(SocketEvent::Closed);
        }
        let framing = self.framing();
        let stream = match &mut self.io {
            Io::Whole(stream) => stream,
            Io::Split { .. } => {
                return Err(DriverError::Io("receive-readiness is push".to_string()));
            },
            Io::Closed => return Ok(SocketEvent::Closed),
        };
        match read_frame(stream, framing).await.map_err(map_io)? {
            Some(payload) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                Ok(SocketEvent::Data(payload))
            },
            None => {
                self.eof_seen = true;
                Ok(SocketEvent::Closed)
            },
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        match std::mem::replace(&mut self.io, Io::Closed) {
            Io::Whole(mut stream) => stream.shutdown().await.map_err(map_io),
            Io::Split { mut write } => write.shutdown().await.map_err(map_io),
            Io::Closed => Ok(()),
        }
    }

    fn apply_options(&mut self, delta: &SocketOptions) -> Result<(), DriverError> {
        if let Io::Whole(stream) = &self.io {
            if let Some(no_delay) = delta.no_delay {
                stream.set_nodelay(no_delay).map_err(map_io)?;
            }
            if let Some(keep_alive) = delta.keep_alive {
                socket2::SockRef::from(stream).set_keepalive(keep_alive).map_err(map_io)?;
            }
        }

        if delta.receive == Some(ReceiveMode::Push) && !matches!(self.io, Io::Split { .. }) {
            self.start_pump()?;
        }
        if delta.receive == Some(ReceiveMode::Pull) && matches!(self.io, Io::Split { .. }) {
            return Err(DriverError::Io("push delivery cannot be disabled".to_string()));
        }

        self.opts = self.opts.overlaid(delta);
        Ok(())
    }

    fn options(&self) -> SocketOptions {
        self.opts
    }

    fn raw_stats(&self) -> RawSocketStats {
        RawSocketStats {
            received: Some(self.received.load(Ordering::Relaxed)),
            sent: Some(self.sent),
            pending_sends: None,
        }
    }

    fn peer_addr(&self) -> Result<SocketAddr, DriverError> {
        Ok(self.peer)
    }

    fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        Ok(self.local)
    }

    fn take_buffered(&mut self) -> Vec<SocketEvent> {
        // In pull mode this driver never reads ahead: unclaimed bytes sit
        // in the kernel buffer and travel with the socket value. The
        // stash only holds events a previous owner left behind.
        self.stash.drain(..).collect()
    }

    fn set_event_sink(&mut self, sink: mpsc::UnboundedSender<SocketEvent>) {
        self.sink = Some(sink);
    }
}

impl Drop for TcpLinkSocket {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
