use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::network::PacketFrame;
use crate::TransportResult;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handle to one live connection.
///
/// The handle is shared between the server's registry, the connection's I/O
/// tasks, and the application listener. The listener must never tear a
/// connection down through this handle directly; closure goes through the
/// owning server, which keeps the registry and the disconnect notification
/// consistent.
///
/// Lifecycle is `Open -> Closing -> Closed`. `Closing` is entered on the
/// first of peer EOF, I/O error, protocol violation, or local close, and
/// stops all further read/write issuance. `Closed` is terminal and is
/// reached right before the single disconnect notification is emitted.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    outbound_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    close_requested: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        peer_addr: SocketAddr,
        outbound_tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Connection {
        Connection {
            id,
            peer_addr,
            outbound_tx,
            cancel,
            close_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.closed.load(Ordering::SeqCst)
    }

    /// Requests local closure. Packets still queued for delivery to the
    /// listener are suppressed from this point on; only the terminal
    /// disconnect notification follows.
    pub(crate) fn close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Stops both I/O halves without suppressing packets that already
    /// arrived. Used when the connection dies on its own (EOF, I/O error,
    /// malformed frame).
    pub(crate) fn cancel_io(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn enqueue_frame(&self, frame: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.outbound_tx.try_send(frame)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {} ({})", self.id, self.peer_addr)
    }
}

/// Read half of a connection's socket.
///
/// Buffers raw bytes from the stream until a complete frame can be parsed.
/// If the peer closes the connection gracefully, `None` is returned. If the
/// peer closes mid-frame, or a frame declares a length above the configured
/// limit, an error is returned and the connection should be closed.
#[derive(Debug)]
pub(crate) struct ConnectionReader {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl ConnectionReader {
    pub(crate) fn new(
        reader: OwnedReadHalf,
        read_buffer_size: usize,
        max_frame_size: usize,
    ) -> ConnectionReader {
        ConnectionReader {
            reader,
            buffer: BytesMut::with_capacity(read_buffer_size),
            max_frame_size,
        }
    }

    pub(crate) async fn read_frame(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            if let Some(payload) = PacketFrame::parse(&mut self.buffer, self.max_frame_size)? {
                return Ok(Some(payload));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    // peer has closed the connection gracefully
                    Ok(None)
                } else {
                    // peer closed the connection while sending a frame
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

/// Write half of a connection's socket.
///
/// Drains the ordered outbound queue. While a write is in flight newly
/// queued frames accumulate in the channel; once the current frame is
/// written, everything already queued is coalesced into the same flush.
/// Frames are written strictly in enqueue order.
#[derive(Debug)]
pub(crate) struct ConnectionWriter {
    writer: BufWriter<OwnedWriteHalf>,
    outbound_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl ConnectionWriter {
    pub(crate) fn new(
        writer: OwnedWriteHalf,
        outbound_rx: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> ConnectionWriter {
        ConnectionWriter {
            writer: BufWriter::new(writer),
            outbound_rx,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) -> TransportResult<()> {
        loop {
            let frame = tokio::select! {
                maybe_frame = self.outbound_rx.recv() => match maybe_frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            self.writer.write_all(&frame).await?;
            while let Ok(next) = self.outbound_rx.try_recv() {
                self.writer.write_all(&next).await?;
            }
            self.writer.flush().await?;
        }
        Ok(())
    }
}
