//! Per-connection socket tasks.
//!
//! Each accepted TCP stream is split into a read task, which turns incoming
//! chunks into [`ProxyEvent`]s, and a write task, which drains an unbounded
//! queue of outbound bytes. The dispatcher only ever sees the outbound half
//! through the [`Transport`] trait.
//!
//! Closing lets the write task flush what is already queued, for at most the
//! flush timeout; a peer that stops reading cannot hold the socket open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::READ_BUFFER_SIZE;
use crate::error::{ProxyError, ProxyResult};

use super::events::ProxyEvent;
use super::registry::{ConnectionId, Delivery, Transport};

/// Outbound half of an accepted TCP connection.
pub struct TcpConnection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    /// Queue towards the write task; `None` once closed.
    write_tx: Option<UnboundedSender<Bytes>>,
    /// Bytes queued but not yet written to the socket.
    queued: Arc<AtomicUsize>,
    /// Stops the read task and starts the flush deadline.
    cancel: CancellationToken,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.write_tx.is_none())
            .finish_non_exhaustive()
    }
}

/// Inbound half, not yet reading.
///
/// Kept separate so the accept loop can announce the connection before any
/// of its bytes are reported.
#[derive(Debug)]
pub(crate) struct ConnectionReader {
    id: ConnectionId,
    reader: OwnedReadHalf,
    cancel: CancellationToken,
}

impl TcpConnection {
    /// Split `stream` and start its write task.
    ///
    /// The read side is returned unstarted; call [`ConnectionReader::spawn`]
    /// once the connection has been handed to the dispatcher. Cancelling
    /// `parent` stops the read task. After close, queued bytes are written
    /// for at most `flush_timeout`.
    pub(crate) fn open(
        id: ConnectionId,
        stream: TcpStream,
        parent: &CancellationToken,
        flush_timeout: Duration,
    ) -> (Self, ConnectionReader) {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Bytes>();
        let queued = Arc::new(AtomicUsize::new(0));
        let cancel = parent.child_token();

        tokio::spawn(Self::write_loop(
            id,
            write_half,
            write_rx,
            Arc::clone(&queued),
            cancel.clone(),
            flush_timeout,
        ));

        (
            Self {
                id,
                peer,
                write_tx: Some(write_tx),
                queued,
                cancel: cancel.clone(),
            },
            ConnectionReader {
                id,
                reader: read_half,
                cancel,
            },
        )
    }

    /// Remote address, if the socket reported one.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Write loop: drains the queue, then shuts the socket's write side.
    ///
    /// Once `closing` fires the drain gets `flush_timeout` to finish; after
    /// that the write half is dropped with whatever is still queued.
    async fn write_loop(
        id: ConnectionId,
        mut writer: OwnedWriteHalf,
        mut write_rx: UnboundedReceiver<Bytes>,
        queued: Arc<AtomicUsize>,
        closing: CancellationToken,
        flush_timeout: Duration,
    ) {
        let flushed = {
            let drain = async {
                while let Some(bytes) = write_rx.recv().await {
                    let len = bytes.len();
                    if let Err(e) = writer.write_all(&bytes).await {
                        log::warn!("[Conn {id}] Write error: {e}");
                        return false;
                    }
                    queued.fetch_sub(len, Ordering::Relaxed);
                }
                true
            };
            tokio::pin!(drain);

            tokio::select! {
                flushed = &mut drain => flushed,
                () = async {
                    closing.cancelled().await;
                    tokio::time::sleep(flush_timeout).await;
                } => {
                    log::warn!(
                        "[Conn {id}] Peer not reading, dropping {} queued bytes after {flush_timeout:?}",
                        queued.load(Ordering::Relaxed)
                    );
                    false
                }
            }
        };

        if flushed {
            if let Err(e) = writer.shutdown().await {
                log::debug!("[Conn {id}] Shutdown after flush failed: {e}");
            }
        }
    }
}

impl Transport for TcpConnection {
    fn send(&self, bytes: Bytes) -> ProxyResult<Delivery> {
        let write_tx = self
            .write_tx
            .as_ref()
            .ok_or(ProxyError::ConnectionClosed(self.id))?;
        let len = bytes.len();
        let queued_bytes = self.queued.fetch_add(len, Ordering::Relaxed) + len;
        if write_tx.send(bytes).is_err() {
            // Write task is gone after a socket error.
            self.queued.fetch_sub(len, Ordering::Relaxed);
            return Err(ProxyError::ConnectionClosed(self.id));
        }
        Ok(Delivery { queued_bytes })
    }

    fn close(&mut self) {
        // Dropping the sender lets the write task flush what is queued.
        if self.write_tx.take().is_some() {
            self.cancel.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.write_tx.is_none()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ConnectionReader {
    /// Start reading, reporting every chunk to the dispatcher loop.
    pub(crate) fn spawn(self, event_tx: UnboundedSender<ProxyEvent>) -> JoinHandle<()> {
        tokio::spawn(self.read_loop(event_tx))
    }

    async fn read_loop(mut self, event_tx: UnboundedSender<ProxyEvent>) {
        let id = self.id;
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            buf.reserve(READ_BUFFER_SIZE);
            let read = tokio::select! {
                () = self.cancel.cancelled() => break,
                read = self.reader.read_buf(&mut buf) => read,
            };

            let event = match read {
                Ok(0) => {
                    log::debug!("[Conn {id}] EOF");
                    let _ = event_tx.send(ProxyEvent::Closed { id });
                    break;
                }
                Ok(_) => ProxyEvent::Data {
                    id,
                    bytes: buf.split().freeze(),
                },
                Err(error) => {
                    let _ = event_tx.send(ProxyEvent::Failed { id, error });
                    break;
                }
            };
            if event_tx.send(event).is_err() {
                break; // dispatcher gone
            }
        }
    }
}
