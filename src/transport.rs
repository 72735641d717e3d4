//! Connection manager and transport trait seam.
//!
//! The notifier core drives its connection through three small traits:
//!
//! - [`ConnectionManager`] — owns the socket lifecycle: `start`, an async
//!   `connect` taking an acceptor callback, an abrupt `stop`, and a
//!   graceful `shutdown`.
//! - [`Connection`] — a live connection handle: `send_frame` and `close`.
//! - [`ConnectionEvents`] — the sink the manager drives: `opened` once
//!   after accept, `recv_frame` per inbound frame, `closed` on remote
//!   closure.
//!
//! [`TcpConnectionManager`] is the production implementation: tokio TCP
//! with optional TLS, frames delimited by a u32 length prefix. A local
//! `close()` does not fire the `closed` event; only remote EOF or a read
//! error does, so teardown initiated on this side is never double-reported.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};

use crate::config::{HubEndpoint, TlsClient};
use crate::constants::SHUTDOWN_DRAIN_TIMEOUT;

/// Errors from the transport layer.
#[derive(Debug)]
pub enum TransportError {
    /// Establishing the connection failed.
    Connect(String),
    /// A connection is already active.
    AlreadyConnected,
    /// Sending a frame failed.
    Send(String),
    /// The connection is closed.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(detail) => write!(f, "connect failed: {detail}"),
            Self::AlreadyConnected => write!(f, "a connection is already active"),
            Self::Send(detail) => write!(f, "send failed: {detail}"),
            Self::Closed => write!(f, "connection is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A live connection handle.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Send`] on I/O failure or
    /// [`TransportError::Closed`] after `close`.
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Idempotent; never fails; does not fire the
    /// `closed` event.
    async fn close(&self);
}

/// Event sink for one connection, driven by the manager.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// Fired once after the connection is accepted, before any frame.
    async fn opened(&self);

    /// Fired for every inbound frame.
    async fn recv_frame(&self, frame: Bytes);

    /// Fired when the connection closes remotely (EOF or read error).
    async fn closed(&self, reason: Option<String>);
}

/// Shared connection handle type.
pub type ConnectionHandle = Arc<dyn Connection>;

/// Shared event-sink handle type.
pub type EventsHandle = Arc<dyn ConnectionEvents>;

/// Callback constructing the event sink for a freshly accepted connection.
pub type Acceptor = Box<dyn FnOnce(ConnectionHandle) -> EventsHandle + Send>;

/// Connection lifecycle owner.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Initialize the manager. Must precede `connect`.
    ///
    /// # Errors
    ///
    /// Implementation-specific initialization failures.
    fn start(&self) -> Result<(), TransportError>;

    /// Open a connection to `endpoint`, wrapping it with `tls` when given.
    ///
    /// The `acceptor` is invoked with the connection handle once the
    /// transport is established; the returned sink then receives `opened`,
    /// every inbound frame, and remote closure.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AlreadyConnected`] when a connection is
    /// live, or [`TransportError::Connect`] on TCP/TLS failure.
    async fn connect(
        &self,
        endpoint: &HubEndpoint,
        acceptor: Acceptor,
        tls: Option<TlsClient>,
    ) -> Result<(), TransportError>;

    /// Tear the connection down abruptly: cancel the reader and drop the
    /// socket without draining.
    async fn stop(&self);

    /// Close the connection gracefully: flush pending writes (bounded by
    /// the drain timeout), then close.
    async fn shutdown(&self);
}

/// Byte stream the manager reads and writes; TCP or TLS-over-TCP.
trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type BoxedIo = Box<dyn Io>;
type Writer = FramedWrite<WriteHalf<BoxedIo>, LengthDelimitedCodec>;
type Reader = FramedRead<ReadHalf<BoxedIo>, LengthDelimitedCodec>;

/// One live TCP (or TLS) connection.
struct TcpConnection {
    writer: Mutex<Option<Writer>>,
    cancel: CancellationToken,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer
                .send(frame)
                .await
                .map_err(|e| TransportError::Send(e.to_string())),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.close().await {
                log::debug!("error closing connection writer: {e}");
            }
        }
    }
}

struct Active {
    conn: Arc<TcpConnection>,
    reader: JoinHandle<()>,
}

/// Tokio TCP connection manager with optional TLS.
///
/// Manages at most one live connection. The reader task forwards inbound
/// frames to the event sink and reports remote closure; local teardown
/// goes through [`ConnectionManager::stop`] / [`ConnectionManager::shutdown`].
#[derive(Default)]
pub struct TcpConnectionManager {
    active: Mutex<Option<Active>>,
}

impl fmt::Debug for TcpConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnectionManager").finish_non_exhaustive()
    }
}

impl TcpConnectionManager {
    /// Create a manager with no active connection.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionManager for TcpConnectionManager {
    fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(
        &self,
        endpoint: &HubEndpoint,
        acceptor: Acceptor,
        tls: Option<TlsClient>,
    ) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        log::debug!("connecting to {} ({})", endpoint.hostname, endpoint.addr);
        let tcp = TcpStream::connect(endpoint.addr)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Err(e) = tcp.set_nodelay(true) {
            log::debug!("could not set TCP_NODELAY: {e}");
        }

        let io: BoxedIo = match tls {
            Some(tls) => Box::new(
                tls.wrap(tcp, &endpoint.hostname)
                    .await
                    .map_err(|e| TransportError::Connect(format!("TLS handshake: {e}")))?,
            ),
            None => Box::new(tcp),
        };

        let (read_half, write_half) = tokio::io::split(io);
        let codec = LengthDelimitedCodec::new;
        let reader = FramedRead::new(read_half, codec());
        let writer = FramedWrite::new(write_half, codec());

        let cancel = CancellationToken::new();
        let conn = Arc::new(TcpConnection {
            writer: Mutex::new(Some(writer)),
            cancel: cancel.clone(),
        });

        let events = acceptor(Arc::clone(&conn) as ConnectionHandle);
        events.opened().await;

        let reader_task = tokio::spawn(read_loop(reader, events, cancel));
        *active = Some(Active {
            conn,
            reader: reader_task,
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(active) = self.active.lock().await.take() {
            log::debug!("stopping connection");
            active.conn.cancel.cancel();
            // Drop the writer without flushing.
            let _ = active.conn.writer.lock().await.take();
            drop(active.reader);
        }
    }

    async fn shutdown(&self) {
        if let Some(active) = self.active.lock().await.take() {
            log::debug!("shutting down connection");
            let conn = Arc::clone(&active.conn);
            let drain = async move {
                let mut guard = conn.writer.lock().await;
                if let Some(mut writer) = guard.take() {
                    if let Err(e) = writer.close().await {
                        log::debug!("error draining connection writer: {e}");
                    }
                }
            };
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain)
                .await
                .is_err()
            {
                log::warn!("shutdown drain timed out; dropping connection");
            }
            active.conn.cancel.cancel();
        }
    }
}

/// Forward inbound frames to the event sink until cancellation or remote
/// closure. Cancellation is silent; remote EOF and read errors fire
/// `closed`.
async fn read_loop(mut reader: Reader, events: EventsHandle, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                log::debug!("reader cancelled");
                return;
            }
            frame = reader.next() => match frame {
                Some(Ok(bytes)) => events.recv_frame(bytes.freeze()).await,
                Some(Err(e)) => {
                    log::debug!("read error: {e}");
                    events.closed(Some(e.to_string())).await;
                    return;
                }
                None => {
                    log::debug!("remote end closed the connection");
                    events.closed(None).await;
                    return;
                }
            }
        }
    }
}
