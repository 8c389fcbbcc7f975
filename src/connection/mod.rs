use crate::config::Config;
use crate::errors::{CodecError, ConnectionError};
use crate::frames::payloads::Codec;
use crate::frames::{BlobCodec, Frame, FrameKind};
use crate::metadata::Metadata;
use crate::status::Status;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

pub type ConnectionResult<T> = Result<T, ConnectionError>;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// One call's byte-stream connection, framed into length-prefixed units.
///
/// Split into a [`FrameReader`] owned by the single reading loop and a cloneable
/// [`FrameWriter`] whose lock every writer must hold.
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Connection {
    pub fn new<R, W>(read: R, write: W, peer: SocketAddr, max_frame_length: usize) -> Connection
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = BlobCodec::new(max_frame_length);
        let read: BoxedRead = Box::new(read);
        let write: BoxedWrite = Box::new(write);
        Connection {
            reader: FrameReader {
                framed: FramedRead::new(read, codec.clone()),
                peer,
                interrupted: false,
            },
            writer: FrameWriter {
                state: Arc::new(Mutex::new(WriterState {
                    framed: Some(FramedWrite::new(write, codec)),
                    interrupted: false,
                })),
                peer,
            },
        }
    }

    pub fn from_stream(stream: TcpStream, max_frame_length: usize) -> ConnectionResult<Connection> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Connection::new(read, write, peer, max_frame_length))
    }

    /// Connects to `addr`, retrying refused attempts until `connect_timeout` elapses.
    pub async fn connect(
        addr: SocketAddr,
        config: &Config,
        cancel: &CancellationToken,
    ) -> ConnectionResult<Connection> {
        let give_up_at = Instant::now() + config.connect_timeout;
        loop {
            debug!("Connecting to {}", addr);
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                attempt = tokio::time::timeout_at(give_up_at, TcpStream::connect(addr)) => attempt,
            };
            let err = match attempt {
                Ok(Ok(stream)) => return Connection::from_stream(stream, config.max_frame_length),
                Ok(Err(err)) => err,
                Err(_elapsed) => {
                    return Err(ConnectionError::Unavailable(format!(
                        "Timed out connecting to {}",
                        addr
                    )))
                }
            };
            if !is_transient(err.kind())
                || Instant::now() + config.connect_retry_interval >= give_up_at
            {
                return Err(ConnectionError::Unavailable(format!(
                    "Failed to connect to {}: {}",
                    addr, err
                )));
            }
            trace!("Connect to {} failed ({}), retrying", addr, err);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                _ = tokio::time::sleep(config.connect_retry_interval) => {}
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.reader.peer
    }

    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::ConnectionRefused | ErrorKind::NotConnected)
}

/// Read side. Only ever used by one loop at a time, so it needs no lock.
pub struct FrameReader {
    framed: FramedRead<BoxedRead, BlobCodec>,
    peer: SocketAddr,
    interrupted: bool,
}

impl FrameReader {
    /// Reads one whole unit.
    ///
    /// End of stream is reported as `Unavailable`. A cancelled read leaves the reader
    /// interrupted: every later read fails without touching the socket.
    pub async fn read_blob(&mut self, cancel: &CancellationToken) -> ConnectionResult<Bytes> {
        if self.interrupted {
            return Err(ConnectionError::Interrupted("read"));
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = self.framed.next() => Some(next),
        };
        match next {
            None => {
                self.interrupted = true;
                Err(ConnectionError::Cancelled)
            }
            Some(Some(Ok(blob))) => {
                trace!("Read {} bytes from {}", blob.len(), self.peer);
                Ok(blob)
            }
            Some(Some(Err(err))) => Err(ConnectionError::from(err)),
            Some(None) => Err(ConnectionError::Unavailable(format!(
                "Connection closed by {}",
                self.peer
            ))),
        }
    }

    pub async fn read_typed<T: Codec>(&mut self, cancel: &CancellationToken) -> ConnectionResult<T> {
        let mut blob = self.read_blob(cancel).await?;
        Ok(T::decode(&mut blob)?)
    }

    pub async fn read_frame(&mut self, cancel: &CancellationToken) -> ConnectionResult<FrameKind> {
        Ok(self.read_typed::<Frame>(cancel).await?.kind())
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Debug for FrameReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("peer", &self.peer)
            .field("interrupted", &self.interrupted)
            .finish()
    }
}

struct WriterState {
    framed: Option<FramedWrite<BoxedWrite, BlobCodec>>,
    interrupted: bool,
}

/// Write side, shared by every writer of a call. The mutex is the call's write lock.
#[derive(Clone)]
pub struct FrameWriter {
    state: Arc<Mutex<WriterState>>,
    peer: SocketAddr,
}

impl FrameWriter {
    /// Acquires the write lock.
    pub async fn lock(&self, cancel: &CancellationToken) -> ConnectionResult<WriteGuard<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            state = self.state.lock() => Ok(WriteGuard { state, peer: self.peer }),
        }
    }

    /// Flushes pending units (bounded by `timeout`) and closes the write side.
    ///
    /// Interrupted writers are closed without flushing, so a partially written unit never
    /// reaches the peer. Safe to call more than once.
    pub async fn close(&self, timeout: Duration) {
        let mut state = match tokio::time::timeout(timeout, self.state.lock()).await {
            Ok(state) => state,
            Err(_) => {
                debug!("Write lock for {} still held, closing on drop", self.peer);
                return;
            }
        };
        let interrupted = state.interrupted;
        state.interrupted = true;
        if let Some(mut framed) = state.framed.take() {
            if interrupted {
                debug!("Closing interrupted connection to {} without flush", self.peer);
                return;
            }
            match tokio::time::timeout(timeout, framed.close()).await {
                Ok(Ok(())) => trace!("Closed connection to {}", self.peer),
                Ok(Err(err)) => debug!("Failed to close connection to {}: {}", self.peer, err),
                Err(_) => debug!("Flush to {} timed out, dropping connection", self.peer),
            }
        }
    }

    pub async fn is_interrupted(&self) -> bool {
        self.state.lock().await.interrupted
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Debug for FrameWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("peer", &self.peer)
            .finish()
    }
}

/// Held write lock. Every method writes whole units and flushes them.
pub struct WriteGuard<'a> {
    state: MutexGuard<'a, WriterState>,
    peer: SocketAddr,
}

impl WriteGuard<'_> {
    pub async fn write_blob(&mut self, blob: Bytes, cancel: &CancellationToken) -> ConnectionResult<()> {
        self.write_units(vec![blob], cancel).await
    }

    pub async fn write_typed<T: Codec>(&mut self, message: T, cancel: &CancellationToken) -> ConnectionResult<()> {
        let blob = message.encode_bytes()?;
        self.write_blob(blob, cancel).await
    }

    /// Marker without body (`RequestCancel`, `RequestComplete`).
    pub async fn write_frame(&mut self, kind: FrameKind, cancel: &CancellationToken) -> ConnectionResult<()> {
        let marker = Frame::new(kind).encode_bytes()?;
        self.write_units(vec![marker], cancel).await
    }

    /// Data marker immediately followed by its payload blob.
    pub async fn write_data(
        &mut self,
        kind: FrameKind,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> ConnectionResult<()> {
        let marker = Frame::new(kind).encode_bytes()?;
        self.write_units(vec![marker, payload], cancel).await
    }

    pub async fn write_headers(&mut self, headers: Metadata, cancel: &CancellationToken) -> ConnectionResult<()> {
        let marker = Frame::new(FrameKind::ResponseHeaders).encode_bytes()?;
        let headers = headers.encode_bytes()?;
        self.write_units(vec![marker, headers], cancel).await
    }

    pub async fn write_status(&mut self, status: Status, cancel: &CancellationToken) -> ConnectionResult<()> {
        let marker = Frame::new(FrameKind::ResponseComplete).encode_bytes()?;
        let status = status.encode_bytes()?;
        self.write_units(vec![marker, status], cancel).await
    }

    async fn write_units(&mut self, units: Vec<Bytes>, cancel: &CancellationToken) -> ConnectionResult<()> {
        let state = &mut *self.state;
        if state.interrupted {
            return Err(ConnectionError::Interrupted("write"));
        }
        let framed = match state.framed.as_mut() {
            Some(framed) => framed,
            None => return Err(ConnectionError::Interrupted("write")),
        };
        let mut units = futures::stream::iter(units.into_iter().map(Ok::<Bytes, CodecError>));
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            sent = framed.send_all(&mut units) => Some(sent),
        };
        match sent {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => {
                debug!("Failed to write to {}: {}", self.peer, err);
                Err(ConnectionError::from(err))
            }
            None => {
                state.interrupted = true;
                Err(ConnectionError::Cancelled)
            }
        }
    }
}
