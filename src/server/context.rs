use crate::cancellation::{expiring_token, CallScope};
use crate::connection::{ConnectionResult, FrameWriter, WriteGuard};
use crate::errors::ConnectionError;
use crate::frames::FrameKind;
use crate::metadata::{Metadata, MetadataValue};
use crate::status::{Code, Status};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Server side view of one call, handed to every handler.
#[derive(Debug, Getters, CopyGetters)]
pub struct ServerCallContext {
    /// Full method name.
    #[get = "pub"]
    method: String,
    /// Local address the call was accepted on.
    #[getset(get_copy = "pub")]
    host: SocketAddr,
    #[getset(get_copy = "pub")]
    peer: SocketAddr,
    #[getset(get_copy = "pub")]
    deadline: Option<SystemTime>,
    #[get = "pub"]
    request_headers: Metadata,
    #[get = "pub(crate)"]
    scope: CallScope,
    #[get = "pub(crate)"]
    response_writer: ResponseWriter,
    trailers: Mutex<Metadata>,
}

impl ServerCallContext {
    pub(crate) fn new(
        method: String,
        host: SocketAddr,
        peer: SocketAddr,
        request_headers: Metadata,
        scope: CallScope,
        writer: FrameWriter,
    ) -> ServerCallContext {
        ServerCallContext {
            method,
            host,
            peer,
            deadline: scope.deadline(),
            request_headers,
            response_writer: ResponseWriter::new(writer, scope.clone()),
            scope,
            trailers: Mutex::new(Metadata::new()),
        }
    }

    /// Fires on client cancel, deadline or server shutdown.
    pub fn cancellation_token(&self) -> &CancellationToken {
        self.scope.token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.scope.cancelled().await
    }

    /// Sends response headers. Allowed once, before the first response message.
    pub async fn write_response_headers(&self, headers: Metadata) -> Result<(), Status> {
        self.response_writer.write_headers(headers).await
    }

    /// Adds a trailer sent with the final OK status.
    pub async fn append_trailer<KEY: AsRef<str>, VALUE: Into<MetadataValue>>(&self, key: KEY, value: VALUE) {
        self.trailers.lock().await.append(key, value);
    }

    pub async fn trailers(&self) -> Metadata {
        self.trailers.lock().await.clone()
    }

    pub(crate) async fn take_trailers(&self) -> Metadata {
        std::mem::take(&mut *self.trailers.lock().await)
    }
}

/// Writes response frames of one call under the connection's write lock.
///
/// Nothing is written once the call scope is cancelled: the scope is checked before and
/// after taking the lock. The one exception is the `DeadlineExceeded` status of an
/// expired call. The final status is written at most once, after which every write fails.
#[derive(Debug, Clone)]
pub(crate) struct ResponseWriter {
    writer: FrameWriter,
    scope: CallScope,
    data_started: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
}

impl ResponseWriter {
    fn new(writer: FrameWriter, scope: CallScope) -> ResponseWriter {
        ResponseWriter {
            writer,
            scope,
            data_started: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn write_headers(&self, headers: Metadata) -> Result<(), Status> {
        let mut guard = self.lock().await?;
        if self.data_started.swap(true, Ordering::SeqCst) {
            return Err(Status::with_code(
                Code::FailedPrecondition,
                "Response headers already sent",
            ));
        }
        guard
            .write_headers(headers, self.scope.token())
            .await
            .map_err(|err| self.failure(err))
    }

    pub async fn write_message(&self, payload: Bytes) -> Result<(), Status> {
        let mut guard = self.lock().await?;
        self.data_started.store(true, Ordering::SeqCst);
        guard
            .write_data(FrameKind::ResponseData, payload, self.scope.token())
            .await
            .map_err(|err| self.failure(err))
    }

    /// Writes `ResponseComplete` with `status`, ending the call.
    pub async fn write_status(&self, status: Status) -> Result<(), Status> {
        let mut guard = self.lock().await?;
        self.completed.store(true, Ordering::SeqCst);
        trace!("Writing {}", status);
        guard
            .write_status(status, self.scope.token())
            .await
            .map_err(|err| self.failure(err))
    }

    /// Ends a call whose deadline passed with `DeadlineExceeded`, unless a status is out.
    ///
    /// The scope is cancelled at this point, so the write runs under its own token that
    /// expires after `timeout`.
    pub async fn write_deadline_exceeded(&self, timeout: Duration) {
        let (stop, timer) = expiring_token(Instant::now() + timeout);
        let written: ConnectionResult<()> = async {
            let mut guard = self.writer.lock(&stop).await?;
            if self.completed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            guard
                .write_status(Status::deadline_exceeded("Deadline exceeded"), &stop)
                .await
        }
        .await;
        timer.abort();
        if let Err(err) = written {
            debug!("Failed to report exceeded deadline: {}", err);
        }
    }

    async fn lock(&self) -> Result<WriteGuard<'_>, Status> {
        if self.scope.is_cancelled() {
            return Err(self.scope.status());
        }
        let guard = self
            .writer
            .lock(self.scope.token())
            .await
            .map_err(|err| self.failure(err))?;
        if self.scope.is_cancelled() {
            return Err(self.scope.status());
        }
        if self.completed.load(Ordering::SeqCst) {
            return Err(Status::with_code(
                Code::FailedPrecondition,
                "Call already completed",
            ));
        }
        Ok(guard)
    }

    fn failure(&self, err: ConnectionError) -> Status {
        match self.scope.is_cancelled() {
            true => self.scope.status(),
            false => Status::from(err),
        }
    }
}
