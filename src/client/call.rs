use crate::cancellation::CallScope;
use crate::config::Config;
use crate::connection::{Connection, ConnectionResult, FrameReader, FrameWriter};
use crate::errors::ConnectionError;
use crate::frames::payloads::RequestEnvelope;
use crate::frames::FrameKind;
use crate::metadata::Metadata;
use crate::method::{CallDescriptor, MethodType};
use crate::queue::{message_queue, QueueReader, QueueWriter};
use crate::signal::Latch;
use crate::status::{Code, Status};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Client side of one call.
///
/// Creating it spawns the call lifecycle: connect, send the request envelope, exchange
/// payloads, read the final status. Results are published through one-shot signals, so
/// any number of clones may wait on them.
#[derive(Debug, Clone)]
pub struct ClientCall {
    shared: Arc<CallShared>,
}

#[derive(Debug)]
struct CallShared {
    descriptor: CallDescriptor,
    scope: CallScope,
    /// Opened once the envelope is sent, for client streaming shapes.
    connected: Latch<Result<FrameWriter, Status>>,
    headers: Latch<Result<Metadata, Status>>,
    response: Latch<Result<Bytes, Status>>,
    status: Latch<Status>,
    responses: Mutex<Option<QueueReader>>,
    request_completed: AtomicBool,
    cancel_sent: AtomicBool,
}

impl ClientCall {
    pub(crate) fn start(
        descriptor: CallDescriptor,
        target: SocketAddr,
        config: Arc<Config>,
        request: Option<Bytes>,
        parent: Option<&CancellationToken>,
    ) -> ClientCall {
        let scope = CallScope::new(parent, descriptor.deadline());
        let (queue, responses) = message_queue(config.message_buffer_size);
        let shared = Arc::new(CallShared::new(descriptor, scope, responses));
        debug!(
            "Starting {} call {} to {}",
            shared.descriptor.method_type(),
            shared.descriptor.method_name(),
            target
        );
        let lifecycle = Lifecycle {
            shared: shared.clone(),
            target,
            config,
            queue,
            writer: None,
            response: None,
        };
        tokio::spawn(lifecycle.run(request));
        ClientCall { shared }
    }

    /// Call that already ended with `status`. Never touches the network.
    pub(crate) fn failed(descriptor: CallDescriptor, status: Status) -> ClientCall {
        debug!("Call {} failed before start: {}", descriptor.method_name(), status);
        let (mut queue, responses) = message_queue(1);
        let shared = Arc::new(CallShared::new(descriptor, CallScope::new(None, None), responses));
        shared.finish(status, None, &mut queue);
        ClientCall { shared }
    }

    pub fn method_name(&self) -> &str {
        self.shared.descriptor.method_name()
    }

    pub fn method_type(&self) -> MethodType {
        self.shared.descriptor.method_type()
    }

    /// Single response message of unary and client streaming calls.
    pub async fn response(&self) -> Result<Bytes, Status> {
        self.shared.response.wait().await
    }

    /// Response headers. Resolves to empty headers when the server sent none.
    pub async fn headers(&self) -> Result<Metadata, Status> {
        self.shared.headers.wait().await
    }

    /// Final status, waiting for the call to end.
    pub async fn status(&self) -> Status {
        self.shared.status.wait().await
    }

    pub async fn trailers(&self) -> Metadata {
        self.status().await.trailers().clone().unwrap_or_default()
    }

    /// Cancels the call. The server gets a best effort cancel notice.
    pub fn cancel(&self) {
        self.shared.scope.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.scope.is_cancelled()
    }

    /// Response queue of server streaming shapes. Can be taken once.
    pub(crate) fn take_responses(&self) -> Option<QueueReader> {
        match self.shared.responses.lock() {
            Ok(mut responses) => responses.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Sends one request message of a client streaming call.
    pub async fn write_request(&self, payload: Bytes) -> Result<(), Status> {
        let writer = self.shared.connected.wait().await.map_err(completed)?;
        if let Some(status) = self.shared.status.get() {
            return Err(completed(status));
        }
        if self.shared.request_completed.load(Ordering::SeqCst) {
            return Err(Status::with_code(
                Code::FailedPrecondition,
                "Request stream already completed",
            ));
        }
        let token = self.shared.scope.token();
        let result = async {
            let mut guard = writer.lock(token).await?;
            guard.write_data(FrameKind::RequestData, payload, token).await
        }
        .await;
        result.map_err(|err| self.shared.write_failure(err))
    }

    /// Signals end of the request stream. Later calls are no-ops.
    pub async fn complete_requests(&self) -> Result<(), Status> {
        let writer = self.shared.connected.wait().await.map_err(completed)?;
        if self.shared.request_completed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(status) = self.shared.status.get() {
            return Err(completed(status));
        }
        let token = self.shared.scope.token();
        let result = async {
            let mut guard = writer.lock(token).await?;
            guard.write_frame(FrameKind::RequestComplete, token).await
        }
        .await;
        trace!("Request stream of {} completed", self.method_name());
        result.map_err(|err| self.shared.write_failure(err))
    }
}

/// Error for a write attempted after the call ended.
fn completed(status: Status) -> Status {
    match status.is_ok() {
        true => Status::with_code(Code::FailedPrecondition, "Call already completed"),
        false => status,
    }
}

impl CallShared {
    fn new(descriptor: CallDescriptor, scope: CallScope, responses: QueueReader) -> CallShared {
        CallShared {
            descriptor,
            scope,
            connected: Latch::new(),
            headers: Latch::new(),
            response: Latch::new(),
            status: Latch::new(),
            responses: Mutex::new(Some(responses)),
            request_completed: AtomicBool::new(false),
            cancel_sent: AtomicBool::new(false),
        }
    }

    fn write_failure(&self, err: ConnectionError) -> Status {
        match self.status.get() {
            Some(status) if !status.is_ok() => status,
            _ if self.scope.is_cancelled() => self.scope.status(),
            _ => Status::from(err),
        }
    }

    /// Publishes the final status, then releases every other waiter.
    fn finish(&self, status: Status, response: Option<Bytes>, queue: &mut QueueWriter) {
        if !self.status.release(status.clone()) {
            return;
        }
        debug!("Call {} finished with {}", self.descriptor.method_name(), status);
        let outcome = status.clone().into_result();
        self.headers
            .release(outcome.clone().map(|()| Metadata::new()));
        self.response.release(match (outcome, response) {
            (Ok(()), Some(payload)) => Ok(payload),
            (Ok(()), None) => Err(Status::internal("Call completed without a response message")),
            (Err(status), _) => Err(status),
        });
        self.connected.release(Err(status.clone()));
        match status.is_ok() {
            true => queue.complete(),
            false => queue.fail(status),
        }
    }

    /// Best effort `RequestCancel`, bounded by the grace window past the deadline.
    async fn send_cancel(&self, writer: &FrameWriter, config: &Config) {
        if self.cancel_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let (grace, timer) = self.scope.grace_token(config.cancel_grace);
        let sent: ConnectionResult<()> = async {
            let mut guard = writer.lock(&grace).await?;
            guard.write_frame(FrameKind::RequestCancel, &grace).await
        }
        .await;
        timer.abort();
        match sent {
            Ok(()) => debug!("Sent cancel notice for {}", self.descriptor.method_name()),
            Err(err) => warn!(
                "Cancel notice for {} not delivered: {}",
                self.descriptor.method_name(),
                err
            ),
        }
    }
}

struct Lifecycle {
    shared: Arc<CallShared>,
    target: SocketAddr,
    config: Arc<Config>,
    queue: QueueWriter,
    writer: Option<FrameWriter>,
    response: Option<Bytes>,
}

impl Lifecycle {
    async fn run(mut self, request: Option<Bytes>) {
        let status = match self.exchange(request).await {
            Ok(status) => status,
            Err(err) if self.shared.scope.is_cancelled() => {
                trace!("Call {} interrupted: {}", self.shared.descriptor.method_name(), err);
                if let Some(writer) = &self.writer {
                    self.shared.send_cancel(writer, &self.config).await;
                }
                self.shared.scope.status()
            }
            Err(err) if self.shared.scope.deadline_passed() => {
                debug!(
                    "Call {} lost its connection past the deadline: {}",
                    self.shared.descriptor.method_name(),
                    err
                );
                Status::deadline_exceeded("Deadline exceeded")
            }
            Err(err) => {
                debug!("Call {} failed: {}", self.shared.descriptor.method_name(), err);
                Status::from(err)
            }
        };
        self.shared
            .finish(status, self.response.take(), &mut self.queue);
        if let Some(writer) = self.writer.take() {
            writer.close(self.config.close_timeout).await;
        }
    }

    async fn exchange(&mut self, request: Option<Bytes>) -> ConnectionResult<Status> {
        let token = self.shared.scope.token().clone();
        let descriptor = &self.shared.descriptor;
        let client_streaming = descriptor.method_type().client_streaming();
        let connection = Connection::connect(self.target, &self.config, &token).await?;
        let (mut reader, writer) = connection.split();
        self.writer = Some(writer.clone());
        {
            let mut guard = writer.lock(&token).await?;
            let envelope = RequestEnvelope::new(
                descriptor.method_name().clone(),
                descriptor.headers().clone(),
                descriptor.deadline(),
            );
            guard.write_typed(envelope, &token).await?;
            match (client_streaming, request) {
                (true, _) => {}
                (false, Some(payload)) => {
                    guard
                        .write_data(FrameKind::RequestData, payload, &token)
                        .await?
                }
                (false, None) => {
                    return Err(ConnectionError::Internal(format!(
                        "Missing request message for {} call",
                        descriptor.method_type()
                    )))
                }
            }
        }
        if client_streaming {
            self.shared.connected.release(Ok(writer));
        }
        self.read_responses(&mut reader, &token).await
    }

    /// Reads frames until `ResponseComplete`, returning the status it carries.
    async fn read_responses(
        &mut self,
        reader: &mut FrameReader,
        token: &CancellationToken,
    ) -> ConnectionResult<Status> {
        let server_streaming = self.shared.descriptor.method_type().server_streaming();
        loop {
            match reader.read_frame(token).await? {
                FrameKind::ResponseHeaders => {
                    let headers = reader.read_typed::<Metadata>(token).await?;
                    trace!("Received {} response headers", headers.len());
                    if !self.shared.headers.release(Ok(headers)) {
                        return Err(ConnectionError::Internal(
                            "Response headers after headers or data".to_owned(),
                        ));
                    }
                }
                FrameKind::ResponseData => {
                    let payload = reader.read_blob(token).await?;
                    // Data without explicit headers implies empty headers.
                    self.shared.headers.release(Ok(Metadata::new()));
                    if server_streaming {
                        if !self.queue.push(payload, token).await? {
                            trace!("Response stream dropped, discarding message");
                        }
                    } else if self.response.replace(payload).is_some() {
                        return Err(ConnectionError::Internal(
                            "More than one response message".to_owned(),
                        ));
                    }
                }
                FrameKind::ResponseComplete => return reader.read_typed::<Status>(token).await,
                other => {
                    return Err(ConnectionError::Internal(format!(
                        "Unexpected {:?} frame from server",
                        other
                    )))
                }
            }
        }
    }
}
