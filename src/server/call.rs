use crate::cancellation::{CallScope, CancelReason};
use crate::config::Config;
use crate::connection::{ConnectionResult, FrameReader};
use crate::errors::ConnectionError;
use crate::frames::FrameKind;
use crate::handler::{CallHandler, HandlerInput};
use crate::queue::{message_queue, QueueWriter};
use crate::server::context::{ResponseWriter, ServerCallContext};
use crate::status::Status;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How reading the client side of a call ended.
#[derive(Debug)]
enum ReadEnd {
    /// `RequestCancel`, or the client went away.
    Cancelled,
    /// Frame not allowed in this state.
    Violation(String),
    /// Stopped locally.
    Stopped,
}

/// Runs one dispatched call: reads the request side, runs the handler and writes the
/// final status. The connection is closed by the caller.
pub(crate) async fn serve(
    handler: Arc<dyn CallHandler>,
    context: ServerCallContext,
    mut reader: FrameReader,
    config: Arc<Config>,
) {
    let scope = context.scope().clone();
    let method_type = handler.method_type();
    let (input, queue) = match method_type.client_streaming() {
        true => {
            let (queue, requests) = message_queue(config.message_buffer_size);
            (HandlerInput::Stream(requests), Some(queue))
        }
        false => match read_request(&mut reader, scope.token()).await {
            Ok(payload) => (HandlerInput::Single(payload), None),
            Err(ReadEnd::Violation(detail)) => {
                debug!("Invalid request for {}: {}", context.method(), detail);
                write_violation(context.response_writer(), detail).await;
                scope.cancel();
                return;
            }
            Err(end) => {
                debug!("Call {} ended before request: {:?}", context.method(), end);
                scope.cancel();
                finish_cancelled(&context, &config).await;
                return;
            }
        },
    };

    let monitor_stop = scope.token().child_token();
    let monitor = monitor(
        &mut reader,
        queue,
        &scope,
        &monitor_stop,
        context.response_writer(),
    );
    let invoke = invoke(handler.as_ref(), input, &context, &config);
    tokio::pin!(monitor);
    tokio::pin!(invoke);
    tokio::select! {
        () = &mut invoke => {
            trace!("Handler of {} finished", context.method());
            monitor_stop.cancel();
            monitor.await;
        }
        () = &mut monitor => {
            scope.cancel();
            finish_cancelled(&context, &config).await;
            if tokio::time::timeout(config.close_timeout, invoke).await.is_err() {
                debug!("Handler of {} ignored cancellation, dropping it", context.method());
            }
        }
    }
}

/// Reads the single `RequestData` of non client streaming shapes.
async fn read_request(reader: &mut FrameReader, token: &CancellationToken) -> Result<Bytes, ReadEnd> {
    let read: ConnectionResult<Option<Bytes>> = async {
        match reader.read_frame(token).await? {
            FrameKind::RequestData => Ok(Some(reader.read_blob(token).await?)),
            FrameKind::RequestCancel => Ok(None),
            other => Err(ConnectionError::Internal(format!(
                "Expected request data, got {:?}",
                other
            ))),
        }
    }
    .await;
    match read {
        Ok(Some(payload)) => Ok(payload),
        Ok(None) => Err(ReadEnd::Cancelled),
        Err(err) => Err(read_end(err)),
    }
}

fn read_end(err: ConnectionError) -> ReadEnd {
    match err {
        ConnectionError::Unavailable(_) => ReadEnd::Cancelled,
        ConnectionError::Cancelled | ConnectionError::Interrupted(_) => ReadEnd::Stopped,
        ConnectionError::Internal(detail) => ReadEnd::Violation(detail),
    }
}

/// Watches the client side for the rest of the call.
///
/// Feeds streamed requests into `queue` and cancels the scope on `RequestCancel`, on a
/// vanished client, or on a protocol violation (answered with `Internal`).
async fn monitor(
    reader: &mut FrameReader,
    mut queue: Option<QueueWriter>,
    scope: &CallScope,
    stop: &CancellationToken,
    writer: &ResponseWriter,
) {
    let end = match read_frames(reader, queue.as_mut(), stop).await {
        Ok(end) => end,
        Err(err) => read_end(err),
    };
    match end {
        ReadEnd::Cancelled => {
            debug!("Call cancelled by client {}", reader.peer());
            scope.cancel();
            fail_queue(queue, Status::cancelled("Call cancelled by client"));
        }
        ReadEnd::Violation(detail) => {
            debug!("Protocol violation from {}: {}", reader.peer(), detail);
            write_violation(writer, detail).await;
            scope.cancel();
            fail_queue(queue, Status::cancelled("Call aborted"));
        }
        ReadEnd::Stopped => {
            if scope.is_cancelled() {
                fail_queue(queue, scope.status());
            }
        }
    }
}

async fn read_frames(
    reader: &mut FrameReader,
    mut queue: Option<&mut QueueWriter>,
    stop: &CancellationToken,
) -> ConnectionResult<ReadEnd> {
    loop {
        let streaming = queue.as_ref().map_or(false, |queue| !queue.is_terminated());
        match reader.read_frame(stop).await? {
            FrameKind::RequestCancel => return Ok(ReadEnd::Cancelled),
            FrameKind::RequestData if streaming => {
                let payload = reader.read_blob(stop).await?;
                if let Some(queue) = queue.as_mut() {
                    if !queue.push(payload, stop).await? {
                        trace!("Request stream dropped by handler, discarding message");
                    }
                }
            }
            FrameKind::RequestComplete if streaming => {
                if let Some(queue) = queue.as_mut() {
                    trace!("Request stream completed");
                    queue.complete();
                }
            }
            other => {
                return Ok(ReadEnd::Violation(format!(
                    "Unexpected {:?} frame from client",
                    other
                )))
            }
        }
    }
}

fn fail_queue(queue: Option<QueueWriter>, status: Status) {
    if let Some(mut queue) = queue {
        queue.fail(status);
    }
}

async fn write_violation(writer: &ResponseWriter, detail: String) {
    if let Err(status) = writer.write_status(Status::internal(detail)).await {
        debug!("Failed to report protocol violation: {}", status);
    }
}

/// Answers a call whose deadline passed with `DeadlineExceeded`. Any other cancellation
/// (client cancel, vanished client, shutdown) ends the call without a response.
async fn finish_cancelled(context: &ServerCallContext, config: &Config) {
    match context.scope().reason() {
        Some(CancelReason::DeadlineExceeded) => {
            debug!("Deadline of {} exceeded", context.method());
            context
                .response_writer()
                .write_deadline_exceeded(config.close_timeout)
                .await;
        }
        _ => debug!("Call {} cancelled, suppressing response", context.method()),
    }
}

/// Runs the handler and writes its outcome. A call cancelled meanwhile ends as
/// [`finish_cancelled`] decides, whatever the handler returned.
async fn invoke(handler: &dyn CallHandler, input: HandlerInput, context: &ServerCallContext, config: &Config) {
    let outcome = handler.call(input, context).await;
    if context.is_cancelled() {
        finish_cancelled(context, config).await;
        return;
    }
    let writer = context.response_writer();
    let status = match outcome {
        Ok(response) => {
            if let Some(payload) = response {
                if let Err(status) = writer.write_message(payload).await {
                    debug!("Failed to write response of {}: {}", context.method(), status);
                    if context.is_cancelled() {
                        finish_cancelled(context, config).await;
                    }
                    return;
                }
            }
            Status::ok().with_trailers(context.take_trailers().await)
        }
        Err(status) if status.trailers().is_some() => status,
        Err(status) => status.with_trailers(context.take_trailers().await),
    };
    if let Err(err) = writer.write_status(status).await {
        debug!("Failed to write status of {}: {}", context.method(), err);
        if context.is_cancelled() {
            finish_cancelled(context, config).await;
        }
    }
}
