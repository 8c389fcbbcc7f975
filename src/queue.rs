use crate::errors::ConnectionError;
use crate::status::Status;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Bounded queue of streamed payloads with explicit termination.
///
/// The producer either completes the queue (graceful end of stream) or fails it with a
/// status. Dropping the producer without either counts as graceful completion.
pub(crate) fn message_queue(capacity: usize) -> (QueueWriter, QueueReader) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let failure = Arc::new(OnceLock::new());
    (
        QueueWriter {
            sender: Some(sender),
            failure: failure.clone(),
        },
        QueueReader {
            receiver: ReceiverStream::new(receiver),
            failure,
            finished: false,
        },
    )
}

#[derive(Debug)]
pub(crate) struct QueueWriter {
    sender: Option<mpsc::Sender<Bytes>>,
    failure: Arc<OnceLock<Status>>,
}

impl QueueWriter {
    /// Enqueues `payload`, waiting for room.
    ///
    /// Returns `Ok(false)` when the queue is already terminated or the reader is gone,
    /// in which case the payload is dropped.
    pub async fn push(
        &self,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<bool, ConnectionError> {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return Ok(false),
        };
        tokio::select! {
            sent = sender.send(payload) => Ok(sent.is_ok()),
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.sender.is_none()
    }

    /// Marks end of stream. Later calls are no-ops.
    pub fn complete(&mut self) {
        if self.sender.take().is_some() {
            trace!("Message queue completed");
        }
    }

    /// Terminates the queue with `status`, unless already terminated.
    pub fn fail(&mut self, status: Status) {
        if self.sender.is_some() {
            debug!("Message queue failed with {}", status);
            // Failure must be visible before the reader can observe the closed channel.
            let _ = self.failure.set(status);
            self.sender = None;
        }
    }
}

#[derive(Debug)]
pub(crate) struct QueueReader {
    receiver: ReceiverStream<Bytes>,
    failure: Arc<OnceLock<Status>>,
    finished: bool,
}

impl QueueReader {
    /// Next payload, `Ok(None)` at end of stream (also on every call after that).
    ///
    /// A failed queue yields its queued items first, then the failure status once.
    pub async fn next(&mut self) -> Result<Option<Bytes>, Status> {
        if self.finished {
            return Ok(None);
        }
        match self.receiver.next().await {
            Some(payload) => Ok(Some(payload)),
            None => {
                self.finished = true;
                match self.failure.get() {
                    Some(status) => Err(status.clone()),
                    None => Ok(None),
                }
            }
        }
    }
}
