use crate::client::call::ClientCall;
use crate::method::Marshaller;
use crate::queue::QueueReader;
use crate::status::{Code, Status};
use futures::Stream;

/// Typed writer of a client streaming or duplex call. Clones share the same stream.
#[derive(Debug)]
pub struct RequestWriter<REQ> {
    call: ClientCall,
    marshaller: Marshaller<REQ>,
}

impl<REQ> RequestWriter<REQ> {
    pub(crate) fn new(call: ClientCall, marshaller: Marshaller<REQ>) -> RequestWriter<REQ> {
        RequestWriter { call, marshaller }
    }

    /// Writes one message. Waits until the call is connected.
    pub async fn write(&self, message: &REQ) -> Result<(), Status> {
        let payload = self.marshaller.serialize(message)?;
        self.call.write_request(payload).await
    }

    /// Ends the request stream.
    pub async fn complete(&self) -> Result<(), Status> {
        self.call.complete_requests().await
    }
}

impl<REQ> Clone for RequestWriter<REQ> {
    fn clone(&self) -> Self {
        RequestWriter {
            call: self.call.clone(),
            marshaller: self.marshaller.clone(),
        }
    }
}

/// Typed reader of a server streaming or duplex call.
#[derive(Debug)]
pub struct ResponseStream<RES> {
    call: ClientCall,
    reader: Option<QueueReader>,
    marshaller: Marshaller<RES>,
    finished: bool,
}

impl<RES> ResponseStream<RES> {
    pub(crate) fn new(call: ClientCall, marshaller: Marshaller<RES>) -> ResponseStream<RES> {
        let reader = call.take_responses();
        ResponseStream {
            call,
            reader,
            marshaller,
            finished: false,
        }
    }

    /// Next response message.
    ///
    /// `Ok(None)` once the server completed the call with OK. A failed call yields its
    /// status once, after every message received before the failure.
    pub async fn message(&mut self) -> Result<Option<RES>, Status> {
        if self.finished {
            return Ok(None);
        }
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => {
                self.finished = true;
                return Err(Status::with_code(
                    Code::FailedPrecondition,
                    "Response stream already taken",
                ));
            }
        };
        let next = match reader.next().await {
            Ok(Some(payload)) => self.marshaller.deserialize(payload).map_err(|err| {
                self.call.cancel();
                Status::from(err)
            }),
            Ok(None) => {
                self.finished = true;
                return self.call.status().await.into_result().map(|()| None);
            }
            Err(status) => Err(status),
        };
        match next {
            Ok(message) => Ok(Some(message)),
            Err(status) => {
                self.finished = true;
                Err(status)
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<RES, Status>> {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.message().await {
                Ok(Some(message)) => Some((Ok(message), stream)),
                Ok(None) => None,
                Err(status) => Some((Err(status), stream)),
            }
        })
    }
}
