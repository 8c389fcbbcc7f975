use crate::method::Marshaller;
use crate::queue::QueueReader;
use crate::server::context::ResponseWriter;
use crate::status::Status;
use futures::Stream;

/// Request messages of a client streaming or duplex call, in the order the client sent them.
#[derive(Debug)]
pub struct RequestStream<REQ> {
    reader: QueueReader,
    marshaller: Marshaller<REQ>,
}

impl<REQ> RequestStream<REQ> {
    pub(crate) fn new(reader: QueueReader, marshaller: Marshaller<REQ>) -> RequestStream<REQ> {
        RequestStream { reader, marshaller }
    }

    /// Next request, `Ok(None)` once the client completed its stream.
    ///
    /// Fails with `Cancelled` when the client cancels or goes away mid-stream.
    pub async fn message(&mut self) -> Result<Option<REQ>, Status> {
        match self.reader.next().await? {
            Some(payload) => Ok(Some(self.marshaller.deserialize(payload)?)),
            None => Ok(None),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<REQ, Status>> {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.message().await {
                Ok(Some(message)) => Some((Ok(message), stream)),
                Ok(None) => None,
                Err(status) => Some((Err(status), stream)),
            }
        })
    }
}

/// Response messages of a server streaming or duplex call.
#[derive(Debug)]
pub struct ResponseSink<RES> {
    writer: ResponseWriter,
    marshaller: Marshaller<RES>,
}

impl<RES> ResponseSink<RES> {
    pub(crate) fn new(writer: ResponseWriter, marshaller: Marshaller<RES>) -> ResponseSink<RES> {
        ResponseSink { writer, marshaller }
    }

    /// Writes one response message. Fails once the call got cancelled.
    pub async fn write(&self, message: &RES) -> Result<(), Status> {
        let payload = self.marshaller.serialize(message)?;
        self.writer.write_message(payload).await
    }
}

impl<RES> Clone for ResponseSink<RES> {
    fn clone(&self) -> Self {
        ResponseSink {
            writer: self.writer.clone(),
            marshaller: self.marshaller.clone(),
        }
    }
}
