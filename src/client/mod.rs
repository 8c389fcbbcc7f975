pub mod call;
pub mod stream;

use crate::client::call::ClientCall;
use crate::client::stream::{RequestWriter, ResponseStream};
use crate::config::Config;
use crate::connection::Connection;
use crate::errors::{ConnectionError, RpcResult};
use crate::metadata::Metadata;
use crate::method::{CallDescriptor, CallOptions, Marshaller, Method, MethodType};
use crate::status::Status;
use bytes::Bytes;
use std::fmt::Debug;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Turns a call descriptor into a running [`ClientCall`].
pub trait CallInvoker: Debug + Send + Sync {
    fn start_call(
        &self,
        descriptor: CallDescriptor,
        request: Option<Bytes>,
        cancellation: Option<&CancellationToken>,
    ) -> ClientCall;
}

/// Opens a new connection to `target` for every call.
#[derive(Debug, new)]
pub struct LiveInvoker {
    target: SocketAddr,
    config: Arc<Config>,
}

impl CallInvoker for LiveInvoker {
    fn start_call(
        &self,
        descriptor: CallDescriptor,
        request: Option<Bytes>,
        cancellation: Option<&CancellationToken>,
    ) -> ClientCall {
        ClientCall::start(
            descriptor,
            self.target,
            self.config.clone(),
            request,
            cancellation,
        )
    }
}

/// Fails every call with `Unavailable` without opening a socket.
#[derive(Debug, new)]
pub struct UnreachableInvoker {
    target: SocketAddr,
}

impl CallInvoker for UnreachableInvoker {
    fn start_call(
        &self,
        descriptor: CallDescriptor,
        _request: Option<Bytes>,
        _cancellation: Option<&CancellationToken>,
    ) -> ClientCall {
        ClientCall::failed(
            descriptor,
            Status::unavailable(format!("{} is unreachable", self.target)),
        )
    }
}

/// RPC client bound to a single server address.
///
/// Calls are started synchronously and run in the background, so every call method
/// must be used within a tokio runtime.
#[derive(Debug, Clone)]
pub struct Client {
    invoker: Arc<dyn CallInvoker>,
}

impl Client {
    /// Client calling `addr`. Connection failures surface per call.
    pub fn new<ADDR: ToSocketAddrs>(addr: ADDR, config: Config) -> RpcResult<Client> {
        let target = first_addr(addr)?;
        Ok(Client::with_invoker(Arc::new(LiveInvoker::new(
            target,
            Arc::new(config),
        ))))
    }

    /// Client failing every call with `Unavailable`.
    pub fn unreachable<ADDR: ToSocketAddrs>(addr: ADDR) -> RpcResult<Client> {
        let target = first_addr(addr)?;
        Ok(Client::with_invoker(Arc::new(UnreachableInvoker::new(target))))
    }

    /// Connects to `addr` once and returns a live client when it accepts connections,
    /// otherwise one failing fast with `Unavailable`.
    pub async fn connect<ADDR: ToSocketAddrs>(addr: ADDR, config: Config) -> RpcResult<Client> {
        let target = first_addr(addr)?;
        match Connection::connect(target, &config, &CancellationToken::new()).await {
            Ok(connection) => {
                let (_, writer) = connection.split();
                writer.close(config.close_timeout).await;
                debug!("{} is reachable", target);
                Ok(Client::with_invoker(Arc::new(LiveInvoker::new(
                    target,
                    Arc::new(config),
                ))))
            }
            Err(err) => {
                warn!("{} is unreachable, calls will fail fast: {}", target, err);
                Ok(Client::with_invoker(Arc::new(UnreachableInvoker::new(target))))
            }
        }
    }

    pub fn with_invoker(invoker: Arc<dyn CallInvoker>) -> Client {
        Client { invoker }
    }

    pub fn unary_call<REQ, RES>(
        &self,
        method: &Method<REQ, RES>,
        options: CallOptions,
        request: &REQ,
    ) -> AsyncUnaryCall<RES> {
        let call = self.start(method, MethodType::Unary, options, Some(request));
        AsyncUnaryCall {
            call,
            marshaller: method.response_marshaller().clone(),
        }
    }

    pub fn client_streaming_call<REQ, RES>(
        &self,
        method: &Method<REQ, RES>,
        options: CallOptions,
    ) -> AsyncClientStreamingCall<REQ, RES> {
        let call = self.start(method, MethodType::ClientStreaming, options, None);
        AsyncClientStreamingCall {
            request_stream: RequestWriter::new(call.clone(), method.request_marshaller().clone()),
            call,
            marshaller: method.response_marshaller().clone(),
        }
    }

    pub fn server_streaming_call<REQ, RES>(
        &self,
        method: &Method<REQ, RES>,
        options: CallOptions,
        request: &REQ,
    ) -> AsyncServerStreamingCall<RES> {
        let call = self.start(method, MethodType::ServerStreaming, options, Some(request));
        AsyncServerStreamingCall {
            response_stream: ResponseStream::new(call.clone(), method.response_marshaller().clone()),
            call,
        }
    }

    pub fn duplex_streaming_call<REQ, RES>(
        &self,
        method: &Method<REQ, RES>,
        options: CallOptions,
    ) -> AsyncDuplexStreamingCall<REQ, RES> {
        let call = self.start(method, MethodType::DuplexStreaming, options, None);
        AsyncDuplexStreamingCall {
            request_stream: RequestWriter::new(call.clone(), method.request_marshaller().clone()),
            response_stream: ResponseStream::new(call.clone(), method.response_marshaller().clone()),
            call,
        }
    }

    fn start<REQ, RES>(
        &self,
        method: &Method<REQ, RES>,
        expected: MethodType,
        options: CallOptions,
        request: Option<&REQ>,
    ) -> ClientCall {
        let descriptor = CallDescriptor::new(
            method.full_name().clone(),
            method.method_type(),
            options.deadline(),
            options.headers().clone(),
        );
        if method.method_type() != expected {
            return ClientCall::failed(
                descriptor,
                Status::internal(format!(
                    "Method {} is {}, called as {}",
                    method.full_name(),
                    method.method_type(),
                    expected
                )),
            );
        }
        let request = match request
            .map(|request| method.request_marshaller().serialize(request))
            .transpose()
        {
            Ok(request) => request,
            Err(err) => return ClientCall::failed(descriptor, Status::from(err)),
        };
        self.invoker
            .start_call(descriptor, request, options.cancellation_token().as_ref())
    }
}

macro_rules! call_accessors {
    () => {
        /// Response headers, empty when the server sent none.
        pub async fn headers(&self) -> Result<Metadata, Status> {
            self.call.headers().await
        }

        /// Final status. Waits for the call to end.
        pub async fn status(&self) -> Status {
            self.call.status().await
        }

        pub async fn trailers(&self) -> Metadata {
            self.call.trailers().await
        }

        pub fn cancel(&self) {
            self.call.cancel()
        }
    };
}

#[derive(Debug)]
pub struct AsyncUnaryCall<RES> {
    call: ClientCall,
    marshaller: Marshaller<RES>,
}

impl<RES> AsyncUnaryCall<RES> {
    pub async fn response(&self) -> Result<RES, Status> {
        let payload = self.call.response().await?;
        Ok(self.marshaller.deserialize(payload)?)
    }

    call_accessors!();
}

#[derive(Debug)]
pub struct AsyncClientStreamingCall<REQ, RES> {
    call: ClientCall,
    request_stream: RequestWriter<REQ>,
    marshaller: Marshaller<RES>,
}

impl<REQ, RES> AsyncClientStreamingCall<REQ, RES> {
    pub fn request_stream(&self) -> &RequestWriter<REQ> {
        &self.request_stream
    }

    pub async fn response(&self) -> Result<RES, Status> {
        let payload = self.call.response().await?;
        Ok(self.marshaller.deserialize(payload)?)
    }

    call_accessors!();
}

#[derive(Debug)]
pub struct AsyncServerStreamingCall<RES> {
    call: ClientCall,
    response_stream: ResponseStream<RES>,
}

impl<RES> AsyncServerStreamingCall<RES> {
    pub fn response_stream(&mut self) -> &mut ResponseStream<RES> {
        &mut self.response_stream
    }

    pub fn into_response_stream(self) -> ResponseStream<RES> {
        self.response_stream
    }

    call_accessors!();
}

#[derive(Debug)]
pub struct AsyncDuplexStreamingCall<REQ, RES> {
    call: ClientCall,
    request_stream: RequestWriter<REQ>,
    response_stream: ResponseStream<RES>,
}

impl<REQ, RES> AsyncDuplexStreamingCall<REQ, RES> {
    pub fn request_stream(&self) -> &RequestWriter<REQ> {
        &self.request_stream
    }

    pub fn response_stream(&mut self) -> &mut ResponseStream<RES> {
        &mut self.response_stream
    }

    /// Splits into independently owned writer and reader.
    pub fn into_streams(self) -> (RequestWriter<REQ>, ResponseStream<RES>) {
        (self.request_stream, self.response_stream)
    }

    call_accessors!();
}

pub(crate) fn first_addr<ADDR: ToSocketAddrs>(addr: ADDR) -> Result<SocketAddr, ConnectionError> {
    let mut addrs = addr
        .to_socket_addrs()
        .map_err(|err| ConnectionError::Unavailable(err.to_string()))?;
    match addrs.next() {
        Some(addr) => Ok(addr),
        None => Err(ConnectionError::Unavailable(
            "Unable to resolve address".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::raw;
    use crate::status::Code;

    fn echo(method_type: MethodType) -> Method<String, String> {
        Method::new(method_type, "/test.Echo/Say", raw::utf8(), raw::utf8())
    }

    #[tokio::test]
    async fn unreachable_client_fails_every_shape() -> Result<(), anyhow::Error> {
        let client = Client::unreachable("127.0.0.1:1")?;
        let unary = client.unary_call(&echo(MethodType::Unary), CallOptions::new(), &"hi".to_owned());
        assert_eq!(Code::Unavailable, unary.response().await.expect_err("unreachable").code());

        let streaming = client.client_streaming_call(&echo(MethodType::ClientStreaming), CallOptions::new());
        let write = streaming.request_stream().write(&"hi".to_owned()).await;
        assert_eq!(Code::Unavailable, write.expect_err("unreachable").code());

        let mut server_streaming =
            client.server_streaming_call(&echo(MethodType::ServerStreaming), CallOptions::new(), &"hi".to_owned());
        let message = server_streaming.response_stream().message().await;
        assert_eq!(Code::Unavailable, message.expect_err("unreachable").code());

        let duplex = client.duplex_streaming_call(&echo(MethodType::DuplexStreaming), CallOptions::new());
        assert_eq!(Code::Unavailable, duplex.status().await.code());
        Ok(())
    }

    #[tokio::test]
    async fn shape_mismatch_is_internal_without_connecting() -> Result<(), anyhow::Error> {
        // Nothing listens on port 1: a connect attempt would take the whole retry window.
        let client = Client::new("127.0.0.1:1", Config::default())?;
        let call = client.unary_call(&echo(MethodType::ServerStreaming), CallOptions::new(), &"hi".to_owned());
        let status = tokio::time::timeout(std::time::Duration::from_millis(100), call.status()).await?;
        assert_eq!(Code::Internal, status.code());
        Ok(())
    }

    #[tokio::test]
    async fn connect_falls_back_to_unreachable() -> Result<(), anyhow::Error> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let target = listener.local_addr()?;
        drop(listener);
        let config = crate::config::ConfigBuilder::default()
            .connect_timeout(std::time::Duration::from_millis(100))
            .build()?;
        let client = Client::connect(target, config).await?;
        let call = client.unary_call(&echo(MethodType::Unary), CallOptions::new(), &"hi".to_owned());
        let status = tokio::time::timeout(std::time::Duration::from_millis(100), call.status()).await?;
        assert_eq!(Code::Unavailable, status.code());
        Ok(())
    }
}
