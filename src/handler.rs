use crate::cancellation::CallScope;
use crate::errors::{HandlerError, RpcError, RpcResult};
use crate::method::{Marshaller, Method, MethodType};
use crate::queue::QueueReader;
use crate::server::context::ServerCallContext;
use crate::server::stream::{RequestStream, ResponseSink};
use crate::status::Status;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Future;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Handles calls with one request and one response.
///
/// Register with [`HandlerRegistry::register_unary`].
#[async_trait]
pub trait UnaryHandler: Debug + Send + Sync + 'static {
    type REQ: Send + 'static;
    type RES: Send + 'static;
    async fn handle(&self, request: Self::REQ, context: &ServerCallContext) -> HandlerResult<Self::RES>;
}

/// Handles calls with a stream of requests and one response.
#[async_trait]
pub trait ClientStreamingHandler: Debug + Send + Sync + 'static {
    type REQ: Send + 'static;
    type RES: Send + 'static;
    async fn handle(
        &self,
        requests: RequestStream<Self::REQ>,
        context: &ServerCallContext,
    ) -> HandlerResult<Self::RES>;
}

/// Handles calls with one request and a stream of responses.
#[async_trait]
pub trait ServerStreamingHandler: Debug + Send + Sync + 'static {
    type REQ: Send + 'static;
    type RES: Send + 'static;
    async fn handle(
        &self,
        request: Self::REQ,
        responses: ResponseSink<Self::RES>,
        context: &ServerCallContext,
    ) -> HandlerResult<()>;
}

/// Handles calls streaming in both directions.
#[async_trait]
pub trait DuplexStreamingHandler: Debug + Send + Sync + 'static {
    type REQ: Send + 'static;
    type RES: Send + 'static;
    async fn handle(
        &self,
        requests: RequestStream<Self::REQ>,
        responses: ResponseSink<Self::RES>,
        context: &ServerCallContext,
    ) -> HandlerResult<()>;
}

/// Request side of a call as the engine hands it to a handler.
#[derive(Debug)]
pub(crate) enum HandlerInput {
    Single(Bytes),
    Stream(QueueReader),
}

impl HandlerInput {
    fn single(self) -> Result<Bytes, Status> {
        match self {
            HandlerInput::Single(payload) => Ok(payload),
            HandlerInput::Stream(_) => Err(Status::internal("Expected a single request message")),
        }
    }

    fn stream(self) -> Result<QueueReader, Status> {
        match self {
            HandlerInput::Stream(reader) => Ok(reader),
            HandlerInput::Single(_) => Err(Status::internal("Expected a request stream")),
        }
    }
}

pub(crate) type CallOutput = Result<Option<Bytes>, Status>;

/// Shape independent handler the server engine works with.
///
/// Returns the single response payload for unary response shapes, `None` for streaming ones.
pub(crate) trait CallHandler: Debug + Send + Sync {
    fn method_type(&self) -> MethodType;

    fn call<'a>(
        &'a self,
        input: HandlerInput,
        context: &'a ServerCallContext,
    ) -> Pin<Box<dyn Future<Output = CallOutput> + Send + 'a>>;
}

/// Maps a handler failure to the status sent to the client.
pub(crate) fn handler_status(err: HandlerError, scope: &CallScope) -> Status {
    match err {
        HandlerError::Status(status) => status,
        HandlerError::Cancelled => scope.status(),
        other => Status::unknown(other.to_string()),
    }
}

/// Debug of adapters, which must not require `Debug` of the message types.
macro_rules! adapter_debug {
    ($adapter:ident, $handler:ident) => {
        impl<HANDLER: $handler> Debug for $adapter<HANDLER> {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($adapter))
                    .field("handler", &self.handler)
                    .finish()
            }
        }
    };
}

adapter_debug!(UnaryAdapter, UnaryHandler);
adapter_debug!(ClientStreamingAdapter, ClientStreamingHandler);
adapter_debug!(ServerStreamingAdapter, ServerStreamingHandler);
adapter_debug!(DuplexStreamingAdapter, DuplexStreamingHandler);

#[derive(new)]
struct UnaryAdapter<HANDLER: UnaryHandler> {
    handler: HANDLER,
    request_marshaller: Marshaller<HANDLER::REQ>,
    response_marshaller: Marshaller<HANDLER::RES>,
}

impl<HANDLER: UnaryHandler> CallHandler for UnaryAdapter<HANDLER> {
    fn method_type(&self) -> MethodType {
        MethodType::Unary
    }

    fn call<'a>(
        &'a self,
        input: HandlerInput,
        context: &'a ServerCallContext,
    ) -> Pin<Box<dyn Future<Output = CallOutput> + Send + 'a>> {
        Box::pin(async move {
            let request = self.request_marshaller.deserialize(input.single()?)?;
            let response = self
                .handler
                .handle(request, context)
                .await
                .map_err(|err| handler_status(err, context.scope()))?;
            Ok(Some(self.response_marshaller.serialize(&response)?))
        })
    }
}

#[derive(new)]
struct ClientStreamingAdapter<HANDLER: ClientStreamingHandler> {
    handler: HANDLER,
    request_marshaller: Marshaller<HANDLER::REQ>,
    response_marshaller: Marshaller<HANDLER::RES>,
}

impl<HANDLER: ClientStreamingHandler> CallHandler for ClientStreamingAdapter<HANDLER> {
    fn method_type(&self) -> MethodType {
        MethodType::ClientStreaming
    }

    fn call<'a>(
        &'a self,
        input: HandlerInput,
        context: &'a ServerCallContext,
    ) -> Pin<Box<dyn Future<Output = CallOutput> + Send + 'a>> {
        Box::pin(async move {
            let requests = RequestStream::new(input.stream()?, self.request_marshaller.clone());
            let response = self
                .handler
                .handle(requests, context)
                .await
                .map_err(|err| handler_status(err, context.scope()))?;
            Ok(Some(self.response_marshaller.serialize(&response)?))
        })
    }
}

#[derive(new)]
struct ServerStreamingAdapter<HANDLER: ServerStreamingHandler> {
    handler: HANDLER,
    request_marshaller: Marshaller<HANDLER::REQ>,
    response_marshaller: Marshaller<HANDLER::RES>,
}

impl<HANDLER: ServerStreamingHandler> CallHandler for ServerStreamingAdapter<HANDLER> {
    fn method_type(&self) -> MethodType {
        MethodType::ServerStreaming
    }

    fn call<'a>(
        &'a self,
        input: HandlerInput,
        context: &'a ServerCallContext,
    ) -> Pin<Box<dyn Future<Output = CallOutput> + Send + 'a>> {
        Box::pin(async move {
            let request = self.request_marshaller.deserialize(input.single()?)?;
            let responses = ResponseSink::new(
                context.response_writer().clone(),
                self.response_marshaller.clone(),
            );
            self.handler
                .handle(request, responses, context)
                .await
                .map_err(|err| handler_status(err, context.scope()))?;
            Ok(None)
        })
    }
}

#[derive(new)]
struct DuplexStreamingAdapter<HANDLER: DuplexStreamingHandler> {
    handler: HANDLER,
    request_marshaller: Marshaller<HANDLER::REQ>,
    response_marshaller: Marshaller<HANDLER::RES>,
}

impl<HANDLER: DuplexStreamingHandler> CallHandler for DuplexStreamingAdapter<HANDLER> {
    fn method_type(&self) -> MethodType {
        MethodType::DuplexStreaming
    }

    fn call<'a>(
        &'a self,
        input: HandlerInput,
        context: &'a ServerCallContext,
    ) -> Pin<Box<dyn Future<Output = CallOutput> + Send + 'a>> {
        Box::pin(async move {
            let requests = RequestStream::new(input.stream()?, self.request_marshaller.clone());
            let responses = ResponseSink::new(
                context.response_writer().clone(),
                self.response_marshaller.clone(),
            );
            self.handler
                .handle(requests, responses, context)
                .await
                .map_err(|err| handler_status(err, context.scope()))?;
            Ok(None)
        })
    }
}

type HandlerRef = Arc<dyn CallHandler>;

/// Handlers by full method name.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerRef>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    pub async fn register_unary<HANDLER: UnaryHandler>(
        &self,
        method: &Method<HANDLER::REQ, HANDLER::RES>,
        handler: HANDLER,
    ) -> RpcResult<()> {
        check_method_type(method, MethodType::Unary)?;
        let adapter = UnaryAdapter::new(
            handler,
            method.request_marshaller().clone(),
            method.response_marshaller().clone(),
        );
        self.register_handler(method.full_name(), Arc::new(adapter)).await
    }

    pub async fn register_client_streaming<HANDLER: ClientStreamingHandler>(
        &self,
        method: &Method<HANDLER::REQ, HANDLER::RES>,
        handler: HANDLER,
    ) -> RpcResult<()> {
        check_method_type(method, MethodType::ClientStreaming)?;
        let adapter = ClientStreamingAdapter::new(
            handler,
            method.request_marshaller().clone(),
            method.response_marshaller().clone(),
        );
        self.register_handler(method.full_name(), Arc::new(adapter)).await
    }

    pub async fn register_server_streaming<HANDLER: ServerStreamingHandler>(
        &self,
        method: &Method<HANDLER::REQ, HANDLER::RES>,
        handler: HANDLER,
    ) -> RpcResult<()> {
        check_method_type(method, MethodType::ServerStreaming)?;
        let adapter = ServerStreamingAdapter::new(
            handler,
            method.request_marshaller().clone(),
            method.response_marshaller().clone(),
        );
        self.register_handler(method.full_name(), Arc::new(adapter)).await
    }

    pub async fn register_duplex_streaming<HANDLER: DuplexStreamingHandler>(
        &self,
        method: &Method<HANDLER::REQ, HANDLER::RES>,
        handler: HANDLER,
    ) -> RpcResult<()> {
        check_method_type(method, MethodType::DuplexStreaming)?;
        let adapter = DuplexStreamingAdapter::new(
            handler,
            method.request_marshaller().clone(),
            method.response_marshaller().clone(),
        );
        self.register_handler(method.full_name(), Arc::new(adapter)).await
    }

    /// Removes handler of `method_name`.
    pub async fn unregister<STR: AsRef<str>>(&self, method_name: STR) -> RpcResult<()> {
        let mut handlers = self.handlers.write().await;
        match handlers.remove(method_name.as_ref()) {
            Some(_) => Ok(()),
            None => Err(RpcError::RegistrationError(format!(
                "No handler registered for '{}'",
                method_name.as_ref()
            ))),
        }
    }

    pub async fn contains<STR: AsRef<str>>(&self, method_name: STR) -> bool {
        self.handlers.read().await.contains_key(method_name.as_ref())
    }

    pub(crate) async fn get(&self, method_name: &str) -> Option<HandlerRef> {
        self.handlers.read().await.get(method_name).cloned()
    }

    async fn register_handler(&self, method_name: &str, handler: HandlerRef) -> RpcResult<()> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(method_name) {
            return Err(RpcError::RegistrationError(format!(
                "Handler already registered for '{}'",
                method_name
            )));
        }
        debug!("Registering {} handler for {}", handler.method_type(), method_name);
        handlers.insert(method_name.to_owned(), handler);
        Ok(())
    }
}

fn check_method_type<REQ, RES>(method: &Method<REQ, RES>, expected: MethodType) -> RpcResult<()> {
    match method.method_type() == expected {
        true => Ok(()),
        false => Err(RpcError::RegistrationError(format!(
            "Method '{}' is {}, handler is {}",
            method.full_name(),
            method.method_type(),
            expected
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::raw;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl UnaryHandler for Echo {
        type REQ = String;
        type RES = String;

        async fn handle(&self, request: String, _context: &ServerCallContext) -> HandlerResult<String> {
            Ok(request)
        }
    }

    fn method(method_type: MethodType) -> Method<String, String> {
        Method::new(method_type, "/test.Echo/Say", raw::utf8(), raw::utf8())
    }

    #[tokio::test]
    async fn rejects_duplicates_and_unknown_removals() -> Result<(), anyhow::Error> {
        let registry = HandlerRegistry::new();
        registry.register_unary(&method(MethodType::Unary), Echo).await?;
        assert!(registry.contains("/test.Echo/Say").await);
        assert!(registry
            .register_unary(&method(MethodType::Unary), Echo)
            .await
            .is_err());

        registry.unregister("/test.Echo/Say").await?;
        assert!(registry.get("/test.Echo/Say").await.is_none());
        assert!(registry.unregister("/test.Echo/Say").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_shape_mismatch() {
        let registry = HandlerRegistry::new();
        let result = registry
            .register_unary(&method(MethodType::DuplexStreaming), Echo)
            .await;
        assert!(matches!(result, Err(RpcError::RegistrationError(_))));
    }

    /// Message type without `Debug`.
    struct Opaque(Bytes);

    #[derive(Debug)]
    struct OpaqueEcho;

    #[async_trait]
    impl UnaryHandler for OpaqueEcho {
        type REQ = Opaque;
        type RES = Opaque;

        async fn handle(&self, request: Opaque, _context: &ServerCallContext) -> HandlerResult<Opaque> {
            Ok(request)
        }
    }

    #[tokio::test]
    async fn registers_handlers_of_messages_without_debug() -> Result<(), anyhow::Error> {
        let marshaller = || Marshaller::new(|message: &Opaque| Ok(message.0.clone()), |payload| Ok(Opaque(payload)));
        let method = Method::new(MethodType::Unary, "/test.Opaque/Echo", marshaller(), marshaller());
        let registry = HandlerRegistry::new();
        registry.register_unary(&method, OpaqueEcho).await?;

        let handler = registry.get("/test.Opaque/Echo").await.expect("registered");
        assert_eq!(MethodType::Unary, handler.method_type());
        assert!(format!("{:?}", handler).contains("OpaqueEcho"));
        Ok(())
    }

    #[test]
    fn handler_errors_map_to_status() {
        use crate::status::Code;
        let scope = CallScope::new(None, None);
        assert_eq!(
            Code::NotFound,
            handler_status(Status::with_code(Code::NotFound, "x").into(), &scope).code()
        );
        let unknown = handler_status(HandlerError::GeneralError("boom".to_owned()), &scope);
        assert_eq!(Code::Unknown, unknown.code());
        assert!(unknown.detail().contains("boom"));
        assert_eq!(
            Code::Cancelled,
            handler_status(HandlerError::Cancelled, &scope).code()
        );
    }
}
