/**
# Besides of `rawgrpc` the example requires following dependencies:
tokio =  { version = "^1", features = ["macros", "signal"] }
async-trait = "^0"
log = "^0"
env_logger = "^0" # to print logs
 */
use async_trait::async_trait;
use log::{error, info};
use rawgrpc::config::ConfigBuilder;
use rawgrpc::errors::HandlerError;
use rawgrpc::handler::{
    ClientStreamingHandler, DuplexStreamingHandler, HandlerRegistry, HandlerResult,
    ServerStreamingHandler, UnaryHandler,
};
use rawgrpc::messages::raw;
use rawgrpc::method::{Method, MethodType};
use rawgrpc::server::context::ServerCallContext;
use rawgrpc::server::stream::{RequestStream, ResponseSink};
use rawgrpc::server::Server;
use rawgrpc::{Code, Status};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    env_logger::init();
    if let Err(err) = run().await {
        error!("Failure: {:?}", err);
        return Err(err);
    }
    Ok(())
}

async fn run() -> Result<(), Error> {
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register_unary(&method(MethodType::Unary, "/demo.Pong/Ping"), PongHandler::default())
        .await?;
    registry
        .register_client_streaming(&method(MethodType::ClientStreaming, "/demo.Counter/Sum"), SumHandler)
        .await?;
    registry
        .register_server_streaming(&method(MethodType::ServerStreaming, "/demo.Counter/CountDown"), CountDownHandler)
        .await?;
    registry
        .register_duplex_streaming(&method(MethodType::DuplexStreaming, "/demo.Echo/Chat"), ChatHandler)
        .await?;
    let server = Server::new(ConfigBuilder::default().build()?, registry);
    let address = server.start().await?;
    info!("Listening on {}", address);
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}

fn method(method_type: MethodType, name: &str) -> Method<String, String> {
    Method::new(method_type, name, raw::utf8(), raw::utf8())
}

#[derive(Debug, Default)]
struct PongHandler {
    counter: AtomicU32,
}

#[async_trait]
impl UnaryHandler for PongHandler {
    type REQ = String;
    type RES = String;

    async fn handle(&self, request: String, context: &ServerCallContext) -> HandlerResult<String> {
        info!("Received '{}' from {}", request, context.peer());
        if request != "Marco" {
            return Err(HandlerError::GeneralError("Bad request".into()));
        }
        match self.counter.fetch_add(1, Ordering::SeqCst) {
            0 => Ok("Polo!".into()),
            1 => Ok("I feel bad ...".into()),
            _ => Err(Status::with_code(Code::ResourceExhausted, "I feel sick ...").into()),
        }
    }
}

#[derive(Debug)]
struct SumHandler;

#[async_trait]
impl ClientStreamingHandler for SumHandler {
    type REQ = String;
    type RES = String;

    async fn handle(&self, mut requests: RequestStream<String>, _context: &ServerCallContext) -> HandlerResult<String> {
        let mut sum = 0i64;
        while let Some(number) = requests.message().await? {
            sum += number
                .parse::<i64>()
                .map_err(|err| Status::with_code(Code::InvalidArgument, err.to_string()))?;
        }
        Ok(sum.to_string())
    }
}

#[derive(Debug)]
struct CountDownHandler;

#[async_trait]
impl ServerStreamingHandler for CountDownHandler {
    type REQ = String;
    type RES = String;

    async fn handle(&self, request: String, responses: ResponseSink<String>, context: &ServerCallContext) -> HandlerResult<()> {
        let from: u32 = request
            .parse()
            .map_err(|_| Status::with_code(Code::InvalidArgument, "number expected"))?;
        for count in (0..=from).rev() {
            responses.write(&count.to_string()).await?;
            tokio::select! {
                _ = context.cancelled() => return Err(HandlerError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ChatHandler;

#[async_trait]
impl DuplexStreamingHandler for ChatHandler {
    type REQ = String;
    type RES = String;

    async fn handle(
        &self,
        mut requests: RequestStream<String>,
        responses: ResponseSink<String>,
        _context: &ServerCallContext,
    ) -> HandlerResult<()> {
        while let Some(message) = requests.message().await? {
            responses.write(&message.to_uppercase()).await?;
        }
        Ok(())
    }
}
