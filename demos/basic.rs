use async_trait::async_trait;
use rawgrpc::client::Client;
use rawgrpc::config::ConfigBuilder;
use rawgrpc::handler::{HandlerRegistry, HandlerResult, UnaryHandler};
use rawgrpc::messages::raw;
use rawgrpc::method::{CallOptions, Method, MethodType};
use rawgrpc::server::context::ServerCallContext;
use rawgrpc::server::Server;
use rawgrpc::RpcError;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn main() -> Result<(), RpcError> {
    let runtime = Runtime::new().map_err(|err| RpcError::Error(err.to_string()))?;
    let server = runtime.block_on(run())?;
    runtime.block_on(server.shutdown());
    Ok(())
}

async fn run() -> Result<Server, RpcError> {
    let method = Method::new(MethodType::Unary, "/basic.Service/Endpoint", raw::utf8(), raw::utf8());

    // Server
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_unary(&method, Handler {}).await?;
    let config = ConfigBuilder::default()
        .server_address("127.0.0.1:0".parse().map_err(|_| RpcError::Error("bad address".to_owned()))?)
        .build()?;
    let server = Server::new(config.clone(), registry);
    let address = server.start().await?;

    // Client
    let client = Client::new(address, config)?;
    let call = client.unary_call(&method, CallOptions::new(), &"a".to_owned());
    let response = call.response().await;

    assert_eq!(Ok("y".to_owned()), response);
    Ok(server)
}

#[derive(Debug)]
struct Handler {}

#[async_trait]
impl UnaryHandler for Handler {
    type REQ = String;
    type RES = String;

    async fn handle(&self, request: String, _context: &ServerCallContext) -> HandlerResult<String> {
        assert_eq!("a", request);
        Ok("y".to_owned())
    }
}
