/**
# Calls the services of the `server` example, run it first.
 */
use futures::StreamExt;
use log::{error, info};
use rawgrpc::client::Client;
use rawgrpc::config::Config;
use rawgrpc::messages::raw;
use rawgrpc::method::{CallOptions, Method, MethodType};
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
    let client = Client::connect("127.0.0.1:8888", Config::default()).await?;

    info!("Sending 3 unary requests");
    let ping = method(MethodType::Unary, "/demo.Pong/Ping");
    for _ in 0..3 {
        let call = client.unary_call(&ping, CallOptions::new(), &"Marco".to_owned());
        match call.response().await {
            Ok(response) => info!("Response: {}", response),
            Err(status) => info!("Fail: {}", status),
        }
    }

    let sum = client.client_streaming_call(&method(MethodType::ClientStreaming, "/demo.Counter/Sum"), CallOptions::new());
    for number in 1..=10 {
        sum.request_stream().write(&number.to_string()).await?;
    }
    sum.request_stream().complete().await?;
    info!("Sum: {}", sum.response().await?);

    let count_down = client.server_streaming_call(
        &method(MethodType::ServerStreaming, "/demo.Counter/CountDown"),
        CallOptions::new().with_timeout(Duration::from_millis(350)),
        &"10".to_owned(),
    );
    let mut counts = Box::pin(count_down.into_response_stream().into_stream());
    while let Some(count) = counts.next().await {
        match count {
            Ok(count) => info!("Count down: {}", count),
            Err(status) => info!("Count down stopped: {}", status),
        }
    }

    let chat = client.duplex_streaming_call(&method(MethodType::DuplexStreaming, "/demo.Echo/Chat"), CallOptions::new());
    let (requests, mut responses) = chat.into_streams();
    let writer = tokio::spawn(async move {
        for word in ["hello", "duplex", "world"] {
            requests.write(&word.to_owned()).await?;
        }
        requests.complete().await
    });
    while let Some(message) = responses.message().await? {
        info!("Chat: {}", message);
    }
    writer.await??;
    Ok(())
}

fn method(method_type: MethodType, name: &str) -> Method<String, String> {
    Method::new(method_type, name, raw::utf8(), raw::utf8())
}
